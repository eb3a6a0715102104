//! Small shared helpers.

mod ids;

pub use ids::path_to_id;
