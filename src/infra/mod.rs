//! Infrastructure: telemetry bootstrap and the HTTP surface.

pub mod error;
pub mod http;
pub mod telemetry;

pub use error::InfraError;
