//! Domain types: the wire resources the client consumes and the error type
//! that flows through the request path.

mod error;
mod resources;

pub use error::ProxyError;
pub use resources::{
    AuthorResource, BookResource, BulkBookResource, ContributorResource, SeriesResource,
    SeriesWorkLinkResource, WorkResource,
};
