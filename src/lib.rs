//! Folio is a caching metadata proxy. It serves book, work, and author
//! records to a library-management client that expects a denormalized shape
//! (an author embeds all works; each work embeds all editions), while the
//! upstream source of truth publishes normalized, edition-centric data
//! behind strict rate limits.
//!
//! Reads are O(1) against a layered cache; the work of fetching, fanning
//! out, deduplicating, and reassembling graphs happens asynchronously in the
//! background. See the [`controller`] module for the orchestration core.

pub mod cache;
pub mod config;
pub mod controller;
pub mod domain;
pub mod infra;
pub mod upstream;
pub mod util;

pub use controller::{Controller, ControllerConfig};
pub use domain::ProxyError;
