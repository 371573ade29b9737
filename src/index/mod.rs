//! Full-text index over extracted documents.

pub mod schema;
pub mod store;

pub use store::{IndexError, IndexStore, SearchHit, SearchResults};
