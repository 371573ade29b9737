//! Extraction worker protocol: metadata parsing and the two-pass HTTP client.

pub mod client;
pub mod metadata;

pub use client::{Extraction, ExtractionClient, ExtractionError, Phase};
pub use metadata::{Metadata, ParseWarning, ParsedMetadata, read_metadata};

/// Boxed error carried by document byte streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
