#![deny(missing_docs)]

//! Core library for the tikagate document extraction and search gateway.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Extraction worker protocol client and metadata parser.
pub mod extraction;
/// Gateway service coordinating extraction and indexing.
pub mod gateway;
/// Full-text search index.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Ingestion metrics helpers.
pub mod metrics;
/// Extraction worker process supervision.
pub mod supervisor;
