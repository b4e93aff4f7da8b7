//! The hierarchical semantic graph pipelines
//!
//! Ingestion (dedup, classify, embed, fuse, link) and retrieval (multi-sector
//! candidates, waypoint expansion, hybrid scoring, reinforcement). Both sit
//! on top of the engine's storage, vector store, and provider chain.

pub mod embed;
pub mod ingest;
pub mod query;

pub use ingest::IngestOptions;
pub use query::Expanded;
