//! InvoiceQA Common Library
//!
//! Shared code for the InvoiceQA services:
//! - Hybrid query resolution engine
//! - Database models and the structured store repository
//! - Embedding clients and semantic index accessors
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod db;
pub mod embeddings;
pub mod engine;
pub mod errors;
pub mod index;
pub mod metrics;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, Repository};
pub use embeddings::Embedder;
pub use engine::{Answer, QueryEngine, SessionId};
pub use errors::{AppError, Result};
pub use index::{InMemoryIndex, IndexWriter, PgVectorIndex};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
