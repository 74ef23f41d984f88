//! Sage core library: incremental indexing and call-graph resolution for
//! source repositories.
//!
//! A pass scans a repository, fingerprints files, re-extracts chunks for the
//! files that changed, resolves call sites against a repository-wide
//! snapshot and commits each file as one unit. Chunks without an embedding
//! wait in a persisted queue for an external embedding consumer.

pub mod config;
pub mod embedding;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod store;

pub use config::{IndexConfig, PassOptions};
pub use embedding::{run_embedding_batch, DrainReport, EmbeddingQueue, Embedder};
pub use errors::{SageError, SageResult};
pub use indexer::pipeline::{IndexReport, Indexer};
pub use store::database::Store;
