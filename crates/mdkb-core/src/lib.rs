//! mdkb-core: Core library for the markdown knowledge base
//!
//! This crate provides:
//! - Directory scanning with content fingerprints
//! - Creating, rewriting and removing documents below the root
//! - Incremental reconciliation of the index against the filesystem
//! - An embedding client for OpenAI-compatible services
//! - SQLite storage for documents and embeddings
//! - Nearest-neighbor semantic search

pub mod embedder;
pub mod files;
pub mod fingerprint;
pub mod inflight;
pub mod reconcile;
pub mod scanner;
pub mod search;
pub mod storage;
pub mod text;

// Re-exports
pub use embedder::{EmbeddingClient, HttpEmbedder, HttpEmbedderConfig};
pub use files::FileError;
pub use fingerprint::fingerprint;
pub use inflight::{Claim, InFlight};
pub use reconcile::{
    plan, ChangeSet, FullPlan, ItemFailure, PathOutcome, ReconcileReport, Reconciler,
};
pub use scanner::{LoadedDocument, ScanError, ScanOutcome, ScannedFile, Scanner};
pub use search::{search, SearchError, SearchHit, SearchOptions};
pub use storage::{DimensionMismatch, DocumentStore, DocumentSummary, Neighbor, SqliteStore};
