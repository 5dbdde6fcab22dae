//! Persistent storage of accepted operations.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  accepted ops   ┌──────────────────┐   append   ┌──────────────┐
//! │ SyncEngine  │ ──────────────► │ PersistenceWriter│ ─────────► │OperationStore│
//! │ (in-memory) │  (unbounded)    │ (background task)│            │ Memory/Rocks │
//! └──────┬──────┘                 └──────────────────┘            └──────┬───────┘
//!        │            first open: current version + log warm-up          │
//!        └◄──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine never waits on the store while deciding an operation; appends
//! are queued and written in order by the writer task.

pub mod memory;
pub mod rocks;
pub mod writer;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};
pub use writer::PersistenceWriter;

use crate::protocol::{DocumentId, Operation};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Read/append contract the engine needs from durable storage.
pub trait OperationStore: Send + Sync {
    /// Version of the last operation recorded for `document`, 0 if none.
    fn load_current_version(&self, document: &DocumentId) -> Result<u64, StoreError>;

    /// Record operations that were accepted, in version order.
    fn append_operations(&self, document: &DocumentId, operations: &[Operation]) -> Result<(), StoreError>;

    /// Recorded operations with `version > since`, in version order.
    fn load_operations_since(&self, document: &DocumentId, since: u64) -> Result<Vec<Operation>, StoreError>;
}
