//! In-memory operation store, used when no storage path is configured.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{OperationStore, StoreError};
use crate::protocol::{DocumentId, Operation};

#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentId, Vec<Operation>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations held for `document`.
    pub fn operation_count(&self, document: &DocumentId) -> usize {
        self.documents
            .lock()
            .map(|docs| docs.get(document).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, HashMap<DocumentId, Vec<Operation>>>, StoreError> {
        self.documents
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl OperationStore for MemoryStore {
    fn load_current_version(&self, document: &DocumentId) -> Result<u64, StoreError> {
        Ok(self
            .locked()?
            .get(document)
            .and_then(|ops| ops.last())
            .map_or(0, |op| op.version))
    }

    fn append_operations(&self, document: &DocumentId, operations: &[Operation]) -> Result<(), StoreError> {
        self.locked()?
            .entry(document.clone())
            .or_default()
            .extend_from_slice(operations);
        Ok(())
    }

    fn load_operations_since(&self, document: &DocumentId, since: u64) -> Result<Vec<Operation>, StoreError> {
        Ok(self
            .locked()?
            .get(document)
            .map(|ops| ops.iter().filter(|op| op.version > since).cloned().collect())
            .unwrap_or_default())
    }
}
