//! Synchronization engine: version assignment and conflict detection.
//!
//! Every document has one authoritative version counter and an ordered log of
//! accepted operations. Submissions are decided inside a per-document critical
//! section, so versions are assigned in strict receipt order and never shared:
//!
//! ```text
//! base == current                         → fast-forward, stamped current+1
//! base <  current, no newer op on target  → accepted as if rebased
//! base <  current, newer op on target     → conflict, nothing applied
//! base >  current                         → protocol error
//! ```
//!
//! A batch is all-or-nothing. Each of its operations is checked against the
//! log as it stood before the batch.
//!
//! The log keeps at most `max_log_len` entries. Older entries are dropped and
//! the checkpoint advances; a base below the checkpoint conflicts with every
//! retained entry, since the dropped history can no longer be inspected.
//!
//! Each decision also yields a [`DeliveryTurn`], taken before the critical
//! section is left. Callers fan results out while holding it, so every
//! connection receives accepted operations in version order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::protocol::{now_millis, ConnectionId, DocumentId, Operation, ProtocolError, Resolution};
use crate::storage::{OperationStore, PersistenceWriter, StoreError};

/// An accepted operation and the connection that submitted it.
/// Operations warmed from the store have no author.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedOperation {
    pub author: Option<ConnectionId>,
    pub operation: Operation,
}

/// Result of submitting a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Every operation was stamped; `version` is the document's new version.
    Accepted {
        operations: Vec<Operation>,
        version: u64,
    },
    /// Nothing was applied. `operations` are the log entries that intervened.
    Conflict {
        operations: Vec<Operation>,
        current_version: u64,
    },
}

/// Result of submitting a conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Resolved(Resolution),
    /// The document moved past the version the resolution was built on.
    Stale {
        operations: Vec<Operation>,
        current_version: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Authoritative state of one document.
#[derive(Debug)]
pub struct DocumentState {
    current_version: u64,
    /// Highest version no longer present in `log`.
    checkpoint: u64,
    log: VecDeque<LoggedOperation>,
    max_log_len: usize,
}

impl DocumentState {
    pub fn new(max_log_len: usize) -> Self {
        Self {
            current_version: 0,
            checkpoint: 0,
            log: VecDeque::new(),
            max_log_len: max_log_len.max(1),
        }
    }

    /// Rebuild state from stored history. Only the gapless tail ending at
    /// `current_version` is kept.
    pub fn restore(current_version: u64, history: Vec<Operation>, max_log_len: usize) -> Self {
        let mut state = Self::new(max_log_len);
        state.current_version = current_version;

        let mut expected = current_version;
        let mut tail = Vec::new();
        for operation in history.into_iter().rev() {
            if expected == 0 || operation.version != expected || tail.len() == state.max_log_len {
                break;
            }
            expected -= 1;
            tail.push(LoggedOperation {
                author: None,
                operation,
            });
        }
        state.checkpoint = expected;
        state.log = tail.into_iter().rev().collect();
        state
    }

    pub fn current_version(&self) -> u64 {
        self.current_version
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Retained operations with `version > since`, in version order.
    pub fn operations_since(&self, since: u64) -> Vec<Operation> {
        self.log
            .iter()
            .filter(|entry| entry.operation.version > since)
            .map(|entry| entry.operation.clone())
            .collect()
    }

    /// Decide a batch atomically.
    pub fn submit(
        &mut self,
        author: ConnectionId,
        operations: Vec<Operation>,
    ) -> Result<SubmitOutcome, ProtocolError> {
        if operations.is_empty() {
            return Err(ProtocolError::EmptyBatch);
        }
        for (index, op) in operations.iter().enumerate() {
            op.validate(index)?;
            if op.base_version > self.current_version {
                return Err(ProtocolError::BaseVersionAhead {
                    base: op.base_version,
                    current: self.current_version,
                });
            }
        }

        let mut conflicting = BTreeMap::new();
        for op in &operations {
            for entry in self.conflicts_with(op) {
                conflicting
                    .entry(entry.operation.version)
                    .or_insert_with(|| entry.operation.clone());
            }
        }
        if !conflicting.is_empty() {
            return Ok(SubmitOutcome::Conflict {
                operations: conflicting.into_values().collect(),
                current_version: self.current_version,
            });
        }

        let stamped = self.append(author, operations, None);
        Ok(SubmitOutcome::Accepted {
            operations: stamped,
            version: self.current_version,
        })
    }

    /// Apply a client's resolution if the document has not moved past the
    /// version it declares.
    ///
    /// `new_version` must lie in `current + 1 ..= current + len`: a resolution
    /// may replay operations the log already holds, so it can declare fewer new
    /// versions than it carries. Its operations are stamped consecutively after
    /// `current` and the resulting version is authoritative.
    pub fn resolve(
        &mut self,
        author: ConnectionId,
        resolution: Resolution,
    ) -> Result<ResolveOutcome, ProtocolError> {
        let Resolution {
            operations,
            new_version,
        } = resolution;
        if operations.is_empty() {
            return Err(ProtocolError::EmptyResolution);
        }
        for (index, op) in operations.iter().enumerate() {
            op.validate(index)?;
        }

        let current = self.current_version;
        if new_version <= current {
            return Ok(ResolveOutcome::Stale {
                operations: self.operations_since(new_version.saturating_sub(1)),
                current_version: current,
            });
        }
        if new_version - current > operations.len() as u64 {
            return Err(ProtocolError::ResolutionAhead {
                new_version,
                current,
            });
        }

        let stamped = self.append(author, operations, Some(current));
        Ok(ResolveOutcome::Resolved(Resolution {
            operations: stamped,
            new_version: self.current_version,
        }))
    }

    /// Log entries an operation with this base would overwrite.
    fn conflicts_with<'a>(&'a self, op: &'a Operation) -> impl Iterator<Item = &'a LoggedOperation> + 'a {
        let history_lost = op.base_version < self.checkpoint;
        self.log.iter().filter(move |entry| {
            entry.operation.version > op.base_version
                && (history_lost || entry.operation.target == op.target)
        })
    }

    fn append(
        &mut self,
        author: ConnectionId,
        operations: Vec<Operation>,
        rebase_to: Option<u64>,
    ) -> Vec<Operation> {
        let mut stamped = Vec::with_capacity(operations.len());
        for mut op in operations {
            self.current_version += 1;
            op.version = self.current_version;
            if let Some(base) = rebase_to {
                op.base_version = base;
            }
            if op.timestamp == 0 {
                op.timestamp = now_millis();
            }
            self.log.push_back(LoggedOperation {
                author: Some(author),
                operation: op.clone(),
            });
            stamped.push(op);
        }
        while self.log.len() > self.max_log_len {
            if let Some(dropped) = self.log.pop_front() {
                self.checkpoint = dropped.operation.version;
            }
        }
        stamped
    }
}

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub accepted_operations: u64,
    pub conflicts: u64,
    pub resolutions: u64,
}

#[derive(Default)]
struct AtomicEngineStats {
    accepted_operations: AtomicU64,
    conflicts: AtomicU64,
    resolutions: AtomicU64,
}

/// Exclusive right to deliver the frames that follow from one decision.
///
/// Turns are taken inside the document's critical section and granted in
/// FIFO order, so holders deliver in the order the engine decided. Dropping
/// the turn lets the next decision's frames go out.
#[derive(Debug)]
pub struct DeliveryTurn {
    _guard: OwnedMutexGuard<()>,
}

/// A decision paired with the turn to deliver it.
#[derive(Debug)]
pub struct Sequenced<T> {
    pub outcome: T,
    pub turn: DeliveryTurn,
}

struct DocumentSlot {
    state: Mutex<DocumentState>,
    delivery: Arc<Mutex<()>>,
}

impl DocumentSlot {
    /// Must be called with `state` locked.
    async fn turn(&self) -> DeliveryTurn {
        DeliveryTurn {
            _guard: self.delivery.clone().lock_owned().await,
        }
    }
}

/// Owns every open document and serializes access to each one.
pub struct SyncEngine {
    documents: RwLock<HashMap<DocumentId, Arc<DocumentSlot>>>,
    store: Arc<dyn OperationStore>,
    writer: PersistenceWriter,
    max_log_len: usize,
    stats: AtomicEngineStats,
}

impl SyncEngine {
    /// Create an engine over `store`. Spawns the persistence writer, so this
    /// must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn OperationStore>, max_log_len: usize) -> Self {
        let (writer, _task) = PersistenceWriter::spawn(store.clone());
        Self {
            documents: RwLock::new(HashMap::new()),
            store,
            writer,
            max_log_len: max_log_len.max(1),
            stats: AtomicEngineStats::default(),
        }
    }

    /// Make sure `document` is loaded and return its current version.
    pub async fn open_document(&self, document: &DocumentId) -> Result<u64, StoreError> {
        let slot = self.document(document).await?;
        let version = slot.state.lock().await.current_version();
        Ok(version)
    }

    /// Current version of `document` plus a delivery turn. Frames sent while
    /// the turn is held cannot be overtaken by later accepted operations.
    pub async fn enter(&self, document: &DocumentId) -> Result<Sequenced<u64>, StoreError> {
        let slot = self.document(document).await?;
        let state = slot.state.lock().await;
        let turn = slot.turn().await;
        Ok(Sequenced {
            outcome: state.current_version(),
            turn,
        })
    }

    pub async fn current_version(&self, document: &DocumentId) -> Result<u64, StoreError> {
        self.open_document(document).await
    }

    pub async fn submit(
        &self,
        document: &DocumentId,
        author: ConnectionId,
        operations: Vec<Operation>,
    ) -> Result<SubmitOutcome, EngineError> {
        Ok(self.submit_sequenced(document, author, operations).await?.outcome)
    }

    /// Decide a batch and hand back the turn to deliver the result.
    pub async fn submit_sequenced(
        &self,
        document: &DocumentId,
        author: ConnectionId,
        operations: Vec<Operation>,
    ) -> Result<Sequenced<SubmitOutcome>, EngineError> {
        let slot = self.document(document).await?;
        let mut state = slot.state.lock().await;
        let outcome = state.submit(author, operations)?;

        match &outcome {
            SubmitOutcome::Accepted {
                operations,
                version,
            } => {
                self.writer.append(document.clone(), operations.clone());
                self.stats
                    .accepted_operations
                    .fetch_add(operations.len() as u64, Ordering::Relaxed);
                log::debug!(
                    "{document}: accepted {} operations from {author}, now v{version}",
                    operations.len()
                );
            }
            SubmitOutcome::Conflict {
                operations,
                current_version,
            } => {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "{document}: batch from {author} conflicts with {} operations at v{current_version}",
                    operations.len()
                );
            }
        }
        let turn = slot.turn().await;
        Ok(Sequenced { outcome, turn })
    }

    pub async fn resolve(
        &self,
        document: &DocumentId,
        author: ConnectionId,
        resolution: Resolution,
    ) -> Result<ResolveOutcome, EngineError> {
        Ok(self.resolve_sequenced(document, author, resolution).await?.outcome)
    }

    /// Decide a resolution and hand back the turn to deliver the result.
    pub async fn resolve_sequenced(
        &self,
        document: &DocumentId,
        author: ConnectionId,
        resolution: Resolution,
    ) -> Result<Sequenced<ResolveOutcome>, EngineError> {
        let slot = self.document(document).await?;
        let mut state = slot.state.lock().await;
        let outcome = state.resolve(author, resolution)?;

        match &outcome {
            ResolveOutcome::Resolved(resolution) => {
                self.writer
                    .append(document.clone(), resolution.operations.clone());
                self.stats.resolutions.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .accepted_operations
                    .fetch_add(resolution.operations.len() as u64, Ordering::Relaxed);
                log::info!(
                    "{document}: conflict resolved by {author} at v{}",
                    resolution.new_version
                );
            }
            ResolveOutcome::Stale {
                current_version, ..
            } => {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                log::debug!("{document}: stale resolution from {author}, document at v{current_version}");
            }
        }
        let turn = slot.turn().await;
        Ok(Sequenced { outcome, turn })
    }

    /// Retained operations newer than `since`, with the current version.
    pub async fn operations_since(
        &self,
        document: &DocumentId,
        since: u64,
    ) -> Result<(Vec<Operation>, u64), EngineError> {
        let slot = self.document(document).await?;
        let state = slot.state.lock().await;
        Ok((state.operations_since(since), state.current_version()))
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Wait until every accepted operation has reached the store.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            accepted_operations: self.stats.accepted_operations.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
            resolutions: self.stats.resolutions.load(Ordering::Relaxed),
        }
    }

    async fn document(&self, document: &DocumentId) -> Result<Arc<DocumentSlot>, StoreError> {
        if let Some(slot) = self.documents.read().await.get(document) {
            return Ok(slot.clone());
        }

        let current = self.store.load_current_version(document)?;
        let since = current.saturating_sub(self.max_log_len as u64);
        let history = if current > 0 {
            self.store.load_operations_since(document, since)?
        } else {
            Vec::new()
        };

        let mut documents = self.documents.write().await;
        // Another task may have opened it while the store was read
        let slot = documents.entry(document.clone()).or_insert_with(|| {
            if current > 0 {
                log::info!("Opened {document} at v{current} from storage");
            }
            Arc::new(DocumentSlot {
                state: Mutex::new(DocumentState::restore(current, history, self.max_log_len)),
                delivery: Arc::new(Mutex::new(())),
            })
        });
        Ok(slot.clone())
    }
}
