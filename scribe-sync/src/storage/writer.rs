//! Background writer that takes store appends off the hot path.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::OperationStore;
use crate::protocol::{DocumentId, Operation};

enum PersistRequest {
    Append {
        document: DocumentId,
        operations: Vec<Operation>,
    },
    /// Completes once every earlier request has been handled.
    Flush(oneshot::Sender<()>),
}

/// Queue of appends, drained in order by a single task.
#[derive(Clone)]
pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<PersistRequest>,
}

impl PersistenceWriter {
    /// Spawn the writer task. It exits when every handle is dropped.
    pub fn spawn(store: Arc<dyn OperationStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    PersistRequest::Append {
                        document,
                        operations,
                    } => {
                        if let Err(e) = store.append_operations(&document, &operations) {
                            log::error!(
                                "Failed to persist {} operations of {document}: {e}",
                                operations.len()
                            );
                        }
                    }
                    PersistRequest::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            log::debug!("Persistence writer stopped");
        });
        (Self { tx }, task)
    }

    /// Queue accepted operations for storage.
    pub fn append(&self, document: DocumentId, operations: Vec<Operation>) {
        if operations.is_empty() {
            return;
        }
        if self
            .tx
            .send(PersistRequest::Append {
                document,
                operations,
            })
            .is_err()
        {
            log::error!("Persistence writer is gone, operations not stored");
        }
    }

    /// Wait until everything queued so far has reached the store.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(PersistRequest::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}
