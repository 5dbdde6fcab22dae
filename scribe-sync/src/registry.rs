//! Connection registry: the set of live client connections.
//!
//! Each admitted transport channel owns exactly one [`Connection`] here.
//! The registry is a plain map guarded by one lock; side effects of admission
//! and removal (presence, broadcasts, closing the socket) are the dispatcher's job
//! so that this lock is never held together with the presence or engine locks.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;

use crate::protocol::{ConnectionId, DocumentId, Operation, UserId};

/// A pre-encoded outbound frame, shared between all recipients of a broadcast.
pub type Frame = Arc<str>;

/// Transport-level delivery failures. Logged, never retried inline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("outbound queue for {0} is full")]
    QueueFull(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} not found")]
    NotFound(ConnectionId),
}

/// Sending half of a connection's transport.
///
/// Frames go into a bounded queue drained by the connection's writer task, so
/// queuing never waits on a slow socket.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<Frame>,
    shutdown: Arc<Notify>,
}

impl TransportHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            outbound,
            shutdown: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    /// Queue a frame without waiting. A full queue drops the frame.
    pub fn try_send(&self, id: ConnectionId, frame: Frame) -> Result<(), TransportError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(id),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed(id),
        })
    }

    /// Signal the connection's receive loop to terminate.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Future side of [`close`](Self::close), awaited by the receive loop.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Heartbeat state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    AwaitingPong,
}

/// One live client session.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: UserId,
    pub document: DocumentId,
    pub last_activity: Instant,
    /// Last document version this connection has acknowledged.
    pub version: u64,
    /// Operations applied by this connection since its last confirmed sync point.
    pub pending: Vec<Operation>,
    pub liveness: Liveness,
    transport: TransportHandle,
}

impl Connection {
    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id,
            identity: self.identity.clone(),
            document: self.document.clone(),
            last_activity: self.last_activity,
            version: self.version,
            pending: self.pending.len(),
            liveness: self.liveness,
        }
    }
}

/// Copy of a connection's state, taken without keeping the registry locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub identity: UserId,
    pub document: DocumentId,
    pub last_activity: Instant,
    pub version: u64,
    pub pending: usize,
    pub liveness: Liveness,
}

/// Registry of live connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    max_pending: usize,
}

impl ConnectionRegistry {
    /// `max_pending` bounds each connection's pending buffer.
    pub fn new(max_pending: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_pending: max_pending.max(1),
        }
    }

    /// Register an authenticated connection joined to `document` at `version`.
    pub async fn admit(
        &self,
        transport: TransportHandle,
        identity: UserId,
        document: DocumentId,
        version: u64,
    ) -> ConnectionSummary {
        let connection = Connection {
            id: ConnectionId::new(),
            identity,
            document,
            last_activity: Instant::now(),
            version,
            pending: Vec::new(),
            liveness: Liveness::Active,
            transport,
        };
        let summary = connection.summary();
        self.connections.write().await.insert(connection.id, connection);
        summary
    }

    /// Remove a connection. Unknown ids are a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.write().await.remove(&id)
    }

    /// Record inbound activity. Any message counts as a pong.
    pub async fn touch(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        let connection = connections.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        connection.last_activity = Instant::now();
        connection.liveness = Liveness::Active;
        Ok(())
    }

    pub async fn get(&self, id: ConnectionId) -> Option<ConnectionSummary> {
        self.connections.read().await.get(&id).map(Connection::summary)
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<ConnectionSummary> {
        self.connections
            .read()
            .await
            .values()
            .map(Connection::summary)
            .collect()
    }

    /// Transport handles of every connection joined to `document`, except `skip`.
    pub async fn recipients(
        &self,
        document: &DocumentId,
        skip: Option<ConnectionId>,
    ) -> Vec<(ConnectionId, TransportHandle)> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| &c.document == document && Some(c.id) != skip)
            .map(|c| (c.id, c.transport.clone()))
            .collect()
    }

    pub async fn transport(&self, id: ConnectionId) -> Option<TransportHandle> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|c| c.transport.clone())
    }

    /// Record a batch the connection just had accepted.
    pub async fn record_applied(
        &self,
        id: ConnectionId,
        operations: &[Operation],
        version: u64,
    ) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        let connection = connections.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        connection.pending.extend_from_slice(operations);
        connection.version = connection.version.max(version);

        let overflow = connection.pending.len().saturating_sub(self.max_pending);
        if overflow > 0 {
            log::debug!("Compacting {overflow} pending operations of {id}");
            connection.pending.drain(..overflow);
        }
        Ok(())
    }

    /// The client has built on `version`: everything at or below it is confirmed.
    pub async fn confirm_through(&self, id: ConnectionId, version: u64) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        let connection = connections.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        connection.pending.retain(|op| op.version > version);
        connection.version = connection.version.max(version);
        Ok(())
    }

    /// Move the connection to an authoritative version, dropping its pending buffer.
    pub async fn set_version(&self, id: ConnectionId, version: u64) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        let connection = connections.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        connection.pending.clear();
        connection.version = version;
        Ok(())
    }

    /// Re-join the connection to another document. Returns the previous one.
    pub async fn switch_document(
        &self,
        id: ConnectionId,
        document: DocumentId,
        version: u64,
    ) -> Result<DocumentId, RegistryError> {
        let mut connections = self.connections.write().await;
        let connection = connections.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        connection.pending.clear();
        connection.version = version;
        Ok(std::mem::replace(&mut connection.document, document))
    }

    /// Visit every connection mutably under a single lock acquisition.
    pub async fn inspect_mut<F>(&self, mut visit: F)
    where
        F: FnMut(&mut Connection),
    {
        let mut connections = self.connections.write().await;
        for connection in connections.values_mut() {
            visit(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Operation;

    async fn admit(registry: &ConnectionRegistry, doc: &str) -> (ConnectionSummary, mpsc::Receiver<Frame>) {
        let (handle, rx) = TransportHandle::channel(8);
        let summary = registry
            .admit(handle, UserId::from("alice"), DocumentId::from(doc), 3)
            .await;
        (summary, rx)
    }

    fn stamped(version: u64) -> Operation {
        let mut op = Operation::insert("body", "x", version - 1);
        op.version = version;
        op
    }

    #[tokio::test]
    async fn test_admit_initializes_connection() {
        let registry = ConnectionRegistry::new(16);
        let (summary, _rx) = admit(&registry, "D").await;

        assert_eq!(summary.version, 3);
        assert_eq!(summary.document.as_str(), "D");
        assert_eq!(summary.identity.as_str(), "alice");
        assert_eq!(summary.liveness, Liveness::Active);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new(16);
        let (summary, _rx) = admit(&registry, "D").await;

        assert!(registry.remove(summary.id).await.is_some());
        assert!(registry.remove(summary.id).await.is_none());
        assert!(registry.remove(ConnectionId::new()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_touch_unknown_is_not_found() {
        let registry = ConnectionRegistry::new(16);
        let id = ConnectionId::new();
        assert_eq!(registry.touch(id).await, Err(RegistryError::NotFound(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_updates_activity_and_liveness() {
        let registry = ConnectionRegistry::new(16);
        let (summary, _rx) = admit(&registry, "D").await;
        registry
            .inspect_mut(|c| c.liveness = Liveness::AwaitingPong)
            .await;

        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        registry.touch(summary.id).await.unwrap();

        let after = registry.get(summary.id).await.unwrap();
        assert!(after.last_activity > summary.last_activity);
        assert_eq!(after.liveness, Liveness::Active);
    }

    #[tokio::test]
    async fn test_recipients_scoped_to_document() {
        let registry = ConnectionRegistry::new(16);
        let (a, _ra) = admit(&registry, "D").await;
        let (b, _rb) = admit(&registry, "D").await;
        let (_c, _rc) = admit(&registry, "E").await;

        let all: Vec<_> = registry
            .recipients(&DocumentId::from("D"), None)
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(all.len(), 2);

        let others = registry.recipients(&DocumentId::from("D"), Some(a.id)).await;
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].0, b.id);
    }

    #[tokio::test]
    async fn test_pending_buffer_confirmed_and_bounded() {
        let registry = ConnectionRegistry::new(2);
        let (summary, _rx) = admit(&registry, "D").await;

        registry
            .record_applied(summary.id, &[stamped(4), stamped(5), stamped(6)], 6)
            .await
            .unwrap();
        let after = registry.get(summary.id).await.unwrap();
        assert_eq!(after.pending, 2);
        assert_eq!(after.version, 6);

        registry.confirm_through(summary.id, 5).await.unwrap();
        assert_eq!(registry.get(summary.id).await.unwrap().pending, 1);

        registry.set_version(summary.id, 9).await.unwrap();
        let after = registry.get(summary.id).await.unwrap();
        assert_eq!(after.pending, 0);
        assert_eq!(after.version, 9);
    }

    #[tokio::test]
    async fn test_switch_document_returns_previous() {
        let registry = ConnectionRegistry::new(16);
        let (summary, _rx) = admit(&registry, "D").await;

        let previous = registry
            .switch_document(summary.id, DocumentId::from("E"), 11)
            .await
            .unwrap();
        assert_eq!(previous.as_str(), "D");

        let after = registry.get(summary.id).await.unwrap();
        assert_eq!(after.document.as_str(), "E");
        assert_eq!(after.version, 11);
    }

    #[tokio::test]
    async fn test_try_send_reports_closed_transport() {
        let (handle, rx) = TransportHandle::channel(1);
        let id = ConnectionId::new();
        handle.try_send(id, Arc::from("a")).unwrap();
        assert_eq!(
            handle.try_send(id, Arc::from("b")),
            Err(TransportError::QueueFull(id))
        );
        drop(rx);
        assert_eq!(
            handle.try_send(id, Arc::from("c")),
            Err(TransportError::Closed(id))
        );
        assert!(handle.is_closed());
    }
}
