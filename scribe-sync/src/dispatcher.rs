//! Message dispatcher: the single place where components meet.
//!
//! Each connection's receive loop feeds its frames to [`Dispatcher::dispatch`],
//! one at a time, so a connection's messages are handled in arrival order.
//! The dispatcher takes the registry, presence and engine locks one after the
//! other and never holds two of them at once. Frames that follow from an
//! engine decision are sent while holding that decision's delivery turn, so
//! every connection sees accepted operations in version order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::broadcast::BroadcastRouter;
use crate::engine::{EngineError, ResolveOutcome, Sequenced, SubmitOutcome, SyncEngine};
use crate::presence::PresenceTracker;
use crate::protocol::{
    ClientMessage, ConnectionId, DocumentId, Operation, PresenceState, ProtocolError, Resolution,
    ServerMessage, UserId,
};
use crate::registry::{ConnectionRegistry, ConnectionSummary, TransportHandle};
use crate::storage::StoreError;

/// Dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub connections_total: u64,
    pub frames_received: u64,
    pub protocol_errors: u64,
    pub conflicts: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct AtomicDispatchStats {
    connections_total: AtomicU64,
    frames_received: AtomicU64,
    protocol_errors: AtomicU64,
    conflicts: AtomicU64,
    evictions: AtomicU64,
}

pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    engine: Arc<SyncEngine>,
    router: Arc<BroadcastRouter>,
    stats: AtomicDispatchStats,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        engine: Arc<SyncEngine>,
        router: Arc<BroadcastRouter>,
    ) -> Self {
        Self {
            registry,
            presence,
            engine,
            router,
            stats: AtomicDispatchStats::default(),
        }
    }

    /// Register an authenticated connection on `document`.
    ///
    /// The client is told its id and the document version, and everyone on the
    /// document receives the current presence set.
    pub async fn admit(
        &self,
        transport: TransportHandle,
        identity: UserId,
        document: DocumentId,
    ) -> Result<ConnectionSummary, StoreError> {
        let Sequenced {
            outcome: version,
            turn,
        } = self.engine.enter(&document).await?;
        let summary = self
            .registry
            .admit(transport, identity, document.clone(), version)
            .await;
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Connection {} ({}) joined {document} at v{version}",
            summary.id,
            summary.identity
        );

        self.router
            .to_one(
                summary.id,
                &ServerMessage::Connected {
                    client_id: summary.id,
                    document_id: document.clone(),
                    version,
                },
            )
            .await;
        drop(turn);
        self.broadcast_presence(&document).await;
        Ok(summary)
    }

    /// Remove a connection and close its transport. Idempotent.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        let Some(connection) = self.registry.remove(id).await else {
            return false;
        };
        connection.transport().close();
        self.presence.remove(id).await;
        self.broadcast_presence(&connection.document).await;
        log::info!("Connection {id} left {}", connection.document);
        true
    }

    /// Forcibly remove a connection that stopped responding.
    pub async fn evict(&self, id: ConnectionId) -> bool {
        let removed = self.disconnect(id).await;
        if removed {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            log::warn!("Evicted unresponsive connection {id}");
        }
        removed
    }

    /// Record transport-level activity (WebSocket ping/pong frames).
    pub async fn touch(&self, id: ConnectionId) {
        if self.registry.touch(id).await.is_err() {
            log::trace!("Activity from unregistered connection {id}");
        }
    }

    /// Handle one inbound text frame.
    pub async fn dispatch(&self, id: ConnectionId, frame: &str) {
        if self.registry.touch(id).await.is_err() {
            log::debug!("Dropping frame from unregistered connection {id}");
            return;
        }
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        match ClientMessage::decode(frame) {
            Ok(msg) => self.handle(id, msg).await,
            Err(e) => self.reject_frame(id, e).await,
        }
    }

    /// Handle one decoded message.
    pub async fn handle(&self, id: ConnectionId, msg: ClientMessage) {
        let Some(connection) = self.registry.get(id).await else {
            return;
        };
        log::trace!("{id}: {msg:?}");

        match msg {
            ClientMessage::Join { document_id } => self.join(&connection, document_id).await,
            ClientMessage::Sync { operations } => self.sync(&connection, operations).await,
            ClientMessage::ConflictResolution { resolution } => {
                self.resolve(&connection, resolution).await
            }
            ClientMessage::Presence { presence } => self.update_presence(&connection, presence).await,
            ClientMessage::History { since_version } => {
                match self
                    .engine
                    .operations_since(&connection.document, since_version)
                    .await
                {
                    Ok((operations, current_version)) => {
                        self.router
                            .to_one(
                                id,
                                &ServerMessage::History {
                                    operations,
                                    current_version,
                                },
                            )
                            .await;
                    }
                    Err(e) => self.report_engine_error(id, e).await,
                }
            }
            ClientMessage::Ping => {
                self.router.to_one(id, &ServerMessage::Pong).await;
            }
            // Activity was already recorded
            ClientMessage::Pong => {}
        }
    }

    /// Tell the sender its frame was rejected. The connection stays open.
    pub async fn reject_frame(&self, id: ConnectionId, error: ProtocolError) {
        self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
        log::debug!("Rejected frame from {id}: {error}");
        self.router
            .to_one(id, &ServerMessage::error(error.to_string()))
            .await;
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            connections_total: self.stats.connections_total.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            protocol_errors: self.stats.protocol_errors.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    async fn join(&self, connection: &ConnectionSummary, document: DocumentId) {
        let id = connection.id;
        if document.as_str().trim().is_empty() {
            self.reject_frame(id, ProtocolError::Malformed("documentId must not be empty".into()))
                .await;
            return;
        }
        let Sequenced {
            outcome: version,
            turn,
        } = match self.engine.enter(&document).await {
            Ok(entered) => entered,
            Err(e) => return self.report_engine_error(id, e.into()).await,
        };
        let previous = match self
            .registry
            .switch_document(id, document.clone(), version)
            .await
        {
            Ok(previous) => previous,
            Err(e) => {
                log::trace!("Join skipped: {e}");
                return;
            }
        };

        self.router
            .to_one(
                id,
                &ServerMessage::Joined {
                    document_id: document.clone(),
                    version,
                },
            )
            .await;
        drop(turn);

        if previous != document {
            self.presence.remove(id).await;
            self.broadcast_presence(&previous).await;
            log::info!("Connection {id} moved from {previous} to {document}");
        }
        self.broadcast_presence(&document).await;
    }

    async fn sync(&self, connection: &ConnectionSummary, operations: Vec<Operation>) {
        let id = connection.id;
        let document = &connection.document;
        let Some(base) = operations.iter().map(|op| op.base_version).min() else {
            return self.reject_frame(id, ProtocolError::EmptyBatch).await;
        };

        let Sequenced { outcome, turn } = match self.engine.submit_sequenced(document, id, operations).await {
            Ok(sequenced) => sequenced,
            Err(e) => return self.report_engine_error(id, e).await,
        };
        if let Err(e) = self.registry.confirm_through(id, base).await {
            log::trace!("Sync bookkeeping skipped: {e}");
        }

        match outcome {
            SubmitOutcome::Accepted {
                operations,
                version,
            } => {
                if let Err(e) = self.registry.record_applied(id, &operations, version).await {
                    log::trace!("Sync bookkeeping skipped: {e}");
                }
                self.router
                    .to_others(
                        document,
                        id,
                        &ServerMessage::Sync {
                            client_id: id,
                            operations: operations.clone(),
                        },
                    )
                    .await;
                self.router
                    .to_one(
                        id,
                        &ServerMessage::Ack {
                            version,
                            operations,
                        },
                    )
                    .await;
            }
            SubmitOutcome::Conflict {
                operations,
                current_version,
            } => self.send_conflict(id, operations, current_version).await,
        }
        drop(turn);
    }

    async fn resolve(&self, connection: &ConnectionSummary, resolution: Resolution) {
        let id = connection.id;
        let document = &connection.document;
        let Sequenced { outcome, turn } = match self.engine.resolve_sequenced(document, id, resolution).await {
            Ok(sequenced) => sequenced,
            Err(e) => return self.report_engine_error(id, e).await,
        };

        match outcome {
            ResolveOutcome::Resolved(resolution) => {
                if let Err(e) = self.registry.set_version(id, resolution.new_version).await {
                    log::trace!("Resolution bookkeeping skipped: {e}");
                }
                self.router
                    .to_all(
                        document,
                        &ServerMessage::ConflictResolved {
                            client_id: id,
                            resolution,
                        },
                    )
                    .await;
            }
            ResolveOutcome::Stale {
                operations,
                current_version,
            } => self.send_conflict(id, operations, current_version).await,
        }
        drop(turn);
    }

    async fn update_presence(&self, connection: &ConnectionSummary, presence: PresenceState) {
        self.presence
            .update(
                connection.id,
                connection.identity.clone(),
                connection.document.clone(),
                presence,
            )
            .await;
        self.broadcast_presence(&connection.document).await;
    }

    async fn broadcast_presence(&self, document: &DocumentId) {
        let presence = self.presence.snapshot(document).await;
        self.router
            .to_all(document, &ServerMessage::PresenceUpdate { presence })
            .await;
    }

    async fn send_conflict(&self, id: ConnectionId, operations: Vec<Operation>, current_version: u64) {
        self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
        self.router
            .to_one(
                id,
                &ServerMessage::Conflict {
                    operations,
                    current_version,
                },
            )
            .await;
    }

    async fn report_engine_error(&self, id: ConnectionId, error: EngineError) {
        match error {
            EngineError::Protocol(e) => self.reject_frame(id, e).await,
            EngineError::Store(e) => {
                log::error!("Storage failure while serving {id}: {e}");
                self.router
                    .to_one(id, &ServerMessage::error("document temporarily unavailable"))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Cursor;
    use crate::registry::Frame;
    use crate::storage::MemoryStore;
    use tokio::sync::mpsc;

    struct Harness {
        dispatcher: Dispatcher,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        engine: Arc<SyncEngine>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(64));
        let presence = Arc::new(PresenceTracker::new());
        let engine = Arc::new(SyncEngine::new(Arc::new(MemoryStore::new()), 100));
        let router = Arc::new(BroadcastRouter::new(registry.clone()));
        let dispatcher = Dispatcher::new(registry.clone(), presence.clone(), engine.clone(), router);
        Harness {
            dispatcher,
            registry,
            presence,
            engine,
        }
    }

    async fn connect(h: &Harness, user: &str, doc: &str) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (handle, rx) = TransportHandle::channel(64);
        let summary = h
            .dispatcher
            .admit(handle, UserId::from(user), DocumentId::from(doc))
            .await
            .unwrap();
        (summary.id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            messages.push(ServerMessage::decode(&frame).unwrap());
        }
        messages
    }

    fn sync_frame(target: &str, base: u64) -> String {
        ClientMessage::Sync {
            operations: vec![Operation::insert(target, "x", base)],
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_admit_sends_connected_and_presence() {
        let h = harness();
        let (a, mut ra) = connect(&h, "alice", "D").await;

        let messages = drain(&mut ra);
        assert_eq!(
            messages[0],
            ServerMessage::Connected {
                client_id: a,
                document_id: DocumentId::from("D"),
                version: 0
            }
        );
        assert_eq!(messages[1], ServerMessage::PresenceUpdate { presence: vec![] });
        assert_eq!(h.dispatcher.stats().connections_total, 1);
    }

    #[tokio::test]
    async fn test_accepted_sync_acks_sender_and_broadcasts_others() {
        let h = harness();
        let (a, mut ra) = connect(&h, "alice", "D").await;
        let (_b, mut rb) = connect(&h, "bob", "D").await;
        let (_c, mut rc) = connect(&h, "carol", "E").await;
        drain(&mut ra);
        drain(&mut rb);
        drain(&mut rc);

        h.dispatcher.dispatch(a, &sync_frame("body", 0)).await;

        match drain(&mut ra).as_slice() {
            [ServerMessage::Ack {
                version,
                operations,
            }] => {
                assert_eq!(*version, 1);
                assert_eq!(operations[0].version, 1);
            }
            other => panic!("expected ack, got {other:?}"),
        }
        match drain(&mut rb).as_slice() {
            [ServerMessage::Sync {
                client_id,
                operations,
            }] => {
                assert_eq!(*client_id, a);
                assert_eq!(operations[0].target, "body");
            }
            other => panic!("expected sync, got {other:?}"),
        }
        assert!(drain(&mut rc).is_empty());
        assert_eq!(h.registry.get(a).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_conflict_goes_to_sender_only() {
        let h = harness();
        let (a, mut ra) = connect(&h, "alice", "D").await;
        let (b, mut rb) = connect(&h, "bob", "D").await;
        h.dispatcher.dispatch(a, &sync_frame("body", 0)).await;
        drain(&mut ra);
        drain(&mut rb);

        h.dispatcher.dispatch(b, &sync_frame("body", 0)).await;

        match drain(&mut rb).as_slice() {
            [ServerMessage::Conflict {
                operations,
                current_version,
            }] => {
                assert_eq!(*current_version, 1);
                assert_eq!(operations.len(), 1);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(drain(&mut ra).is_empty());
        assert_eq!(h.dispatcher.stats().conflicts, 1);
    }

    #[tokio::test]
    async fn test_resolution_broadcast_to_everyone() {
        let h = harness();
        let (a, mut ra) = connect(&h, "alice", "D").await;
        let (b, mut rb) = connect(&h, "bob", "D").await;
        h.dispatcher.dispatch(a, &sync_frame("body", 0)).await;
        h.dispatcher.dispatch(b, &sync_frame("body", 0)).await;
        drain(&mut ra);
        drain(&mut rb);

        let frame = ClientMessage::ConflictResolution {
            resolution: Resolution {
                operations: vec![Operation::insert("body", "merged", 1)],
                new_version: 2,
            },
        }
        .encode()
        .unwrap();
        h.dispatcher.dispatch(b, &frame).await;

        for rx in [&mut ra, &mut rb] {
            match drain(rx).as_slice() {
                [ServerMessage::ConflictResolved {
                    client_id,
                    resolution,
                }] => {
                    assert_eq!(*client_id, b);
                    assert_eq!(resolution.new_version, 2);
                }
                other => panic!("expected conflict_resolved, got {other:?}"),
            }
        }
        assert_eq!(h.engine.current_version(&"D".into()).await.unwrap(), 2);
        assert_eq!(h.registry.get(b).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let h = harness();
        let (a, mut ra) = connect(&h, "alice", "D").await;
        drain(&mut ra);

        h.dispatcher.dispatch(a, "{not json").await;
        h.dispatcher
            .dispatch(a, r#"{"type":"sync","operations":[{"kind":"insert","baseVersion":0}]}"#)
            .await;
        h.dispatcher.dispatch(a, r#"{"type":"sync","operations":[]}"#).await;

        let messages = drain(&mut ra);
        assert_eq!(messages.len(), 3);
        assert!(messages
            .iter()
            .all(|msg| matches!(msg, ServerMessage::Error { .. })));
        assert!(h.registry.contains(a).await);
        assert_eq!(h.engine.current_version(&"D".into()).await.unwrap(), 0);
        assert_eq!(h.dispatcher.stats().protocol_errors, 3);
    }

    #[tokio::test]
    async fn test_presence_update_broadcast_to_document() {
        let h = harness();
        let (a, mut ra) = connect(&h, "alice", "D").await;
        let (_b, mut rb) = connect(&h, "bob", "D").await;
        drain(&mut ra);
        drain(&mut rb);

        let frame = ClientMessage::Presence {
            presence: PresenceState {
                cursor: Some(Cursor {
                    target: "body".into(),
                    position: 3,
                }),
                selection: None,
            },
        }
        .encode()
        .unwrap();
        h.dispatcher.dispatch(a, &frame).await;

        for rx in [&mut ra, &mut rb] {
            match drain(rx).as_slice() {
                [ServerMessage::PresenceUpdate { presence }] => {
                    assert_eq!(presence.len(), 1);
                    assert_eq!(presence[0].client_id, a);
                    assert_eq!(presence[0].user_id.as_str(), "alice");
                }
                other => panic!("expected presence_update, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_clears_presence_and_closes_transport() {
        let h = harness();
        let (handle, _ra) = TransportHandle::channel(64);
        let shutdown = handle.shutdown_signal();
        let a = h
            .dispatcher
            .admit(handle, UserId::from("alice"), DocumentId::from("D"))
            .await
            .unwrap()
            .id;
        let (_b, mut rb) = connect(&h, "bob", "D").await;
        h.dispatcher
            .handle(a, ClientMessage::Presence { presence: PresenceState::default() })
            .await;
        drain(&mut rb);

        assert!(h.dispatcher.disconnect(a).await);
        assert!(!h.dispatcher.disconnect(a).await);

        shutdown.notified().await;
        assert!(h.presence.get(a).await.is_none());
        assert_eq!(
            drain(&mut rb),
            vec![ServerMessage::PresenceUpdate { presence: vec![] }]
        );
    }

    #[tokio::test]
    async fn test_join_moves_connection() {
        let h = harness();
        let (a, mut ra) = connect(&h, "alice", "D").await;
        let (_b, mut rb) = connect(&h, "bob", "D").await;
        h.dispatcher
            .handle(a, ClientMessage::Presence { presence: PresenceState::default() })
            .await;
        drain(&mut ra);
        drain(&mut rb);

        h.dispatcher
            .handle(a, ClientMessage::Join { document_id: "E".into() })
            .await;

        assert_eq!(
            drain(&mut rb),
            vec![ServerMessage::PresenceUpdate { presence: vec![] }]
        );
        let messages = drain(&mut ra);
        assert_eq!(
            messages[0],
            ServerMessage::Joined {
                document_id: "E".into(),
                version: 0
            }
        );
        assert_eq!(h.registry.get(a).await.unwrap().document.as_str(), "E");
    }

    #[tokio::test]
    async fn test_history_and_ping() {
        let h = harness();
        let (a, mut ra) = connect(&h, "alice", "D").await;
        h.dispatcher.dispatch(a, &sync_frame("body", 0)).await;
        h.dispatcher.dispatch(a, &sync_frame("title", 1)).await;
        drain(&mut ra);

        h.dispatcher
            .dispatch(a, r#"{"type":"history","sinceVersion":1}"#)
            .await;
        h.dispatcher.dispatch(a, r#"{"type":"ping"}"#).await;

        let messages = drain(&mut ra);
        match &messages[0] {
            ServerMessage::History {
                operations,
                current_version,
            } => {
                assert_eq!(*current_version, 2);
                assert_eq!(operations.len(), 1);
                assert_eq!(operations[0].target, "title");
            }
            other => panic!("expected history, got {other:?}"),
        }
        assert_eq!(messages[1], ServerMessage::Pong);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_syncs_reach_observer_in_version_order() {
        let registry = Arc::new(ConnectionRegistry::new(64));
        let engine = Arc::new(SyncEngine::new(Arc::new(MemoryStore::new()), 10_000));
        let router = Arc::new(BroadcastRouter::new(registry.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            Arc::new(PresenceTracker::new()),
            engine,
            router,
        ));

        let (handle, mut observer) = TransportHandle::channel(4096);
        dispatcher
            .admit(handle, UserId::from("observer"), DocumentId::from("D"))
            .await
            .unwrap();

        let mut writers = Vec::new();
        for w in 0..8 {
            let (handle, rx) = TransportHandle::channel(2048);
            let id = dispatcher
                .admit(handle, UserId::new(format!("writer{w}")), DocumentId::from("D"))
                .await
                .unwrap()
                .id;
            let dispatcher = dispatcher.clone();
            writers.push(tokio::spawn(async move {
                let _queue = rx;
                for i in 0..100 {
                    dispatcher
                        .dispatch(id, &sync_frame(&format!("w{w}-{i}"), 0))
                        .await;
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let versions: Vec<u64> = drain(&mut observer)
            .into_iter()
            .filter_map(|msg| match msg {
                ServerMessage::Sync { operations, .. } => Some(operations[0].version),
                _ => None,
            })
            .collect();
        assert_eq!(versions.len(), 800);
        assert!(
            versions.windows(2).all(|pair| pair[0] < pair[1]),
            "observer saw operations out of version order"
        );
    }

    #[tokio::test]
    async fn test_sync_from_departed_connection_still_reaches_peers() {
        let h = harness();
        let (a, _ra) = connect(&h, "alice", "D").await;
        let (_b, mut rb) = connect(&h, "bob", "D").await;
        drain(&mut rb);

        // Alice leaves after her frame was read but before it is applied
        let summary = h.registry.get(a).await.unwrap();
        h.registry.remove(a).await;
        h.dispatcher
            .sync(&summary, vec![Operation::insert("body", "x", 0)])
            .await;

        assert_eq!(h.engine.current_version(&"D".into()).await.unwrap(), 1);
        assert!(matches!(
            drain(&mut rb).as_slice(),
            [ServerMessage::Sync { client_id, .. }] if *client_id == a
        ));
    }

    #[tokio::test]
    async fn test_unregistered_connection_is_ignored() {
        let h = harness();
        h.dispatcher.dispatch(ConnectionId::new(), "{}").await;
        assert_eq!(h.dispatcher.stats().frames_received, 0);
    }
}
