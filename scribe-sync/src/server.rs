//! WebSocket sync server with per-document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/<doc>   ┌─────────────┐
//!            ├──────────────────► │ Auth gate   │ IdentityResolver
//! Client B ──┘                    └──────┬──────┘
//!                                        ▼
//!                  receive loop ──► Dispatcher ──► SyncEngine ──► PersistenceWriter
//!                  (one per conn)       │              (per-document lock)
//!                                       ├──► PresenceTracker
//!                                       └──► BroadcastRouter ──► outbound queue ──► writer task
//!                                                ▲
//!                               LivenessMonitor ─┘ (ping / evict)
//! ```
//!
//! Every connection runs two tasks: the receive loop, which hands frames to
//! the dispatcher in arrival order, and a writer task draining the bounded
//! outbound queue into the socket.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{resolver_from_config, AnonymousResolver, ConnectionRequest, IdentityResolver};
use crate::broadcast::BroadcastRouter;
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::SyncEngine;
use crate::error::ServerError;
use crate::liveness::LivenessMonitor;
use crate::presence::PresenceTracker;
use crate::protocol::{DocumentId, ProtocolError, ServerMessage};
use crate::registry::{ConnectionRegistry, TransportHandle};
use crate::storage::{MemoryStore, OperationStore, RocksStore, StoreConfig};

/// How long a closing connection may take to flush its outbound queue.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub active_documents: usize,
    pub total_messages: u64,
    pub accepted_operations: u64,
    pub conflicts: u64,
    pub resolutions: u64,
    pub protocol_errors: u64,
    pub evictions: u64,
    pub broadcasts: u64,
    pub dropped_sends: u64,
}

/// State shared by every connection task.
#[derive(Clone)]
struct ConnectionContext {
    dispatcher: Arc<Dispatcher>,
    identity: Arc<dyn IdentityResolver>,
    default_document: DocumentId,
    outbound_capacity: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    engine: Arc<SyncEngine>,
    router: Arc<BroadcastRouter>,
    dispatcher: Arc<Dispatcher>,
    identity: Arc<dyn IdentityResolver>,
}

impl SyncServer {
    /// Wire up every component. Must be called inside a tokio runtime.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn OperationStore>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_pending_ops));
        let presence = Arc::new(PresenceTracker::new());
        let engine = Arc::new(SyncEngine::new(store, config.max_log_len));
        let router = Arc::new(BroadcastRouter::new(registry.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            presence,
            engine.clone(),
            router.clone(),
        ));

        Self {
            config,
            registry,
            engine,
            router,
            dispatcher,
            identity,
        }
    }

    /// Default configuration, in-memory storage, anonymous access.
    pub fn with_defaults() -> Self {
        Self::new(
            ServerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(AnonymousResolver),
        )
    }

    /// Build storage and authentication from configuration.
    pub fn from_config(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let store: Arc<dyn OperationStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig::at(path.clone()))?;
                let documents = store.list_documents()?;
                log::info!(
                    "Opened store at {} with {} documents",
                    path.display(),
                    documents.len()
                );
                Arc::new(store)
            }
            None => {
                log::info!("No storage path configured, documents are kept in memory");
                Arc::new(MemoryStore::new())
            }
        };
        let identity = resolver_from_config(&config.auth);
        Ok(Self::new(config, store, identity))
    }

    /// Listen on the configured address until the process is stopped.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Listen on the configured address until `shutdown` completes.
    pub async fn run_until(&self, shutdown: impl Future) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until `shutdown` completes, then
    /// close every connection and flush pending writes.
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future) -> Result<(), ServerError> {
        self.config.validate()?;
        log::info!("Sync server listening on {}", listener.local_addr()?);

        let monitor = LivenessMonitor::new(
            self.registry.clone(),
            self.router.clone(),
            self.config.heartbeat_interval(),
        )
        .spawn(self.dispatcher.clone());

        let ctx = ConnectionContext {
            dispatcher: self.dispatcher.clone(),
            identity: self.identity.clone(),
            default_document: DocumentId::new(self.config.default_document.clone()),
            outbound_capacity: self.config.outbound_capacity,
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                                log::error!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("Failed to accept connection: {e}"),
                },
            }
        }

        log::info!("Sync server shutting down");
        monitor.abort();
        for connection in self.registry.snapshot().await {
            self.dispatcher.disconnect(connection.id).await;
        }
        self.engine.flush().await;
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), ServerError> {
        let mut captured = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let path = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
                let headers = req
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v.to_string())));
                captured = Some(ConnectionRequest::from_parts(path, headers));
                Ok(response)
            },
        )
        .await?;
        let request = captured.unwrap_or_default();
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let identity = match ctx.identity.resolve_identity(&request).await {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("Rejected connection from {addr}: {e}");
                let frame = ServerMessage::error(format!("authentication failed: {e}"))
                    .encode()
                    .unwrap_or_default();
                let _ = ws_sender.send(Message::Text(frame.into())).await;
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(());
            }
        };
        let document = request
            .document_id()
            .map(DocumentId::from)
            .unwrap_or_else(|| ctx.default_document.clone());

        let (transport, mut outbound) = TransportHandle::channel(ctx.outbound_capacity);
        let shutdown = transport.shutdown_signal();
        let id = match ctx.dispatcher.admit(transport, identity, document).await {
            Ok(summary) => summary.id,
            Err(e) => {
                let _ = ws_sender
                    .send(Message::Text(
                        ServerMessage::error("document unavailable")
                            .encode()
                            .unwrap_or_default()
                            .into(),
                    ))
                    .await;
                let _ = ws_sender.send(Message::Close(None)).await;
                return Err(e.into());
            }
        };
        log::info!("WebSocket connection {id} established from {addr}");

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = ws_sender.send(Message::Text(frame.to_string().into())).await {
                    log::debug!("Write to {id} failed: {e}");
                    break;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    log::debug!("Closing connection {id}");
                    break;
                }
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => ctx.dispatcher.dispatch(id, text.as_str()).await,
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => ctx.dispatcher.dispatch(id, text).await,
                        Err(_) => {
                            ctx.dispatcher.touch(id).await;
                            ctx.dispatcher
                                .reject_frame(id, ProtocolError::Malformed("binary frame is not UTF-8".into()))
                                .await;
                        }
                    },
                    // tungstenite answers pings itself
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => ctx.dispatcher.touch(id).await,
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {id} closed by {addr}");
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                },
            }
        }

        ctx.dispatcher.disconnect(id).await;
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let dispatch = self.dispatcher.stats();
        let engine = self.engine.stats();
        let broadcast = self.router.stats();
        ServerStats {
            total_connections: dispatch.connections_total,
            active_connections: self.registry.len().await,
            active_documents: self.engine.document_count().await,
            total_messages: dispatch.frames_received,
            accepted_operations: engine.accepted_operations,
            conflicts: dispatch.conflicts,
            resolutions: engine.resolutions,
            protocol_errors: dispatch.protocol_errors,
            evictions: dispatch.evictions,
            broadcasts: broadcast.messages_sent,
            dropped_sends: broadcast.send_failures,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, AuthMode};

    #[tokio::test]
    async fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_from_config_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::from_config(config).unwrap();
        assert_eq!(
            server.engine().open_document(&"D".into()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_from_config_reopens_existing_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(StoreConfig::at(path.clone())).unwrap();
            let mut op = crate::protocol::Operation::insert("body", "x", 0);
            op.version = 1;
            store.append_operations(&"D".into(), &[op]).unwrap();
            store.flush().unwrap();
        }
        let config = ServerConfig {
            storage_path: Some(path),
            ..ServerConfig::default()
        };
        let server = SyncServer::from_config(config).unwrap();
        assert_eq!(
            server.engine().open_document(&"D".into()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid() {
        let config = ServerConfig {
            auth: AuthConfig {
                mode: AuthMode::Token,
                tokens: Default::default(),
            },
            ..ServerConfig::default()
        };
        assert!(matches!(
            SyncServer::from_config(config),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = SyncServer::with_defaults();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        server.serve(listener, async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_rejects_invalid_config() {
        for heartbeat_interval_secs in [0, u64::MAX] {
            let server = SyncServer::new(
                ServerConfig {
                    heartbeat_interval_secs,
                    ..ServerConfig::default()
                },
                Arc::new(MemoryStore::new()),
                Arc::new(AnonymousResolver),
            );
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let result = server.serve(listener, std::future::pending::<()>()).await;
            assert!(matches!(result, Err(ServerError::Config(_))));
        }
    }
}
