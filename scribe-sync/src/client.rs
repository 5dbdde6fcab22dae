//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Operation submission based on the last version the client has seen
//! - Conflict resolution and presence updates
//! - Automatic replies to application-level pings
//!
//! Server frames are surfaced as [`SyncEvent`]s on a channel.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::protocol::{
    ClientMessage, ConnectionId, DocumentId, Operation, PresenceRecord, PresenceState,
    ProtocolError, Resolution, ServerMessage,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Admitted by the server
    Connected {
        client_id: ConnectionId,
        document_id: DocumentId,
        version: u64,
    },
    Joined {
        document_id: DocumentId,
        version: u64,
    },
    /// Our own batch was accepted
    Acknowledged {
        version: u64,
        operations: Vec<Operation>,
    },
    /// Operations accepted from another client
    RemoteSync {
        client_id: ConnectionId,
        operations: Vec<Operation>,
    },
    Conflict {
        operations: Vec<Operation>,
        current_version: u64,
    },
    ConflictResolved {
        client_id: ConnectionId,
        resolution: Resolution,
    },
    Presence(Vec<PresenceRecord>),
    History {
        operations: Vec<Operation>,
        current_version: u64,
    },
    /// The server rejected a frame
    Error(String),
    /// Connection lost
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The sync client.
pub struct SyncClient {
    server_url: String,
    document: DocumentId,
    user: Option<String>,
    token: Option<String>,
    auto_pong: bool,

    state: Arc<RwLock<ConnectionState>>,
    /// Last document version this client has seen
    version: Arc<AtomicU64>,
    client_id: Arc<RwLock<Option<ConnectionId>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a client for `document` on the server at `server_url` (`ws://host:port`).
    pub fn new(server_url: impl Into<String>, document: impl Into<DocumentId>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            document: document.into(),
            user: None,
            token: None,
            auto_pong: true,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            version: Arc::new(AtomicU64::new(0)),
            client_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Ask for a user name (honoured by anonymous servers).
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Do not answer server pings. The server will eventually evict the client.
    pub fn without_auto_pong(mut self) -> Self {
        self.auto_pong = false;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// URL this client connects to: the document as the last path segment,
    /// identity as query parameters, all percent-encoded.
    pub fn url(&self) -> Result<String, ClientError> {
        let mut url = Url::parse(&self.server_url).map_err(|e| ClientError::Connect(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Connect(format!("{} cannot carry a document path", self.server_url)))?
            .pop_if_empty()
            .push(self.document.as_str());

        let params: Vec<(&str, &str)> = [("user", &self.user), ("token", &self.token)]
            .into_iter()
            .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
            .collect();
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url.into())
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = match self.url() {
            Ok(url) => url,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let ws_stream = match tokio_tungstenite::connect_async(url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: turn server frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let version = self.version.clone();
        let client_id = self.client_id.clone();
        let pong_tx = self.auto_pong.then(|| out_tx.clone());
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let server_msg = match ServerMessage::decode(text.as_str()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Undecodable server frame: {e}");
                        continue;
                    }
                };

                let event = match server_msg {
                    ServerMessage::Connected {
                        client_id: id,
                        document_id,
                        version: v,
                    } => {
                        *client_id.write().await = Some(id);
                        version.store(v, Ordering::SeqCst);
                        Some(SyncEvent::Connected {
                            client_id: id,
                            document_id,
                            version: v,
                        })
                    }
                    ServerMessage::Joined {
                        document_id,
                        version: v,
                    } => {
                        version.store(v, Ordering::SeqCst);
                        Some(SyncEvent::Joined {
                            document_id,
                            version: v,
                        })
                    }
                    ServerMessage::Ack {
                        version: v,
                        operations,
                    } => {
                        version.fetch_max(v, Ordering::SeqCst);
                        Some(SyncEvent::Acknowledged {
                            version: v,
                            operations,
                        })
                    }
                    ServerMessage::Sync {
                        client_id: author,
                        operations,
                    } => {
                        if let Some(last) = operations.last() {
                            version.fetch_max(last.version, Ordering::SeqCst);
                        }
                        Some(SyncEvent::RemoteSync {
                            client_id: author,
                            operations,
                        })
                    }
                    ServerMessage::Conflict {
                        operations,
                        current_version,
                    } => Some(SyncEvent::Conflict {
                        operations,
                        current_version,
                    }),
                    ServerMessage::ConflictResolved {
                        client_id: author,
                        resolution,
                    } => {
                        version.fetch_max(resolution.new_version, Ordering::SeqCst);
                        Some(SyncEvent::ConflictResolved {
                            client_id: author,
                            resolution,
                        })
                    }
                    ServerMessage::PresenceUpdate { presence } => Some(SyncEvent::Presence(presence)),
                    ServerMessage::History {
                        operations,
                        current_version,
                    } => Some(SyncEvent::History {
                        operations,
                        current_version,
                    }),
                    ServerMessage::Ping => {
                        if let Some(tx) = &pong_tx {
                            if let Ok(frame) = ClientMessage::Pong.encode() {
                                let _ = tx.send(Message::Text(frame.into())).await;
                            }
                        }
                        None
                    }
                    ServerMessage::Pong => None,
                    ServerMessage::Error { error } => Some(SyncEvent::Error(error)),
                };

                if let Some(evt) = event {
                    let _ = event_tx.send(evt).await;
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        Ok(())
    }

    /// Send any client message.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        let frame = msg.encode()?;
        tx.send(Message::Text(frame.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Submit operations based on the last version this client has seen.
    pub async fn submit(&self, mut operations: Vec<Operation>) -> Result<(), ClientError> {
        let base = self.version();
        for op in &mut operations {
            op.base_version = base;
        }
        self.send(&ClientMessage::Sync { operations }).await
    }

    /// Submit a resolution that should become version `new_version`.
    pub async fn resolve(&self, operations: Vec<Operation>, new_version: u64) -> Result<(), ClientError> {
        self.send(&ClientMessage::ConflictResolution {
            resolution: Resolution {
                operations,
                new_version,
            },
        })
        .await
    }

    pub async fn update_presence(&self, presence: PresenceState) -> Result<(), ClientError> {
        self.send(&ClientMessage::Presence { presence }).await
    }

    pub async fn join(&self, document: impl Into<DocumentId>) -> Result<(), ClientError> {
        self.send(&ClientMessage::Join {
            document_id: document.into(),
        })
        .await
    }

    pub async fn request_history(&self, since_version: u64) -> Result<(), ClientError> {
        self.send(&ClientMessage::History { since_version }).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Last document version seen.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Id assigned by the server, once connected.
    pub async fn client_id(&self) -> Option<ConnectionId> {
        *self.client_id.read().await
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ConnectionRequest;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("ws://localhost:9090", "notes");
        assert_eq!(client.document().as_str(), "notes");
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.version(), 0);
    }

    #[test]
    fn test_url_building() {
        let client = SyncClient::new("ws://localhost:9090/", "D");
        assert_eq!(client.url().unwrap(), "ws://localhost:9090/D");

        let client = SyncClient::new("ws://localhost:9090", "D")
            .with_user("alice")
            .with_token("abc");
        assert_eq!(client.url().unwrap(), "ws://localhost:9090/D?user=alice&token=abc");

        assert!(matches!(
            SyncClient::new("not a url", "D").url(),
            Err(ClientError::Connect(_))
        ));
    }

    #[test]
    fn test_url_escapes_reserved_characters() {
        let client = SyncClient::new("ws://localhost:9090", "my doc/1?draft")
            .with_user("J&ürgen")
            .with_token("a+b");
        let url = Url::parse(&client.url().unwrap()).unwrap();
        assert_eq!(url.path_segments().unwrap().count(), 1);

        // The server reads back exactly what the client meant
        let path_and_query = format!("{}?{}", url.path(), url.query().unwrap());
        let request = ConnectionRequest::from_parts(path_and_query.as_str(), Vec::<(String, String)>::new());
        assert_eq!(request.document_id(), Some("my doc/1?draft"));
        assert_eq!(request.query_param("user"), Some("J&ürgen"));
        assert_eq!(request.bearer_token(), Some("a+b"));
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:9090", "D");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.client_id().await.is_none());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = SyncClient::new("ws://localhost:9090", "D");
        assert!(matches!(
            client.submit(vec![Operation::insert("body", "x", 0)]).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        // Nothing listens on port 1
        let mut client = SyncClient::new("ws://127.0.0.1:1", "D");
        assert!(matches!(client.connect().await, Err(ClientError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:9090", "D");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
