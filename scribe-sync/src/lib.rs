//! # scribe-sync: real-time document synchronization
//!
//! Clients edit a shared document by sending operations over WebSocket. The
//! server assigns every accepted operation a document version, detects edits
//! that were based on stale state and fans results out to everyone on the
//! document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                         ┌──────────────────┼──────────────────┐
//!                         ▼                  ▼                  ▼
//!                  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//!                  │ SyncEngine  │    │ Presence    │    │ Broadcast   │
//!                  │ (versions)  │    │ Tracker     │    │ Router      │
//!                  └──────┬──────┘    └─────────────┘    └─────────────┘
//!                         ▼
//!                  ┌─────────────┐
//!                  │ Operation   │
//!                  │ Store       │
//!                  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire protocol and identifiers
//! - [`registry`]: Live connections and their outbound queues
//! - [`engine`]: Version assignment and conflict detection
//! - [`presence`]: Cursor & selection awareness
//! - [`broadcast`]: Fan-out to document members
//! - [`dispatcher`]: Routes inbound frames to the components above
//! - [`liveness`]: Heartbeat pings and eviction
//! - [`auth`]: Identity resolution at connect time
//! - [`storage`]: Persistent operation log (memory or RocksDB)
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod liveness;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{AnonymousResolver, AuthError, ConnectionRequest, IdentityResolver, TokenResolver};
pub use broadcast::{BroadcastRouter, BroadcastStats};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use config::{AuthConfig, AuthMode, ConfigError, ServerConfig, MAX_HEARTBEAT_INTERVAL_SECS};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use engine::{
    DeliveryTurn, DocumentState, EngineError, EngineStats, ResolveOutcome, Sequenced, SubmitOutcome,
    SyncEngine,
};
pub use error::ServerError;
pub use liveness::LivenessMonitor;
pub use presence::PresenceTracker;
pub use protocol::{
    ClientMessage, ConnectionId, Cursor, DocumentId, OpKind, Operation, PresenceRecord,
    PresenceState, ProtocolError, Resolution, Selection, ServerMessage, UserId,
};
pub use registry::{
    ConnectionRegistry, ConnectionSummary, Frame, Liveness, RegistryError, TransportError,
    TransportHandle,
};
pub use server::{ServerStats, SyncServer};
pub use storage::{
    DocumentMetadata, MemoryStore, OperationStore, PersistenceWriter, RocksStore, StoreConfig,
    StoreError,
};
