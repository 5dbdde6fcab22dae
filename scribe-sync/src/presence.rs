//! Presence tracking for cursor & selection awareness.
//!
//! Presence is ephemeral: records live only as long as their connection and
//! are rebuilt from scratch when a client reconnects. Each connection owns one
//! record; other connections only ever read it through [`PresenceTracker::snapshot`].

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::protocol::{now_millis, ConnectionId, DocumentId, PresenceRecord, PresenceState, UserId};

struct TrackedPresence {
    document: DocumentId,
    record: PresenceRecord,
}

/// Per-connection presence records, grouped by document on read.
#[derive(Default)]
pub struct PresenceTracker {
    records: RwLock<HashMap<ConnectionId, TrackedPresence>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the presence of `connection` and stamp `lastUpdate`.
    pub async fn update(
        &self,
        connection: ConnectionId,
        user: UserId,
        document: DocumentId,
        presence: PresenceState,
    ) -> PresenceRecord {
        let record = PresenceRecord {
            client_id: connection,
            user_id: user,
            cursor: presence.cursor,
            selection: presence.selection,
            last_update: now_millis(),
        };
        self.records.write().await.insert(
            connection,
            TrackedPresence {
                document,
                record: record.clone(),
            },
        );
        record
    }

    pub async fn remove(&self, connection: ConnectionId) -> Option<PresenceRecord> {
        self.records
            .write()
            .await
            .remove(&connection)
            .map(|tracked| tracked.record)
    }

    pub async fn get(&self, connection: ConnectionId) -> Option<PresenceRecord> {
        self.records
            .read()
            .await
            .get(&connection)
            .map(|tracked| tracked.record.clone())
    }

    /// All records of one document, ordered by client id.
    pub async fn snapshot(&self, document: &DocumentId) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|tracked| &tracked.document == document)
            .map(|tracked| tracked.record.clone())
            .collect();
        records.sort_by_key(|r| r.client_id);
        records
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
