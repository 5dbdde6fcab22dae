//! Fan-out of server messages to the connections of a document.
//!
//! Messages are encoded once and the resulting [`Frame`] is shared by every
//! recipient. Delivery is fire-and-forget: a recipient whose queue is full or
//! whose socket is gone is logged and skipped, and the liveness monitor
//! eventually evicts it. Nothing here ever fails the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{ConnectionId, DocumentId, ServerMessage};
use crate::registry::{ConnectionRegistry, Frame, TransportHandle};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub deliveries: u64,
    pub send_failures: u64,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    send_failures: AtomicU64,
}

/// Routes messages to one, all-but-one, or all connections of a document.
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    stats: AtomicBroadcastStats,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Deliver to every connection joined to `document`.
    /// Returns the number of connections the frame was queued for.
    pub async fn to_all(&self, document: &DocumentId, msg: &ServerMessage) -> usize {
        let recipients = self.registry.recipients(document, None).await;
        self.fan_out(recipients, msg)
    }

    /// Deliver to every connection joined to `document` except `sender`.
    pub async fn to_others(
        &self,
        document: &DocumentId,
        sender: ConnectionId,
        msg: &ServerMessage,
    ) -> usize {
        let recipients = self.registry.recipients(document, Some(sender)).await;
        self.fan_out(recipients, msg)
    }

    /// Deliver to a single connection.
    pub async fn to_one(&self, id: ConnectionId, msg: &ServerMessage) -> bool {
        match self.registry.transport(id).await {
            Some(handle) => self.fan_out(vec![(id, handle)], msg) == 1,
            None => {
                log::debug!("Dropping message for unknown connection {id}");
                false
            }
        }
    }

    /// Deliver the same message to an explicit set of connections.
    pub async fn to_connections(&self, ids: &[ConnectionId], msg: &ServerMessage) -> usize {
        let mut recipients = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(handle) = self.registry.transport(*id).await {
                recipients.push((*id, handle));
            }
        }
        self.fan_out(recipients, msg)
    }

    /// Broadcast statistics (lock-free snapshot).
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
        }
    }

    fn fan_out(&self, recipients: Vec<(ConnectionId, TransportHandle)>, msg: &ServerMessage) -> usize {
        if recipients.is_empty() {
            return 0;
        }
        let frame: Frame = match msg.encode() {
            Ok(encoded) => Arc::from(encoded),
            Err(e) => {
                log::error!("Failed to encode outbound message: {e}");
                return 0;
            }
        };
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for (id, handle) in recipients {
            match handle.try_send(id, frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Send failed: {e}");
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}
