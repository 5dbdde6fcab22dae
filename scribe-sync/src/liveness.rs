//! Heartbeat-driven eviction of unresponsive connections.
//!
//! ```text
//! Active ──(idle ≥ 1 interval)──► AwaitingPong ──(any inbound)──► Active
//!                                      │
//!                          (idle > 2 intervals)
//!                                      ▼
//!                                    Dead ──► evicted
//! ```
//!
//! Each tick pings every connection that is still alive.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::broadcast::BroadcastRouter;
use crate::dispatcher::Dispatcher;
use crate::protocol::{ConnectionId, ServerMessage};
use crate::registry::{ConnectionRegistry, Liveness};

pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    router: Arc<BroadcastRouter>,
    interval: Duration,
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl LivenessMonitor {
    /// `interval` is raised to at least one millisecond.
    pub fn new(registry: Arc<ConnectionRegistry>, router: Arc<BroadcastRouter>, interval: Duration) -> Self {
        Self {
            registry,
            router,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Run one tick at `now`: update liveness states, ping the living and
    /// return the ids of dead connections.
    pub async fn sweep(&self, now: Instant) -> Vec<ConnectionId> {
        let interval = self.interval;
        let mut dead = Vec::new();
        let mut alive = Vec::new();

        self.registry
            .inspect_mut(|connection| {
                let idle = now.saturating_duration_since(connection.last_activity);
                if idle > interval.saturating_mul(2) {
                    dead.push(connection.id);
                    return;
                }
                if idle >= interval {
                    connection.liveness = Liveness::AwaitingPong;
                }
                alive.push(connection.id);
            })
            .await;

        if !alive.is_empty() {
            self.router.to_connections(&alive, &ServerMessage::Ping).await;
        }
        if !dead.is_empty() {
            log::debug!("Liveness sweep: {} alive, {} dead", alive.len(), dead.len());
        }
        dead
    }

    /// Run the monitor until the returned handle is aborted.
    pub fn spawn(self, dispatcher: Arc<Dispatcher>) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!("Liveness monitor started (interval: {:?})", self.interval);
            let mut timer = tokio::time::interval(self.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            timer.tick().await;

            loop {
                timer.tick().await;
                for id in self.sweep(Instant::now()).await {
                    dispatcher.evict(id).await;
                }
            }
        })
    }
}
