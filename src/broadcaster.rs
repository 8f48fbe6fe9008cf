//! Fan-out of verified webhook events to live WebSocket subscribers.
//!
//! The subscriber set lives inside [`Broadcaster`] behind an async mutex.
//! `publish` holds that lock for the whole pass, so:
//! - adds and removes never interleave with a half-finished publish,
//! - a subscriber removed before `publish` starts never receives the event,
//! - events reach every subscriber in the order `publish` was called.
//!
//! A failed or timed-out send prunes that one subscriber and nothing else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::BroadcastConfig;

/// One serialized event, shared between every subscriber queue.
pub type Frame = Arc<str>;

/// Unique handle of a subscriber connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

/// Last time a connection showed signs of life. Shared between the
/// subscriber entry and the connection's read loop.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<parking_lot::Mutex<Instant>>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(parking_lot::Mutex::new(Instant::now())))
    }

    pub fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.0.lock().elapsed()
    }
}

/// A registered connection: its handle plus the queue feeding its writer.
#[derive(Debug)]
pub struct Subscriber {
    id: ConnectionId,
    sender: mpsc::Sender<Frame>,
    liveness: Liveness,
}

impl Subscriber {
    pub fn new(sender: mpsc::Sender<Frame>) -> Self {
        Self {
            id: ConnectionId::generate(),
            sender,
            liveness: Liveness::new(),
        }
    }

    /// A subscriber and the receiving end of its bounded frame queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }
}

/// What happened during one `publish` pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub pruned: usize,
}

#[derive(Debug, Default)]
struct SubscriberSet {
    members: HashMap<ConnectionId, Subscriber>,
    closed: bool,
}

#[derive(Debug)]
pub struct Broadcaster {
    subscribers: Mutex<SubscriberSet>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(config: &BroadcastConfig) -> Self {
        Self {
            subscribers: Mutex::new(SubscriberSet::default()),
            send_timeout: config.send_timeout,
        }
    }

    /// Register a subscriber. Returns `false` without touching the set if
    /// the handle is already present or the broadcaster has shut down.
    pub async fn add_subscriber(&self, subscriber: Subscriber) -> bool {
        let mut set = self.subscribers.lock().await;
        if set.closed || set.members.contains_key(&subscriber.id) {
            return false;
        }
        let id = subscriber.id;
        set.members.insert(id, subscriber);
        info!(%id, subscribers = set.members.len(), "subscriber connected");
        true
    }

    /// Unregister a subscriber. No-op if it is not present.
    pub async fn remove_subscriber(&self, id: ConnectionId) -> bool {
        let mut set = self.subscribers.lock().await;
        let removed = set.members.remove(&id).is_some();
        if removed {
            info!(%id, subscribers = set.members.len(), "subscriber disconnected");
        }
        removed
    }

    /// Send `event` to every current subscriber, pruning the ones whose
    /// connection is gone or whose queue stays full past the send timeout.
    #[instrument(skip_all)]
    pub async fn publish(&self, event: &Value) -> PublishReport {
        let frame: Frame = event.to_string().into();
        self.publish_frame(frame).await
    }

    async fn publish_frame(&self, frame: Frame) -> PublishReport {
        let mut set = self.subscribers.lock().await;
        let send_timeout = self.send_timeout;

        let attempts = set.members.values().map(|subscriber| {
            let frame = frame.clone();
            async move {
                let outcome =
                    tokio::time::timeout(send_timeout, subscriber.sender.send(frame)).await;
                (subscriber.id, outcome)
            }
        });

        let mut failed = Vec::new();
        for (id, outcome) in join_all(attempts).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    debug!(%id, "subscriber queue closed");
                    failed.push(id);
                }
                Err(_) => {
                    warn!(%id, timeout = ?send_timeout, "subscriber send timed out");
                    failed.push(id);
                }
            }
        }

        for id in &failed {
            set.members.remove(id);
        }

        let report = PublishReport {
            delivered: set.members.len(),
            pruned: failed.len(),
        };
        debug!(delivered = report.delivered, pruned = report.pruned, "event published");
        report
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.members.len()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.subscribers.lock().await.members.contains_key(&id)
    }

    /// Drop subscribers that have been silent for longer than `max_idle`.
    pub async fn prune_idle(&self, max_idle: Duration) -> usize {
        let mut set = self.subscribers.lock().await;
        let before = set.members.len();
        set.members.retain(|id, subscriber| {
            let idle = subscriber.liveness.idle_for();
            let keep = idle <= max_idle;
            if !keep {
                info!(%id, ?idle, "dropping idle subscriber");
            }
            keep
        });
        before - set.members.len()
    }

    /// Periodically run [`Broadcaster::prune_idle`].
    pub fn spawn_idle_sweep(
        self: &Arc<Self>,
        every: Duration,
        max_idle: Duration,
    ) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                broadcaster.prune_idle(max_idle).await;
            }
        })
    }

    /// Drop every subscriber and refuse new ones. Writer tasks see their
    /// queue close and shut their sockets.
    pub async fn shutdown(&self) {
        let mut set = self.subscribers.lock().await;
        set.closed = true;
        let dropped = set.members.len();
        set.members.clear();
        info!(dropped, "broadcaster shut down");
    }
}

#[cfg(test)]
impl Subscriber {
    fn with_id(id: ConnectionId, sender: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            sender,
            liveness: Liveness::new(),
        }
    }
}
