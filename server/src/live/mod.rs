//! Live fan-out of accepted records
//!
//! Thin wrapper over a tokio broadcast channel plus a subscriber registry.
//! Publishing never blocks the ingest path: a slow consumer lags on its own
//! receiver and is disconnected once its accumulated lag exceeds the budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::constants::{DEFAULT_STREAM_MAX_SECS, STREAM_LAG_BUDGET};
use crate::store::MetricRecord;

/// Why a subscription ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The per-connection wall-clock limit was reached
    MaxDurationReached,
    /// The consumer fell too far behind and was cut off
    SubscriberTimeout,
    /// The hub itself shut down
    HubClosed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
}

pub struct LiveHub {
    sender: broadcast::Sender<MetricRecord>,
    subscribers: DashMap<Uuid, SubscriberInfo>,
    published: AtomicU64,
    max_stream: Duration,
    lag_budget: u64,
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        Self::with_limits(
            capacity,
            Duration::from_secs(DEFAULT_STREAM_MAX_SECS),
            STREAM_LAG_BUDGET,
        )
    }

    pub fn with_limits(capacity: usize, max_stream: Duration, lag_budget: u64) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: DashMap::new(),
            published: AtomicU64::new(0),
            max_stream,
            lag_budget,
        }
    }

    /// Fan a record out to whoever is listening. No listeners is not an error.
    pub fn publish(&self, record: MetricRecord) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(record);
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = Uuid::new_v4();
        let info = SubscriberInfo {
            id,
            connected_at: Utc::now(),
        };
        self.subscribers.insert(id, info);
        tracing::debug!(subscriber = %id, total = self.subscribers.len(), "Live subscriber connected");
        Subscription {
            id,
            rx: self.sender.subscribe(),
            hub: Arc::clone(self),
            deadline: Instant::now() + self.max_stream,
            lagged: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn unregister(&self, id: Uuid) {
        self.subscribers.remove(&id);
        tracing::debug!(subscriber = %id, total = self.subscribers.len(), "Live subscriber disconnected");
    }
}

/// One consumer's view of the hub. Dropped on disconnect, which removes it
/// from the registry.
pub struct Subscription {
    id: Uuid,
    rx: broadcast::Receiver<MetricRecord>,
    hub: Arc<LiveHub>,
    deadline: Instant,
    lagged: u64,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Await the next record, enforcing both disconnect policies.
    ///
    /// A lag event means the broadcast ring overwrote entries this consumer
    /// never read; the skipped count accumulates and past the budget the
    /// consumer is treated as timed out rather than silently fed gaps forever.
    pub async fn next(&mut self) -> Result<MetricRecord, StreamEnd> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(self.deadline) => {
                    return Err(StreamEnd::MaxDurationReached);
                }
                res = self.rx.recv() => match res {
                    Ok(record) => return Ok(record),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.lagged = self.lagged.saturating_add(skipped);
                        tracing::warn!(
                            subscriber = %self.id,
                            skipped,
                            total_lagged = self.lagged,
                            "Live subscriber lagging"
                        );
                        if self.lagged > self.hub.lag_budget {
                            return Err(StreamEnd::SubscriberTimeout);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(StreamEnd::HubClosed);
                    }
                },
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}
