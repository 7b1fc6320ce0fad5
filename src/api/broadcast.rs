use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::analytics::MetricsSnapshot;

/// Fans serialized snapshots out to WebSocket subscribers.
///
/// Each subscriber gets a bounded queue. A subscriber whose queue is full is
/// dropped on the spot; delivery to the rest never waits on it.
pub struct MetricsBroadcaster {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
    queue: usize,
}

pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Arc<str>>,
}

impl MetricsBroadcaster {
    pub fn new(queue: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue: queue.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<Arc<str>>>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// New subscribers only see snapshots published after this call.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(self.queue);
        let count = {
            let mut subscribers = self.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        tracing::debug!(subscriber = id, subscribers = count, "metrics subscriber added");
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            tracing::debug!(subscriber = id, "metrics subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Returns how many subscribers accepted the message.
    pub fn broadcast(&self, message: Arc<str>) -> usize {
        let mut delivered = 0;
        self.lock().retain(|id, tx| match tx.try_send(Arc::clone(&message)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = *id, "metrics subscriber too slow, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Serializes each snapshot from the live feed once and broadcasts it.
    pub fn spawn_forwarder(
        self: &Arc<Self>,
        mut feed: broadcast::Receiver<Arc<MetricsSnapshot>>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let snapshot = match feed.recv().await {
                    Ok(snapshot) => snapshot,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "metrics forwarder fell behind the feed");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match serde_json::to_string(snapshot.as_ref()) {
                    Ok(json) => {
                        this.broadcast(Arc::from(json));
                    }
                    Err(e) => tracing::error!(error = %e, "failed to serialize snapshot"),
                }
            }
            tracing::debug!("metrics forwarder stopped");
        })
    }
}
