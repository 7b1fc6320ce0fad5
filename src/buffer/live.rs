use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::analytics::MetricsSnapshot;

/// Snapshots a feed subscriber may fall behind by before it starts losing them.
const METRICS_FEED_CAPACITY: usize = 256;

/// One encoded, annotated frame.
#[derive(Debug, Clone)]
pub struct FramePacket {
    /// Pipeline that produced the frame.
    pub pipeline: u64,
    /// Frame index within that pipeline, starting at 1.
    pub seq: u64,
    pub jpeg: Bytes,
}

struct Channels {
    /// Pipeline allowed to publish; 0 means none.
    owner: Mutex<u64>,
    frames: watch::Sender<Option<Arc<FramePacket>>>,
    metrics: watch::Sender<Option<Arc<MetricsSnapshot>>>,
    /// Every published snapshot, in order.
    feed: broadcast::Sender<Arc<MetricsSnapshot>>,
}

/// Latest-value slots for the annotated frame and its metrics.
///
/// Outlives individual pipelines. Only the current owner may publish, and
/// ownership changes under the same lock that guards publishing, so a reader
/// never sees an old pipeline's output after a newer one's.
#[derive(Clone)]
pub struct LiveOutputs {
    inner: Arc<Channels>,
}

impl Default for LiveOutputs {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveOutputs {
    pub fn new() -> Self {
        let (frames, _) = watch::channel(None);
        let (metrics, _) = watch::channel(None);
        let (feed, _) = broadcast::channel(METRICS_FEED_CAPACITY);
        Self {
            inner: Arc::new(Channels {
                owner: Mutex::new(0),
                frames,
                metrics,
                feed,
            }),
        }
    }

    fn owner(&self) -> MutexGuard<'_, u64> {
        // The guarded value is a plain id; a poisoned lock still holds a valid one.
        self.inner
            .owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<FramePacket>>> {
        self.inner.frames.subscribe()
    }

    #[cfg(test)]
    pub fn subscribe_metrics(&self) -> watch::Receiver<Option<Arc<MetricsSnapshot>>> {
        self.inner.metrics.subscribe()
    }

    /// Every snapshot published after the call, in publish order. The latest
    /// value alone is in [`latest_metrics`](Self::latest_metrics).
    pub fn subscribe_feed(&self) -> broadcast::Receiver<Arc<MetricsSnapshot>> {
        self.inner.feed.subscribe()
    }

    pub fn latest_frame(&self) -> Option<Arc<FramePacket>> {
        self.inner.frames.borrow().clone()
    }

    pub fn latest_metrics(&self) -> Option<Arc<MetricsSnapshot>> {
        self.inner.metrics.borrow().clone()
    }

    #[cfg(test)]
    pub fn current_owner(&self) -> u64 {
        *self.owner()
    }

    /// Publishes on behalf of `pipeline`. Returns `false` (and publishes
    /// nothing) when `pipeline` is not the current owner.
    pub fn publish(
        &self,
        pipeline: u64,
        frame: Option<FramePacket>,
        metrics: MetricsSnapshot,
    ) -> bool {
        let owner = self.owner();
        if *owner != pipeline {
            return false;
        }
        if let Some(frame) = frame {
            self.inner.frames.send_replace(Some(Arc::new(frame)));
        }
        self.send_metrics(metrics);
        true
    }

    /// Makes `pipeline` the owner and publishes its first output in the same
    /// critical section. Without a first frame the frame slot is emptied, so
    /// the previous owner's image never sits next to the new owner's metrics.
    pub fn hand_over(&self, pipeline: u64, frame: Option<FramePacket>, metrics: MetricsSnapshot) {
        let mut owner = self.owner();
        *owner = pipeline;
        self.inner.frames.send_replace(frame.map(Arc::new));
        self.send_metrics(metrics);
        tracing::debug!(pipeline, "live outputs handed over");
    }

    /// Caller holds the owner lock, which keeps the feed in publish order.
    fn send_metrics(&self, metrics: MetricsSnapshot) {
        let metrics = Arc::new(metrics);
        // No feed subscribers is fine.
        let _ = self.inner.feed.send(Arc::clone(&metrics));
        self.inner.metrics.send_replace(Some(metrics));
    }

    /// Revokes ownership and empties both slots.
    pub fn clear(&self) {
        let mut owner = self.owner();
        *owner = 0;
        self.inner.frames.send_replace(None);
        self.inner.metrics.send_replace(None);
    }
}
