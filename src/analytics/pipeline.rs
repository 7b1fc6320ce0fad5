use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::buffer::{FramePacket, LiveOutputs};
use crate::camera::{sleep_unless_shutdown, Frame, FrameSource, ResilientSource, SourceError};
use crate::config::{Config, TrackerConfig, TrafficConfig};

use super::aggregate::{Aggregator, MetricsSnapshot, MinuteAggregator, MinuteSummary};
use super::annotate;
use super::object::Detector;
use super::roi::Polygon;
use super::tracker::{TrackedObject, Tracker};

const DEFAULT_FILE_FPS: f64 = 25.0;
const MAX_FILE_FPS: f64 = 240.0;
const SLOT_WAIT: Duration = Duration::from_millis(100);

/// One model shared by every pipeline; a switch briefly runs two workers.
pub type SharedDetector = Arc<Mutex<Box<dyn Detector>>>;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub frame_stride: u32,
    pub live_size: (i32, i32),
    pub file_size: (i32, i32),
    pub jpeg_quality: i32,
    pub tracker: TrackerConfig,
    pub traffic: TrafficConfig,
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        Self {
            frame_stride: config.source.frame_stride,
            live_size: (config.source.live_width, config.source.live_height),
            file_size: (config.source.file_width, config.source.file_height),
            jpeg_quality: config.stream.jpeg_quality,
            tracker: config.tracker.clone(),
            traffic: config.traffic.clone(),
        }
    }
}

/// Shared by every pipeline the controller starts.
#[derive(Clone)]
pub struct PipelineContext {
    pub detector: SharedDetector,
    pub outputs: LiveOutputs,
    pub history: Option<mpsc::UnboundedSender<MinuteSummary>>,
    pub settings: WorkerSettings,
}

/// What a single pipeline runs on.
pub struct PipelineSpec {
    pub id: u64,
    pub label: String,
    pub source: ResilientSource,
    pub roi: Option<Polygon>,
    pub shutdown: Arc<AtomicBool>,
}

/// The first processed frame, held back from the live outputs until the
/// controller commits the switch.
pub struct FirstOutput {
    pub frame: Option<FramePacket>,
    pub metrics: MetricsSnapshot,
}

pub struct WorkerHandle {
    id: u64,
    shutdown: Arc<AtomicBool>,
    acquisition: JoinHandle<()>,
    inference: JoinHandle<()>,
    first_output: Option<oneshot::Receiver<FirstOutput>>,
    failure: Option<oneshot::Receiver<SourceError>>,
}

impl WorkerHandle {
    pub fn take_first_output(&mut self) -> Option<oneshot::Receiver<FirstOutput>> {
        self.first_output.take()
    }

    /// Resolves with the error that ended acquisition; the sender is dropped
    /// without a value on a requested shutdown.
    pub fn take_failure(&mut self) -> Option<oneshot::Receiver<SourceError>> {
        self.failure.take()
    }

    /// Signals both threads and waits for them. The source is closed by the
    /// acquisition thread before it exits.
    pub async fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Err(e) = self.acquisition.await {
            tracing::error!(pipeline = self.id, error = %e, "acquisition thread panicked");
        }
        if let Err(e) = self.inference.await {
            tracing::error!(pipeline = self.id, error = %e, "inference thread panicked");
        }
        tracing::debug!(pipeline = self.id, "pipeline worker joined");
    }
}

pub fn spawn_pipeline(spec: PipelineSpec, ctx: &PipelineContext) -> WorkerHandle {
    let PipelineSpec {
        id,
        label,
        source,
        roi,
        shutdown,
    } = spec;

    let slot = Arc::new(FrameSlot::default());
    let (first_tx, first_rx) = oneshot::channel();
    let (failure_tx, failure_rx) = oneshot::channel();

    let target = if source.kind().is_live() {
        ctx.settings.live_size
    } else {
        ctx.settings.file_size
    };

    let acquisition = Acquisition {
        id,
        label: label.clone(),
        source,
        stride: u64::from(ctx.settings.frame_stride.max(1)),
        slot: Arc::clone(&slot),
        shutdown: Arc::clone(&shutdown),
        failure: Some(failure_tx),
    };

    let inference = Inference {
        id,
        label,
        detector: Arc::clone(&ctx.detector),
        roi,
        tracker: Tracker::new(ctx.settings.tracker.iou_threshold, ctx.settings.tracker.max_missed),
        aggregator: Aggregator::new(&ctx.settings.traffic),
        minutes: MinuteAggregator::new((&ctx.settings.traffic).into()),
        outputs: ctx.outputs.clone(),
        history: ctx.history.clone(),
        target,
        jpeg_quality: ctx.settings.jpeg_quality,
        first: Some(first_tx),
        skipped: 0,
    };

    let inference_slot = Arc::clone(&slot);
    let inference_shutdown = Arc::clone(&shutdown);

    WorkerHandle {
        id,
        shutdown,
        acquisition: tokio::task::spawn_blocking(move || acquisition.run()),
        inference: tokio::task::spawn_blocking(move || {
            inference.run(&inference_slot, &inference_shutdown)
        }),
        first_output: Some(first_rx),
        failure: Some(failure_rx),
    }
}

enum SlotRead {
    Frame(Frame),
    Empty,
    Closed,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    closed: bool,
    overwritten: u64,
}

/// Single-frame handoff between acquisition and inference. A new frame
/// replaces an unconsumed one, so inference always sees the newest.
#[derive(Default)]
struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn put(&self, frame: Frame) {
        let mut state = self.lock();
        if state.frame.replace(frame).is_some() {
            state.overwritten += 1;
        }
        self.ready.notify_one();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    fn take(&self, wait: Duration) -> SlotRead {
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.frame.take() {
                return SlotRead::Frame(frame);
            }
            if state.closed {
                return SlotRead::Closed;
            }
            let (next, timeout) = self
                .ready
                .wait_timeout(state, wait)
                .unwrap_or_else(|p| p.into_inner());
            state = next;
            if timeout.timed_out() && state.frame.is_none() && !state.closed {
                return SlotRead::Empty;
            }
        }
    }

    fn overwritten(&self) -> u64 {
        self.lock().overwritten
    }
}

struct Acquisition {
    id: u64,
    label: String,
    source: ResilientSource,
    stride: u64,
    slot: Arc<FrameSlot>,
    shutdown: Arc<AtomicBool>,
    failure: Option<oneshot::Sender<SourceError>>,
}

impl Acquisition {
    fn run(mut self) {
        tracing::info!(pipeline = self.id, source = %self.label, "acquisition started");

        let live = self.source.kind().is_live();
        let mut pacer = Pacer::default();
        let mut read: u64 = 0;

        let outcome = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break None;
            }
            match self.source.read_frame() {
                Ok(frame) => {
                    read += 1;
                    if !live {
                        let fps = file_fps(self.source.nominal_fps());
                        pacer.wait(fps, &self.shutdown);
                    }
                    if (read - 1) % self.stride == 0 {
                        self.slot.put(frame);
                    }
                }
                Err(SourceError::Cancelled) => break None,
                Err(e) => break Some(e),
            }
        };

        self.source.close();

        // Report before closing the slot: a controller waiting on the first
        // frame reads the failure once inference exits.
        match outcome {
            Some(e) => {
                tracing::error!(pipeline = self.id, source = %self.label, error = %e, "acquisition failed");
                if let Some(failure) = self.failure.take() {
                    let _ = failure.send(e);
                }
            }
            None => tracing::info!(
                pipeline = self.id,
                frames = read,
                overwritten = self.slot.overwritten(),
                "acquisition stopped"
            ),
        }

        self.slot.close();
    }
}

fn file_fps(nominal: Option<f64>) -> f64 {
    nominal
        .filter(|fps| *fps >= 1.0 && *fps <= MAX_FILE_FPS)
        .unwrap_or(DEFAULT_FILE_FPS)
}

/// Holds file playback to the container's frame rate.
#[derive(Default)]
struct Pacer {
    next_due: Option<Instant>,
}

impl Pacer {
    fn wait(&mut self, fps: f64, shutdown: &AtomicBool) {
        let interval = Duration::from_secs_f64(1.0 / fps);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            sleep_unless_shutdown(due - now, shutdown);
        }
        // Running late resets the schedule instead of bursting to catch up.
        self.next_due = Some(due.max(now) + interval);
    }
}

struct Inference {
    id: u64,
    label: String,
    detector: SharedDetector,
    roi: Option<Polygon>,
    tracker: Tracker,
    aggregator: Aggregator,
    minutes: MinuteAggregator,
    outputs: LiveOutputs,
    history: Option<mpsc::UnboundedSender<MinuteSummary>>,
    target: (i32, i32),
    jpeg_quality: i32,
    first: Option<oneshot::Sender<FirstOutput>>,
    skipped: u64,
}

impl Inference {
    fn run(mut self, slot: &FrameSlot, shutdown: &AtomicBool) {
        tracing::info!(pipeline = self.id, source = %self.label, "inference started");

        while !shutdown.load(Ordering::Relaxed) {
            match slot.take(SLOT_WAIT) {
                SlotRead::Frame(frame) => self.process(frame),
                SlotRead::Empty => continue,
                SlotRead::Closed => break,
            }
        }

        if let Some(summary) = self.minutes.flush() {
            self.record(summary);
        }

        tracing::info!(
            pipeline = self.id,
            skipped = self.skipped,
            live_tracks = self.tracker.live_tracks().count(),
            "inference stopped"
        );
    }

    fn process(&mut self, frame: Frame) {
        let mut frame = match self.resize(frame) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(pipeline = self.id, error = %e, "frame resize failed");
                self.skipped += 1;
                return;
            }
        };

        let inferred = {
            let mut detector = self.detector.lock().unwrap_or_else(|p| p.into_inner());
            detector.infer(&frame)
        };
        let detections = match inferred {
            Ok(d) => d,
            Err(e) => {
                self.skipped += 1;
                tracing::debug!(pipeline = self.id, error = %e, "inference failed, frame skipped");
                return;
            }
        };

        let detections = match &self.roi {
            Some(roi) => detections
                .into_iter()
                .filter(|d| roi.contains_box(&d.bbox))
                .collect(),
            None => detections,
        };

        let visible = self.tracker.update(&detections);
        let snapshot = self.aggregator.process(&visible, Utc::now(), Instant::now());

        if let Some(summary) = self.minutes.observe(&snapshot) {
            self.record(summary);
        }

        let frame = self.render(&mut frame, &visible, &snapshot);

        match self.first.take() {
            Some(first) => {
                tracing::debug!(pipeline = self.id, "first frame ready");
                let _ = first.send(FirstOutput {
                    frame,
                    metrics: snapshot,
                });
            }
            None => {
                self.outputs.publish(self.id, frame, snapshot);
            }
        }
    }

    fn resize(&self, frame: Frame) -> opencv::Result<Frame> {
        let (width, height) = self.target;
        if width <= 0 || height <= 0 || (frame.cols() == width && frame.rows() == height) {
            return Ok(frame);
        }
        let mut resized = Mat::default();
        imgproc::resize(
            &frame,
            &mut resized,
            Size::new(width, height),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;
        Ok(resized)
    }

    /// Annotates and encodes once; every stream client shares the bytes.
    fn render(
        &self,
        frame: &mut Mat,
        visible: &[TrackedObject],
        snapshot: &MetricsSnapshot,
    ) -> Option<FramePacket> {
        if let Err(e) = annotate::draw(frame, visible, snapshot) {
            tracing::warn!(pipeline = self.id, error = %e, "annotation failed");
        }
        match annotate::encode_jpeg(frame, self.jpeg_quality) {
            Ok(jpeg) => Some(FramePacket {
                pipeline: self.id,
                seq: snapshot.frame,
                jpeg: Bytes::from(jpeg),
            }),
            Err(e) => {
                tracing::warn!(pipeline = self.id, error = %e, "JPEG encode failed");
                None
            }
        }
    }

    fn record(&self, summary: MinuteSummary) {
        if let Some(history) = &self.history {
            if history.send(summary).is_err() {
                tracing::warn!(pipeline = self.id, "history writer gone, minute summary dropped");
            }
        }
    }
}
