//! Stand-ins for cameras and the model, shared by controller and API tests.
//!
//! URL schemes understood by [`FakeOpener`]:
//! - `fake://...` and plain paths stream frames forever
//! - `fail://...` refuses to open
//! - `dies://...` yields a few frames, then every read and reopen fails
//! - `mute://...` opens but never yields a frame

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opencv::core::{Mat, Scalar, CV_8UC3};
use opencv::prelude::*;

use crate::analytics::{
    BoundingBox, ClassLabel, Detection, Detector, InferenceError, PipelineContext, SharedDetector,
    WorkerSettings,
};
use crate::buffer::LiveOutputs;
use crate::camera::{Frame, FrameSource, ReconnectPolicy, SourceError, SourceOpener};
use crate::config::{TrackerConfig, TrafficConfig};
use crate::controller::{ControllerSettings, PipelineController};

pub const FRAME_WIDTH: i32 = 64;
pub const FRAME_HEIGHT: i32 = 48;
const FRAME_INTERVAL: Duration = Duration::from_millis(5);

struct FakeSource {
    remaining: Option<u32>,
    produces: bool,
    closed: Arc<AtomicUsize>,
}

impl FrameSource for FakeSource {
    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        std::thread::sleep(FRAME_INTERVAL);
        if !self.produces {
            return Err(SourceError::Read("mute".into()));
        }
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(SourceError::Read("connection reset".into()));
            }
            *remaining -= 1;
        }
        Mat::new_rows_cols_with_default(FRAME_HEIGHT, FRAME_WIDTH, CV_8UC3, Scalar::all(90.0))
            .map_err(SourceError::from)
    }

    fn nominal_fps(&self) -> Option<f64> {
        Some(200.0)
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeOpener {
    pub opens: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    opened_urls: Mutex<Vec<String>>,
}

impl FakeOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened_urls(&self) -> Vec<String> {
        self.opened_urls.lock().unwrap().clone()
    }
}

impl SourceOpener for FakeOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.opened_urls.lock().unwrap().push(url.to_string());

        let closed = Arc::clone(&self.closed);
        // Plain paths behave like `fake://`.
        let scheme = url.split_once("://").map_or("fake", |(scheme, _)| scheme);
        let (remaining, produces) = match scheme {
            "fake" => (None, true),
            "dies" if self.opened_urls().iter().filter(|u| *u == url).count() == 1 => {
                (Some(5), true)
            }
            "mute" => (None, false),
            _ => return Err(SourceError::Unavailable(format!("{url}: refused"))),
        };
        Ok(Box::new(FakeSource {
            remaining,
            produces,
            closed,
        }))
    }
}

/// One car in the top-left corner of every frame.
pub struct FakeDetector {
    pub fail: Arc<AtomicBool>,
}

impl Detector for FakeDetector {
    fn infer(&mut self, frame: &Mat) -> Result<Vec<Detection>, InferenceError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(InferenceError::Model("scripted failure".into()));
        }
        if frame.empty() {
            return Err(InferenceError::Frame("empty frame".into()));
        }
        Ok(vec![Detection {
            class_label: ClassLabel::Car,
            bbox: BoundingBox::new(4.0, 4.0, 16.0, 12.0),
            confidence: 0.9,
        }])
    }
}

pub fn fake_detector() -> (SharedDetector, Arc<AtomicBool>) {
    let fail = Arc::new(AtomicBool::new(false));
    let detector: Box<dyn Detector> = Box::new(FakeDetector {
        fail: Arc::clone(&fail),
    });
    (Arc::new(Mutex::new(detector)), fail)
}

pub fn settings() -> ControllerSettings {
    ControllerSettings {
        open_timeout: Duration::from_secs(2),
        first_frame_timeout: Duration::from_secs(2),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts_per_minute: 2,
        },
    }
}

pub fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        frame_stride: 1,
        live_size: (FRAME_WIDTH, FRAME_HEIGHT),
        file_size: (FRAME_WIDTH, FRAME_HEIGHT),
        jpeg_quality: 60,
        tracker: TrackerConfig::default(),
        traffic: TrafficConfig::default(),
    }
}

pub struct Harness {
    pub controller: PipelineController,
    pub opener: Arc<FakeOpener>,
    pub outputs: LiveOutputs,
    pub detector_fail: Arc<AtomicBool>,
}

pub fn harness() -> Harness {
    let opener = FakeOpener::new();
    let outputs = LiveOutputs::new();
    let (detector, detector_fail) = fake_detector();
    let context = PipelineContext {
        detector,
        outputs: outputs.clone(),
        history: None,
        settings: worker_settings(),
    };
    let controller = PipelineController::new(settings(), opener.clone(), context);
    Harness {
        controller,
        opener,
        outputs,
        detector_fail,
    }
}
