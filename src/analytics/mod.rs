mod aggregate;
pub mod annotate;
mod object;
mod pipeline;
mod roi;
mod tracker;

pub use aggregate::{Aggregator, MetricsSnapshot, MinuteAggregator, MinuteSummary, TrafficState};
pub use object::{BoundingBox, ClassLabel, Detection, Detector, InferenceError, ObjectDetector};
pub use pipeline::{
    spawn_pipeline, FirstOutput, PipelineContext, PipelineSpec, SharedDetector, WorkerHandle,
    WorkerSettings,
};
pub use roi::Polygon;
pub use tracker::TrackedObject;
