mod cameras;
mod history;

pub use cameras::{Camera, CameraPatch, CameraRegistry, NewCamera, RegistryError};
pub use history::{spawn_history_writer, DailyReport, HistoryError, MetricsHistory};
