mod broadcast;
mod error;
mod mjpeg;
mod server;
mod ws;

pub use broadcast::MetricsBroadcaster;
pub use server::{start_server, AppState, StreamSettings};
