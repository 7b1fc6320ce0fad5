//! Frame acquisition from RTSP, HTTP and local-file sources.
//!
//! Every variant sits behind [`FrameSource`]; [`DefaultOpener`] picks the
//! variant from the source URL and [`ResilientSource`] layers reconnects and
//! file looping on top of whatever the opener returns.

mod capture;
mod mjpeg;
mod reconnect;

use std::time::Duration;

use opencv::core::Mat;
use thiserror::Error;

pub use capture::CaptureSource;
pub use mjpeg::MjpegSource;
pub use reconnect::{ReconnectPolicy, ResilientSource};
pub(crate) use reconnect::sleep_unless_shutdown;

pub type Frame = Mat;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("end of stream")]
    EndOfStream,
    #[error("read error: {0}")]
    Read(String),
    #[error("source failed {attempts} reconnects within a minute")]
    Persistent { attempts: usize },
    #[error("cancelled")]
    Cancelled,
}

impl From<opencv::Error> for SourceError {
    fn from(e: opencv::Error) -> Self {
        SourceError::Read(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Rtsp,
    Http,
    LocalFile,
}

impl SourceKind {
    pub fn from_url(url: &str) -> Self {
        let lower = url.trim().to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceKind::Http
        } else {
            SourceKind::LocalFile
        }
    }

    pub fn is_live(self) -> bool {
        !matches!(self, SourceKind::LocalFile)
    }
}

/// An open handle producing decoded BGR frames.
pub trait FrameSource: Send {
    /// Next frame. File sources return `EndOfStream` at the end; network
    /// sources report transient failures as `Read`.
    fn read_frame(&mut self) -> Result<Frame, SourceError>;

    /// Native frame rate, when the container reports one.
    fn nominal_fps(&self) -> Option<f64> {
        None
    }

    /// Releases the underlying decoder or connection. Safe to call twice.
    fn close(&mut self);
}

pub trait SourceOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Dispatches on the URL scheme.
pub struct DefaultOpener {
    open_timeout: Duration,
}

impl DefaultOpener {
    pub fn new(open_timeout: Duration) -> Self {
        Self { open_timeout }
    }
}

impl SourceOpener for DefaultOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        let kind = SourceKind::from_url(url);
        tracing::debug!(url = %url, kind = ?kind, "opening source");

        match kind {
            SourceKind::Rtsp => Ok(Box::new(CaptureSource::open_live(url, self.open_timeout)?)),
            SourceKind::Http => match MjpegSource::connect(url, self.open_timeout)? {
                Some(mjpeg) => Ok(Box::new(mjpeg)),
                // Not a multipart stream (HLS, progressive mp4, ...): let ffmpeg handle it.
                None => Ok(Box::new(CaptureSource::open_live(url, self.open_timeout)?)),
            },
            SourceKind::LocalFile => {
                let path = url.strip_prefix("file://").unwrap_or(url);
                Ok(Box::new(CaptureSource::open_file(path)?))
            }
        }
    }
}
