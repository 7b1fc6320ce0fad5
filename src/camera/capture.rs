use std::path::Path;
use std::time::Duration;

use opencv::core::{Mat, Vector};
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};

use super::{Frame, FrameSource, SourceError};

/// ffmpeg-backed capture used for RTSP, non-multipart HTTP and video files.
pub struct CaptureSource {
    capture: Option<VideoCapture>,
    url: String,
    live: bool,
    fps: Option<f64>,
}

impl CaptureSource {
    pub fn open_live(url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let params = Vector::<i32>::from_slice(&[
            videoio::CAP_PROP_OPEN_TIMEOUT_MSEC,
            timeout_ms,
            videoio::CAP_PROP_READ_TIMEOUT_MSEC,
            timeout_ms,
        ]);
        let mut capture =
            VideoCapture::from_file_with_params(url, videoio::CAP_FFMPEG, &params)
                .map_err(|e| SourceError::Unavailable(format!("{url}: {e}")))?;
        Self::ensure_opened(&capture, url)?;

        // Keep the decoder queue short so reads return the newest frame.
        let _ = capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);

        Ok(Self::from_capture(capture, url, true))
    }

    pub fn open_file(path: &str) -> Result<Self, SourceError> {
        if !Path::new(path).is_file() {
            return Err(SourceError::Unavailable(format!("{path}: no such file")));
        }
        let capture = VideoCapture::from_file(path, videoio::CAP_ANY)
            .map_err(|e| SourceError::Unavailable(format!("{path}: {e}")))?;
        Self::ensure_opened(&capture, path)?;
        Ok(Self::from_capture(capture, path, false))
    }

    fn ensure_opened(capture: &VideoCapture, url: &str) -> Result<(), SourceError> {
        match capture.is_opened() {
            Ok(true) => Ok(()),
            Ok(false) => Err(SourceError::Unavailable(format!("{url}: could not be opened"))),
            Err(e) => Err(SourceError::Unavailable(format!("{url}: {e}"))),
        }
    }

    fn from_capture(capture: VideoCapture, url: &str, live: bool) -> Self {
        let fps = capture
            .get(videoio::CAP_PROP_FPS)
            .ok()
            .filter(|fps| fps.is_finite() && *fps > 0.0);
        let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0);
        let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0);

        tracing::info!(
            url = %url,
            live,
            fps = ?fps,
            width = width as i32,
            height = height as i32,
            "capture opened"
        );

        Self {
            capture: Some(capture),
            url: url.to_string(),
            live,
            fps,
        }
    }
}

impl FrameSource for CaptureSource {
    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| SourceError::Read(format!("{}: closed", self.url)))?;

        let mut frame = Mat::default();
        let grabbed = capture.read(&mut frame)?;
        if grabbed && !frame.empty() {
            return Ok(frame);
        }

        if self.live {
            Err(SourceError::Read(format!("{}: no frame", self.url)))
        } else {
            Err(SourceError::EndOfStream)
        }
    }

    fn nominal_fps(&self) -> Option<f64> {
        self.fps
    }

    fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                tracing::warn!(url = %self.url, error = %e, "failed to release capture");
            }
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}
