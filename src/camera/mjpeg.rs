use std::io::Read;
use std::time::Duration;

use opencv::core::Vector;
use opencv::imgcodecs;
use opencv::prelude::*;
use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;

use super::{Frame, FrameSource, SourceError};

const READ_CHUNK: usize = 64 * 1024;
const MAX_PENDING_BYTES: usize = 8 * 1024 * 1024;

/// `multipart/x-mixed-replace` JPEG stream over HTTP.
pub struct MjpegSource {
    url: String,
    response: Option<Response>,
    pending: Vec<u8>,
}

impl MjpegSource {
    /// Returns `Ok(None)` when the server answers with something other than a
    /// multipart stream, so the caller can fall back to a generic decoder.
    pub fn connect(url: &str, timeout: Duration) -> Result<Option<Self>, SourceError> {
        // Blocking client: this runs on the acquisition thread, never on the runtime.
        // Its timeout also bounds every body read, so a camera that goes
        // silent surfaces as a read error and gets reconnected.
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("{url}: {e}")))?;

        let response = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Unavailable(format!("{url}: {e}")))?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if !content_type.starts_with("multipart/") {
            tracing::debug!(url = %url, content_type = %content_type, "not an MJPEG stream");
            return Ok(None);
        }

        tracing::info!(url = %url, "MJPEG stream connected");
        Ok(Some(Self {
            url: url.to_string(),
            response: Some(response),
            pending: Vec::new(),
        }))
    }
}

impl FrameSource for MjpegSource {
    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(jpeg) = next_jpeg(&mut self.pending) {
                let encoded = Vector::<u8>::from_slice(&jpeg);
                let frame = imgcodecs::imdecode(&encoded, imgcodecs::IMREAD_COLOR)?;
                if frame.empty() {
                    return Err(SourceError::Read(format!("{}: undecodable JPEG", self.url)));
                }
                return Ok(frame);
            }

            if self.pending.len() > MAX_PENDING_BYTES {
                self.pending.clear();
                return Err(SourceError::Read(format!("{}: no JPEG boundary found", self.url)));
            }

            let response = self
                .response
                .as_mut()
                .ok_or_else(|| SourceError::Read(format!("{}: closed", self.url)))?;
            let n = response
                .read(&mut chunk)
                .map_err(|e| SourceError::Read(format!("{}: {e}", self.url)))?;
            if n == 0 {
                return Err(SourceError::Read(format!("{}: stream ended", self.url)));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn close(&mut self) {
        self.response.take();
        self.pending.clear();
    }
}

/// Pops the first complete JPEG out of `buf`, discarding any multipart
/// framing in front of it. The part's `Content-Length` wins over scanning for
/// EOI, which an embedded EXIF thumbnail also contains.
fn next_jpeg(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = find(buf, &[0xFF, 0xD8], 0)?;
    let end = match content_length(&buf[..start]) {
        Some(len) if len >= 2 => {
            if buf.len() < start + len {
                return None;
            }
            start + len
        }
        _ => find(buf, &[0xFF, 0xD9], start + 2)? + 2,
    };
    let jpeg = buf[start..end].to_vec();
    buf.drain(..end);
    Some(jpeg)
}

fn content_length(headers: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(headers)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .filter_map(|(_, value)| value.trim().parse().ok())
        .last()
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
