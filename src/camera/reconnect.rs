use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SourceConfig;

use super::{Frame, FrameSource, SourceError, SourceKind, SourceOpener};

const ATTEMPT_WINDOW: Duration = Duration::from_secs(60);
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts_per_minute: u32,
}

impl ReconnectPolicy {
    /// Delay before the `n`th consecutive attempt (0-based).
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&SourceConfig> for ReconnectPolicy {
    fn from(config: &SourceConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.reconnect_base_ms),
            max_delay: Duration::from_millis(config.reconnect_max_ms),
            max_attempts_per_minute: config.max_reconnects_per_minute,
        }
    }
}

/// Wraps an open source with reconnect-with-backoff for network failures and
/// rewind-on-EOF for files.
pub struct ResilientSource {
    opener: Arc<dyn SourceOpener>,
    url: String,
    kind: SourceKind,
    inner: Option<Box<dyn FrameSource>>,
    policy: ReconnectPolicy,
    attempts: VecDeque<Instant>,
    consecutive_failures: u32,
    frames_since_open: u64,
    shutdown: Arc<AtomicBool>,
}

impl ResilientSource {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        url: &str,
        initial: Box<dyn FrameSource>,
        policy: ReconnectPolicy,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            opener,
            url: url.to_string(),
            kind: SourceKind::from_url(url),
            inner: Some(initial),
            policy,
            attempts: VecDeque::new(),
            consecutive_failures: 0,
            frames_since_open: 0,
            shutdown,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    fn drop_inner(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close();
        }
    }

    fn reopen_now(&mut self) -> Result<(), SourceError> {
        let source = self.opener.open(&self.url)?;
        self.inner = Some(source);
        self.frames_since_open = 0;
        Ok(())
    }

    /// One backoff-delayed reopen attempt, counted against the per-minute budget.
    fn reconnect(&mut self) -> Result<(), SourceError> {
        let now = Instant::now();
        while let Some(front) = self.attempts.front() {
            if now.duration_since(*front) > ATTEMPT_WINDOW {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        if self.attempts.len() >= self.policy.max_attempts_per_minute as usize {
            return Err(SourceError::Persistent {
                attempts: self.attempts.len(),
            });
        }

        let delay = self.policy.delay(self.consecutive_failures);
        tracing::info!(
            url = %self.url,
            attempt = self.consecutive_failures + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnecting source"
        );
        if !sleep_unless_shutdown(delay, &self.shutdown) {
            return Err(SourceError::Cancelled);
        }

        self.attempts.push_back(Instant::now());
        self.consecutive_failures += 1;

        match self.reopen_now() {
            Ok(()) => {
                tracing::info!(url = %self.url, "source reconnected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "reconnect failed");
                Ok(())
            }
        }
    }
}

impl FrameSource for ResilientSource {
    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(SourceError::Cancelled);
            }

            let Some(inner) = self.inner.as_mut() else {
                self.reconnect()?;
                continue;
            };

            match inner.read_frame() {
                Ok(frame) => {
                    self.consecutive_failures = 0;
                    self.frames_since_open += 1;
                    return Ok(frame);
                }
                Err(SourceError::EndOfStream) if self.frames_since_open > 0 => {
                    tracing::debug!(
                        url = %self.url,
                        frames = self.frames_since_open,
                        "end of file, restarting from the first frame"
                    );
                    self.drop_inner();
                    if let Err(e) = self.reopen_now() {
                        tracing::warn!(url = %self.url, error = %e, "failed to reopen file");
                    }
                }
                Err(SourceError::EndOfStream) => {
                    // EOF with no frames since opening: treat as a broken file.
                    tracing::warn!(url = %self.url, "file produced no frames");
                    self.drop_inner();
                }
                Err(SourceError::Read(e)) | Err(SourceError::Unavailable(e)) => {
                    tracing::warn!(url = %self.url, error = %e, "source read failed");
                    self.drop_inner();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn nominal_fps(&self) -> Option<f64> {
        self.inner.as_ref().and_then(|s| s.nominal_fps())
    }

    fn close(&mut self) {
        self.drop_inner();
    }
}

impl Drop for ResilientSource {
    fn drop(&mut self) {
        self.drop_inner();
    }
}

/// Returns `false` if shutdown was requested before `duration` elapsed.
pub(crate) fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use opencv::core::{Mat, Scalar, CV_8UC3};
    use opencv::prelude::*;

    fn frame(tag: f64) -> Frame {
        Mat::new_rows_cols_with_default(2, 2, CV_8UC3, Scalar::all(tag)).unwrap()
    }

    fn tag(frame: &Frame) -> u8 {
        frame.at_2d::<opencv::core::Vec3b>(0, 0).unwrap()[0]
    }

    /// Yields `frames` tagged 0.., then `end`.
    struct ScriptedSource {
        next: u8,
        frames: u8,
        end: fn() -> SourceError,
        closed: Arc<AtomicUsize>,
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<Frame, SourceError> {
            if self.next < self.frames {
                self.next += 1;
                Ok(frame((self.next - 1) as f64))
            } else {
                Err((self.end)())
            }
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedOpener {
        opens: AtomicUsize,
        closed: Arc<AtomicUsize>,
        frames: u8,
        end: fn() -> SourceError,
        fail_opens: Mutex<u32>,
    }

    impl ScriptedOpener {
        fn new(frames: u8, end: fn() -> SourceError) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
                frames,
                end,
                fail_opens: Mutex::new(0),
            })
        }

        fn source(&self) -> Box<dyn FrameSource> {
            Box::new(ScriptedSource {
                next: 0,
                frames: self.frames,
                end: self.end,
                closed: Arc::clone(&self.closed),
            })
        }
    }

    impl SourceOpener for ScriptedOpener {
        fn open(&self, _url: &str) -> Result<Box<dyn FrameSource>, SourceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let mut fail = self.fail_opens.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(SourceError::Unavailable("scripted".into()));
            }
            Ok(self.source())
        }
    }

    fn fast_policy(max_per_minute: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts_per_minute: max_per_minute,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts_per_minute: 10,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(40), Duration::from_secs(10));
    }

    #[test]
    fn file_loops_from_first_frame_at_end_of_stream() {
        let opener = ScriptedOpener::new(3, || SourceError::EndOfStream);
        let initial = opener.source();
        let mut source = ResilientSource::new(
            opener.clone(),
            "/videos/loop.mp4",
            initial,
            fast_policy(10),
            Arc::new(AtomicBool::new(false)),
        );

        let tags: Vec<u8> = (0..7).map(|_| tag(&source.read_frame().unwrap())).collect();
        assert_eq!(tags, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_eq!(opener.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn read_errors_reconnect_until_budget_exhausted() {
        let opener = ScriptedOpener::new(1, || SourceError::Read("reset".into()));
        *opener.fail_opens.lock().unwrap() = 1;
        let initial = opener.source();
        let mut source = ResilientSource::new(
            opener.clone(),
            "rtsp://cam/stream",
            initial,
            fast_policy(3),
            Arc::new(AtomicBool::new(false)),
        );

        assert!(source.read_frame().is_ok());
        // First reopen fails, second succeeds and yields one frame.
        assert!(source.read_frame().is_ok());
        assert!(source.read_frame().is_ok());
        // Third attempt used the budget; the next failure is persistent.
        match source.read_frame() {
            Err(SourceError::Persistent { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected persistent failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn shutdown_interrupts_backoff() {
        let opener = ScriptedOpener::new(0, || SourceError::Read("down".into()));
        let shutdown = Arc::new(AtomicBool::new(true));
        let initial = opener.source();
        let mut source = ResilientSource::new(
            opener,
            "rtsp://cam/stream",
            initial,
            fast_policy(10),
            shutdown,
        );
        assert!(matches!(source.read_frame(), Err(SourceError::Cancelled)));
    }
}
