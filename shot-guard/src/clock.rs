use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use parking_lot::Condvar;
use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;
use quanta::Mock;

/// Epoch used by mocked time sources. Aligned to a whole minute so windows of
/// 1s and 60s start exactly at the mock origin.
pub const MOCK_EPOCH_MS: u64 = 1_600_000_020_000;

/// Millisecond/nanosecond time used by every window and controller.
///
/// Values are epoch based: the wall clock is sampled once at construction and
/// the monotonic `quanta` clock supplies the elapsed part, so timestamps never
/// go backwards during a run.
#[derive(Clone)]
pub struct TimeSource {
    clock: Clock,
    anchor: Instant,
    base_ms: u64,
    mock: Option<MockMode>,
}

#[derive(Clone)]
struct MockMode {
    handle: Arc<Mock>,
    advance_on_sleep: bool,
}

impl fmt::Debug for TimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSource")
            .field("base_ms", &self.base_ms)
            .field("mocked", &self.mock.is_some())
            .finish()
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource {
    pub fn new() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let clock = Clock::new();
        let anchor = clock.now();
        Self {
            clock,
            anchor,
            base_ms,
            mock: None,
        }
    }

    /// A mocked source starting at [`MOCK_EPOCH_MS`].
    ///
    /// Sleeping on it advances the mock by the requested duration, so code
    /// that parks a thread completes instantly in tests.
    pub fn mock() -> (Self, Arc<Mock>) {
        Self::mocked(true)
    }

    /// A mocked source whose time only moves when the returned handle is
    /// incremented. Sleeps return immediately without advancing.
    pub fn frozen() -> (Self, Arc<Mock>) {
        Self::mocked(false)
    }

    fn mocked(advance_on_sleep: bool) -> (Self, Arc<Mock>) {
        let (clock, handle) = Clock::mock();
        let anchor = clock.now();
        let source = Self {
            clock,
            anchor,
            base_ms: MOCK_EPOCH_MS,
            mock: Some(MockMode {
                handle: Arc::clone(&handle),
                advance_on_sleep,
            }),
        };
        (source, handle)
    }

    pub fn is_mock(&self) -> bool {
        self.mock.is_some()
    }

    #[inline]
    fn elapsed(&self) -> Duration {
        self.clock.now().duration_since(self.anchor)
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.base_ms + self.elapsed().as_millis() as u64
    }

    #[inline]
    pub fn now_nanos(&self) -> u64 {
        self.base_ms * 1_000_000 + self.elapsed().as_nanos() as u64
    }

    /// Parks the calling thread for `duration`.
    ///
    /// Returns `false` when `cancel` fired before the duration elapsed.
    pub fn sleep(&self, duration: Duration, cancel: Option<&CancelToken>) -> bool {
        if duration.is_zero() {
            return !cancel.is_some_and(CancelToken::is_cancelled);
        }
        if let Some(mock) = &self.mock {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return false;
            }
            if mock.advance_on_sleep {
                mock.handle.increment(duration);
            }
            return true;
        }
        match cancel {
            Some(token) => !token.wait_timeout(duration),
            None => {
                std::thread::sleep(duration);
                true
            }
        }
    }
}

/// Cancellation signal for bounded waits inside controllers.
///
/// A cancelled wait is reported to the caller as a reject.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Waits up to `timeout`; returns `true` if cancelled meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self.inner.cv.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}
