use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;

/// Counters kept per time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    Pass,
    Block,
    /// The call finished (successfully or not) after passing.
    Complete,
    /// The call finished with a business error.
    Error,
    /// Accumulated response time in milliseconds.
    Rt,
    /// Passes borrowed from a future window by prioritized callers.
    OccupiedPass,
}

impl MetricEvent {
    pub const COUNT: usize = 6;

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

/// Lock-free counters for one window.
#[derive(Debug)]
pub struct MetricBucket {
    counters: [AtomicU64; MetricEvent::COUNT],
    min_rt: AtomicU64,
    max_rt: AtomicU64,
    max_concurrency: AtomicU64,
}

impl Default for MetricBucket {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            min_rt: AtomicU64::new(u64::MAX),
            max_rt: AtomicU64::new(0),
            max_concurrency: AtomicU64::new(0),
        }
    }
}

impl MetricBucket {
    #[inline]
    pub fn add(&self, event: MetricEvent, n: u64) {
        self.counters[event.index()].fetch_add(n, Ordering::Relaxed);
    }

    /// Takes back `n` counts, stopping at zero.
    pub fn sub(&self, event: MetricEvent, n: u64) {
        let _ = self.counters[event.index()].fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |v| Some(v.saturating_sub(n)),
        );
    }

    #[inline]
    pub fn get(&self, event: MetricEvent) -> u64 {
        self.counters[event.index()].load(Ordering::Relaxed)
    }

    pub fn add_rt(&self, rt: u64) {
        self.add(MetricEvent::Rt, rt);
        self.min_rt.fetch_min(rt, Ordering::Relaxed);
        self.max_rt.fetch_max(rt, Ordering::Relaxed);
    }

    /// `None` until a response time was recorded.
    pub fn min_rt(&self) -> Option<u64> {
        match self.min_rt.load(Ordering::Relaxed) {
            u64::MAX => None,
            rt => Some(rt),
        }
    }

    pub fn max_rt(&self) -> u64 {
        self.max_rt.load(Ordering::Relaxed)
    }

    pub fn observe_concurrency(&self, concurrency: u64) {
        self.max_concurrency.fetch_max(concurrency, Ordering::Relaxed);
    }

    pub fn max_concurrency(&self) -> u64 {
        self.max_concurrency.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, timestamp: u64) -> MetricSnapshot {
        MetricSnapshot {
            timestamp,
            pass: self.get(MetricEvent::Pass),
            block: self.get(MetricEvent::Block),
            success: self.get(MetricEvent::Complete),
            exception: self.get(MetricEvent::Error),
            rt: self.get(MetricEvent::Rt),
            occupied_pass: self.get(MetricEvent::OccupiedPass),
            min_rt: self.min_rt().unwrap_or_default(),
            max_rt: self.max_rt(),
            concurrency: self.max_concurrency(),
        }
    }
}

/// Plain copy of one bucket, as returned by metric queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricSnapshot {
    pub timestamp: u64,
    pub pass: u64,
    pub block: u64,
    pub success: u64,
    pub exception: u64,
    pub rt: u64,
    pub occupied_pass: u64,
    pub min_rt: u64,
    pub max_rt: u64,
    pub concurrency: u64,
}

impl MetricSnapshot {
    pub fn total(&self) -> u64 {
        self.pass + self.block
    }

    pub fn avg_rt(&self) -> f64 {
        if self.success == 0 {
            0.0
        } else {
            self.rt as f64 / self.success as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.success == 0 {
            0.0
        } else {
            self.exception as f64 / self.success as f64
        }
    }
}
