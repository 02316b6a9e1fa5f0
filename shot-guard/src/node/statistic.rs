use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use crate::clock::TimeSource;
use crate::error::ConfigError;
use crate::stat::MetricArray;
use crate::stat::MetricEvent;
use crate::stat::MetricSnapshot;

/// Window layout shared by every node the registry creates.
#[derive(Debug, Clone)]
pub struct StatConfig {
    pub second_sample_count: usize,
    pub second_interval_ms: u64,
    pub minute_sample_count: usize,
    pub minute_interval_ms: u64,
    pub occupy_timeout_ms: u64,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            second_sample_count: 2,
            second_interval_ms: 1000,
            minute_sample_count: 60,
            minute_interval_ms: 60_000,
            occupy_timeout_ms: crate::config::DEFAULT_OCCUPY_TIMEOUT_MS,
        }
    }
}

/// Leaf statistics: a per-second and a per-minute sliding window plus the
/// live concurrency gauge.
#[derive(Debug)]
pub struct StatisticNode {
    second: MetricArray,
    minute: MetricArray,
    cur_thread_num: AtomicI64,
    occupy_timeout_ms: u64,
    time: TimeSource,
}

impl StatisticNode {
    pub fn new(config: &StatConfig, time: TimeSource) -> Result<Self, ConfigError> {
        Ok(Self {
            second: MetricArray::occupiable(config.second_sample_count, config.second_interval_ms)?,
            minute: MetricArray::new(config.minute_sample_count, config.minute_interval_ms)?,
            cur_thread_num: AtomicI64::new(0),
            occupy_timeout_ms: config.occupy_timeout_ms,
            time,
        })
    }

    pub fn time(&self) -> &TimeSource {
        &self.time
    }

    pub fn add_pass_request(&self, count: u32) {
        let now = self.time.now_ms();
        self.second.add(now, MetricEvent::Pass, count as u64);
        self.minute.add(now, MetricEvent::Pass, count as u64);
    }

    pub fn add_rt_and_success(&self, rt: u64, count: u32) {
        let now = self.time.now_ms();
        self.second.add(now, MetricEvent::Complete, count as u64);
        self.second.add_rt(now, rt);
        self.minute.add(now, MetricEvent::Complete, count as u64);
        self.minute.add_rt(now, rt);
    }

    pub fn increase_block_qps(&self, count: u32) {
        let now = self.time.now_ms();
        self.second.add(now, MetricEvent::Block, count as u64);
        self.minute.add(now, MetricEvent::Block, count as u64);
    }

    pub fn increase_exception_qps(&self, count: u32) {
        let now = self.time.now_ms();
        self.second.add(now, MetricEvent::Error, count as u64);
        self.minute.add(now, MetricEvent::Error, count as u64);
    }

    pub fn increase_thread_num(&self) {
        let current = self.cur_thread_num.fetch_add(1, Ordering::AcqRel) + 1;
        let now = self.time.now_ms();
        self.second.observe_concurrency(now, current.max(0) as u64);
        self.minute.observe_concurrency(now, current.max(0) as u64);
    }

    pub fn decrease_thread_num(&self) {
        self.cur_thread_num.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn cur_thread_num(&self) -> u64 {
        self.cur_thread_num.load(Ordering::Acquire).max(0) as u64
    }

    pub fn pass_qps(&self) -> f64 {
        self.second.qps(self.time.now_ms(), MetricEvent::Pass)
    }

    pub fn block_qps(&self) -> f64 {
        self.second.qps(self.time.now_ms(), MetricEvent::Block)
    }

    pub fn total_qps(&self) -> f64 {
        self.pass_qps() + self.block_qps()
    }

    pub fn success_qps(&self) -> f64 {
        self.second.qps(self.time.now_ms(), MetricEvent::Complete)
    }

    pub fn exception_qps(&self) -> f64 {
        self.second.qps(self.time.now_ms(), MetricEvent::Error)
    }

    pub fn occupied_pass_qps(&self) -> f64 {
        self.second.qps(self.time.now_ms(), MetricEvent::OccupiedPass)
    }

    /// Largest per-bucket success count, scaled to a per-second rate.
    pub fn max_success_qps(&self) -> f64 {
        let now = self.time.now_ms();
        self.second.max_of(now, MetricEvent::Complete) as f64 * self.second.sample_count() as f64
            / (self.second.interval_ms() as f64 / 1000.0)
    }

    pub fn avg_rt(&self) -> f64 {
        let now = self.time.now_ms();
        let success = self.second.sum(now, MetricEvent::Complete);
        if success == 0 {
            return 0.0;
        }
        self.second.sum(now, MetricEvent::Rt) as f64 / success as f64
    }

    /// Smallest response time seen in the last second, at least 1ms.
    pub fn min_rt(&self, statistic_max_rt: u64) -> u64 {
        self.second
            .min_rt(self.time.now_ms())
            .unwrap_or(statistic_max_rt)
            .max(1)
    }

    fn per_second(&self, count: u64) -> f64 {
        count as f64 * 1000.0 / self.minute.window_length_ms() as f64
    }

    /// Pass rate of the last completed minute-array bucket.
    pub fn previous_pass_qps(&self) -> f64 {
        let now = self.time.now_ms();
        self.per_second(self.minute.previous_window_sum(now, MetricEvent::Pass))
    }

    pub fn previous_block_qps(&self) -> f64 {
        let now = self.time.now_ms();
        self.per_second(self.minute.previous_window_sum(now, MetricEvent::Block))
    }

    pub fn total_request(&self) -> u64 {
        let now = self.time.now_ms();
        self.minute.sum(now, MetricEvent::Pass) + self.minute.sum(now, MetricEvent::Block)
    }

    pub fn total_pass(&self) -> u64 {
        self.minute.sum(self.time.now_ms(), MetricEvent::Pass)
    }

    pub fn total_success(&self) -> u64 {
        self.minute.sum(self.time.now_ms(), MetricEvent::Complete)
    }

    pub fn total_exception(&self) -> u64 {
        self.minute.sum(self.time.now_ms(), MetricEvent::Error)
    }

    /// Per-bucket history of the minute window.
    pub fn metrics(&self) -> Vec<MetricSnapshot> {
        self.minute.snapshots(self.time.now_ms())
    }

    /// The minute-array bucket covering `time`, if it is still retained.
    pub fn minute_bucket_at(&self, time: u64) -> Option<MetricSnapshot> {
        self.minute.snapshot_at(time)
    }

    pub fn minute_window_ms(&self) -> u64 {
        self.minute.window_length_ms()
    }

    pub fn occupy_timeout_ms(&self) -> u64 {
        self.occupy_timeout_ms
    }

    /// How long a prioritized caller has to wait for a future window with
    /// room for `acquire` more passes under `threshold` QPS.
    ///
    /// A result of `occupy_timeout_ms` or more means no window qualifies.
    pub fn try_occupy_next(&self, now: u64, acquire: u32, threshold: f64) -> u64 {
        let interval = self.second.interval_ms();
        let max_count = threshold * interval as f64 / 1000.0;
        let current_borrow = self.second.waiting(now);
        if current_borrow as f64 >= max_count {
            return self.occupy_timeout_ms;
        }

        let window_length = self.second.window_length_ms();
        let mut earliest = (now - now % window_length + window_length).saturating_sub(interval);
        let mut idx = 0;
        let mut current_pass = self.second.sum(now, MetricEvent::Pass) as f64;
        while earliest < now {
            let wait = idx * window_length + window_length - now % window_length;
            if wait >= self.occupy_timeout_ms {
                break;
            }
            let window_pass = self.second.window_sum(earliest, MetricEvent::Pass) as f64;
            if current_pass + current_borrow as f64 + acquire as f64 - window_pass <= max_count {
                return wait;
            }
            earliest += window_length;
            current_pass -= window_pass;
            idx += 1;
        }
        self.occupy_timeout_ms
    }

    pub fn add_waiting_request(&self, future_time: u64, acquire: u32) {
        self.second.add_waiting(future_time, acquire as u64);
    }

    pub fn add_occupied_pass(&self, now: u64, acquire: u32) {
        self.minute.add(now, MetricEvent::OccupiedPass, acquire as u64);
        self.minute.add(now, MetricEvent::Pass, acquire as u64);
    }

    /// Undoes a reservation made at `booked_ms` for the window starting
    /// `wait_ms` later.
    pub fn release_occupied_pass(&self, booked_ms: u64, wait_ms: u64, acquire: u32) {
        let n = acquire as u64;
        self.second.remove_waiting(booked_ms + wait_ms, n);
        self.minute.remove(booked_ms, MetricEvent::OccupiedPass, n);
        self.minute.remove(booked_ms, MetricEvent::Pass, n);
    }

    pub fn waiting(&self) -> u64 {
        self.second.waiting(self.time.now_ms())
    }
}
