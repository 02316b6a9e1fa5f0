use std::sync::Arc;

use super::LeapArray;
use super::MetricBucket;
use super::MetricEvent;
use super::MetricSnapshot;
use super::Window;
use crate::error::ConfigError;

/// Sliding window of [`MetricBucket`]s with rate helpers.
///
/// When built with [`MetricArray::occupiable`], a second "borrow" ring holds
/// passes that prioritized callers reserved in future windows. A bucket that
/// is (re)created for such a window starts with those passes already counted.
#[derive(Debug)]
pub struct MetricArray {
    array: LeapArray<MetricBucket>,
    borrow: Option<LeapArray<MetricBucket>>,
}

impl MetricArray {
    pub fn new(sample_count: usize, interval_ms: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            array: LeapArray::new(sample_count, interval_ms)?,
            borrow: None,
        })
    }

    pub fn occupiable(sample_count: usize, interval_ms: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            array: LeapArray::new(sample_count, interval_ms)?,
            borrow: Some(LeapArray::new(sample_count, interval_ms)?),
        })
    }

    pub fn interval_ms(&self) -> u64 {
        self.array.interval_ms()
    }

    pub fn sample_count(&self) -> usize {
        self.array.sample_count()
    }

    pub fn window_length_ms(&self) -> u64 {
        self.array.window_length_ms()
    }

    fn current(&self, now: u64) -> Arc<Window<MetricBucket>> {
        match &self.borrow {
            None => self.array.current_window_at(now),
            Some(borrow) => self.array.current_window_with(now, |start| {
                let bucket = MetricBucket::default();
                if let Some(borrowed) = borrow.window_at(start) {
                    bucket.add(MetricEvent::Pass, borrowed.value().get(MetricEvent::Pass));
                }
                bucket
            }),
        }
    }

    #[inline]
    pub fn add(&self, now: u64, event: MetricEvent, n: u64) {
        self.current(now).value().add(event, n);
    }

    pub fn add_rt(&self, now: u64, rt: u64) {
        self.current(now).value().add_rt(rt);
    }

    pub fn observe_concurrency(&self, now: u64, concurrency: u64) {
        self.current(now).value().observe_concurrency(concurrency);
    }

    pub fn sum(&self, now: u64, event: MetricEvent) -> u64 {
        // Touch the current window so an idle ring is rotated before reading.
        self.current(now);
        self.array
            .values_at(now)
            .iter()
            .map(|w| w.value().get(event))
            .sum()
    }

    pub fn qps(&self, now: u64, event: MetricEvent) -> f64 {
        self.sum(now, event) as f64 / self.array.interval_secs()
    }

    pub fn max_of(&self, now: u64, event: MetricEvent) -> u64 {
        self.current(now);
        self.array
            .values_at(now)
            .iter()
            .map(|w| w.value().get(event))
            .max()
            .unwrap_or_default()
    }

    pub fn min_rt(&self, now: u64) -> Option<u64> {
        self.current(now);
        self.array
            .values_at(now)
            .iter()
            .filter_map(|w| w.value().min_rt())
            .min()
    }

    /// Count recorded in the window covering `time` (0 if it was recycled).
    pub fn window_sum(&self, time: u64, event: MetricEvent) -> u64 {
        self.array
            .window_at(time)
            .map(|w| w.value().get(event))
            .unwrap_or_default()
    }

    pub fn previous_window_sum(&self, now: u64, event: MetricEvent) -> u64 {
        self.array
            .previous_window_at(now)
            .map(|w| w.value().get(event))
            .unwrap_or_default()
    }

    pub fn snapshot_at(&self, time: u64) -> Option<MetricSnapshot> {
        self.array
            .window_at(time)
            .map(|w| w.value().snapshot(w.start()))
    }

    /// Live buckets ordered by start time.
    pub fn snapshots(&self, now: u64) -> Vec<MetricSnapshot> {
        let mut snaps: Vec<_> = self
            .array
            .values_at(now)
            .iter()
            .map(|w| w.value().snapshot(w.start()))
            .collect();
        snaps.sort_by_key(|s| s.timestamp);
        snaps
    }

    /// Registers `n` passes into the future window covering `future_time`.
    pub fn add_waiting(&self, future_time: u64, n: u64) {
        if let Some(borrow) = &self.borrow {
            borrow
                .current_window_at(future_time)
                .value()
                .add(MetricEvent::Pass, n);
        }
    }

    /// Takes `n` counts out of the bucket covering `time`, if it is still in
    /// the ring.
    pub fn remove(&self, time: u64, event: MetricEvent, n: u64) {
        if let Some(window) = self.array.window_at(time) {
            window.value().sub(event, n);
        }
    }

    /// Gives back `n` passes reserved for the window covering `future_time`,
    /// whether or not that window has started.
    pub fn remove_waiting(&self, future_time: u64, n: u64) {
        if let Some(window) = self
            .borrow
            .as_ref()
            .and_then(|borrow| borrow.window_at(future_time))
        {
            window.value().sub(MetricEvent::Pass, n);
        }
        self.remove(future_time, MetricEvent::Pass, n);
    }

    /// Passes already reserved in windows that have not started yet.
    pub fn waiting(&self, now: u64) -> u64 {
        self.borrow
            .as_ref()
            .map(|borrow| {
                borrow
                    .windows()
                    .iter()
                    .filter(|w| w.start() > now)
                    .map(|w| w.value().get(MetricEvent::Pass))
                    .sum()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qps_over_the_interval() {
        let array = MetricArray::new(2, 1000).unwrap();
        array.add(10_000, MetricEvent::Pass, 4);
        array.add(10_600, MetricEvent::Pass, 6);
        assert_eq!(array.sum(10_700, MetricEvent::Pass), 10);
        assert_eq!(array.qps(10_700, MetricEvent::Pass), 10.0);

        // The first bucket leaves the window.
        assert_eq!(array.sum(11_100, MetricEvent::Pass), 6);
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let array = Arc::new(MetricArray::new(2, 1000).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let array = Arc::clone(&array);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        array.add(50_100, MetricEvent::Pass, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(array.qps(50_200, MetricEvent::Pass), 80_000.0);
    }

    #[test]
    fn borrowed_passes_seed_future_bucket() {
        let array = MetricArray::occupiable(2, 1000).unwrap();
        array.add(10_100, MetricEvent::Pass, 1);
        array.add_waiting(10_600, 3);
        assert_eq!(array.waiting(10_100), 3);

        // Once the future window becomes current, the reserved passes count.
        assert_eq!(array.sum(10_650, MetricEvent::Pass), 4);
        assert_eq!(array.waiting(10_650), 0);
    }

    #[test]
    fn snapshots_are_sorted() {
        let array = MetricArray::new(60, 60_000).unwrap();
        array.add(3_000, MetricEvent::Pass, 1);
        array.add(1_000, MetricEvent::Pass, 1);
        array.add(2_000, MetricEvent::Block, 1);
        let stamps: Vec<_> = array
            .snapshots(3_500)
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(stamps, vec![1_000, 2_000, 3_000]);
    }
}
