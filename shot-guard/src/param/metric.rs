use std::sync::Arc;

use dashmap::DashMap;

use super::ParamValue;
use crate::clock::CancelToken;
use crate::clock::TimeSource;
use crate::flow::Pacer;

/// Distinct values tracked per rule before stale ones are evicted.
pub const MAX_TRACKED_VALUES: usize = 4000;

#[derive(Debug, Clone, Copy)]
struct TokenState {
    tokens: i64,
    last_refill_ms: u64,
}

/// Per-value state of one parameter flow rule.
///
/// Token buckets and pacers are keyed by value; each map holds at most
/// `capacity` values and drops the least recently refilled ones when full.
/// In-flight concurrency per value is kept separately and never evicted.
#[derive(Debug)]
pub struct ParameterMetric {
    capacity: usize,
    tokens: DashMap<ParamValue, TokenState>,
    pacers: DashMap<ParamValue, Arc<Pacer>>,
    threads: DashMap<ParamValue, u64>,
}

impl Default for ParameterMetric {
    fn default() -> Self {
        Self::new(MAX_TRACKED_VALUES)
    }
}

impl ParameterMetric {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tokens: DashMap::new(),
            pacers: DashMap::new(),
            threads: DashMap::new(),
        }
    }

    /// Values currently holding a token bucket or a pacer.
    pub fn tracked_values(&self) -> usize {
        self.tokens.len() + self.pacers.len()
    }

    /// Takes `acquire` tokens from the bucket of `value`.
    ///
    /// A bucket holds up to `threshold + burst` tokens and is refilled with
    /// `threshold` tokens per `duration_ms`, in proportion to the time since
    /// its last refill once a whole duration has elapsed.
    pub fn pass_tokens(
        &self,
        now: u64,
        value: &ParamValue,
        threshold: f64,
        burst: u64,
        duration_ms: u64,
        acquire: u32,
    ) -> bool {
        let rate = threshold as i64;
        let max = rate.saturating_add(burst as i64);
        let acquire = acquire as i64;
        if acquire > max {
            return false;
        }

        if !self.tokens.contains_key(value) {
            self.evict_tokens(now, duration_ms);
        }
        let mut state = self.tokens.entry(value.clone()).or_insert(TokenState {
            tokens: max,
            last_refill_ms: now,
        });

        let elapsed = now.saturating_sub(state.last_refill_ms);
        if elapsed > duration_ms {
            let refill = (elapsed as f64 * rate as f64 / duration_ms as f64) as i64;
            state.tokens = state.tokens.saturating_add(refill).min(max);
            state.last_refill_ms = now;
        }
        if state.tokens < acquire {
            return false;
        }
        state.tokens -= acquire;
        true
    }

    fn evict_tokens(&self, now: u64, duration_ms: u64) {
        if self.tokens.len() < self.capacity {
            return;
        }
        // Anything untouched for a full duration would be refilled anyway.
        self.tokens
            .retain(|_, state| now.saturating_sub(state.last_refill_ms) <= duration_ms);
        while self.tokens.len() >= self.capacity {
            let oldest = self
                .tokens
                .iter()
                .min_by_key(|entry| entry.last_refill_ms)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.tokens.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Spaces calls carrying `value` evenly at `duration_ms / threshold`,
    /// queueing up to `max_queueing_time_ms`.
    #[allow(clippy::too_many_arguments)]
    pub fn pass_throttled(
        &self,
        time: &TimeSource,
        value: &ParamValue,
        threshold: f64,
        duration_ms: u64,
        max_queueing_time_ms: u64,
        acquire: u32,
        cancel: Option<&CancelToken>,
    ) -> bool {
        if threshold <= 0.0 {
            return false;
        }
        let existing = self.pacers.get(value).map(|pacer| Arc::clone(pacer.value()));
        let pacer = match existing {
            Some(pacer) => pacer,
            None => {
                if self.pacers.len() >= self.capacity {
                    self.evict_pacers(time);
                }
                let entry = self
                    .pacers
                    .entry(value.clone())
                    .or_insert_with(|| Arc::new(Pacer::new(max_queueing_time_ms, false)));
                Arc::clone(entry.value())
            }
        };
        let cost = (duration_ms as f64 * acquire as f64 / threshold).round() as i64;
        pacer.acquire(time, cost, cancel)
    }

    fn evict_pacers(&self, time: &TimeSource) {
        let now = time.now_ms() as i64;
        // A pacer whose last pass is in the past holds no queued callers.
        self.pacers.retain(|_, pacer| pacer.latest_passed() > now);
        if self.pacers.len() < self.capacity {
            return;
        }
        let victim = self
            .pacers
            .iter()
            .min_by_key(|entry| entry.value().latest_passed())
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            self.pacers.remove(&key);
        }
    }

    pub fn thread_count(&self, value: &ParamValue) -> u64 {
        self.threads.get(value).map_or(0, |count| *count)
    }

    pub fn increase_thread(&self, value: &ParamValue) {
        *self.threads.entry(value.clone()).or_insert(0) += 1;
    }

    pub fn decrease_thread(&self, value: &ParamValue) {
        self.threads.remove_if_mut(value, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_600_000_020_000;

    #[test]
    fn tokens_refill_after_the_duration() {
        let metric = ParameterMetric::default();
        let vip = ParamValue::from("vip");
        for _ in 0..3 {
            assert!(metric.pass_tokens(NOW, &vip, 3.0, 0, 1000, 1));
        }
        assert!(!metric.pass_tokens(NOW + 500, &vip, 3.0, 0, 1000, 1));
        // Other values have their own bucket.
        assert!(metric.pass_tokens(NOW, &ParamValue::from("guest"), 3.0, 0, 1000, 1));

        assert!(metric.pass_tokens(NOW + 1001, &vip, 3.0, 0, 1000, 1));
    }

    #[test]
    fn burst_adds_headroom() {
        let metric = ParameterMetric::default();
        let key = ParamValue::Int(1);
        let passed = (0..10)
            .filter(|_| metric.pass_tokens(NOW, &key, 2.0, 3, 1000, 1))
            .count();
        assert_eq!(passed, 5);
        assert!(!metric.pass_tokens(NOW, &key, 2.0, 3, 1000, 6));
    }

    #[test]
    fn full_map_evicts_stale_values() {
        let metric = ParameterMetric::new(2);
        assert!(metric.pass_tokens(NOW, &ParamValue::Int(1), 1.0, 0, 1000, 1));
        assert!(metric.pass_tokens(NOW + 10, &ParamValue::Int(2), 1.0, 0, 1000, 1));
        assert!(metric.pass_tokens(NOW + 20, &ParamValue::Int(3), 1.0, 0, 1000, 1));
        assert_eq!(metric.tracked_values(), 2);
        // Value 1 was the oldest and starts over with a full bucket.
        assert!(metric.pass_tokens(NOW + 30, &ParamValue::Int(1), 1.0, 0, 1000, 1));
    }

    #[test]
    fn throttled_values_are_spaced() {
        let (time, _mock) = TimeSource::frozen();
        let metric = ParameterMetric::default();
        let key = ParamValue::from("k");
        // 200ms apart, 500ms of queue.
        let passed = (0..10)
            .filter(|_| metric.pass_throttled(&time, &key, 5.0, 1000, 500, 1, None))
            .count();
        assert_eq!(passed, 3);
    }

    #[test]
    fn thread_counts() {
        let metric = ParameterMetric::default();
        let key = ParamValue::Bool(true);
        metric.increase_thread(&key);
        metric.increase_thread(&key);
        assert_eq!(metric.thread_count(&key), 2);
        metric.decrease_thread(&key);
        metric.decrease_thread(&key);
        assert_eq!(metric.thread_count(&key), 0);
        metric.decrease_thread(&key);
        assert_eq!(metric.thread_count(&key), 0);
    }
}
