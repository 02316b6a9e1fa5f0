use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ConfigError;

/// Marker for values that can live in a [`LeapArray`] slot.
///
/// A fresh `Default` value is the zeroed state of a bucket.
pub trait BucketValue: Default + Send + Sync + 'static {}

impl<T> BucketValue for T where T: Default + Send + Sync + 'static {}

/// One time slice of a [`LeapArray`].
#[derive(Debug)]
pub struct Window<T> {
    start: u64,
    length: u64,
    value: T,
}

impl<T> Window<T> {
    fn new(start: u64, length: u64, value: T) -> Self {
        Self {
            start,
            length,
            value,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn contains(&self, time: u64) -> bool {
        self.start <= time && time < self.start + self.length
    }

    /// Stale relative to `now`: either older than one full interval or
    /// stamped in the future (the clock went backwards).
    pub fn is_deprecated(&self, now: u64, interval_ms: u64) -> bool {
        now < self.start || now - self.start >= interval_ms
    }
}

/// Ring of `sample_count` time buckets covering `interval_ms`.
///
/// A slot is never zeroed in place. When time moves on, the slot's `Arc` is
/// swapped for a fresh window under the slot's write lock, so a reader that
/// already holds the previous window keeps a consistent view of it.
#[derive(Debug)]
pub struct LeapArray<T> {
    window_length_ms: u64,
    sample_count: usize,
    interval_ms: u64,
    slots: Box<[RwLock<Option<Arc<Window<T>>>>]>,
}

impl<T: BucketValue> LeapArray<T> {
    pub fn new(sample_count: usize, interval_ms: u64) -> Result<Self, ConfigError> {
        if sample_count == 0 || interval_ms == 0 || interval_ms % sample_count as u64 != 0 {
            return Err(ConfigError::InvalidWindow {
                sample_count,
                interval_ms,
            });
        }
        let slots = (0..sample_count).map(|_| RwLock::new(None)).collect();
        Ok(Self {
            window_length_ms: interval_ms / sample_count as u64,
            sample_count,
            interval_ms,
            slots,
        })
    }

    pub fn window_length_ms(&self) -> u64 {
        self.window_length_ms
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn interval_secs(&self) -> f64 {
        self.interval_ms as f64 / 1000.0
    }

    #[inline]
    fn index_of(&self, time: u64) -> usize {
        ((time / self.window_length_ms) % self.sample_count as u64) as usize
    }

    #[inline]
    pub fn window_start(&self, time: u64) -> u64 {
        time - time % self.window_length_ms
    }

    /// The bucket owning `now`, created or replaced if needed.
    pub fn current_window_at(&self, now: u64) -> Arc<Window<T>> {
        self.current_window_with(now, |_| T::default())
    }

    /// Like [`LeapArray::current_window_at`], but `init` builds the value of
    /// a replacement bucket from its start time.
    pub fn current_window_with<F>(&self, now: u64, init: F) -> Arc<Window<T>>
    where
        F: FnOnce(u64) -> T,
    {
        let idx = self.index_of(now);
        let start = self.window_start(now);

        if let Some(window) = self.slots[idx].read().as_ref()
            && window.start == start
        {
            return Arc::clone(window);
        }

        let mut slot = self.slots[idx].write();
        match slot.as_ref() {
            Some(window) if window.start == start => Arc::clone(window),
            _ => {
                // Older (elapsed) or newer (clock skew) than the slot for `now`.
                let window = Arc::new(Window::new(start, self.window_length_ms, init(start)));
                *slot = Some(Arc::clone(&window));
                window
            }
        }
    }

    /// The bucket that covers `time` exactly, if it is still in the ring.
    pub fn window_at(&self, time: u64) -> Option<Arc<Window<T>>> {
        let idx = self.index_of(time);
        let slot = self.slots[idx].read();
        slot.as_ref()
            .filter(|window| window.contains(time))
            .map(Arc::clone)
    }

    pub fn previous_window_at(&self, now: u64) -> Option<Arc<Window<T>>> {
        now.checked_sub(self.window_length_ms)
            .and_then(|time| self.window_at(time))
    }

    /// Buckets still inside the interval ending at `now`.
    pub fn values_at(&self, now: u64) -> Vec<Arc<Window<T>>> {
        self.slots
            .iter()
            .filter_map(|slot| {
                slot.read()
                    .as_ref()
                    .filter(|window| !window.is_deprecated(now, self.interval_ms))
                    .map(Arc::clone)
            })
            .collect()
    }

    /// Every populated bucket, whatever its age.
    pub fn windows(&self) -> Vec<Arc<Window<T>>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.read().as_ref().map(Arc::clone))
            .collect()
    }

    pub fn reset(&self) {
        for slot in self.slots.iter() {
            *slot.write() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    use super::*;

    type Counter = AtomicU64;

    #[test]
    fn rejects_uneven_windows() {
        assert!(LeapArray::<Counter>::new(3, 1000).is_err());
        assert!(LeapArray::<Counter>::new(0, 1000).is_err());
        assert!(LeapArray::<Counter>::new(2, 0).is_err());
        assert!(LeapArray::<Counter>::new(4, 1000).is_ok());
    }

    #[test]
    fn same_slot_is_returned_within_a_window() {
        let array = LeapArray::<Counter>::new(2, 1000).unwrap();
        let a = array.current_window_at(10_000);
        let b = array.current_window_at(10_499);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.start(), 10_000);

        let c = array.current_window_at(10_500);
        assert_eq!(c.start(), 10_500);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn elapsed_slot_is_replaced_not_zeroed() {
        let array = LeapArray::<Counter>::new(2, 1000).unwrap();
        let old = array.current_window_at(10_000);
        old.value().fetch_add(7, Ordering::Relaxed);

        // Same ring index one interval later.
        let fresh = array.current_window_at(11_000);
        assert_eq!(fresh.value().load(Ordering::Relaxed), 0);
        // The holder of the old bucket still sees its data.
        assert_eq!(old.value().load(Ordering::Relaxed), 7);
    }

    #[test]
    fn expired_buckets_do_not_contribute() {
        let array = LeapArray::<Counter>::new(2, 1000).unwrap();
        array
            .current_window_at(10_000)
            .value()
            .fetch_add(3, Ordering::Relaxed);

        assert_eq!(array.values_at(10_999).len(), 1);
        // T + interval + epsilon
        assert!(array.values_at(11_001).is_empty());
    }

    #[test]
    fn backward_clock_treats_buckets_as_stale() {
        let array = LeapArray::<Counter>::new(2, 1000).unwrap();
        array
            .current_window_at(20_000)
            .value()
            .fetch_add(5, Ordering::Relaxed);

        // Time jumps back by several seconds.
        assert!(array.values_at(15_000).is_empty());
        let window = array.current_window_at(15_000);
        assert_eq!(window.start(), 15_000);
        assert_eq!(window.value().load(Ordering::Relaxed), 0);
    }

    #[test]
    fn previous_window_lookup() {
        let array = LeapArray::<Counter>::new(60, 60_000).unwrap();
        array
            .current_window_at(5_000)
            .value()
            .fetch_add(2, Ordering::Relaxed);
        let previous = array.previous_window_at(6_200).unwrap();
        assert_eq!(previous.start(), 5_000);
        assert_eq!(previous.value().load(Ordering::Relaxed), 2);
        assert!(array.previous_window_at(7_000).is_none());
    }
}
