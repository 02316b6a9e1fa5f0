use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::Admission;
use super::TrafficShapingController;
use crate::clock::CancelToken;
use crate::clock::TimeSource;
use crate::node::StatisticNode;

const NANOS_PER_MS: i64 = 1_000_000;

/// Uniform spacing of passes, queueing callers for at most a bounded time.
///
/// Time is kept either in milliseconds or, when the spacing would not be a
/// whole number of milliseconds, in nanoseconds.
#[derive(Debug)]
pub(crate) struct Pacer {
    latest_passed: AtomicI64,
    use_nanos: bool,
    max_queueing: i64,
}

impl Pacer {
    pub(crate) fn new(max_queueing_time_ms: u64, use_nanos: bool) -> Self {
        let unit = if use_nanos { NANOS_PER_MS } else { 1 };
        Self {
            latest_passed: AtomicI64::new(-1),
            use_nanos,
            max_queueing: (max_queueing_time_ms as i64).saturating_mul(unit),
        }
    }

    pub(crate) fn uses_nanos(&self) -> bool {
        self.use_nanos
    }

    /// Time of the latest granted slot, in the pacer's unit.
    pub(crate) fn latest_passed(&self) -> i64 {
        self.latest_passed.load(Ordering::Acquire)
    }

    pub(crate) fn now(&self, time: &TimeSource) -> i64 {
        if self.use_nanos {
            time.now_nanos() as i64
        } else {
            time.now_ms() as i64
        }
    }

    fn duration(&self, units: i64) -> Duration {
        let units = units.max(0) as u64;
        if self.use_nanos {
            Duration::from_nanos(units)
        } else {
            Duration::from_millis(units)
        }
    }

    /// Claims the next slot `cost` units after the last pass, waiting for it
    /// if it lies in the future.
    pub(crate) fn acquire(&self, time: &TimeSource, cost: i64, cancel: Option<&CancelToken>) -> bool {
        let (now, latest) = loop {
            let now = self.now(time);
            let latest = self.latest_passed.load(Ordering::Acquire);
            if cost + latest > now {
                break (now, latest);
            }
            // Only one caller may take a free slot; the others decide again.
            if self
                .latest_passed
                .compare_exchange(latest, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        };

        let wait = cost + latest - now;
        if wait > self.max_queueing {
            return false;
        }
        let claimed = self.latest_passed.fetch_add(cost, Ordering::AcqRel) + cost;
        let wait = claimed - now;
        if wait > self.max_queueing {
            self.latest_passed.fetch_sub(cost, Ordering::AcqRel);
            return false;
        }
        if wait > 0 && !time.sleep(self.duration(wait), cancel) {
            self.latest_passed.fetch_sub(cost, Ordering::AcqRel);
            return false;
        }
        true
    }
}

/// Spaces passes evenly at `stat_interval_ms / count`, queueing callers up
/// to `max_queueing_time_ms` instead of rejecting bursts outright.
#[derive(Debug)]
pub struct ThrottlingController {
    count: f64,
    stat_interval_ms: u64,
    pacer: Pacer,
}

impl ThrottlingController {
    pub fn new(count: f64, stat_interval_ms: u64, max_queueing_time_ms: u64) -> Self {
        let use_nanos = if count > 0.0 {
            let rounded = count.round() as u64;
            rounded == 0
                || stat_interval_ms % rounded != 0
                || count / stat_interval_ms as f64 > 1.0
        } else {
            false
        };
        Self {
            count,
            stat_interval_ms,
            pacer: Pacer::new(max_queueing_time_ms, use_nanos),
        }
    }

    pub fn uses_nanos(&self) -> bool {
        self.pacer.uses_nanos()
    }
}

impl TrafficShapingController for ThrottlingController {
    fn can_pass(
        &self,
        node: &StatisticNode,
        acquire: u32,
        _prioritized: bool,
        cancel: Option<&CancelToken>,
    ) -> Admission {
        if acquire == 0 {
            return Admission::Pass;
        }
        if self.count <= 0.0 {
            return Admission::Reject;
        }
        let unit = if self.pacer.uses_nanos() { NANOS_PER_MS } else { 1 };
        let stat = self.stat_interval_ms as f64 * unit as f64;
        let cost = (stat * acquire as f64 / self.count).round() as i64;
        if self.pacer.acquire(node.time(), cost, cancel) {
            Admission::Pass
        } else {
            Admission::Reject
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::node::StatConfig;

    fn frozen_node() -> (StatisticNode, Arc<quanta::Mock>) {
        let (time, mock) = TimeSource::frozen();
        (StatisticNode::new(&StatConfig::default(), time).unwrap(), mock)
    }

    #[test]
    fn precision_choice() {
        assert!(!ThrottlingController::new(10.0, 1000, 500).uses_nanos());
        assert!(ThrottlingController::new(3.0, 1000, 500).uses_nanos());
        assert!(ThrottlingController::new(2000.0, 1000, 500).uses_nanos());
        assert!(ThrottlingController::new(0.3, 1000, 500).uses_nanos());
    }

    #[test]
    fn evenly_spaced_calls_always_pass() {
        let (node, mock) = frozen_node();
        let controller = ThrottlingController::new(10.0, 1000, 0);
        for _ in 0..30 {
            assert_eq!(controller.can_pass(&node, 1, false, None), Admission::Pass);
            mock.increment(Duration::from_millis(100));
        }
    }

    #[test]
    fn burst_queues_then_rejects() {
        let (node, _mock) = frozen_node();
        // 100ms spacing, 500ms of queue: the first call passes at once, five
        // more queue behind it.
        let controller = ThrottlingController::new(10.0, 1000, 500);
        let passed = (0..10)
            .filter(|_| controller.can_pass(&node, 1, false, None).is_pass())
            .count();
        assert_eq!(passed, 6);
    }

    #[test]
    fn waits_for_the_slot() {
        let (time, _mock) = TimeSource::mock();
        let node = StatisticNode::new(&StatConfig::default(), time).unwrap();
        let controller = ThrottlingController::new(5.0, 1000, 1000);
        let start = node.time().now_ms();
        for _ in 0..4 {
            assert!(controller.can_pass(&node, 1, false, None).is_pass());
        }
        // Three queued calls, 200ms apart.
        assert_eq!(node.time().now_ms() - start, 600);
    }

    #[test]
    fn nanosecond_spacing_keeps_the_rate() {
        let (node, mock) = frozen_node();
        // 1000 / 3 is not a whole number of milliseconds.
        let controller = ThrottlingController::new(3.0, 1000, 0);
        let mut passed = 0;
        for _ in 0..3000 {
            if controller.can_pass(&node, 1, false, None).is_pass() {
                passed += 1;
            }
            mock.increment(Duration::from_millis(1));
        }
        assert_eq!(passed, 9);
    }

    #[test]
    fn simultaneous_callers_share_one_free_slot() {
        let (time, _mock) = TimeSource::frozen();
        for _ in 0..200 {
            let pacer = Arc::new(Pacer::new(0, false));
            let barrier = Arc::new(Barrier::new(16));
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let pacer = Arc::clone(&pacer);
                    let barrier = Arc::clone(&barrier);
                    let time = time.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        pacer.acquire(&time, 100, None)
                    })
                })
                .collect();
            let passed = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|passed| *passed)
                .count();
            assert_eq!(passed, 1);
        }
    }

    #[test]
    fn cancelled_wait_rejects_and_rolls_back() {
        let (node, _mock) = frozen_node();
        let controller = ThrottlingController::new(10.0, 1000, 500);
        assert!(controller.can_pass(&node, 1, false, None).is_pass());

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(controller.can_pass(&node, 1, false, Some(&cancel)), Admission::Reject);
        // The slot given back is claimed by the next caller.
        let passed = (0..10)
            .filter(|_| controller.can_pass(&node, 1, false, None).is_pass())
            .count();
        assert_eq!(passed, 5);
    }
}
