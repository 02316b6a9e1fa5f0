use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::debug;
use tracing::warn;

use super::Admission;
use super::TrafficShapingController;
use crate::clock::CancelToken;
use crate::node::StatisticNode;

/// Drain cadence of the background thread.
const TICK: Duration = Duration::from_micros(200);
/// Longest slice a queued caller sleeps before re-checking its cancel token.
const WAIT_SLICE: Duration = Duration::from_millis(1);
/// How long the drain thread lingers on an empty queue before exiting.
pub const DRAIN_IDLE_GRACE: Duration = Duration::from_secs(1);

/// A queued caller.
#[derive(Debug)]
struct WaterDrop {
    acquire: u32,
    released: Mutex<bool>,
    cv: Condvar,
}

impl WaterDrop {
    fn release(&self) {
        *self.released.lock() = true;
        self.cv.notify_all();
    }
}

#[derive(Debug)]
struct BucketState {
    queue: VecDeque<Arc<WaterDrop>>,
    queued: u64,
    next_release: Option<Instant>,
    draining: bool,
}

#[derive(Debug)]
struct Shared {
    spacing: Duration,
    capacity: u64,
    max_queueing: Duration,
    state: Mutex<BucketState>,
}

/// Leaky bucket: passes leave at a fixed spacing of `stat_interval_ms / count`.
///
/// Callers that find the outlet busy queue as water drops, up to the number
/// the bucket can drain within `max_queueing_time_ms`. A background thread
/// releases drops in order; it is started on demand and exits once the
/// queue has been empty for [`DRAIN_IDLE_GRACE`].
///
/// Waits use the real clock whatever the node's time source.
#[derive(Debug)]
pub struct LeakyBucketController {
    count: f64,
    shared: Arc<Shared>,
}

impl LeakyBucketController {
    pub fn new(count: f64, stat_interval_ms: u64, max_queueing_time_ms: u64) -> Self {
        let spacing = if count > 0.0 {
            Duration::from_secs_f64(stat_interval_ms as f64 / 1000.0 / count)
        } else {
            Duration::ZERO
        };
        let capacity = ((count * max_queueing_time_ms as f64 / stat_interval_ms as f64).floor() as u64).max(1);
        Self {
            count,
            shared: Arc::new(Shared {
                spacing,
                capacity,
                max_queueing: Duration::from_millis(max_queueing_time_ms),
                state: Mutex::new(BucketState {
                    queue: VecDeque::new(),
                    queued: 0,
                    next_release: None,
                    draining: false,
                }),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// Whether the drain thread is currently running.
    pub fn is_draining(&self) -> bool {
        self.shared.state.lock().draining
    }

    pub fn queued(&self) -> u64 {
        self.shared.state.lock().queued
    }

    fn start_drain(&self, state: &mut BucketState) -> bool {
        if state.draining {
            return true;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("shot-guard-leaky-bucket".into())
            .spawn(move || drain(shared));
        match spawned {
            Ok(_) => {
                state.draining = true;
                true
            }
            Err(err) => {
                warn!(error = %err, "cannot start leaky bucket drain thread");
                false
            }
        }
    }

    /// Takes `water` back out of the queue. Returns false if it was released
    /// meanwhile.
    fn withdraw(&self, water: &Arc<WaterDrop>) -> bool {
        let mut state = self.shared.state.lock();
        if *water.released.lock() {
            return false;
        }
        if let Some(pos) = state.queue.iter().position(|d| Arc::ptr_eq(d, water)) {
            state.queue.remove(pos);
            state.queued -= water.acquire as u64;
        }
        true
    }
}

fn drain(shared: Arc<Shared>) {
    let mut idle_since: Option<Instant> = None;
    loop {
        {
            let mut state = shared.state.lock();
            if state.queue.is_empty() {
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= DRAIN_IDLE_GRACE {
                    state.draining = false;
                    debug!("leaky bucket drain thread idle, exiting");
                    return;
                }
            } else {
                idle_since = None;
                let now = Instant::now();
                if state.next_release.is_none_or(|at| at <= now)
                    && let Some(water) = state.queue.pop_front()
                {
                    state.queued -= water.acquire as u64;
                    state.next_release = Some(now + shared.spacing * water.acquire);
                    water.release();
                }
            }
        }
        std::thread::sleep(TICK);
    }
}

impl TrafficShapingController for LeakyBucketController {
    fn can_pass(
        &self,
        _node: &StatisticNode,
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

        let water = {
            let mut state = self.shared.state.lock();
            let now = Instant::now();
            // Outlet free and nobody waiting: go straight through.
            if state.queue.is_empty() && state.next_release.is_none_or(|at| at <= now) {
                state.next_release = Some(now + self.shared.spacing * acquire);
                return Admission::Pass;
            }
            if state.queued + acquire as u64 > self.shared.capacity {
                return Admission::Reject;
            }
            if !self.start_drain(&mut state) {
                return Admission::Reject;
            }
            let water = Arc::new(WaterDrop {
                acquire,
                released: Mutex::new(false),
                cv: Condvar::new(),
            });
            state.queue.push_back(Arc::clone(&water));
            state.queued += acquire as u64;
            water
        };

        let deadline = Instant::now() + self.shared.max_queueing;
        loop {
            let mut released = water.released.lock();
            if *released {
                return Admission::Pass;
            }
            let now = Instant::now();
            if now >= deadline || cancel.is_some_and(CancelToken::is_cancelled) {
                break;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            water.cv.wait_for(&mut released, slice);
        }
        // Released between the deadline and the withdrawal: it counts.
        if self.withdraw(&water) {
            return Admission::Reject;
        }
        Admission::Pass
    }
}
