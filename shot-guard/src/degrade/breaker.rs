use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;

use super::DegradeRule;
use super::listener::BreakerListeners;
use super::listener::StateChange;
use crate::clock::TimeSource;
use crate::error::ConfigError;
use crate::param::ParamValue;
use crate::stat::LeapArray;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum State {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => State::Open,
            2 => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Answer of [`CircuitBreaker::try_pass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPermit {
    Pass,
    /// Let through as the single half-open probe.
    Probe,
    Deny,
}

/// Calls in the breaker's window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerCounts {
    pub total: u64,
    /// Slow or failed calls, depending on the strategy.
    pub target: u64,
}

/// One bucket of a breaker window.
#[derive(Debug, Default)]
pub(crate) struct BreakerCounter {
    total: AtomicU64,
    target: AtomicU64,
}

/// Window of a breaker: one bucket spanning `stat_interval_ms`.
#[derive(Debug)]
pub(crate) struct BreakerWindow {
    array: LeapArray<BreakerCounter>,
}

impl BreakerWindow {
    pub(crate) fn new(stat_interval_ms: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            array: LeapArray::new(1, stat_interval_ms)?,
        })
    }

    pub(crate) fn record(&self, now: u64, target: bool) {
        let window = self.array.current_window_at(now);
        window.value().total.fetch_add(1, Ordering::Relaxed);
        if target {
            window.value().target.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn counts(&self, now: u64) -> BreakerCounts {
        self.array
            .values_at(now)
            .iter()
            .fold(BreakerCounts::default(), |acc, w| BreakerCounts {
                total: acc.total + w.value().total.load(Ordering::Relaxed),
                target: acc.target + w.value().target.load(Ordering::Relaxed),
            })
    }

    pub(crate) fn reset(&self) {
        self.array.reset();
    }
}

/// State machine shared by every breaker kind.
///
/// Transitions are compare-and-swap on the state, so under concurrency
/// exactly one caller performs (and reports) each transition.
pub struct BreakerCore {
    rule: Arc<DegradeRule>,
    param: Option<ParamValue>,
    state: AtomicU8,
    next_retry_ms: AtomicU64,
    failed_probes: AtomicU32,
    time: TimeSource,
    listeners: Arc<BreakerListeners>,
}

impl fmt::Debug for BreakerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerCore")
            .field("resource", &self.rule.resource)
            .field("param", &self.param)
            .field("state", &self.state())
            .field("next_retry_ms", &self.next_retry_ms())
            .finish()
    }
}

impl BreakerCore {
    pub(crate) fn new(
        rule: Arc<DegradeRule>,
        param: Option<ParamValue>,
        time: TimeSource,
        listeners: Arc<BreakerListeners>,
    ) -> Self {
        Self {
            rule,
            param,
            state: AtomicU8::new(State::Closed as u8),
            next_retry_ms: AtomicU64::new(0),
            failed_probes: AtomicU32::new(0),
            time,
            listeners,
        }
    }

    pub fn rule(&self) -> &Arc<DegradeRule> {
        &self.rule
    }

    /// The parameter value this breaker guards, for parameter rules.
    pub fn param(&self) -> Option<&ParamValue> {
        self.param.as_ref()
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn next_retry_ms(&self) -> u64 {
        self.next_retry_ms.load(Ordering::Acquire)
    }

    pub(crate) fn now(&self) -> u64 {
        self.time.now_ms()
    }

    pub(crate) fn try_pass(&self) -> BreakerPermit {
        match self.state() {
            State::Closed => BreakerPermit::Pass,
            State::Open if self.now() >= self.next_retry_ms() => {
                if self.transition(State::Open, State::HalfOpen, None) {
                    BreakerPermit::Probe
                } else {
                    BreakerPermit::Deny
                }
            }
            State::Open | State::HalfOpen => BreakerPermit::Deny,
        }
    }

    fn recovery_timeout(&self, failed_probes: u32) -> u64 {
        let base = self.rule.recovery_timeout_ms;
        match self.rule.max_recovery_timeout_ms {
            None => base,
            Some(max) => base
                .saturating_mul(2u64.saturating_pow(failed_probes))
                .min(max),
        }
    }

    fn arm_retry(&self, failed_probes: u32) {
        let at = self.now() + self.recovery_timeout(failed_probes);
        self.next_retry_ms.store(at, Ordering::Release);
    }

    pub(crate) fn closed_to_open(&self, snapshot: f64) -> bool {
        self.arm_retry(0);
        if self.transition(State::Closed, State::Open, Some(snapshot)) {
            self.failed_probes.store(0, Ordering::Release);
            return true;
        }
        false
    }

    pub(crate) fn half_open_to_open(&self, snapshot: f64) -> bool {
        let streak = self.failed_probes.load(Ordering::Acquire) + 1;
        self.arm_retry(streak);
        if self.transition(State::HalfOpen, State::Open, Some(snapshot)) {
            self.failed_probes.store(streak, Ordering::Release);
            return true;
        }
        false
    }

    pub(crate) fn half_open_to_closed(&self) -> bool {
        if self.transition(State::HalfOpen, State::Closed, None) {
            self.failed_probes.store(0, Ordering::Release);
            return true;
        }
        false
    }

    /// The probe never reached the protected code: back to open, with the
    /// current timeout and without counting a failed probe.
    pub(crate) fn revert_probe(&self) {
        self.arm_retry(self.failed_probes.load(Ordering::Acquire));
        self.transition(State::HalfOpen, State::Open, None);
    }

    fn transition(&self, from: State, to: State, snapshot: Option<f64>) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.listeners.notify(&StateChange {
                rule: Arc::clone(&self.rule),
                param: self.param.clone(),
                from,
                to,
                snapshot,
                next_retry_ms: (to == State::Open).then(|| self.next_retry_ms()),
            });
        }
        swapped
    }
}

/// A circuit breaker bound to one degrade rule (and, for parameter rules,
/// one argument value).
pub trait CircuitBreaker: Send + Sync + fmt::Debug {
    fn core(&self) -> &BreakerCore;

    /// Records a finished call and evaluates the transitions it can cause.
    ///
    /// `overloaded` is consulted only before tripping a rule that asks for a
    /// scenario check.
    fn on_request_complete(&self, rt: u64, failed: bool, overloaded: &dyn Fn() -> bool);

    fn counts(&self) -> BreakerCounts;

    fn rule(&self) -> &Arc<DegradeRule> {
        self.core().rule()
    }

    fn state(&self) -> State {
        self.core().state()
    }

    fn try_pass(&self) -> BreakerPermit {
        self.core().try_pass()
    }

    fn revert_probe(&self) {
        self.core().revert_probe()
    }

    fn next_retry_ms(&self) -> u64 {
        self.core().next_retry_ms()
    }
}

/// Shared completion logic: `target` marks the call as slow or failed, and
/// `trips` decides from the window counts whether a closed breaker opens.
pub(crate) fn complete(
    core: &BreakerCore,
    window: &BreakerWindow,
    target: bool,
    trips: impl Fn(BreakerCounts) -> Option<f64>,
    overloaded: &dyn Fn() -> bool,
) {
    let now = core.now();
    window.record(now, target);

    match core.state() {
        State::Open => {}
        State::HalfOpen => {
            if target {
                core.half_open_to_open(1.0);
            } else if core.half_open_to_closed() {
                window.reset();
            }
        }
        State::Closed => {
            let counts = window.counts(now);
            // A window without slow or failed calls never trips, whatever
            // the threshold.
            if counts.total < core.rule().min_request_amount || counts.target == 0 {
                return;
            }
            let Some(snapshot) = trips(counts) else {
                return;
            };
            if core.rule().scenario_check && !overloaded() {
                return;
            }
            if core.closed_to_open(snapshot) {
                window.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::clock::MOCK_EPOCH_MS;
    use crate::degrade::BreakerStrategy;
    use crate::degrade::SlowRequestBreaker;
    use crate::degrade::StateChangeListener;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<(State, State)>>);

    impl StateChangeListener for Recorder {
        fn on_change(&self, change: &super::StateChange) {
            self.0.lock().push((change.from, change.to));
        }
    }

    fn open_breaker(rule: DegradeRule) -> (SlowRequestBreaker, Arc<quanta::Mock>, Arc<Recorder>) {
        let (time, mock) = TimeSource::frozen();
        let listeners = Arc::new(BreakerListeners::default());
        let recorder = Arc::new(Recorder::default());
        listeners.add(recorder.clone());
        let breaker = SlowRequestBreaker::new(Arc::new(rule), None, time, listeners).unwrap();
        for _ in 0..5 {
            breaker.on_request_complete(500, false, &|| false);
        }
        assert_eq!(breaker.state(), State::Open);
        (breaker, mock, recorder)
    }

    fn slow_rule() -> DegradeRule {
        DegradeRule::new(
            "svc",
            BreakerStrategy::SlowRequestRatio {
                max_allowed_rt_ms: 100,
                threshold: 1.0,
            },
        )
        .with_recovery_timeout_ms(1000)
    }

    #[test]
    fn failed_probes_back_off_up_to_the_ceiling() {
        let (breaker, mock, _) = open_breaker(slow_rule().with_max_recovery_timeout_ms(3000));
        let mut now = MOCK_EPOCH_MS;
        assert_eq!(breaker.next_retry_ms(), now + 1000);

        for expected in [2000, 3000, 3000] {
            let wait = breaker.next_retry_ms() - now;
            mock.increment(Duration::from_millis(wait));
            now += wait;
            assert_eq!(breaker.try_pass(), BreakerPermit::Probe);
            breaker.on_request_complete(500, false, &|| false);
            assert_eq!(breaker.next_retry_ms(), now + expected);
        }

        mock.increment(Duration::from_millis(3000));
        now += 3000;
        assert_eq!(breaker.try_pass(), BreakerPermit::Probe);
        breaker.on_request_complete(1, false, &|| false);
        assert_eq!(breaker.state(), State::Closed);

        // The streak restarts after closing.
        for _ in 0..5 {
            breaker.on_request_complete(500, false, &|| false);
        }
        assert_eq!(breaker.next_retry_ms(), now + 1000);
    }

    #[test]
    fn reverted_probe_reopens_without_backoff() {
        let (breaker, mock, _) = open_breaker(slow_rule().with_max_recovery_timeout_ms(8000));
        mock.increment(Duration::from_millis(1000));
        assert_eq!(breaker.try_pass(), BreakerPermit::Probe);

        breaker.revert_probe();
        assert_eq!(breaker.state(), State::Open);
        assert_eq!(breaker.next_retry_ms(), MOCK_EPOCH_MS + 2000);
    }

    #[test]
    fn listeners_see_every_transition() {
        let (breaker, mock, recorder) = open_breaker(slow_rule());
        mock.increment(Duration::from_millis(1000));
        assert_eq!(breaker.try_pass(), BreakerPermit::Probe);
        breaker.on_request_complete(1, false, &|| false);

        assert_eq!(
            *recorder.0.lock(),
            vec![
                (State::Closed, State::Open),
                (State::Open, State::HalfOpen),
                (State::HalfOpen, State::Closed),
            ]
        );
    }
}
