use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use super::Admission;
use super::TrafficShapingController;
use super::WarmUpState;
use super::throttling::Pacer;
use crate::clock::CancelToken;
use crate::node::StatisticNode;

/// Token stock driving a warm-up ramp.
///
/// Idle capacity accumulates as tokens up to `max_token`. While the stock is
/// above `warning_token` the permitted rate is reduced, down to
/// `count / cold_factor` when the stock is full, and rises linearly as
/// sustained traffic drains the stock.
#[derive(Debug)]
pub(crate) struct WarmUpTokens {
    count: f64,
    cold_factor: u32,
    warning_token: i64,
    max_token: i64,
    slope: f64,
    stored_tokens: AtomicI64,
    last_filled_ms: AtomicU64,
}

impl WarmUpTokens {
    pub(crate) fn new(count: f64, warm_up_period_sec: u32, cold_factor: u32) -> Self {
        // Rules and config refuse factors below 2; direct construction is clamped.
        let cold_factor = cold_factor.max(2);
        let period = warm_up_period_sec as f64;
        let warning_token = (period * count) as i64 / (cold_factor as i64 - 1);
        let max_token = warning_token + (2.0 * period * count / (1.0 + cold_factor as f64)) as i64;
        let slope = if max_token > warning_token && count > 0.0 {
            (cold_factor as f64 - 1.0) / count / (max_token - warning_token) as f64
        } else {
            0.0
        };
        Self {
            count,
            cold_factor,
            warning_token,
            max_token,
            slope,
            stored_tokens: AtomicI64::new(0),
            last_filled_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn warning_token(&self) -> i64 {
        self.warning_token
    }

    pub(crate) fn max_token(&self) -> i64 {
        self.max_token
    }

    pub(crate) fn stored(&self) -> i64 {
        self.stored_tokens.load(Ordering::Acquire)
    }

    /// Refills the stock once per second from the idle time since the last
    /// refill, then drains what the previous second consumed.
    pub(crate) fn sync(&self, now_ms: u64, previous_qps: i64) {
        let now = now_ms - now_ms % 1000;
        let last_filled = self.last_filled_ms.load(Ordering::Acquire);
        if now <= last_filled {
            return;
        }

        let old = self.stored_tokens.load(Ordering::Acquire);
        let new = self.cool_down(old, now, last_filled, previous_qps);
        if self
            .stored_tokens
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let current = self.stored_tokens.fetch_sub(previous_qps, Ordering::AcqRel) - previous_qps;
            if current < 0 {
                self.stored_tokens.store(0, Ordering::Release);
            }
            self.last_filled_ms.store(now, Ordering::Release);
        }
    }

    fn cool_down(&self, old: i64, now: u64, last_filled: u64, previous_qps: i64) -> i64 {
        let refill = || old + ((now - last_filled) as f64 * self.count / 1000.0) as i64;
        let new = if old < self.warning_token {
            refill()
        } else if old > self.warning_token && previous_qps < self.count as i64 / self.cold_factor as i64 {
            refill()
        } else {
            old
        };
        new.min(self.max_token)
    }

    /// The rate currently permitted, given the stock.
    pub(crate) fn permitted_qps(&self) -> f64 {
        let rest = self.stored();
        if rest >= self.warning_token {
            let above = (rest - self.warning_token) as f64;
            (1.0 / (above * self.slope + 1.0 / self.count)).next_up()
        } else {
            self.count
        }
    }

    pub(crate) fn state(&self) -> WarmUpState {
        WarmUpState {
            stored_tokens: self.stored(),
            last_filled_ms: self.last_filled_ms.load(Ordering::Acquire),
        }
    }

    pub(crate) fn restore(&self, state: WarmUpState) {
        self.stored_tokens
            .store(state.stored_tokens.clamp(0, self.max_token), Ordering::Release);
        self.last_filled_ms
            .store(state.last_filled_ms, Ordering::Release);
    }
}

/// Rejects above a threshold that ramps up from `count / cold_factor` to
/// `count` over the warm-up period.
#[derive(Debug)]
pub struct WarmUpController {
    tokens: WarmUpTokens,
}

impl WarmUpController {
    pub fn new(count: f64, warm_up_period_sec: u32, cold_factor: u32) -> Self {
        Self {
            tokens: WarmUpTokens::new(count, warm_up_period_sec, cold_factor),
        }
    }
}

impl TrafficShapingController for WarmUpController {
    fn can_pass(
        &self,
        node: &StatisticNode,
        acquire: u32,
        _prioritized: bool,
        _cancel: Option<&CancelToken>,
    ) -> Admission {
        let pass_qps = node.pass_qps().floor();
        self.tokens
            .sync(node.time().now_ms(), node.previous_pass_qps() as i64);

        if pass_qps + acquire as f64 <= self.tokens.permitted_qps() {
            Admission::Pass
        } else {
            Admission::Reject
        }
    }

    fn warm_up_state(&self) -> Option<WarmUpState> {
        Some(self.tokens.state())
    }

    fn restore_warm_up(&self, state: WarmUpState) {
        self.tokens.restore(state);
    }
}

/// Warm-up ramp with uniform pacing: the spacing between passes follows the
/// permitted rate, and callers queue instead of being rejected.
#[derive(Debug)]
pub struct WarmUpThrottlingController {
    tokens: WarmUpTokens,
    pacer: Pacer,
}

impl WarmUpThrottlingController {
    pub fn new(count: f64, warm_up_period_sec: u32, cold_factor: u32, max_queueing_time_ms: u64) -> Self {
        Self {
            tokens: WarmUpTokens::new(count, warm_up_period_sec, cold_factor),
            pacer: Pacer::new(max_queueing_time_ms, false),
        }
    }
}

impl TrafficShapingController for WarmUpThrottlingController {
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
        if self.tokens.count <= 0.0 {
            return Admission::Reject;
        }
        let time = node.time();
        self.tokens
            .sync(time.now_ms(), node.previous_pass_qps() as i64);

        let cost = (acquire as f64 / self.tokens.permitted_qps() * 1000.0).round() as i64;
        if self.pacer.acquire(time, cost, cancel) {
            Admission::Pass
        } else {
            Admission::Reject
        }
    }

    fn warm_up_state(&self) -> Option<WarmUpState> {
        Some(self.tokens.state())
    }

    fn restore_warm_up(&self, state: WarmUpState) {
        self.tokens.restore(state);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use more_asserts::assert_ge;
    use more_asserts::assert_lt;

    use super::*;
    use crate::clock::TimeSource;
    use crate::node::StatConfig;

    fn node() -> (StatisticNode, Arc<quanta::Mock>) {
        let (time, mock) = TimeSource::frozen();
        (StatisticNode::new(&StatConfig::default(), time).unwrap(), mock)
    }

    #[test]
    fn token_layout() {
        let tokens = WarmUpTokens::new(10.0, 10, 3);
        assert_eq!(tokens.warning_token(), 50);
        assert_eq!(tokens.max_token(), 100);
    }

    #[test]
    fn cold_factor_of_one_is_clamped() {
        let tokens = WarmUpTokens::new(10.0, 10, 1);
        assert_eq!(tokens.warning_token(), WarmUpTokens::new(10.0, 10, 2).warning_token());

        let (node, _mock) = node();
        let controller = WarmUpController::new(10.0, 10, 1);
        assert!(controller.can_pass(&node, 1, false, None).is_pass());
        let controller = WarmUpThrottlingController::new(10.0, 10, 1, 500);
        assert!(controller.can_pass(&node, 1, false, None).is_pass());
    }

    #[test]
    fn starts_cold() {
        let (node, _mock) = node();
        let controller = WarmUpController::new(10.0, 10, 3);
        let mut admitted = 0;
        for _ in 0..20 {
            if controller.can_pass(&node, 1, false, None).is_pass() {
                node.add_pass_request(1);
                admitted += 1;
            }
        }
        assert_eq!(controller.tokens.stored(), 100);
        // count / cold_factor
        assert_eq!(admitted, 3);
    }

    #[test]
    fn admitted_rate_ramps_up_to_the_threshold() {
        let (node, mock) = node();
        let controller = WarmUpController::new(10.0, 10, 3);

        let mut rates = Vec::new();
        for _ in 0..30 {
            let admitted = (0..20)
                .filter(|_| {
                    let pass = controller.can_pass(&node, 1, false, None).is_pass();
                    if pass {
                        node.add_pass_request(1);
                    }
                    pass
                })
                .count();
            rates.push(admitted);
            mock.increment(Duration::from_secs(1));
        }

        assert!(rates.windows(2).all(|w| w[1] >= w[0]), "{rates:?}");
        assert_lt!(rates[0], 10);
        assert!(rates[20..].iter().all(|&r| r == 10), "{rates:?}");
    }

    #[test]
    fn stock_survives_restore() {
        let (node, mock) = node();
        let old = WarmUpController::new(10.0, 10, 3);
        for _ in 0..15 {
            for _ in 0..20 {
                if old.can_pass(&node, 1, false, None).is_pass() {
                    node.add_pass_request(1);
                }
            }
            mock.increment(Duration::from_secs(1));
        }
        let state = old.warm_up_state().unwrap();
        assert_lt!(state.stored_tokens, 100);

        let fresh = WarmUpController::new(10.0, 10, 3);
        fresh.restore_warm_up(state);
        let admitted = (0..20)
            .filter(|_| {
                let pass = fresh.can_pass(&node, 1, false, None).is_pass();
                if pass {
                    node.add_pass_request(1);
                }
                pass
            })
            .count();
        assert_ge!(admitted, 7);
    }

    #[test]
    fn throttled_warm_up_spaces_cold_calls_wider() {
        let (node, _mock) = node();
        // Cold: ~3.3 qps permitted, so ~300ms between passes; with 1s of
        // queue only a few calls fit.
        let controller = WarmUpThrottlingController::new(10.0, 10, 3, 1000);
        let passed = (0..10)
            .filter(|_| controller.can_pass(&node, 1, false, None).is_pass())
            .count();
        assert_eq!(passed, 4);
    }
}
