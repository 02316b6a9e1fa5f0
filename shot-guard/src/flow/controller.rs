use std::fmt;
use std::time::Duration;

use super::FlowGrade;
use crate::clock::CancelToken;
use crate::node::StatisticNode;

/// Decision of a [`TrafficShapingController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Pass,
    /// Admitted into a future window after waiting `wait`. The pass was
    /// booked at `booked_ms` and is already counted in that window.
    Occupied { wait: Duration, booked_ms: u64 },
    Reject,
}

impl Admission {
    pub fn is_pass(&self) -> bool {
        !matches!(self, Admission::Reject)
    }
}

/// Token stock of a warm-up controller, carried across rule reloads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmUpState {
    pub stored_tokens: i64,
    pub last_filled_ms: u64,
}

/// Admission algorithm of a flow rule.
///
/// `can_pass` may park the calling thread for a bounded time (queueing
/// controllers); a fired `cancel` token ends the wait with a reject.
pub trait TrafficShapingController: Send + Sync + fmt::Debug {
    fn can_pass(
        &self,
        node: &StatisticNode,
        acquire: u32,
        prioritized: bool,
        cancel: Option<&CancelToken>,
    ) -> Admission;

    fn warm_up_state(&self) -> Option<WarmUpState> {
        None
    }

    fn restore_warm_up(&self, _state: WarmUpState) {}
}

/// Instant pass/reject against a fixed threshold.
///
/// Prioritized QPS calls that would be rejected may borrow room from a
/// future window instead, waiting at most the node's occupy timeout.
#[derive(Debug)]
pub struct DefaultController {
    grade: FlowGrade,
    count: f64,
}

impl DefaultController {
    pub fn new(grade: FlowGrade, count: f64) -> Self {
        Self { grade, count }
    }
}

impl TrafficShapingController for DefaultController {
    fn can_pass(
        &self,
        node: &StatisticNode,
        acquire: u32,
        prioritized: bool,
        cancel: Option<&CancelToken>,
    ) -> Admission {
        let current = match self.grade {
            FlowGrade::Thread => node.cur_thread_num() as f64,
            FlowGrade::Qps => node.pass_qps(),
        };
        if current + acquire as f64 <= self.count {
            return Admission::Pass;
        }

        if prioritized && self.grade == FlowGrade::Qps {
            let time = node.time();
            let now = time.now_ms();
            let wait = node.try_occupy_next(now, acquire, self.count);
            if wait < node.occupy_timeout_ms() {
                node.add_waiting_request(now + wait, acquire);
                node.add_occupied_pass(now, acquire);
                let wait = Duration::from_millis(wait);
                if time.sleep(wait, cancel) {
                    return Admission::Occupied {
                        wait,
                        booked_ms: now,
                    };
                }
            }
        }
        Admission::Reject
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::TimeSource;
    use crate::node::StatConfig;

    fn node() -> (StatisticNode, Arc<quanta::Mock>) {
        let (time, mock) = TimeSource::mock();
        (StatisticNode::new(&StatConfig::default(), time).unwrap(), mock)
    }

    #[test]
    fn boundary_passes() {
        let (node, _mock) = node();
        let controller = DefaultController::new(FlowGrade::Qps, 3.0);
        node.add_pass_request(2);
        // 2 + 1 == 3
        assert_eq!(controller.can_pass(&node, 1, false, None), Admission::Pass);
        assert_eq!(controller.can_pass(&node, 2, false, None), Admission::Reject);
        node.add_pass_request(1);
        assert_eq!(controller.can_pass(&node, 1, false, None), Admission::Reject);
    }

    #[test]
    fn thread_grade_reads_concurrency() {
        let (node, _mock) = node();
        let controller = DefaultController::new(FlowGrade::Thread, 1.0);
        assert!(controller.can_pass(&node, 1, false, None).is_pass());
        node.increase_thread_num();
        assert!(!controller.can_pass(&node, 1, false, None).is_pass());
        node.decrease_thread_num();
        assert!(controller.can_pass(&node, 1, false, None).is_pass());
    }

    #[test]
    fn prioritized_call_occupies_next_window() {
        let (node, mock) = node();
        let controller = DefaultController::new(FlowGrade::Qps, 2.0);
        node.add_pass_request(2);
        mock.increment(Duration::from_millis(800));

        let before = node.time().now_ms();
        assert_eq!(
            controller.can_pass(&node, 1, true, None),
            Admission::Occupied {
                wait: Duration::from_millis(200),
                booked_ms: before,
            }
        );
        // The mock clock moved by the wait.
        assert_eq!(node.time().now_ms(), before + 200);
        // Non-prioritized callers are still rejected.
        node.add_pass_request(2);
        assert_eq!(controller.can_pass(&node, 1, false, None), Admission::Reject);
    }

    #[test]
    fn cancelled_occupy_wait_rejects() {
        let (node, mock) = node();
        let controller = DefaultController::new(FlowGrade::Qps, 1.0);
        node.add_pass_request(1);
        mock.increment(Duration::from_millis(700));

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(controller.can_pass(&node, 1, true, Some(&cancel)), Admission::Reject);
    }
}
