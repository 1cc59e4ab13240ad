//! Fault injection for the simulated link.
//!
//! A [`FaultPlan`] is consulted before every transport operation. It can
//! fail an operation outright, fail it after a number of successes, report
//! the link busy a few times, drop the link for good, or fail at random.

use std::collections::HashMap;

use super::rng::SimRng;
use crate::transport::{TransportError, TransportResult};

/// Transport operations faults can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Device enumeration
    Enumerate,
    /// Opening the link
    Open,
    /// Setting the latency timer
    SetLatency,
    /// Setting USB parameters
    SetUsbParameters,
    /// Setting the transfer size
    SetTransferSize,
    /// Purging the queues
    Purge,
    /// Writing command frames
    Write,
    /// Reading sample bytes
    Read,
    /// Querying the queue and flags
    QueueStatus,
    /// Closing the link
    Close,
}

/// A scripted failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultScenario {
    /// Every call to `operation` fails.
    Fail {
        /// Operation to fail
        operation: Operation,
    },
    /// `operation` succeeds `count` times, then fails.
    FailAfter {
        /// Operation to fail
        operation: Operation,
        /// Successful calls before the failures start
        count: u32,
    },
    /// `operation` reports busy `times` times, then behaves.
    Busy {
        /// Operation to hold up
        operation: Operation,
        /// Busy replies before it succeeds
        times: u32,
    },
    /// After `count` calls to `operation`, the link is gone: this and every
    /// later operation except `close` reports a disconnect.
    LinkLossAfter {
        /// Operation that loses the link
        operation: Operation,
        /// Calls that still succeed
        count: u32,
    },
    /// Every call to `operation` times out.
    Timeout {
        /// Operation to time out
        operation: Operation,
    },
    /// Every `every`-th call to `operation` reports busy.
    Stall {
        /// Operation to stall
        operation: Operation,
        /// Stall period in calls
        every: u32,
    },
}

/// Fault configuration and state of one simulated device.
#[derive(Debug, Default)]
pub struct FaultPlan {
    scenarios: Vec<FaultScenario>,
    failure_rates: HashMap<Operation, f64>,
    rng: SimRng,
    counts: HashMap<Operation, u32>,
    link_lost: bool,
}

impl FaultPlan {
    /// No faults.
    pub fn none() -> Self {
        Self::default()
    }

    /// A plan with one scenario.
    pub fn scenario(scenario: FaultScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// A plan with several scenarios, checked in order.
    pub fn scenarios(scenarios: Vec<FaultScenario>) -> Self {
        Self {
            scenarios,
            ..Self::default()
        }
    }

    /// Fail `operation` at random with probability `rate`.
    pub fn with_failure_rate(mut self, operation: Operation, rate: f64, seed: Option<u64>) -> Self {
        self.failure_rates.insert(operation, rate);
        self.rng = SimRng::new(seed);
        self
    }

    /// Add a scenario after the existing ones.
    pub fn push(&mut self, scenario: FaultScenario) {
        self.scenarios.push(scenario);
    }

    /// Whether a link-loss scenario has fired.
    pub fn link_lost(&self) -> bool {
        self.link_lost
    }

    /// Clear counters and restore a lost link. Scenarios are kept.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.link_lost = false;
    }

    /// Decide the fate of one call to `operation`.
    pub fn check(&mut self, operation: Operation) -> TransportResult<()> {
        if self.link_lost && operation != Operation::Close {
            return Err(TransportError::Disconnected);
        }

        let calls = {
            let count = self.counts.entry(operation).or_insert(0);
            *count += 1;
            *count
        };

        for scenario in &self.scenarios {
            match *scenario {
                FaultScenario::Fail { operation: op } if op == operation => {
                    return Err(injected(operation));
                }
                FaultScenario::FailAfter { operation: op, count } if op == operation => {
                    if calls > count {
                        return Err(injected(operation));
                    }
                }
                FaultScenario::Busy { operation: op, times } if op == operation => {
                    if calls <= times {
                        return Err(TransportError::Busy);
                    }
                }
                FaultScenario::LinkLossAfter { operation: op, count } if op == operation => {
                    if calls > count {
                        self.link_lost = true;
                        return Err(TransportError::Disconnected);
                    }
                }
                FaultScenario::Timeout { operation: op } if op == operation => {
                    return Err(TransportError::Timeout);
                }
                FaultScenario::Stall { operation: op, every } if op == operation => {
                    if every > 0 && calls % every == 0 {
                        return Err(TransportError::Busy);
                    }
                }
                _ => {}
            }
        }

        let rate = self.failure_rates.get(&operation).copied().unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return Err(TransportError::Io(format!(
                "random failure on {:?}",
                operation
            )));
        }

        Ok(())
    }
}

fn injected(operation: Operation) -> TransportError {
    TransportError::Io(format!("injected failure on {:?}", operation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_faults() {
        let mut plan = FaultPlan::none();
        for _ in 0..100 {
            assert!(plan.check(Operation::Read).is_ok());
        }
    }

    #[test]
    fn test_fail_after() {
        let mut plan = FaultPlan::scenario(FaultScenario::FailAfter {
            operation: Operation::Write,
            count: 2,
        });
        assert!(plan.check(Operation::Write).is_ok());
        assert!(plan.check(Operation::Write).is_ok());
        assert!(matches!(
            plan.check(Operation::Write),
            Err(TransportError::Io(_))
        ));
        assert!(plan.check(Operation::Read).is_ok());

        plan.reset();
        assert!(plan.check(Operation::Write).is_ok());
    }

    #[test]
    fn test_busy_then_ok() {
        let mut plan = FaultPlan::scenario(FaultScenario::Busy {
            operation: Operation::Close,
            times: 3,
        });
        for _ in 0..3 {
            assert_eq!(plan.check(Operation::Close), Err(TransportError::Busy));
        }
        assert!(plan.check(Operation::Close).is_ok());
    }

    #[test]
    fn test_periodic_stall() {
        let mut plan = FaultPlan::scenario(FaultScenario::Stall {
            operation: Operation::Read,
            every: 3,
        });
        let results: Vec<bool> = (0..6).map(|_| plan.check(Operation::Read).is_ok()).collect();
        assert_eq!(results, vec![true, true, false, true, true, false]);
    }

    #[test]
    fn test_link_loss_is_sticky() {
        let mut plan = FaultPlan::scenario(FaultScenario::LinkLossAfter {
            operation: Operation::Read,
            count: 1,
        });
        assert!(plan.check(Operation::Read).is_ok());
        assert_eq!(plan.check(Operation::Read), Err(TransportError::Disconnected));
        assert!(plan.link_lost());
        assert_eq!(
            plan.check(Operation::QueueStatus),
            Err(TransportError::Disconnected)
        );
        assert!(plan.check(Operation::Close).is_ok());
    }

    #[test]
    fn test_random_failures() {
        let mut plan = FaultPlan::none().with_failure_rate(Operation::Read, 0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| plan.check(Operation::Read).is_err())
            .count();
        assert!(failures > 400 && failures < 600, "got {}", failures);
        assert!(plan.check(Operation::Write).is_ok());
    }
}
