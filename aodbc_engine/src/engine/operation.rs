//! One in-flight native call, driven to completion by repeated polls.

use crate::config::Settings;
use crate::driver::{Driver, SqlReturn};
use crate::error::{AodbcError, Result};
use crate::signal::{CompletionSignal, SignalStatus};
use std::time::{Duration, Instant};

/// Outcome of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpPoll {
    Pending,
    Complete(SqlReturn),
}

/// An accepted asynchronous call paired with its completion signal and
/// timeout budget.
///
/// Each poll first checks the deadline, then performs one bounded wait on
/// the signal. A poll that observes the signal ready only records that;
/// the return code is retrieved and reported by the next poll. After the
/// operation finishes, timed out or completed, further polls are an error.
pub struct AsyncOp {
    signal: CompletionSignal,
    settings: Settings,
    timeout_secs: i64,
    started: Instant,
    operation: &'static str,
    observed_ready: bool,
    finished: bool,
}

impl AsyncOp {
    pub fn new(
        signal: CompletionSignal,
        settings: Settings,
        timeout_secs: i64,
        operation: &'static str,
    ) -> Self {
        Self {
            signal,
            settings,
            timeout_secs,
            started: Instant::now(),
            operation,
            observed_ready: false,
            finished: false,
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Drive the operation one step.
    ///
    /// A timeout of zero waits indefinitely. Nonzero timeouts expire once
    /// the elapsed time reaches the budget plus the settings' slack; the
    /// deadline is checked before waiting, so an expired operation never
    /// blocks the caller again.
    pub fn poll(&mut self, driver: &dyn Driver) -> Result<OpPoll> {
        if self.finished {
            return Err(AodbcError::AlreadyCompleted(self.operation));
        }
        if self.observed_ready {
            self.finished = true;
            return Ok(OpPoll::Complete(self.signal.complete(driver)));
        }
        let elapsed = self.started.elapsed();
        if self.timeout_secs > 0 {
            let budget = self.timeout_secs as u64 + self.settings.deadline_slack_secs();
            if elapsed.as_secs() >= budget {
                // Abandon the in-flight call. The signal is forced ready so
                // a worker thread's storage outlives any late completion.
                self.signal.force_ready();
                self.finished = true;
                return Err(AodbcError::Timeout {
                    operation: self.operation,
                    elapsed_secs: elapsed.as_secs_f64(),
                });
            }
        }
        let wait = Duration::from_millis(self.settings.poll_interval_ms());
        if self.signal.poll(wait) == SignalStatus::Ready {
            self.observed_ready = true;
        }
        Ok(OpPoll::Pending)
    }

    #[cfg(test)]
    fn backdate(&mut self, secs: u64) {
        self.started -= Duration::from_secs(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::ScriptedDriver;
    use crate::signal::WorkerSignal;
    use std::thread;

    fn op_with_worker<F>(timeout_secs: i64, call: F) -> AsyncOp
    where
        F: FnOnce() -> SqlReturn + Send + 'static,
    {
        AsyncOp::new(
            CompletionSignal::Worker(WorkerSignal::spawn(call)),
            Settings::default(),
            timeout_secs,
            "execute",
        )
    }

    #[test]
    fn test_completion_reported_on_poll_after_ready() {
        let driver = ScriptedDriver::new();
        let mut op = op_with_worker(0, || SqlReturn::Success);
        let mut pending_polls = 0;
        loop {
            match op.poll(&driver).unwrap() {
                OpPoll::Pending => pending_polls += 1,
                OpPoll::Complete(rc) => {
                    assert_eq!(rc, SqlReturn::Success);
                    break;
                }
            }
            assert!(pending_polls < 100, "operation never completed");
        }
        // The ready observation itself reported pending.
        assert!(pending_polls >= 1);
    }

    #[test]
    fn test_poll_after_completion_is_an_error() {
        let driver = ScriptedDriver::new();
        let mut op = op_with_worker(0, || SqlReturn::Success);
        loop {
            if let OpPoll::Complete(_) = op.poll(&driver).unwrap() {
                break;
            }
        }
        let err = op.poll(&driver).unwrap_err();
        assert!(matches!(err, AodbcError::AlreadyCompleted("execute")));
    }

    #[test]
    fn test_deadline_checked_before_waiting() {
        let driver = ScriptedDriver::new();
        let mut op = op_with_worker(3, || {
            thread::sleep(Duration::from_secs(600));
            SqlReturn::Success
        });
        // Inside the budget: pending, not a timeout.
        assert_eq!(op.poll(&driver).unwrap(), OpPoll::Pending);
        // Past budget plus slack: times out without another wait.
        op.backdate(4);
        let before = Instant::now();
        let err = op.poll(&driver).unwrap_err();
        assert!(before.elapsed() < Duration::from_millis(40));
        match err {
            AodbcError::Timeout {
                operation,
                elapsed_secs,
            } => {
                assert_eq!(operation, "execute");
                assert!(elapsed_secs >= 4.0);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_no_timeout_before_budget_plus_slack() {
        let driver = ScriptedDriver::new();
        let mut op = op_with_worker(3, || {
            thread::sleep(Duration::from_secs(600));
            SqlReturn::Success
        });
        // Default slack is one second, so 3.x elapsed is still pending.
        op.backdate(3);
        assert_eq!(op.poll(&driver).unwrap(), OpPoll::Pending);
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let driver = ScriptedDriver::new();
        let mut op = op_with_worker(0, || {
            thread::sleep(Duration::from_millis(400));
            SqlReturn::Success
        });
        op.backdate(3600);
        assert_eq!(op.poll(&driver).unwrap(), OpPoll::Pending);
    }

    #[test]
    fn test_poll_after_timeout_is_already_completed() {
        let driver = ScriptedDriver::new();
        let mut op = op_with_worker(1, || {
            thread::sleep(Duration::from_secs(600));
            SqlReturn::Success
        });
        op.backdate(10);
        assert!(matches!(
            op.poll(&driver).unwrap_err(),
            AodbcError::Timeout { .. }
        ));
        assert!(matches!(
            op.poll(&driver).unwrap_err(),
            AodbcError::AlreadyCompleted(_)
        ));
    }
}
