//! Per-step attempt tracking.
//!
//! A step moves through `NotStarted -> Attempting(n) -> {Succeeded, Failed,
//! TimedOut}`, or straight to `Skipped` when its guard is false. A failed
//! attempt either loops back to `Attempting(n + 1)` with a delay or ends the
//! step, depending on the policy.

use gitci_core::Error;
use gitci_core::pipeline::{BackoffStrategy, RetryPolicy};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    NotStarted,
    Attempting(u32),
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptState::NotStarted | AttemptState::Attempting(_))
    }
}

/// Why an attempt failed, as far as retry conditions care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ExitCode(i32),
    Timeout,
    /// The job deadline passed. Never retried.
    Deadline,
    /// The command could not be started.
    System,
}

impl FailureKind {
    pub fn of(error: &Error) -> Self {
        if matches!(error, Error::JobTimeout { .. }) {
            return FailureKind::Deadline;
        }
        if error.is_timeout() {
            return FailureKind::Timeout;
        }
        match error.exit_code() {
            Some(code) => FailureKind::ExitCode(code),
            None => FailureKind::System,
        }
    }

    fn matches(&self, condition: &str) -> bool {
        match condition.trim() {
            "always" | "any" => true,
            "failure" | "script_failure" | "non_zero_exit" => {
                matches!(self, FailureKind::ExitCode(_))
            }
            "timeout" | "stuck_or_timeout_failure" | "job_execution_timeout" => {
                matches!(self, FailureKind::Timeout)
            }
            "runner_system_failure" | "unknown_failure" | "system_failure" => {
                matches!(self, FailureKind::System)
            }
            other => match (other.parse::<i32>(), self) {
                (Ok(code), FailureKind::ExitCode(actual)) => code == *actual,
                _ => false,
            },
        }
    }
}

/// Attempt state machine for one step.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: AttemptState,
    attempts: u32,
}

impl RetryMachine {
    pub fn new(policy: Option<&RetryPolicy>) -> Self {
        Self {
            policy: policy.cloned().unwrap_or_default(),
            state: AttemptState::NotStarted,
            attempts: 0,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts()
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// Start the first attempt.
    pub fn begin(&mut self) -> u32 {
        if self.state == AttemptState::NotStarted {
            self.attempts = 1;
            self.state = AttemptState::Attempting(1);
        }
        self.attempts
    }

    pub fn skip(&mut self) {
        if self.state == AttemptState::NotStarted {
            self.state = AttemptState::Skipped;
        }
    }

    pub fn succeed(&mut self) {
        if let AttemptState::Attempting(_) = self.state {
            self.state = AttemptState::Succeeded;
        }
    }

    /// Record a failed attempt.
    ///
    /// Returns the wait before the next attempt when the policy allows one;
    /// the state is then `Attempting(n + 1)`. Returns `None` once the step
    /// has failed for good.
    pub fn fail(&mut self, kind: FailureKind) -> Option<Duration> {
        let AttemptState::Attempting(n) = self.state else {
            return None;
        };

        if n < self.max_attempts() && self.is_retryable(kind) {
            self.attempts = n + 1;
            self.state = AttemptState::Attempting(n + 1);
            return Some(backoff_delay(self.policy.backoff, self.policy.delay(), n));
        }

        self.state = match kind {
            FailureKind::Timeout | FailureKind::Deadline => AttemptState::TimedOut,
            _ => AttemptState::Failed,
        };
        None
    }

    fn is_retryable(&self, kind: FailureKind) -> bool {
        if kind == FailureKind::Deadline {
            return false;
        }
        if self.policy.conditions.is_empty() && self.policy.exit_codes.is_empty() {
            return true;
        }
        if matches!(kind, FailureKind::ExitCode(code) if self.policy.exit_codes.contains(&code)) {
            return true;
        }
        self.policy.conditions.iter().any(|c| kind.matches(c))
    }
}

/// Wait before retry number `retry` (1-based).
pub fn backoff_delay(strategy: BackoffStrategy, base: Duration, retry: u32) -> Duration {
    let retry = retry.max(1);
    match strategy {
        BackoffStrategy::Constant => base,
        BackoffStrategy::Linear => base.saturating_mul(retry),
        BackoffStrategy::Exponential => base.saturating_mul(2u32.saturating_pow(retry - 1)),
    }
}
