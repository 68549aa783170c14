//! Poll retry policy
//!
//! Pure decision logic, kept apart from the polling loop so the timing rules
//! can be tested without sleeping.

use scribe_common::config::PollSettings;
use std::time::Duration;

use crate::transport::TransportError;

/// Selects poll errors that get the short fast-fail budget
pub type FastFailPredicate = fn(&TransportError) -> bool;

/// What the poll loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    /// Sleep, then poll again
    RetryAfter(Duration),
    /// Attempt ceiling reached while the job is still running
    Timeout,
    /// Fast-fail budget exhausted
    AuthExpired,
    /// Give the poll error to the caller
    Surface,
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Wait between status queries while the job is running
    pub interval: Duration,
    /// Poll attempt ceiling (120 × 3s ≈ 6 minutes)
    pub max_attempts: u32,
    /// Wait between retries of fast-fail errors
    pub auth_retry_interval: Duration,
    /// Consecutive fast-fail errors tolerated before `AuthExpired`
    pub auth_max_attempts: u32,
    /// Other poll errors are surfaced once within this many final attempts
    pub transient_tail: u32,
    pub fast_fail: FastFailPredicate,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from(&PollSettings::default())
    }
}

impl From<&PollSettings> for PollPolicy {
    fn from(settings: &PollSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.interval_ms),
            max_attempts: settings.max_attempts,
            auth_retry_interval: Duration::from_millis(settings.auth_retry_interval_ms),
            auth_max_attempts: settings.auth_max_attempts,
            transient_tail: settings.transient_tail,
            fast_fail: TransportError::is_auth_failure,
        }
    }
}

impl PollPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_fast_fail(mut self, fast_fail: FastFailPredicate) -> Self {
        self.fast_fail = fast_fail;
        self
    }

    /// Decision after a non-terminal status at 1-based `attempt`
    pub fn after_pending(&self, attempt: u32) -> PollVerdict {
        if attempt >= self.max_attempts {
            PollVerdict::Timeout
        } else {
            PollVerdict::RetryAfter(self.interval)
        }
    }

    /// Decision after a failed poll request
    ///
    /// `fast_fail_streak` counts consecutive fast-fail errors including this one.
    pub fn after_error(
        &self,
        error: &TransportError,
        attempt: u32,
        fast_fail_streak: u32,
    ) -> PollVerdict {
        if (self.fast_fail)(error) {
            if fast_fail_streak >= self.auth_max_attempts || attempt >= self.max_attempts {
                return PollVerdict::AuthExpired;
            }
            return PollVerdict::RetryAfter(self.auth_retry_interval);
        }

        if attempt > self.max_attempts.saturating_sub(self.transient_tail) {
            PollVerdict::Surface
        } else {
            PollVerdict::RetryAfter(self.interval)
        }
    }
}
