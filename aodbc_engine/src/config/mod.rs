use crate::error::{AodbcError, Result};

/// Largest timeout accepted by [`crate::connect`] and
/// [`crate::Statement::execute`], in seconds.
pub const MAX_TIMEOUT_SECS: i64 = 2_147_483_647;

/// Poll pacing for a session and every statement opened under it.
///
/// The rate multiplier scales the bounded wait performed by each poll
/// (`base_interval_ms * rate`) and widens the timeout slack by
/// `ceil(1 / rate)` seconds. It is fixed at session construction; there is
/// no process-wide mutable value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    rate: f64,
    base_interval_ms: u64,
}

impl Settings {
    pub const DEFAULT_BASE_INTERVAL_MS: u64 = 50;

    pub fn new(rate: f64) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(AodbcError::Configuration(
                "the poll rate multiplier must be a positive finite number",
            ));
        }
        Ok(Self {
            rate,
            base_interval_ms: Self::DEFAULT_BASE_INTERVAL_MS,
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// One bounded wait, in milliseconds.
    pub fn poll_interval_ms(&self) -> u64 {
        let scaled = self.base_interval_ms as f64 * self.rate;
        scaled.max(1.0) as u64
    }

    /// Extra whole seconds granted past the timeout budget, accounting for
    /// scheduling jitter of one poll tick.
    pub fn deadline_slack_secs(&self) -> u64 {
        (1.0 / self.rate).ceil() as u64
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rate: 1.0,
            base_interval_ms: Self::DEFAULT_BASE_INTERVAL_MS,
        }
    }
}

/// Timeouts are nonnegative seconds, 0 meaning unbounded.
pub fn validate_timeout(timeout_secs: i64) -> Result<()> {
    if timeout_secs < 0 {
        return Err(AodbcError::Configuration(
            "the timeout value must be nonnegative",
        ));
    }
    if timeout_secs > MAX_TIMEOUT_SECS {
        return Err(AodbcError::Configuration(
            "the timeout value must be less than 2147483648",
        ));
    }
    Ok(())
}
