//! Time limits for external tools
//!
//! - `timeout_seconds`: maximum wall-clock time per tool invocation
//! - `termination_grace_seconds`: time between SIGTERM and kill when a tool
//!   is stopped
//!
//! The enforcer only reports expiry; the runner decides how to stop the tool.

use std::time::{Duration, Instant};

/// Upper bound for `timeout_seconds`
pub const MAX_TIMEOUT_SECONDS: u64 = 86400;

/// Upper bound for `termination_grace_seconds`
pub const MAX_GRACE_SECONDS: u64 = 300;

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum wall-clock time per tool invocation (default: 1800 = 30 min)
    pub timeout_seconds: u64,

    /// Grace period between SIGTERM and kill (default: 10)
    pub termination_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 1800,
            termination_grace_seconds: 10,
        }
    }
}

impl TimeoutConfig {
    /// Validate bounds
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        // timeout_seconds must be in (0, 86400]
        if self.timeout_seconds == 0 || self.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(TimeoutValidationError::TimeoutOutOfBounds {
                value: self.timeout_seconds,
            });
        }

        // termination_grace_seconds must be in [0, 300]
        if self.termination_grace_seconds > MAX_GRACE_SECONDS {
            return Err(TimeoutValidationError::GraceOutOfBounds {
                value: self.termination_grace_seconds,
            });
        }

        Ok(())
    }

    /// Create from optional config values, falling back to defaults
    pub fn from_config(timeout: Option<u64>, grace: Option<u64>) -> Self {
        let defaults = Self::default();
        Self {
            timeout_seconds: timeout.unwrap_or(defaults.timeout_seconds),
            termination_grace_seconds: grace.unwrap_or(defaults.termination_grace_seconds),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_seconds)
    }
}

/// Timeout validation errors
#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("timeout_seconds must be in (0, 86400], got {value}")]
    TimeoutOutOfBounds { value: u64 },

    #[error("termination_grace_seconds must be at most 300, got {value}")]
    GraceOutOfBounds { value: u64 },
}

/// Timeout check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    /// Still within the limit
    Ok,
    /// Limit exceeded
    Expired,
}

impl TimeoutStatus {
    /// Returns true if a timeout occurred
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutStatus::Expired)
    }
}

/// Wall-clock limit for a single tool invocation
#[derive(Debug)]
pub struct TimeoutEnforcer {
    limit: Duration,
    start_time: Instant,
}

impl TimeoutEnforcer {
    /// Start tracking a new invocation
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            start_time: Instant::now(),
        }
    }

    /// Check for timeout
    pub fn check(&self) -> TimeoutStatus {
        if self.start_time.elapsed() > self.limit {
            TimeoutStatus::Expired
        } else {
            TimeoutStatus::Ok
        }
    }

    /// Time since the invocation started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Time left before expiry
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}
