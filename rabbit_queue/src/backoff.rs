//! Reconnect delay policies.
//!
//! The supervisor counts every detachment and every failed reconnect as one
//! attempt and asks the policy how long to wait before the next try.
//! Retries never stop.

use std::{fmt, time::Duration};

/// Maps a reconnect attempt number (starting at 1) to a delay.
pub trait BackoffPolicy: fmt::Debug + Send + Sync + 'static {
    fn delay(&self, attempt: u32) -> Duration;
}

/// What happens once the attempt number passes the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffMode {
    /// Start over from one step: 1, 2, .. ceiling, 1, 2, ..
    #[default]
    Wrap,
    /// Stay at the ceiling: 1, 2, .. ceiling, ceiling, ..
    Saturate,
}

/// Linear steps up to a ceiling, no jitter.
///
/// The default waits 1s, 2s, 3s, 4s, 5s and then starts over at 1s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteppedBackoff {
    step: Duration,
    ceiling: u32,
    mode: BackoffMode,
}

impl SteppedBackoff {
    /// A `ceiling` of zero is treated as one.
    pub fn new(step: Duration, ceiling: u32, mode: BackoffMode) -> Self {
        Self {
            step,
            ceiling: ceiling.max(1),
            mode,
        }
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn mode(&self) -> BackoffMode {
        self.mode
    }
}

impl Default for SteppedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 5, BackoffMode::Wrap)
    }
}

impl BackoffPolicy for SteppedBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let steps = match self.mode {
            BackoffMode::Wrap => (attempt - 1) % self.ceiling + 1,
            BackoffMode::Saturate => attempt.min(self.ceiling),
        };
        self.step.saturating_mul(steps)
    }
}
