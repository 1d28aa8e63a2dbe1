//! Bounded retries around the unit runner.

use tracing::warn;

use super::executor::{UnitRunner, WorkUnit};
use super::result::UnitResult;

/// Re-runs failed units up to `retries` extra times.
#[derive(Clone)]
pub struct RetryingRunner {
    runner: UnitRunner,
    retries: u32,
}

impl RetryingRunner {
    pub fn new(runner: UnitRunner, retries: u32) -> Self {
        Self { runner, retries }
    }

    /// Total attempts allowed per unit.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Returns the first non-failed attempt, or the last failed attempt,
    /// annotated with the number of attempts used.
    ///
    /// Every attempt goes back through the resume gate.
    pub async fn run(&self, unit: &WorkUnit) -> UnitResult {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            let result = self.runner.run(unit).await.with_attempt(attempt);
            if !result.is_failed() {
                return result.with_attempts_used(attempt);
            }
            warn!(
                model_id = unit.model_id,
                "attempt {}/{} failed: {}",
                attempt,
                max_attempts,
                result.reason_text()
            );
            if attempt >= max_attempts {
                return result.with_attempts_used(max_attempts);
            }
            attempt += 1;
        }
    }
}
