//! Reconnection logic with exponential backoff and jitter

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Lower bound for every backoff; a zero delay would never grow
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Random extra delay, as a fraction of the current backoff (0.0 disables)
    pub jitter: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached ({0})")]
    MaxAttemptsReached(usize),
}

/// Reconnection manager with exponential backoff
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff.max(MIN_BACKOFF),
            config,
            attempt: 0,
        }
    }

    /// Wait before next reconnection attempt
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached(max_attempts));
            }
        }

        let delay = self.jittered(self.current_backoff);
        debug!(
            "Waiting {}ms before reconnection attempt {}",
            delay.as_millis(),
            self.attempt
        );

        sleep(delay).await;

        // Increase backoff
        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);

        self.current_backoff = next_backoff.min(self.config.max_backoff).max(MIN_BACKOFF);

        Ok(())
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        if self.config.jitter <= 0.0 {
            return backoff;
        }
        let factor = rand::thread_rng().gen_range(0.0..self.config.jitter);
        backoff + backoff.mul_f64(factor)
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff.max(MIN_BACKOFF);
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get current backoff duration
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
