use std::future::Future;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};

use crate::cancel::CancellationToken;
use crate::error::VenueError;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

/// Retry configuration for venue calls
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// `base * 2^attempt`, capped at `max_delay_ms`, then spread by up to
    /// `jitter_factor` either way.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(32))
            .min(self.max_delay_ms) as f64;
        let spread = capped * self.jitter_factor;
        let jittered = if spread > 0.0 {
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Retry a venue call with bounded exponential backoff.
///
/// Only ambiguous failures are retried; a definite answer (rejection, not
/// found) is returned at once. Cancellation wins over both the call and the
/// backoff sleep and yields `VenueError::Cancelled`.
pub async fn retry_venue<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let mut last_error = VenueError::Timeout;

    for attempt in 0..=config.max_retries {
        if cancel.is_cancelled() {
            return Err(VenueError::Cancelled);
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VenueError::Cancelled),
            r = operation() => r,
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_ambiguous() => return Err(e),
            Err(e) => {
                if attempt < config.max_retries {
                    let delay = config.delay_for_attempt(attempt);
                    log(
                        Level::Warn,
                        Domain::Exec,
                        "retry",
                        obj(&[
                            ("operation", v_str(operation_name)),
                            ("attempt", v_num((attempt + 1) as f64)),
                            ("max_attempts", v_num((config.max_retries + 1) as f64)),
                            ("error", v_str(&e.to_string())),
                            ("delay_ms", v_num(delay.as_millis() as f64)),
                        ]),
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(VenueError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
                last_error = e;
            }
        }
    }

    Err(last_error)
}
