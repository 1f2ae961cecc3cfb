//! Bounded retry with exponential backoff for venue calls.
//!
//! The caller decides which failures are worth another attempt: an error the
//! predicate refuses ends the loop at once and is returned unchanged.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::future::Future;
use tokio::time::{sleep, Duration};

use crate::error::{EngineError, EngineResult};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Spread applied to each delay, as a fraction of it
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
    /// `base * 2^attempt`, capped at `max_delay_ms`, then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doubled = self.base_delay_ms.saturating_mul(1u64 << attempt.min(32));
        let capped = doubled.min(self.max_delay_ms);
        let spread = (capped as f64 * self.jitter_factor) as u64;
        let millis = if spread == 0 {
            capped
        } else {
            let low = capped.saturating_sub(spread);
            rand::thread_rng().gen_range(low..=capped.saturating_add(spread))
        };
        Duration::from_millis(millis)
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(EngineError::config(
                "retry.delay_ms",
                format!("need 0 < base ({}) <= max ({})", self.base_delay_ms, self.max_delay_ms),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(EngineError::config("retry.jitter_factor", "must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Run `op` until it succeeds, the attempts run out, or it fails with an
/// error `retryable` refuses.
pub async fn retry_async<F, Fut, T, R>(config: &RetryConfig, name: &str, mut op: F, retryable: R) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&anyhow::Error) -> bool,
{
    let attempts = config.attempts();
    let mut last = None;
    for attempt in 0..attempts {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !retryable(&err) {
            log(
                Level::Warn,
                Domain::Exec,
                "retry_abort",
                obj(&[("operation", v_str(name)), ("attempt", v_num((attempt + 1) as f64)), ("msg", v_str(&err.to_string()))]),
            );
            return Err(err);
        }
        if attempt + 1 < attempts {
            let delay = config.delay_for_attempt(attempt);
            log(
                Level::Warn,
                Domain::Exec,
                "retry",
                obj(&[
                    ("operation", v_str(name)),
                    ("attempt", v_num((attempt + 1) as f64)),
                    ("of", v_num(attempts as f64)),
                    ("delay_ms", v_num(delay.as_millis() as f64)),
                    ("msg", v_str(&err.to_string())),
                ]),
            );
            sleep(delay).await;
        }
        last = Some(err);
    }
    Err(last.unwrap_or_else(|| anyhow!("{}: no attempts made", name)))
}
