//! Bounded retry with linear backoff

use super::TransportError;
use crate::control::ControlFlags;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Retry policy: `attempts` tries, sleeping `min(base * n, cap)` after try `n`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            cap,
        }
    }

    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.cap)
    }

    /// Total time spent sleeping if every attempt fails
    pub fn max_total_delay(&self) -> Duration {
        (1..self.attempts).map(|attempt| self.delay(attempt)).sum()
    }

    /// Run `op` until it succeeds or the attempts run out
    ///
    /// Termination and the optional `stop` flag are checked before every
    /// attempt, giving `Killed` and `Stopped` respectively.
    pub async fn retry<T, F, Fut>(
        &self,
        what: &'static str,
        flags: &ControlFlags,
        stop: Option<&AtomicBool>,
        mut op: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        for attempt in 1..=self.attempts {
            flags.check()?;
            if stop.map_or(false, |s| s.load(Ordering::SeqCst)) {
                return Err(TransportError::Stopped);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!("{} failed (attempt {}/{}): {}", what, attempt, self.attempts, e);
                    if attempt < self.attempts {
                        sleep(self.delay(attempt)).await;
                    }
                }
            }
        }

        Err(TransportError::EstablishFailed {
            what,
            attempts: self.attempts,
        })
    }
}
