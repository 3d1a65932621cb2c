//! Bandwidth ceiling for the transport direction
//!
//! A `governor` quota counted in bytes. Records are paid for before they are
//! written; bytes paid for but not yet accepted by the transport stay as
//! credit for the next attempt, so a short or refused write is never charged
//! twice.

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Smallest burst allowance, so a low rate still fits a full-size record
const MIN_BURST: u32 = 64 * 1024;

type ByteQuota = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Byte-rate limiter for transport writes
pub struct RateLimiter {
    quota: ByteQuota,
    clock: DefaultClock,
    /// Bytes already paid for and not yet written
    credit: usize,
    /// Set when the last payment was refused
    blocked_until: Option<Instant>,
}

impl RateLimiter {
    /// Create a limiter for `bytes_per_sec`, starting with a full burst
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = u32::try_from(bytes_per_sec).unwrap_or(u32::MAX).max(1);
        let burst = (rate / 10).max(MIN_BURST);
        let quota = Quota::per_second(NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));

        let clock = DefaultClock::default();
        Self {
            quota: governor::RateLimiter::direct_with_clock(quota, &clock),
            clock,
            credit: 0,
            blocked_until: None,
        }
    }

    /// Pay for a write of `bytes`; false means the write has to wait
    pub fn acquire(&mut self, bytes: usize) -> bool {
        if bytes <= self.credit {
            return true;
        }
        let owed = bytes - self.credit;
        let Some(cells) = u32::try_from(owed).ok().and_then(NonZeroU32::new) else {
            return true;
        };

        match self.quota.check_n(cells) {
            Ok(Ok(())) => {
                self.credit += owed;
                self.blocked_until = None;
                true
            }
            Ok(Err(not_until)) => {
                let wait = not_until.wait_time_from(self.clock.now());
                self.blocked_until = Some(Instant::now() + wait);
                false
            }
            Err(e) => {
                // Larger than the whole burst; let it through rather than stall forever
                debug!("{} byte write exceeds the burst allowance: {}", owed, e);
                self.credit += owed;
                true
            }
        }
    }

    /// Record bytes the transport accepted
    pub fn consume(&mut self, bytes: usize) {
        self.credit = self.credit.saturating_sub(bytes);
    }

    /// Check if a write may be attempted
    pub fn has_budget(&self) -> bool {
        self.blocked_until.map_or(true, |until| Instant::now() >= until)
    }

    /// How long until a refused write may be retried
    pub fn time_until_budget(&self) -> Duration {
        self.blocked_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(Instant::now()))
    }
}
