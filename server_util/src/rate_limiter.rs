// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::{Duration, Instant};

/// Token-bucket limiter: `burst + 1` actions are admitted immediately, then
/// one per `interval`. A zero interval admits everything.
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    available: u32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self::with_burst(interval, 0)
    }

    pub fn with_burst(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst,
            available: burst + 1,
            last_refill: Instant::now(),
        }
    }

    pub fn no_limit() -> Self {
        Self::with_burst(Duration::ZERO, 0)
    }

    /// Returns true if the action exceeds the limit and should be prevented.
    pub fn should_limit(&mut self) -> bool {
        self.should_limit_at(Instant::now())
    }

    pub fn should_limit_at(&mut self, now: Instant) -> bool {
        if self.interval == Duration::ZERO {
            return false;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let refill = (elapsed.as_nanos() / self.interval.as_nanos().max(1)) as u32;
        if refill > 0 {
            self.available = self.available.saturating_add(refill).min(self.burst + 1);
            // Advance by whole intervals only, keeping the remainder.
            self.last_refill += self.interval * refill;
        }

        if self.available > 0 {
            self.available -= 1;
            false
        } else {
            true
        }
    }
}
