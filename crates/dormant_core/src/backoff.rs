/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rand::{thread_rng, Rng};
use std::time::Duration;

/// Exponential retry delay with symmetric jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the deterministic delay, e.g. 0.15 for ±15%.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(120),
            jitter: 0.15,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let pow = attempt.min(20);
        self.base.saturating_mul(1u32 << pow).min(self.max)
    }

    /// Jittered delay, never above `max`.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let factor = thread_rng().gen_range(-self.jitter..=self.jitter);
        apply_jitter(self.delay(attempt), factor).min(self.max)
    }

    /// Delay for retry `attempt` of a job whose previous retry waited
    /// `prev`. Successive retries never wait less than the one before.
    pub fn next_delay(&self, attempt: u32, prev: Duration) -> Duration {
        self.jittered(attempt).max(prev.min(self.max))
    }
}

fn apply_jitter(d: Duration, factor: f64) -> Duration {
    d.mul_f64((1.0 + factor).max(0.0))
}

/// Spacing between dispatches for the given quota. Above `threshold`
/// (fraction of `max_quota` remaining) this is `base`; below it the delay
/// doubles per eighth of the deficit, up to `max`.
pub fn pacing_delay(
    remaining: u32,
    max_quota: u32,
    threshold: f64,
    base: Duration,
    max: Duration,
) -> Duration {
    if max_quota == 0 {
        return base;
    }
    let ratio = f64::from(remaining.min(max_quota)) / f64::from(max_quota);
    if ratio > threshold || threshold <= 0.0 {
        return base;
    }
    let deficit = ((threshold - ratio) / threshold).clamp(0.0, 1.0);
    let floor = base.max(Duration::from_millis(50));
    let scaled = floor.mul_f64(2f64.powf(deficit * 8.0));
    scaled.min(max).max(base)
}
