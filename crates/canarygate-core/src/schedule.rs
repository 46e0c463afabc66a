//! Fixed-interval schedule with optional jitter.
//!
//! Replaces rate-expression scheduling ("every 1 minute") with an explicit
//! interval + jitter pair, decoupled from any hosting runtime. The loops in
//! `canaryd` ask the schedule for the next delay before each tick.

use std::time::Duration;

/// A periodic schedule: a fixed interval plus up to `jitter` of random
/// spread per tick, so co-located probes don't fire in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    every: Duration,
    jitter: Duration,
}

impl Schedule {
    /// A schedule that fires every `every` with no jitter.
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            jitter: Duration::ZERO,
        }
    }

    /// Add up to `jitter` of random delay per tick.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Base interval without jitter.
    pub fn interval(&self) -> Duration {
        self.every
    }

    /// The delay to sleep before the next tick: `every` plus a uniform
    /// draw from `[0, jitter]`. Falls back to the bare interval if the
    /// entropy source is unavailable.
    pub fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.every;
        }
        let mut buf = [0u8; 8];
        if getrandom::getrandom(&mut buf).is_err() {
            return self.every;
        }
        let draw = u64::from_le_bytes(buf) as f64 / u64::MAX as f64;
        self.every + self.jitter.mul_f64(draw)
    }
}

/// Parse a duration string like "30s", "500ms", "2m", or a bare number of
/// seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
