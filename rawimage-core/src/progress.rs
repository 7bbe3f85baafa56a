//! Transfer rate and time-remaining bookkeeping for progress events.
use crate::session::EngineState;
use std::fmt;
use std::time::{Duration, Instant};

/// Longest estimate reported, 999:59:59.
pub const MAX_REMAINING: Duration = Duration::from_secs(3_599_999);

const RATE_INTERVAL: Duration = Duration::from_secs(1);
const MIB: f64 = 1024.0 * 1024.0;

/// A snapshot emitted after every transferred chunk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Progress {
    pub state: EngineState,
    pub done_sectors: u64,
    pub total_sectors: u64,
    pub sector_size: u64,
    /// MiB per second, `None` until a full second has passed.
    pub rate: Option<f64>,
    pub remaining: Option<Duration>,
}

impl Progress {
    pub fn done_bytes(&self) -> u64 {
        self.done_sectors.saturating_mul(self.sector_size)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_sectors.saturating_mul(self.sector_size)
    }

    /// Completion in whole percent.
    pub fn percent(&self) -> u8 {
        if self.total_sectors == 0 {
            return 100;
        }
        (u128::from(self.done_sectors) * 100 / u128::from(self.total_sectors)).min(100) as u8
    }
}

/// Tracks throughput across one transfer.
///
/// The rate is recomputed at most once per second from the sectors moved
/// since the previous refresh; between refreshes the last value is repeated.
#[derive(Debug)]
pub struct RateTracker {
    sector_size: u64,
    started: Instant,
    last_refresh: Instant,
    last_done: u64,
    rate: Option<f64>,
}

impl RateTracker {
    pub fn new(sector_size: u64, now: Instant) -> Self {
        Self {
            sector_size,
            started: now,
            last_refresh: now,
            last_done: 0,
            rate: None,
        }
    }

    /// Records that `done` of `total` sectors are complete at `now`.
    pub fn update(
        &mut self,
        done: u64,
        total: u64,
        now: Instant,
    ) -> (Option<f64>, Option<Duration>) {
        let since_refresh = now.saturating_duration_since(self.last_refresh);
        if since_refresh >= RATE_INTERVAL {
            let moved = done.saturating_sub(self.last_done) as f64 * self.sector_size as f64;
            self.rate = Some(moved / since_refresh.as_secs_f64() / MIB);
            self.last_refresh = now;
            self.last_done = done;
        }
        let elapsed = now.saturating_duration_since(self.started);
        (self.rate, remaining(elapsed, done, total))
    }
}

/// Estimates the time left as `elapsed * (total - done) / done`.
pub fn remaining(elapsed: Duration, done: u64, total: u64) -> Option<Duration> {
    if done == 0 {
        return None;
    }
    let left = total.saturating_sub(done) as f64;
    let secs = elapsed.as_secs_f64() * left / done as f64;
    Some(Duration::from_secs_f64(secs.min(MAX_REMAINING.as_secs_f64())))
}

/// Formats a duration as `H:MM:SS`.
pub struct Hms(pub Duration);

impl fmt::Display for Hms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.min(MAX_REMAINING).as_secs();
        write!(f, "{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
    }
}
