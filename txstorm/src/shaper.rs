use tokio::time::{Duration, Instant};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// A wall-clock driven shaper.
///
/// The number of requests due is derived from the time elapsed since start,
/// not from the number of ticks, so a late wakeup is compensated on the
/// following ticks instead of shifting the whole schedule.
#[derive(Debug)]
pub struct Shaper {
    /// Requests per second.
    rate: u64,
    started: Instant,
    /// Number of requests consumed since start.
    consumed: u64,
}

impl Shaper {
    pub fn new(rate: u64, started: Instant) -> Self {
        Self { rate, started, consumed: 0 }
    }

    /// Called on each loop tick in a worker.
    ///
    /// Returns the number of requests due at `now`. The first request is due
    /// immediately at start.
    pub fn tick(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.started).as_nanos();
        let due = elapsed * self.rate as u128 / NANOS_PER_SEC + 1;

        u64::try_from(due).unwrap_or(u64::MAX).saturating_sub(self.consumed)
    }

    /// Consume specified amount of requests.
    ///
    /// Must be called after actual request submission to maintain this
    /// shaper.
    #[inline]
    pub fn consume(&mut self, num: u64) {
        self.consumed += num;
    }

    /// Returns the instant at which the next request becomes due.
    pub fn next_due(&self) -> Instant {
        let rate = self.rate.max(1) as u128;
        let nanos = (self.consumed as u128 * NANOS_PER_SEC).div_ceil(rate);

        self.started + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    #[inline]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}
