use std::time::{Duration, Instant};

/// Monotonic time source. `now` is measured from an arbitrary fixed origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A periodic deadline anchored at `origin`.
///
/// The `n`th deadline is always `origin + n * period`, computed from the
/// index rather than by adding the period to the previous deadline, so a late
/// check never shifts the deadlines that follow it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    origin: Duration,
    period_s: f64,
    index: u64,
}

impl Deadline {
    /// First deadline at `origin` itself.
    pub fn starting_at(origin: Duration, period: f64) -> Self {
        Self {
            origin,
            period_s: period,
            index: 0,
        }
    }

    /// First deadline one period after `origin`.
    pub fn first_after(origin: Duration, period: f64) -> Self {
        Self {
            origin,
            period_s: period,
            index: 1,
        }
    }

    pub fn at(&self) -> Duration {
        self.origin + Duration::from_secs_f64(self.period_s * self.index as f64)
    }

    pub fn is_due(&self, now: Duration) -> bool {
        now >= self.at()
    }

    /// Moves to the next slot, whether or not the current one was on time.
    pub fn advance(&mut self) {
        self.index += 1;
    }

    /// Number of slots consumed so far, counting from the first deadline.
    pub fn index(&self) -> u64 {
        self.index
    }
}

/// Sleeps towards a target without overshooting the poll interval, so the
/// caller gets control back often enough to notice an interrupt.
pub struct Pacer<'a> {
    clock: &'a dyn Clock,
    max_yield: Duration,
}

impl<'a> Pacer<'a> {
    pub fn new(clock: &'a dyn Clock, max_yield: Duration) -> Self {
        Self { clock, max_yield }
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Blocks until `target` or for one poll interval, whichever comes first.
    /// Returns immediately if `target` already passed.
    pub fn wait_until(&self, target: Duration) {
        let remaining = target.saturating_sub(self.clock.now());
        if !remaining.is_zero() {
            self.clock.sleep(remaining.min(self.max_yield));
        }
    }
}
