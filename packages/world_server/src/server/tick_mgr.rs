//! See `TickMgr`.

use std::time::{
    Instant,
    Duration,
};


/// Manages ticks and the passage of time.
///
/// Simulated time advances by exactly one interval per tick regardless of how long ticks take to
/// process. Wall-clock time only decides when the next tick begins.
#[derive(Debug)]
pub struct TickMgr {
    interval: Duration,
    tick: u64,
    next_tick: Instant,
}

/// Timing of the tick about to be processed.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TickInfo {
    /// Number of the tick, starting at 0.
    pub tick: u64,
    /// Simulated seconds since the world started, as of this tick.
    pub time: f64,
    /// Simulated seconds this tick advances.
    pub delta: f64,
}

impl TickMgr {
    /// Construct with the given tick interval. The first tick is due immediately.
    pub fn new(interval: Duration) -> Self {
        TickMgr {
            interval,
            tick: 0,
            next_tick: Instant::now(),
        }
    }

    /// Get the time that the next tick is scheduled to begin.
    pub fn next_tick(&self) -> Instant {
        self.next_tick
    }

    /// Timing for the tick about to be processed.
    pub fn begin_tick(&self) -> TickInfo {
        let delta = self.interval.as_secs_f64();
        TickInfo {
            tick: self.tick,
            time: self.tick as f64 * delta,
            delta,
        }
    }

    /// Call this after doing a tick which began at `started`, so as to schedule the next tick.
    ///
    /// The next tick begins one interval minus the time the tick took after now, or immediately
    /// if the tick took longer than an interval.
    pub fn on_tick_done(&mut self, started: Instant) {
        self.tick += 1;

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(started);
        if elapsed > self.interval {
            warn!(tick = self.tick - 1, ?elapsed, "tick took longer than the tick interval");
        }
        self.next_tick = now + self.interval.saturating_sub(elapsed);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_time_advances_one_interval_per_tick() {
        let mut tick_mgr = TickMgr::new(Duration::from_millis(250));
        assert_eq!(tick_mgr.begin_tick(), TickInfo { tick: 0, time: 0.0, delta: 0.25 });
        for _ in 0..4 {
            tick_mgr.on_tick_done(Instant::now());
        }
        assert_eq!(tick_mgr.begin_tick(), TickInfo { tick: 4, time: 1.0, delta: 0.25 });
    }

    #[test]
    fn slow_tick_shortens_wait() {
        let interval = Duration::from_millis(300);
        let mut tick_mgr = TickMgr::new(interval);
        let started = Instant::now() - Duration::from_millis(200);
        tick_mgr.on_tick_done(started);
        assert!(tick_mgr.next_tick() <= Instant::now() + Duration::from_millis(100));

        let started = Instant::now() - Duration::from_secs(1);
        tick_mgr.on_tick_done(started);
        assert!(tick_mgr.next_tick() <= Instant::now());
    }
}
