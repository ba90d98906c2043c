//! Virtual time source.
//!
//! All simulation time flows through a [`Clock`]. The production clock maps
//! wall time through a fixed speed factor; tests supply a [`ManualClock`]
//! they advance explicitly. Virtual time is a `Duration` measured from
//! simulation start and is monotonic non-decreasing by construction: it only
//! advances through `sleep`, in whole virtual steps, so the same schedule
//! replayed at different speed factors observes the identical sequence of
//! virtual instants.

use std::sync::Mutex;
use std::time::Duration;

/// Source of virtual "now" plus a virtual-duration sleep.
pub trait Clock: Send + Sync {
    /// Current virtual time since simulation start.
    fn now(&self) -> Duration;

    /// Suspend the caller for `virtual_duration` of simulated time
    /// (i.e. `virtual_duration / speed_factor` of wall time).
    fn sleep(&self, virtual_duration: Duration);

    /// Configured speed factor (virtual seconds per wall second).
    fn speed_factor(&self) -> f64;
}

/// Wall-backed clock with a fixed speed factor.
pub struct SimClock {
    speed_factor: f64,
    virtual_now: Mutex<Duration>,
}

impl SimClock {
    /// `speed_factor` must be > 0; enforced by config validation upstream,
    /// clamped here so an extreme value can never yield a negative or
    /// infinite wall sleep.
    pub fn new(speed_factor: f64) -> Self {
        Self {
            speed_factor: speed_factor.max(f64::MIN_POSITIVE),
            virtual_now: Mutex::new(Duration::ZERO),
        }
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        *self.virtual_now.lock().expect("clock mutex poisoned")
    }

    fn sleep(&self, virtual_duration: Duration) {
        let wall = virtual_duration.div_f64(self.speed_factor);
        std::thread::sleep(wall);
        let mut now = self.virtual_now.lock().expect("clock mutex poisoned");
        *now = now.saturating_add(virtual_duration);
    }

    fn speed_factor(&self) -> f64 {
        self.speed_factor
    }
}

/// Deterministic clock for tests: `sleep` advances virtual time without
/// touching the wall clock, and `advance` steps it directly.
#[derive(Default)]
pub struct ManualClock {
    virtual_now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.virtual_now.lock().expect("clock mutex poisoned");
        *now = now.saturating_add(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.virtual_now.lock().expect("clock mutex poisoned")
    }

    fn sleep(&self, virtual_duration: Duration) {
        self.advance(virtual_duration);
    }

    fn speed_factor(&self) -> f64 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_demand() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_millis(100));
        assert_eq!(clock.now(), Duration::from_millis(100));

        clock.sleep(Duration::from_secs(2));
        assert_eq!(clock.now(), Duration::from_millis(2100));
    }

    #[test]
    fn sim_clock_virtual_time_is_monotonic() {
        let clock = SimClock::new(10_000.0);
        let mut last = clock.now();
        for _ in 0..5 {
            clock.sleep(Duration::from_millis(100));
            let now = clock.now();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, Duration::from_millis(500));
    }

    #[test]
    fn extreme_speed_factor_never_goes_negative() {
        let clock = SimClock::new(f64::MAX);
        clock.sleep(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));

        // A zero factor is clamped rather than producing a division blowup.
        let clamped = SimClock::new(0.0);
        assert!(clamped.speed_factor() > 0.0);
    }
}
