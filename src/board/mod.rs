//! # Board Module
//!
//! Timing, watchdog and modem power-key seams.
//!
//! Every blocking wait in the modem engine goes through [`Clock`] and
//! strokes the [`Watchdog`]; on hardware a lapse resets the whole device.
//! The host binary uses [`SystemClock`] and [`SoftWatchdog`], tests use the
//! simulated doubles in [`mocks`].

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Longest single sleep performed between watchdog feeds
pub const MAX_SLEEP_SLICE_MS: u64 = 100;

/// Monotonic millisecond clock with blocking delay
pub trait Clock {
    /// Milliseconds elapsed since an arbitrary fixed origin
    fn now_ms(&self) -> u64;

    /// Block the calling task for `ms` milliseconds
    fn delay_ms(&mut self, ms: u64);
}

/// Hardware watchdog liveness signal
pub trait Watchdog {
    /// Reset the watchdog countdown
    fn feed(&mut self);
}

/// Modem power-key line
pub trait PowerKey {
    /// Drive the power key high (`true`) or low (`false`)
    fn set_high(&mut self, high: bool);
}

/// Host clock backed by [`Instant`]
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Software watchdog for hosts without a hardware one.
///
/// Warns when two feeds are further apart than the configured period, which
/// on the real board would have rebooted the device. Clones feed the same
/// countdown.
#[derive(Debug, Clone)]
pub struct SoftWatchdog {
    period: Duration,
    last_feed: Rc<Cell<Instant>>,
}

impl SoftWatchdog {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_feed: Rc::new(Cell::new(Instant::now())),
        }
    }
}

impl Watchdog for SoftWatchdog {
    fn feed(&mut self) {
        let gap = self.last_feed.get().elapsed();
        if gap > self.period {
            warn!("Watchdog period exceeded: {:?} since last feed", gap);
        }
        self.last_feed.set(Instant::now());
    }
}

/// Power key for setups where the modem power line is not wired
#[derive(Debug, Default)]
pub struct UnwiredPowerKey;

impl PowerKey for UnwiredPowerKey {
    fn set_high(&mut self, _high: bool) {}
}
