//! Clock abstraction.
//!
//! The seasonal policy and the staleness checks read wall-clock time, so the
//! clock is injected: [`SystemClock`] in the daemon, [`ManualClock`] in
//! tests where months and timestamps must be simulated deterministically.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use chrono::{Datelike, Local, Utc};

/// Time source used by the regulator, health task and Modbus status word.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
    /// Calendar month, 1..=12, in the plant's local time zone.
    fn month(&self) -> u32;
}

/// Real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn month(&self) -> u32 {
        Local::now().month()
    }
}

/// Settable clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
    month: AtomicU32,
}

impl ManualClock {
    pub fn new(now_ms: i64, month: u32) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
            month: AtomicU32::new(month),
        }
    }

    pub fn set_now_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn advance_ms(&self, delta: i64) {
        self.now_ms.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_month(&self, month: u32) {
        self.month.store(month, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }

    fn month(&self) -> u32 {
        self.month.load(Ordering::Relaxed)
    }
}
