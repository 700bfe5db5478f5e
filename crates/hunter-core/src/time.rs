use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall clock, unix seconds.
pub fn now_unix() -> i64 {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_secs() as i64
}

/// Coordinator time as estimated from the last `CurrentServerTime` record.
///
/// Re-execution intervals are measured against this clock so a skewed local
/// clock cannot shorten them. Until the first calibration it reports local
/// time.
#[derive(Debug, Default)]
pub struct ServerClock {
    offset: AtomicI64,
    calibrated: AtomicBool,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calibrate(&self, server_time: i64) {
        self.calibrate_at(server_time, now_unix());
    }

    pub fn calibrate_at(&self, server_time: i64, local_time: i64) {
        self.offset
            .store(server_time.saturating_sub(local_time), Ordering::Relaxed);
        self.calibrated.store(true, Ordering::Relaxed);
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated.load(Ordering::Relaxed)
    }

    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn now(&self) -> i64 {
        self.at(now_unix())
    }

    pub fn at(&self, local_time: i64) -> i64 {
        local_time.saturating_add(self.offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncalibrated_clock_is_local_time() {
        let clock = ServerClock::new();
        assert!(!clock.is_calibrated());
        assert_eq!(clock.at(1_000), 1_000);
    }

    #[test]
    fn calibration_applies_offset() {
        let clock = ServerClock::new();
        clock.calibrate_at(5_000, 4_000);
        assert!(clock.is_calibrated());
        assert_eq!(clock.offset(), 1_000);
        assert_eq!(clock.at(4_010), 5_010);

        clock.calibrate_at(3_000, 4_000);
        assert_eq!(clock.at(4_000), 3_000);
    }
}
