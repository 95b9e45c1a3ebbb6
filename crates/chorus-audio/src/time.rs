//! Frame/time arithmetic helpers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock nanoseconds used to stamp shm sample timestamps.
pub fn wall_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Exact duration covered by `frames` frames at `rate` Hz, in nanoseconds.
pub fn frames_to_duration(frames: u64, rate: u32) -> Duration {
    if rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(frames * 1_000_000_000 / u64::from(rate))
}

/// Frames a device at `rate` Hz produces or consumes in `elapsed`.
pub fn duration_to_frames(elapsed: Duration, rate: u32) -> u64 {
    elapsed.as_nanos() as u64 * u64::from(rate) / 1_000_000_000
}
