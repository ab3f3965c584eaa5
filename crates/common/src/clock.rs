//! Clock and timing utilities for media timestamps.
//!
//! Every timestamp in Recast is a signed count of microseconds. This module
//! provides:
//! - Conversions between microseconds, milliseconds, seconds and container ticks
//! - A job clock anchored to a wall-clock start time
//! - Running averages used for decoder and queue telemetry

use std::time::{Duration, Instant};

/// Microseconds per second.
pub const MICROS_PER_SEC: i64 = 1_000_000;

/// Convert microseconds to seconds.
pub fn us_to_secs(us: i64) -> f64 {
    us as f64 / MICROS_PER_SEC as f64
}

/// Convert seconds to microseconds, rounding to the nearest microsecond.
pub fn secs_to_us(secs: f64) -> i64 {
    (secs * MICROS_PER_SEC as f64).round() as i64
}

/// Convert milliseconds to microseconds, rounding to the nearest microsecond.
pub fn ms_to_us(ms: f64) -> i64 {
    (ms * 1_000.0).round() as i64
}

/// Convert microseconds to milliseconds.
pub fn us_to_ms(us: i64) -> f64 {
    us as f64 / 1_000.0
}

/// Rescale a container tick count to microseconds.
///
/// Uses 128-bit intermediates so 64-bit tick counts at high timescales do not
/// overflow. A zero timescale yields zero.
pub fn ticks_to_us(ticks: i64, timescale: u32) -> i64 {
    if timescale == 0 {
        return 0;
    }
    (ticks as i128 * MICROS_PER_SEC as i128 / timescale as i128) as i64
}

/// Wall-clock and monotonic anchor for a single export job.
#[derive(Debug, Clone)]
pub struct JobClock {
    started: Instant,
    started_wall: String,
}

impl JobClock {
    /// Start a clock anchored to now.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Time elapsed since the job started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wall-clock start time (RFC 3339).
    pub fn started_wall(&self) -> &str {
        &self.started_wall
    }
}

/// Running mean of sampled durations.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningAverage {
    count: u64,
    total: Duration,
}

impl RunningAverage {
    /// Record one sample.
    pub fn record(&mut self, sample: Duration) {
        self.count += 1;
        self.total += sample;
    }

    /// Number of samples recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of all samples.
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Mean sample in milliseconds, zero when empty.
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total.as_secs_f64() * 1_000.0 / self.count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversions() {
        assert!((us_to_secs(1_500_000) - 1.5).abs() < 1e-9);
        assert_eq!(secs_to_us(2.0), 2_000_000);
        assert_eq!(ms_to_us(33.3334), 33_333);
        assert!((us_to_ms(40_000) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_ticks_to_us() {
        assert_eq!(ticks_to_us(90_000, 90_000), 1_000_000);
        assert_eq!(ticks_to_us(1001, 30_000), 33_366);
        assert_eq!(ticks_to_us(5, 0), 0);
        // 2^40 ticks at 1 GHz timescale still fits
        assert_eq!(ticks_to_us(1 << 40, 1_000_000_000), 1_099_511_627);
    }

    #[test]
    fn test_running_average() {
        let mut avg = RunningAverage::default();
        assert_eq!(avg.mean_ms(), 0.0);
        avg.record(Duration::from_millis(2));
        avg.record(Duration::from_millis(4));
        assert_eq!(avg.count(), 2);
        assert!((avg.mean_ms() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_job_clock_elapsed() {
        let clock = JobClock::start();
        assert!(clock.elapsed() < Duration::from_secs(1));
        assert!(!clock.started_wall().is_empty());
    }
}
