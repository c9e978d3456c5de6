// Monotonic timestamps for the sample path, anchored to wall-clock time
// only at the edges (event ids, CSV rows, telemetry payloads).
//
// Samples are stamped from a monotonic source so that queue latency,
// NTP steps or suspend/resume cannot reorder the per-device streams.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Host-monotonic time in seconds since the gateway [`Clock`] epoch.
///
/// Sub-millisecond precision; not meaningful across process restarts.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Timestamp {
  secs: f64,
}

impl Timestamp {
  pub const ZERO: Timestamp = Timestamp { secs: 0.0 };

  pub fn from_secs_f64(secs: f64) -> Self {
    Timestamp { secs }
  }

  pub fn as_secs_f64(self) -> f64 {
    self.secs
  }

  /// Seconds elapsed since `earlier`. Negative if `earlier` is later.
  pub fn since(self, earlier: Timestamp) -> f64 {
    self.secs - earlier.secs
  }

  pub fn offset(self, secs: f64) -> Timestamp {
    Timestamp {
      secs: self.secs + secs,
    }
  }
}

/// Pairs a monotonic epoch with the wall-clock instant it was taken, so
/// any [`Timestamp`] can be rendered as civil time without ever feeding
/// wall time back into ordering decisions.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
  epoch: Instant,
  epoch_wall: DateTime<Utc>,
}

impl Clock {
  pub fn new() -> Self {
    Clock {
      epoch: Instant::now(),
      epoch_wall: Utc::now(),
    }
  }

  pub fn now(&self) -> Timestamp {
    Timestamp {
      secs: self.epoch.elapsed().as_secs_f64(),
    }
  }

  /// Wall-clock rendering of a monotonic timestamp.
  pub fn wall(&self, t: Timestamp) -> DateTime<Utc> {
    let micros = (t.as_secs_f64() * 1e6).round() as i64;
    self.epoch_wall + chrono::Duration::microseconds(micros)
  }

  pub fn uptime(&self) -> Duration {
    self.epoch.elapsed()
  }
}

impl Default for Clock {
  fn default() -> Self {
    Clock::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn timestamps_order_and_subtract() {
    let a = Timestamp::from_secs_f64(10.0);
    let b = a.offset(2.5);
    assert!(b > a);
    assert_eq!(b.since(a), 2.5);
    assert_eq!(a.since(b), -2.5);
  }

  #[test]
  fn wall_conversion_tracks_offset() {
    let clock = Clock::new();
    let t = Timestamp::from_secs_f64(1.5);
    let w0 = clock.wall(Timestamp::ZERO);
    let w1 = clock.wall(t);
    let delta = (w1 - w0).num_microseconds().unwrap();
    assert_eq!(delta, 1_500_000);
  }

  #[test]
  fn clock_is_monotonic() {
    let clock = Clock::new();
    let a = clock.now();
    let b = clock.now();
    assert!(b >= a);
  }
}
