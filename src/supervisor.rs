//! Per-device connection supervisor.
//!
//! One supervisor owns one wireless link, the raw-byte queue behind its
//! notification callback, the frame assembler and the device's recent
//! history (ring buffer, health window, bias). Its life is a small
//! explicit state machine; the fleet coordinator drives the transitions
//! and enforces every policy that spans more than one device.

use std::fmt;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  buffer::{HealthStats, HealthWindow, RingBuffer},
  config::{DeviceConfig, DeviceNumber, HealthConfig},
  link::Link,
  queue::ByteQueueReceiver,
  sample::Sample,
  time::Timestamp,
  wire::FrameCodec,
};

/// Link lifecycle states. Transitions are one-way except for the
/// re-entry into CONNECTING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
  Disconnected,
  Connecting,
  Discovering,
  AwaitingFirstSample,
  Ready,
  Reconnecting,
  Failed,
}

impl LinkState {
  /// States that occupy the fleet-wide connect slot.
  pub fn is_connect_phase(self) -> bool {
    matches!(
      self,
      LinkState::Connecting
        | LinkState::Discovering
        | LinkState::AwaitingFirstSample
        | LinkState::Reconnecting
    )
  }
}

impl fmt::Display for LinkState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      LinkState::Disconnected => "DISCONNECTED",
      LinkState::Connecting => "CONNECTING",
      LinkState::Discovering => "DISCOVERING",
      LinkState::AwaitingFirstSample => "AWAITING_FIRST_SAMPLE",
      LinkState::Ready => "READY",
      LinkState::Reconnecting => "RECONNECTING",
      LinkState::Failed => "FAILED",
    };
    f.write_str(s)
  }
}

/// Events a supervisor's state machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
  ConnectRequested,
  LinkEstablished,
  CharacteristicsDiscovered,
  FirstSampleReceived,
  /// Timeout, missing characteristics or stack error during any connect
  /// step, including the first-sample wait.
  ConnectAttemptFailed,
  /// Staleness or sliding-window failure on a READY link.
  ConnectionLost,
  /// Cleanup finished and the reconnect backoff elapsed.
  BackoffElapsed,
  /// consecutive_failures reached the configured limit.
  FailureLimitReached,
  /// Fleet-level host-radio recovery finished for this device.
  RecoveryComplete,
}

/// The transition table. Returns the successor state, or `None` when
/// the event is not defined in `state`.
pub fn next_state(state: LinkState, event: SupervisorEvent) -> Option<LinkState> {
  use LinkState::*;
  use SupervisorEvent::*;
  match (state, event) {
    (Disconnected, ConnectRequested) => Some(Connecting),
    (Connecting, LinkEstablished) => Some(Discovering),
    (Connecting, ConnectAttemptFailed) => Some(Disconnected),
    (Discovering, CharacteristicsDiscovered) => Some(AwaitingFirstSample),
    (Discovering, ConnectAttemptFailed) => Some(Disconnected),
    (AwaitingFirstSample, FirstSampleReceived) => Some(Ready),
    (AwaitingFirstSample, ConnectAttemptFailed) => Some(Disconnected),
    (Ready, ConnectionLost) => Some(Reconnecting),
    (Reconnecting, BackoffElapsed) => Some(Connecting),
    (Failed, RecoveryComplete) => Some(Disconnected),
    (_, FailureLimitReached) => Some(Failed),
    _ => None,
  }
}

/// Result of a READY-state self-check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthVerdict {
  Healthy,
  /// No sample for longer than data_timeout.
  Stale { age_s: f64 },
  /// Unhealthy fraction in the last second at or above the trigger
  /// percentage.
  WindowUnhealthy { percentage: f64 },
}

pub struct DeviceSupervisor {
  number: DeviceNumber,
  name: String,
  address: String,
  state: LinkState,
  consecutive_failures: u32,
  last_sample: Option<Timestamp>,
  current: Option<Sample>,
  bias_z: f64,
  codec: FrameCodec,
  ring: RingBuffer,
  health: HealthWindow,
  queue: Option<ByteQueueReceiver>,
  link: Option<Box<dyn Link>>,
  samples_total: u64,
}

impl DeviceSupervisor {
  pub fn new(config: &DeviceConfig, ring_capacity: usize, health_window: usize) -> Self {
    DeviceSupervisor {
      number: config.number,
      name: config.name.clone(),
      address: config.address.clone(),
      state: LinkState::Disconnected,
      consecutive_failures: 0,
      last_sample: None,
      current: None,
      bias_z: 0.0,
      codec: FrameCodec::new(),
      ring: RingBuffer::new(ring_capacity),
      health: HealthWindow::new(health_window),
      queue: None,
      link: None,
      samples_total: 0,
    }
  }

  pub fn number(&self) -> DeviceNumber {
    self.number
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn address(&self) -> &str {
    &self.address
  }

  pub fn state(&self) -> LinkState {
    self.state
  }

  pub fn is_ready(&self) -> bool {
    self.state == LinkState::Ready
  }

  pub fn consecutive_failures(&self) -> u32 {
    self.consecutive_failures
  }

  pub fn bias_z(&self) -> f64 {
    self.bias_z
  }

  pub fn set_bias_z(&mut self, bias: f64) {
    self.bias_z = bias;
  }

  pub fn current_sample(&self) -> Option<Sample> {
    self.current
  }

  pub fn samples_total(&self) -> u64 {
    self.samples_total
  }

  pub fn last_sample_age(&self, now: Timestamp) -> Option<f64> {
    self.last_sample.map(|at| now.since(at))
  }

  pub fn ring_len(&self) -> usize {
    self.ring.len()
  }

  pub fn ring_capacity(&self) -> usize {
    self.ring.capacity()
  }

  pub fn ring_snapshot(&self) -> Vec<(Timestamp, Sample)> {
    self.ring.snapshot()
  }

  pub fn health_stats(&self, now: Timestamp) -> Option<HealthStats> {
    self.health.recent_stats(now)
  }

  /// Apply one event to the state machine. Returns `false` (and leaves
  /// the state alone) when the transition is not in the table.
  pub fn transition(&mut self, event: SupervisorEvent) -> bool {
    match next_state(self.state, event) {
      Some(next) => {
        if next != self.state {
          debug!("[{}] {} -> {} ({:?})", self.name, self.state, next, event);
        }
        let entering_ready = next == LinkState::Ready && self.state != LinkState::Ready;
        self.state = next;
        if entering_ready {
          self.consecutive_failures = 0;
          // Stale verdicts from before the reconnect must not linger.
          self.health.clear();
        }
        true
      }
      None => {
        warn!(
          "[{}] ignoring {:?} in state {}",
          self.name, event, self.state
        );
        false
      }
    }
  }

  pub fn record_failure(&mut self) -> u32 {
    self.consecutive_failures += 1;
    warn!(
      "[{}] consecutive failures: {}",
      self.name, self.consecutive_failures
    );
    self.consecutive_failures
  }

  pub fn reset_failures(&mut self) {
    if self.consecutive_failures > 0 {
      info!(
        "[{}] resetting failure count from {}",
        self.name, self.consecutive_failures
      );
    }
    self.consecutive_failures = 0;
  }

  /// Install the byte-queue consumer side for a new connection attempt.
  pub fn attach_queue(&mut self, queue: ByteQueueReceiver) {
    self.codec.reset();
    self.queue = Some(queue);
  }

  pub fn queue(&self) -> Option<&ByteQueueReceiver> {
    self.queue.as_ref()
  }

  /// Install the subscribed link once the worker hands it over.
  pub fn attach_link(&mut self, link: Box<dyn Link>) {
    self.link = Some(link);
  }

  pub fn has_link(&self) -> bool {
    self.link.is_some()
  }

  /// Drain the byte queue through the frame codec. Each decoded sample
  /// updates the last-sample time, the current snapshot, the ring
  /// buffer and the health window, and is returned for the detector.
  ///
  /// Point health records whether the sample arrived on schedule: the
  /// inter-sample gap is compared against the staleness timeout. The
  /// dominant failure mode is missing samples, not corrupt ones.
  pub fn drain_samples(&mut self, data_timeout_s: f64) -> Vec<(Timestamp, Sample)> {
    let slices = match self.queue.as_ref() {
      Some(queue) => queue.take_all(),
      None => return Vec::new(),
    };

    let mut out = Vec::new();
    for (at, payload) in slices {
      for byte in payload.as_ref() {
        if let Some(sample) = self.codec.feed(*byte) {
          let on_schedule = match self.last_sample {
            Some(prev) => at.since(prev) < data_timeout_s,
            None => true,
          };
          self.last_sample = Some(at);
          self.current = Some(sample);
          self.samples_total += 1;
          self.ring.push(at, sample);
          self.health.record(at, on_schedule);
          out.push((at, sample));
        }
      }
    }
    out
  }

  /// Health-poll hook: a READY device that produced nothing since the
  /// previous poll records an unhealthy point, so a silent link decays
  /// the window even though no samples arrive to do it.
  pub fn record_missed_interval(&mut self, now: Timestamp) {
    self.health.record(now, false);
  }

  /// READY-state self check: staleness first, then the sliding window.
  pub fn health_verdict(&self, now: Timestamp, cfg: &HealthConfig) -> HealthVerdict {
    debug_assert_eq!(self.state, LinkState::Ready);
    if let Some(age) = self.last_sample_age(now) {
      if age > cfg.data_timeout_s {
        return HealthVerdict::Stale { age_s: age };
      }
    }
    if let Some(stats) = self.health.recent_stats(now) {
      if stats.unhealthy_percentage >= cfg.trigger_percentage {
        return HealthVerdict::WindowUnhealthy {
          percentage: stats.unhealthy_percentage,
        };
      }
    }
    HealthVerdict::Healthy
  }

  /// First half of cleanup: detach the link and the queue so the worker
  /// can tear the link down off-loop. The caller must already have
  /// deregistered the queue from the poll. Idempotent; subsequent calls
  /// return `(None, None)`.
  pub fn detach_for_cleanup(&mut self) -> (Option<Box<dyn Link>>, Option<ByteQueueReceiver>) {
    self.codec.reset();
    self.current = None;
    self.last_sample = None;
    (self.link.take(), self.queue.take())
  }
}
