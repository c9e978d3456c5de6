//! Trigger/stop state machine turning per-device Z-axis excursions into
//! one fleet-wide recording session.
//!
//! The detector runs entirely inside the sample callback path: no
//! suspension points, no allocation failures, no I/O. A completed
//! recording is moved out to the event writer and never touched again.

use std::collections::{BTreeMap, VecDeque};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  config::{DetectionConfig, DeviceNumber},
  sample::Sample,
  time::Timestamp,
};

/// Read access to the fleet the detector needs at trigger and stop
/// time. Implemented by the coordinator over its supervisors; stubbed
/// in tests.
pub trait FleetView {
  /// All supervised devices, ascending.
  fn device_numbers(&self) -> Vec<DeviceNumber>;
  /// Devices currently in READY state, ascending.
  fn ready_devices(&self) -> Vec<DeviceNumber>;
  /// Owned chronological copy of a device's recent history.
  fn ring_snapshot(&self, device: DeviceNumber) -> Vec<(Timestamp, Sample)>;
}

/// Metadata fixed at the moment a recording starts.
#[derive(Debug, Clone)]
pub struct TriggerInfo {
  pub device: DeviceNumber,
  pub at: Timestamp,
  /// |AccZ - bias| of the triggering sample, in g.
  pub magnitude_z: f64,
  pub threshold_g: f64,
}

/// Why a recording session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  /// Every currently-ready device went quiescent on the Z axis.
  AllQuiescent,
  /// The hard max_record_seconds cap.
  MaxDuration,
}

/// A finished recording, moved out of the detector.
#[derive(Debug)]
pub struct EventRecording {
  pub trigger: TriggerInfo,
  pub end_time: Timestamp,
  pub stop_reason: StopReason,
  /// Per-device sample series: pre-roll seeded from the ring buffers at
  /// trigger time, extended live until the stop condition fired.
  pub series: BTreeMap<DeviceNumber, Vec<(Timestamp, Sample)>>,
}

impl EventRecording {
  pub fn duration_s(&self) -> f64 {
    self.end_time.since(self.trigger.at)
  }

  /// Maximum total-acceleration magnitude over every recorded sample.
  pub fn max_acceleration_g(&self) -> f64 {
    self
      .series
      .values()
      .flatten()
      .map(|(_, s)| s.acceleration_magnitude())
      .fold(0.0, f64::max)
  }

  pub fn total_samples(&self) -> usize {
    self.series.values().map(Vec::len).sum()
  }
}

/// What the trigger looked like, for the console report and the event
/// start notification.
#[derive(Debug, Clone)]
pub struct TriggerSummary {
  pub trigger: TriggerInfo,
  /// Pre-roll sample count captured per device.
  pub preroll: Vec<(DeviceNumber, usize)>,
}

/// Result of feeding one sample.
#[derive(Debug)]
pub enum DetectorOutcome {
  None,
  Triggered(TriggerSummary),
  Completed(EventRecording),
}

struct RecordingSession {
  trigger: TriggerInfo,
  series: BTreeMap<DeviceNumber, Vec<(Timestamp, Sample)>>,
  stop_windows: BTreeMap<DeviceNumber, VecDeque<f64>>,
}

enum DetectorState {
  Idle,
  Recording(RecordingSession),
}

pub struct Detector {
  state: DetectorState,
  cfg: DetectionConfig,
}

impl Detector {
  pub fn new(cfg: DetectionConfig) -> Self {
    Detector {
      state: DetectorState::Idle,
      cfg,
    }
  }

  pub fn is_idle(&self) -> bool {
    matches!(self.state, DetectorState::Idle)
  }

  pub fn is_recording(&self) -> bool {
    matches!(self.state, DetectorState::Recording(_))
  }

  /// Feed one sample from a ready device. Synchronous start to finish.
  pub fn on_sample(
    &mut self,
    device: DeviceNumber,
    at: Timestamp,
    sample: &Sample,
    bias_z: f64,
    fleet: &dyn FleetView,
  ) -> DetectorOutcome {
    let excursion = (sample.acc_z - bias_z).abs();

    match &mut self.state {
      DetectorState::Idle => {
        if excursion > self.cfg.threshold_g {
          let summary = self.start_recording(device, at, excursion, fleet);
          DetectorOutcome::Triggered(summary)
        } else {
          DetectorOutcome::None
        }
      }
      DetectorState::Recording(session) => {
        // A concurrent second crossing is not a new event; the sample
        // joins the running recording like any other.
        session.series.entry(device).or_default().push((at, *sample));

        let window = session.stop_windows.entry(device).or_default();
        if window.len() == self.cfg.stop_window_size {
          window.pop_front();
        }
        window.push_back(excursion);

        if let Some(reason) = self.stop_reason(at, fleet) {
          return DetectorOutcome::Completed(self.finish(at, reason));
        }
        DetectorOutcome::None
      }
    }
  }

  fn start_recording(
    &mut self,
    device: DeviceNumber,
    at: Timestamp,
    magnitude_z: f64,
    fleet: &dyn FleetView,
  ) -> TriggerSummary {
    let trigger = TriggerInfo {
      device,
      at,
      magnitude_z,
      threshold_g: self.cfg.threshold_g,
    };

    // Pre-roll: freeze every device's ring buffer under its own key,
    // triggering device included. The triggering sample is already the
    // newest ring entry, so it is not appended again.
    let mut series = BTreeMap::new();
    let mut preroll = Vec::new();
    for dev in fleet.device_numbers() {
      let history = fleet.ring_snapshot(dev);
      preroll.push((dev, history.len()));
      series.insert(dev, history);
    }

    // Stop windows start cleared; a device cannot satisfy the stop
    // check until it has delivered at least one post-trigger sample.
    self.state = DetectorState::Recording(RecordingSession {
      trigger: trigger.clone(),
      series,
      stop_windows: BTreeMap::new(),
    });

    info!(
      "trigger: device {} |z|={:.3} g > {:.3} g",
      device, magnitude_z, self.cfg.threshold_g
    );

    TriggerSummary { trigger, preroll }
  }

  fn stop_reason(&self, at: Timestamp, fleet: &dyn FleetView) -> Option<StopReason> {
    let session = match &self.state {
      DetectorState::Recording(session) => session,
      DetectorState::Idle => return None,
    };

    let elapsed = at.since(session.trigger.at);
    if elapsed >= self.cfg.max_record_seconds {
      return Some(StopReason::MaxDuration);
    }

    if elapsed < self.cfg.post_trigger_duration_s {
      return None;
    }

    // Quiescence is judged over currently-ready devices only. With no
    // ready device there is no evidence to stop on; the hard cap above
    // bounds the session instead.
    let ready = fleet.ready_devices();
    if ready.is_empty() {
      return None;
    }
    let all_quiet = ready.iter().all(|dev| {
      session
        .stop_windows
        .get(dev)
        .map(|w| !w.is_empty() && w.iter().all(|v| *v < self.cfg.stop_threshold_z))
        .unwrap_or(false)
    });
    if all_quiet {
      Some(StopReason::AllQuiescent)
    } else {
      None
    }
  }

  fn finish(&mut self, end_time: Timestamp, stop_reason: StopReason) -> EventRecording {
    let state = std::mem::replace(&mut self.state, DetectorState::Idle);
    let session = match state {
      DetectorState::Recording(session) => session,
      DetectorState::Idle => unreachable!("finish called while idle"),
    };
    info!(
      "recording stopped after {:.2} s ({:?})",
      end_time.since(session.trigger.at),
      stop_reason
    );
    EventRecording {
      trigger: session.trigger,
      end_time,
      stop_reason,
      series: session.series,
    }
  }

  /// Shutdown path: flush a running recording to the writer.
  pub fn flush(&mut self, now: Timestamp) -> Option<EventRecording> {
    if self.is_recording() {
      Some(self.finish(now, StopReason::MaxDuration))
    } else {
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use super::*;

  struct StubFleet {
    devices: Vec<DeviceNumber>,
    ready: Vec<DeviceNumber>,
    rings: BTreeMap<DeviceNumber, Vec<(Timestamp, Sample)>>,
  }

  impl StubFleet {
    fn new(devices: &[u16]) -> Self {
      StubFleet {
        devices: devices.iter().map(|n| DeviceNumber(*n)).collect(),
        ready: devices.iter().map(|n| DeviceNumber(*n)).collect(),
        rings: BTreeMap::new(),
      }
    }

    fn with_ring(mut self, device: u16, samples: usize, start: f64) -> Self {
      let series = (0..samples)
        .map(|i| {
          (
            Timestamp::from_secs_f64(start + i as f64 * 0.02),
            Sample::with_acc_z(1.0),
          )
        })
        .collect();
      self.rings.insert(DeviceNumber(device), series);
      self
    }
  }

  impl FleetView for StubFleet {
    fn device_numbers(&self) -> Vec<DeviceNumber> {
      self.devices.clone()
    }

    fn ready_devices(&self) -> Vec<DeviceNumber> {
      self.ready.clone()
    }

    fn ring_snapshot(&self, device: DeviceNumber) -> Vec<(Timestamp, Sample)> {
      self.rings.get(&device).cloned().unwrap_or_default()
    }
  }

  fn ts(secs: f64) -> Timestamp {
    Timestamp::from_secs_f64(secs)
  }

  fn quick_cfg() -> DetectionConfig {
    DetectionConfig {
      threshold_g: 2.0,
      post_trigger_duration_s: 1.0,
      max_record_seconds: 60.0,
      stop_threshold_z: 0.5,
      stop_window_size: 5,
      ..DetectionConfig::default()
    }
  }

  #[test]
  fn trigger_snapshots_all_devices() {
    let fleet = StubFleet::new(&[1, 2])
      .with_ring(1, 250, 5.0)
      .with_ring(2, 120, 7.6);
    let mut detector = Detector::new(quick_cfg());

    let outcome = detector.on_sample(
      DeviceNumber(1),
      ts(10.0),
      &Sample::with_acc_z(3.0),
      0.0,
      &fleet,
    );
    match outcome {
      DetectorOutcome::Triggered(summary) => {
        assert_eq!(summary.trigger.device, DeviceNumber(1));
        assert_eq!(summary.trigger.magnitude_z, 3.0);
        assert_eq!(summary.preroll, vec![(DeviceNumber(1), 250), (DeviceNumber(2), 120)]);
      }
      other => panic!("expected trigger, got {other:?}"),
    }
    assert!(detector.is_recording());
  }

  #[test]
  fn trigger_respects_bias() {
    let fleet = StubFleet::new(&[1]);
    let mut detector = Detector::new(quick_cfg());
    // Raw 3.0 g with a 1.0 g bias is a 2.0 g excursion: not above the
    // strict threshold.
    let outcome = detector.on_sample(
      DeviceNumber(1),
      ts(0.0),
      &Sample::with_acc_z(3.0),
      1.0,
      &fleet,
    );
    assert!(matches!(outcome, DetectorOutcome::None));
    assert!(detector.is_idle());
    // Negative excursions count through the absolute value.
    let outcome = detector.on_sample(
      DeviceNumber(1),
      ts(0.1),
      &Sample::with_acc_z(-1.5),
      1.0,
      &fleet,
    );
    assert!(matches!(outcome, DetectorOutcome::Triggered(_)));
  }

  #[test]
  fn second_trigger_is_ignored() {
    let fleet = StubFleet::new(&[1, 2]);
    let mut detector = Detector::new(quick_cfg());
    detector.on_sample(DeviceNumber(1), ts(0.0), &Sample::with_acc_z(3.0), 0.0, &fleet);
    let outcome = detector.on_sample(
      DeviceNumber(2),
      ts(0.1),
      &Sample::with_acc_z(5.0),
      0.0,
      &fleet,
    );
    assert!(matches!(outcome, DetectorOutcome::None));
    assert!(detector.is_recording());
  }

  #[test]
  fn recording_appends_each_sample_exactly_once() {
    let fleet = StubFleet::new(&[1, 2]);
    let mut detector = Detector::new(quick_cfg());
    detector.on_sample(DeviceNumber(1), ts(0.0), &Sample::with_acc_z(3.0), 0.0, &fleet);

    for i in 0..10 {
      let outcome = detector.on_sample(
        DeviceNumber(2),
        ts(0.02 * (i + 1) as f64),
        &Sample::with_acc_z(0.9),
        0.0,
        &fleet,
      );
      assert!(matches!(outcome, DetectorOutcome::None));
    }

    let recording = detector.flush(ts(0.5)).unwrap();
    let series = &recording.series[&DeviceNumber(2)];
    assert_eq!(series.len(), 10);
    let mut stamps: Vec<f64> = series.iter().map(|(t, _)| t.as_secs_f64()).collect();
    stamps.dedup();
    assert_eq!(stamps.len(), 10);
  }

  #[test]
  fn stops_when_all_ready_devices_quiescent() {
    let fleet = StubFleet::new(&[1, 2]);
    let mut detector = Detector::new(quick_cfg());
    detector.on_sample(DeviceNumber(1), ts(0.0), &Sample::with_acc_z(3.0), 0.0, &fleet);

    // Both devices stream sub-threshold samples past the minimum
    // duration until their stop windows are uniformly quiet.
    let mut completed = None;
    for i in 0..200 {
      let at = ts(0.02 * (i + 1) as f64 + 1.0);
      for dev in [1u16, 2] {
        match detector.on_sample(DeviceNumber(dev), at, &Sample::with_acc_z(0.1), 0.0, &fleet) {
          DetectorOutcome::Completed(rec) => completed = Some(rec),
          DetectorOutcome::Triggered(_) => panic!("no retrigger expected"),
          DetectorOutcome::None => {}
        }
        if completed.is_some() {
          break;
        }
      }
      if completed.is_some() {
        break;
      }
    }
    let recording = completed.expect("quiescence should stop the recording");
    assert_eq!(recording.stop_reason, StopReason::AllQuiescent);
    assert!(detector.is_idle());
    assert!(recording.duration_s() >= 1.0);
  }

  #[test]
  fn trigger_crossing_does_not_linger_in_stop_windows() {
    // Stop windows are cleared at trigger: the crossing itself must not
    // force the triggering device to evict it with a full window of
    // quiet samples before the stop check can pass.
    let fleet = StubFleet::new(&[1, 2]);
    let mut detector = Detector::new(quick_cfg());
    detector.on_sample(DeviceNumber(1), ts(0.0), &Sample::with_acc_z(3.0), 0.0, &fleet);

    // One quiet sample per device past the minimum duration suffices.
    assert!(matches!(
      detector.on_sample(DeviceNumber(2), ts(1.1), &Sample::with_acc_z(0.1), 0.0, &fleet),
      DetectorOutcome::None
    ));
    match detector.on_sample(DeviceNumber(1), ts(1.12), &Sample::with_acc_z(0.1), 0.0, &fleet) {
      DetectorOutcome::Completed(recording) => {
        assert_eq!(recording.stop_reason, StopReason::AllQuiescent);
      }
      other => panic!("expected quiescent stop, got {other:?}"),
    }
  }

  #[test]
  fn loud_device_blocks_quiescent_stop_until_cap() {
    let fleet = StubFleet::new(&[1, 2]);
    let mut detector = Detector::new(quick_cfg());
    detector.on_sample(DeviceNumber(1), ts(0.0), &Sample::with_acc_z(3.0), 0.0, &fleet);

    // Device 2 stays loud; no stop before the cap, stop exactly at it.
    let mut at = ts(0.0);
    for i in 0..2000 {
      at = ts(0.03 * (i + 1) as f64);
      if at.since(ts(0.0)) >= 60.0 {
        break;
      }
      let outcome =
        detector.on_sample(DeviceNumber(2), at, &Sample::with_acc_z(1.2), 0.0, &fleet);
      assert!(matches!(outcome, DetectorOutcome::None), "early stop at {at:?}");
    }
    let outcome = detector.on_sample(
      DeviceNumber(2),
      ts(60.0),
      &Sample::with_acc_z(1.2),
      0.0,
      &fleet,
    );
    match outcome {
      DetectorOutcome::Completed(recording) => {
        assert_eq!(recording.stop_reason, StopReason::MaxDuration);
        assert_eq!(recording.duration_s(), 60.0);
      }
      other => panic!("expected completion at the cap, got {other:?}"),
    }
  }

  #[test]
  fn no_ready_devices_means_no_quiescent_stop() {
    let mut fleet = StubFleet::new(&[1]);
    let mut detector = Detector::new(quick_cfg());
    detector.on_sample(DeviceNumber(1), ts(0.0), &Sample::with_acc_z(3.0), 0.0, &fleet);

    // The device drops out of READY after triggering.
    fleet.ready.clear();
    for i in 0..100 {
      let outcome = detector.on_sample(
        DeviceNumber(1),
        ts(1.0 + 0.02 * i as f64),
        &Sample::with_acc_z(0.0),
        0.0,
        &fleet,
      );
      assert!(matches!(outcome, DetectorOutcome::None));
    }
    assert!(detector.is_recording());
  }

  #[test]
  fn device_lost_mid_recording_no_longer_vetoes_stop() {
    let mut fleet = StubFleet::new(&[1, 2]);
    let mut detector = Detector::new(quick_cfg());
    detector.on_sample(DeviceNumber(1), ts(0.0), &Sample::with_acc_z(3.0), 0.0, &fleet);

    // Device 2 never sends anything after the trigger and then drops
    // out of READY; quiescence is judged over device 1 alone.
    fleet.ready = vec![DeviceNumber(1)];
    let mut completed = None;
    for i in 0..100 {
      let at = ts(1.1 + 0.02 * i as f64);
      if let DetectorOutcome::Completed(rec) =
        detector.on_sample(DeviceNumber(1), at, &Sample::with_acc_z(0.05), 0.0, &fleet)
      {
        completed = Some(rec);
        break;
      }
    }
    assert!(completed.is_some());
  }

  #[test]
  fn max_acceleration_covers_preroll() {
    let mut fleet = StubFleet::new(&[1]);
    fleet.rings.insert(
      DeviceNumber(1),
      vec![(ts(9.0), Sample { acc_x: 3.0, acc_y: 4.0, acc_z: 0.0, ..Sample::ZERO })],
    );
    let mut detector = Detector::new(quick_cfg());
    detector.on_sample(DeviceNumber(1), ts(10.0), &Sample::with_acc_z(2.5), 0.0, &fleet);
    let recording = detector.flush(ts(11.0)).unwrap();
    assert_eq!(recording.max_acceleration_g(), 5.0);
  }

  #[test]
  fn flush_when_idle_is_none() {
    let mut detector = Detector::new(quick_cfg());
    assert!(detector.flush(ts(1.0)).is_none());
  }
}
