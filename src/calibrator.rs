//! Periodic quiescent-window estimation of each device's Z-axis bias.
//!
//! The detector judges excursions against `AccZ - bias`, which makes it
//! robust to installation tilt; this module supplies the bias. It runs
//! as an on-loop state machine fed by the same sample stream as the
//! detector, once at startup and then on the configured interval, and
//! only while the detector is idle.

use std::collections::BTreeMap;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  config::{CalibrationConfig, DeviceNumber},
  sample::Sample,
  time::Timestamp,
};

/// Wait before retrying after a rejected (too-vibrating) or aborted
/// calibration attempt.
const RETRY_DELAY_S: f64 = 300.0;

/// Length of the quiescence probe preceding collection.
const PROBE_SECS: f64 = 1.0;

enum Phase {
  Idle {
    next_run: Timestamp,
  },
  /// Checking that the site is actually quiet before trusting a bias.
  Probing {
    until: Timestamp,
    z: BTreeMap<DeviceNumber, Vec<f64>>,
  },
  Collecting {
    deadline: Timestamp,
    z: BTreeMap<DeviceNumber, Vec<f64>>,
  },
}

/// What the fleet coordinator should do after a poll.
#[derive(Debug)]
pub enum CalibratorAction {
  None,
  /// New per-device biases, ready to install.
  Apply(BTreeMap<DeviceNumber, f64>),
  /// Probe saw too much vibration; retry scheduled.
  Rejected { device: DeviceNumber, std_dev: f64 },
}

pub struct Calibrator {
  cfg: CalibrationConfig,
  phase: Phase,
  last_calibrated: Option<Timestamp>,
}

impl Calibrator {
  /// A fresh calibrator wants to run immediately.
  pub fn new(cfg: CalibrationConfig, now: Timestamp) -> Self {
    Calibrator {
      cfg,
      phase: Phase::Idle { next_run: now },
      last_calibrated: None,
    }
  }

  pub fn is_sampling(&self) -> bool {
    matches!(self.phase, Phase::Probing { .. } | Phase::Collecting { .. })
  }

  pub fn last_calibrated(&self) -> Option<Timestamp> {
    self.last_calibrated
  }

  /// Tap on the live sample stream. Only devices that were ready when
  /// the probe started are tracked.
  pub fn on_sample(&mut self, device: DeviceNumber, _at: Timestamp, sample: &Sample) {
    let target = self.cfg.samples;
    match &mut self.phase {
      Phase::Probing { z, .. } => {
        if let Some(series) = z.get_mut(&device) {
          series.push(sample.acc_z);
        }
      }
      Phase::Collecting { z, .. } => {
        if let Some(series) = z.get_mut(&device) {
          if series.len() < target {
            series.push(sample.acc_z);
          }
        }
      }
      Phase::Idle { .. } => {}
    }
  }

  /// Advance the state machine. Called on a coarse periodic tick.
  pub fn poll(
    &mut self,
    now: Timestamp,
    ready: &[DeviceNumber],
    detector_idle: bool,
  ) -> CalibratorAction {
    match &mut self.phase {
      Phase::Idle { next_run } => {
        if detector_idle && now >= *next_run && !ready.is_empty() {
          info!("calibration: probing {} device(s) for quiescence", ready.len());
          self.phase = Phase::Probing {
            until: now.offset(PROBE_SECS),
            z: ready.iter().map(|d| (*d, Vec::new())).collect(),
          };
        }
        CalibratorAction::None
      }
      Phase::Probing { until, z } => {
        if now < *until {
          return CalibratorAction::None;
        }
        let loudest = z
          .iter()
          .filter(|(_, series)| !series.is_empty())
          .map(|(dev, series)| (*dev, std_dev(series)))
          .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((device, std_dev)) = loudest {
          if std_dev > self.cfg.vibration_threshold {
            warn!(
              "calibration rejected: device {} Z std-dev {:.3} g > {:.3} g; retry in {} s",
              device, std_dev, self.cfg.vibration_threshold, RETRY_DELAY_S as u64
            );
            self.phase = Phase::Idle {
              next_run: now.offset(RETRY_DELAY_S),
            };
            return CalibratorAction::Rejected { device, std_dev };
          }
        }
        let devices: Vec<DeviceNumber> = z.keys().copied().collect();
        self.phase = Phase::Collecting {
          deadline: now.offset(2.0 * self.cfg.duration_s),
          z: devices.into_iter().map(|d| (d, Vec::new())).collect(),
        };
        CalibratorAction::None
      }
      Phase::Collecting { deadline, z } => {
        let target = self.cfg.samples;
        let complete = z.values().all(|series| series.len() >= target);
        if !complete && now < *deadline {
          return CalibratorAction::None;
        }
        let biases: BTreeMap<DeviceNumber, f64> = z
          .iter()
          .filter(|(_, series)| !series.is_empty())
          .map(|(dev, series)| (*dev, mean(series)))
          .collect();
        self.last_calibrated = Some(now);
        self.phase = Phase::Idle {
          next_run: now.offset(self.cfg.interval_hours * 3600.0),
        };
        for (dev, bias) in &biases {
          info!("calibration: device {} bias {:.3} g", dev, bias);
        }
        CalibratorAction::Apply(biases)
      }
    }
  }

  /// Called when a recording starts mid-calibration: drop the attempt
  /// and retry once things calm down.
  pub fn abort(&mut self, now: Timestamp) {
    if self.is_sampling() {
      debug!("calibration aborted by recording; retry in {} s", RETRY_DELAY_S as u64);
      self.phase = Phase::Idle {
        next_run: now.offset(RETRY_DELAY_S),
      };
    }
  }
}

fn mean(series: &[f64]) -> f64 {
  series.iter().sum::<f64>() / series.len() as f64
}

fn std_dev(series: &[f64]) -> f64 {
  let m = mean(series);
  let var = series.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / series.len() as f64;
  var.max(0.0).sqrt()
}
