//! Shared harness for the gateway integration scenarios: a fleet of
//! simulated sensors, aggressively shortened timeouts, and status
//! polling that checks the connect-serialization invariant on every
//! observation.

// Each test binary uses a different subset of the harness.
#![allow(dead_code)]

use std::{
  path::Path,
  sync::Arc,
  time::{Duration, Instant},
};

use railwatch::{
  config::{
    BufferConfig, DetectionConfig, DeviceConfig, DeviceNumber, GatewayConfig, HealthConfig,
    OutputConfig, ReconnectConfig, TimeoutConfig,
  },
  fleet::FleetStatus,
  gateway::Gateway,
  link::{
    sim::{SimControl, SimProfile, SimulatedRadio},
    RadioStack,
  },
  recovery::{RecordingRecovery, RecoveryExecutor},
  telemetry::{RecordingTransport, Transport},
};

pub const CONNECT_PHASES: [&str; 4] = [
  "CONNECTING",
  "DISCOVERING",
  "AWAITING_FIRST_SAMPLE",
  "RECONNECTING",
];

/// Gateway configuration scaled for test wall-clock: sub-second health
/// polling and staleness, small stop windows, short record cap.
pub fn test_config(output_dir: &Path, device_count: u16) -> GatewayConfig {
  GatewayConfig {
    devices: (1..=device_count)
      .map(|n| DeviceConfig {
        number: DeviceNumber(n),
        name: format!("sensor-{n}"),
        address: sim_address(n),
        enabled: true,
      })
      .collect(),
    detection: DetectionConfig {
      threshold_g: 2.0,
      post_trigger_duration_s: 0.5,
      max_record_seconds: 10.0,
      stop_threshold_z: 0.5,
      stop_window_size: 10,
    },
    timeouts: TimeoutConfig {
      connect_s: 2.0,
      discover_s: 1.0,
      first_sample_s: 1.0,
      config_write_s: 1.0,
      cleanup_step_s: 0.5,
    },
    health_monitoring: HealthConfig {
      data_timeout_s: 0.6,
      check_interval_s: 0.2,
      max_consecutive_failures: 3,
      sliding_window_size: 50,
      trigger_percentage: 70.0,
    },
    reconnect: ReconnectConfig {
      max_retries: 3,
      global_cooldown_s: 0.3,
      os_cleanup_cooldown_s: 600.0,
      os_cleanup_global_cooldown_s: 60.0,
    },
    buffer: BufferConfig {
      sample_rate_hz: 50.0,
      retention_seconds: 2.0,
    },
    output: OutputConfig {
      directory: output_dir.display().to_string(),
      database_filename: "events.db".to_string(),
      log_filename: "railwatch.log".to_string(),
    },
    ..GatewayConfig::default()
  }
}

pub fn sim_address(n: u16) -> String {
  format!("SIM:00:00:00:00:{n:02}")
}

pub struct Harness {
  pub gateway: Gateway,
  pub controls: Vec<SimControl>,
  pub recovery: Arc<RecordingRecovery>,
  pub transport: Arc<RecordingTransport>,
  output: tempfile::TempDir,
}

impl Harness {
  pub fn output_path(&self) -> &Path {
    self.output.path()
  }
}

pub fn start_fleet(cfg_fn: impl FnOnce(&mut GatewayConfig)) -> Harness {
  start_fleet_faulted(cfg_fn, |_| {})
}

/// Like [`start_fleet`], with a hook to inject faults into the
/// simulated sensors before the gateway's first connect attempt.
pub fn start_fleet_faulted(
  cfg_fn: impl FnOnce(&mut GatewayConfig),
  fault_fn: impl FnOnce(&[SimControl]),
) -> Harness {
  let output = tempfile::tempdir().expect("tempdir");
  let mut cfg = test_config(output.path(), 2);
  cfg_fn(&mut cfg);

  let sim = Arc::new(SimulatedRadio::new());
  let controls: Vec<SimControl> = cfg
    .enabled_devices()
    .iter()
    .map(|d| {
      sim.add_device(
        &d.address,
        SimProfile {
          sample_rate_hz: cfg.buffer.sample_rate_hz,
          // Rest at zero keeps the quiescence checks independent of
          // the calibration schedule.
          rest_acc_z_g: 0.0,
          ..SimProfile::default()
        },
      )
    })
    .collect();

  fault_fn(&controls);

  let recovery = Arc::new(RecordingRecovery::new());
  let transport = Arc::new(RecordingTransport::new());
  let gateway = Gateway::start(
    cfg,
    Arc::clone(&sim) as Arc<dyn RadioStack>,
    Arc::clone(&recovery) as Arc<dyn RecoveryExecutor>,
    Arc::clone(&transport) as Arc<dyn Transport>,
  )
  .expect("gateway start");

  Harness {
    gateway,
    controls,
    recovery,
    transport,
    output,
  }
}

/// Poll status until `pred` holds. Every observation also asserts that
/// at most one supervisor occupies a connect-phase state.
pub fn wait_for(
  gateway: &Gateway,
  timeout: Duration,
  what: &str,
  pred: impl Fn(&FleetStatus) -> bool,
) -> FleetStatus {
  let deadline = Instant::now() + timeout;
  loop {
    let status = gateway.status().expect("status query");
    assert_connect_serialization(&status);
    if pred(&status) {
      return status;
    }
    if Instant::now() >= deadline {
      panic!("timed out waiting for {what}; last status: {status:?}");
    }
    std::thread::sleep(Duration::from_millis(50));
  }
}

pub fn assert_connect_serialization(status: &FleetStatus) {
  let in_connect_phase = status
    .devices
    .iter()
    .filter(|d| CONNECT_PHASES.contains(&d.state.as_str()))
    .count();
  assert!(
    in_connect_phase <= 1,
    "{in_connect_phase} supervisors in connect phases simultaneously: {status:?}"
  );
}

pub fn all_ready(status: &FleetStatus) -> bool {
  !status.devices.is_empty() && status.devices.iter().all(|d| d.ready)
}

pub fn device_state<'a>(status: &'a FleetStatus, number: u16) -> &'a str {
  &status
    .devices
    .iter()
    .find(|d| d.number == number)
    .expect("device in status")
    .state
}
