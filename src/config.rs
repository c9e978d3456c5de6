//! Gateway configuration: device records, detection / calibration /
//! timeout / health / reconnect parameter groups, output paths and
//! telemetry endpoints.
//!
//! Read exactly once at startup. A missing file is fatal; unknown keys
//! are ignored so configs can carry site-specific annotations.

use std::{fmt, fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable small-integer device identifier used everywhere above the
/// radio address layer.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DeviceNumber(pub u16);

impl fmt::Display for DeviceNumber {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("cannot read configuration file {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("configuration parse error: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("invalid configuration: {0}")]
  Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
  pub number: DeviceNumber,
  pub name: String,
  /// Radio (MAC) address understood by the host radio stack.
  pub address: String,
  #[serde(default = "default_true")]
  pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
  /// Trigger threshold on |AccZ - bias|, in g.
  pub threshold_g: f64,
  /// Minimum recording length after trigger before the quiescent stop
  /// check is considered, in seconds.
  pub post_trigger_duration_s: f64,
  /// Hard cap on a recording session, in seconds.
  pub max_record_seconds: f64,
  /// Per-device quiescence threshold on |AccZ - bias|, in g.
  pub stop_threshold_z: f64,
  /// Per-device stop window length, in samples.
  pub stop_window_size: usize,
}

impl Default for DetectionConfig {
  fn default() -> Self {
    DetectionConfig {
      threshold_g: 2.0,
      post_trigger_duration_s: 5.0,
      max_record_seconds: 60.0,
      stop_threshold_z: 0.5,
      stop_window_size: 50,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
  pub interval_hours: f64,
  /// Target number of Z samples per device.
  pub samples: usize,
  /// Nominal collection duration, in seconds. Collection wall time is
  /// capped at twice this value.
  pub duration_s: f64,
  /// Reject calibration when any device's Z std-dev exceeds this, in g.
  pub vibration_threshold: f64,
}

impl Default for CalibrationConfig {
  fn default() -> Self {
    CalibrationConfig {
      interval_hours: 6.0,
      samples: 100,
      duration_s: 2.0,
      vibration_threshold: 0.3,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
  pub connect_s: f64,
  pub discover_s: f64,
  pub first_sample_s: f64,
  /// Best-effort sensor configuration write during connect.
  pub config_write_s: f64,
  /// Per step: unsubscribe, disconnect.
  pub cleanup_step_s: f64,
}

impl Default for TimeoutConfig {
  fn default() -> Self {
    TimeoutConfig {
      connect_s: 15.0,
      discover_s: 10.0,
      first_sample_s: 5.0,
      config_write_s: 5.0,
      cleanup_step_s: 2.0,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
  /// A READY device with no sample for this long is stale, in seconds.
  pub data_timeout_s: f64,
  pub check_interval_s: f64,
  /// Consecutive connect failures before fleet-level recovery.
  pub max_consecutive_failures: u32,
  pub sliding_window_size: usize,
  /// Unhealthy percentage in the last second that declares the
  /// connection dead.
  pub trigger_percentage: f64,
}

impl Default for HealthConfig {
  fn default() -> Self {
    HealthConfig {
      data_timeout_s: 3.0,
      check_interval_s: 2.0,
      max_consecutive_failures: 3,
      sliding_window_size: 50,
      trigger_percentage: 70.0,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
  /// Automatic OS-recovery rounds per device before it is left FAILED
  /// until restart.
  pub max_retries: u32,
  /// Fleet-wide minimum spacing between reconnect starts, in seconds.
  pub global_cooldown_s: f64,
  /// Per-device OS-recovery cooldown, in seconds.
  pub os_cleanup_cooldown_s: f64,
  /// Fleet-wide OS-recovery cooldown, in seconds.
  pub os_cleanup_global_cooldown_s: f64,
}

impl Default for ReconnectConfig {
  fn default() -> Self {
    ReconnectConfig {
      max_retries: 5,
      global_cooldown_s: 5.0,
      os_cleanup_cooldown_s: 600.0,
      os_cleanup_global_cooldown_s: 300.0,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
  pub sample_rate_hz: f64,
  pub retention_seconds: f64,
}

impl BufferConfig {
  /// Pre-roll ring capacity in samples. Fixed from configuration; the
  /// achieved sensor rate does not resize it.
  pub fn ring_capacity(&self) -> usize {
    ((self.sample_rate_hz * self.retention_seconds) as usize).max(1)
  }
}

impl Default for BufferConfig {
  fn default() -> Self {
    BufferConfig {
      sample_rate_hz: 50.0,
      retention_seconds: 5.0,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
  pub directory: String,
  pub database_filename: String,
  pub log_filename: String,
}

impl Default for OutputConfig {
  fn default() -> Self {
    OutputConfig {
      directory: "train_events".to_string(),
      database_filename: "events.db".to_string(),
      log_filename: "railwatch.log".to_string(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventEndpointConfig {
  pub enabled: bool,
  pub base_url: String,
  pub start_path: String,
  pub end_path: String,
  pub device_summary_path: String,
  pub timeout_s: f64,
}

impl Default for EventEndpointConfig {
  fn default() -> Self {
    EventEndpointConfig {
      enabled: false,
      base_url: "http://localhost:8000".to_string(),
      start_path: "/api/event/start".to_string(),
      end_path: "/api/event/end".to_string(),
      device_summary_path: "/api/event/device".to_string(),
      timeout_s: 5.0,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthEndpointConfig {
  pub enabled: bool,
  pub host: String,
  pub port: u16,
  pub path: String,
  pub interval_s: f64,
  pub timeout_s: f64,
}

impl HealthEndpointConfig {
  pub fn url(&self) -> String {
    format!("http://{}:{}{}", self.host, self.port, self.path)
  }
}

impl Default for HealthEndpointConfig {
  fn default() -> Self {
    HealthEndpointConfig {
      enabled: false,
      host: "localhost".to_string(),
      port: 8000,
      path: "/api/imu/status".to_string(),
      interval_s: 30.0,
      timeout_s: 3.0,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
  pub enabled: bool,
  pub url: String,
  pub api_token: String,
  pub folder_id: String,
  /// Delay between event save and archive upload, in seconds.
  pub settle_delay_s: f64,
  pub timeout_s: f64,
}

impl Default for ArchiveConfig {
  fn default() -> Self {
    ArchiveConfig {
      enabled: false,
      url: "http://localhost:8000/api/archive".to_string(),
      api_token: String::new(),
      folder_id: String::new(),
      settle_delay_s: 10.0,
      timeout_s: 30.0,
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
  pub event: EventEndpointConfig,
  pub health: HealthEndpointConfig,
  pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
  pub devices: Vec<DeviceConfig>,
  pub detection: DetectionConfig,
  pub calibration: CalibrationConfig,
  pub timeouts: TimeoutConfig,
  pub health_monitoring: HealthConfig,
  pub reconnect: ReconnectConfig,
  pub buffer: BufferConfig,
  pub output: OutputConfig,
  pub telemetry: TelemetryConfig,
}

/// Practical upper bound on a single gateway's fleet.
pub const MAX_FLEET_SIZE: usize = 8;

impl GatewayConfig {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.display().to_string(),
      source,
    })?;
    let config: GatewayConfig = serde_json::from_str(&text)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let enabled = self.enabled_devices();
    if enabled.is_empty() {
      return Err(ConfigError::Invalid("no enabled devices".to_string()));
    }
    if enabled.len() > MAX_FLEET_SIZE {
      return Err(ConfigError::Invalid(format!(
        "{} enabled devices exceeds the fleet limit of {}",
        enabled.len(),
        MAX_FLEET_SIZE
      )));
    }
    for (i, a) in enabled.iter().enumerate() {
      for b in &enabled[i + 1..] {
        if a.number == b.number {
          return Err(ConfigError::Invalid(format!(
            "duplicate device number {}",
            a.number
          )));
        }
        if a.address == b.address {
          return Err(ConfigError::Invalid(format!(
            "duplicate radio address {}",
            a.address
          )));
        }
      }
    }
    if self.detection.threshold_g <= 0.0 {
      return Err(ConfigError::Invalid(
        "detection.threshold_g must be positive".to_string(),
      ));
    }
    if self.detection.stop_window_size == 0 {
      return Err(ConfigError::Invalid(
        "detection.stop_window_size must be at least 1".to_string(),
      ));
    }
    Ok(())
  }

  /// Enabled device records in ascending device-number order; the order
  /// every fleet-wide iteration uses.
  pub fn enabled_devices(&self) -> Vec<DeviceConfig> {
    let mut enabled: Vec<DeviceConfig> =
      self.devices.iter().filter(|d| d.enabled).cloned().collect();
    enabled.sort_by_key(|d| d.number);
    enabled
  }
}

fn default_true() -> bool {
  true
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use super::*;

  fn two_device_json() -> &'static str {
    r#"{
      "devices": [
        {"number": 2, "name": "rear", "address": "C0:00:00:00:00:02"},
        {"number": 1, "name": "front", "address": "C0:00:00:00:00:01"},
        {"number": 3, "name": "spare", "address": "C0:00:00:00:00:03", "enabled": false}
      ],
      "detection": {"threshold_g": 1.5},
      "an_unknown_section": {"ignored": true}
    }"#
  }

  #[test]
  fn parses_defaults_and_ignores_unknown_keys() {
    let config: GatewayConfig = serde_json::from_str(two_device_json()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.detection.threshold_g, 1.5);
    assert_eq!(config.detection.max_record_seconds, 60.0);
    assert_eq!(config.health_monitoring.trigger_percentage, 70.0);
    assert_eq!(config.reconnect.os_cleanup_cooldown_s, 600.0);
    assert_eq!(config.buffer.ring_capacity(), 250);
  }

  #[test]
  fn enabled_devices_sorted_ascending() {
    let config: GatewayConfig = serde_json::from_str(two_device_json()).unwrap();
    let enabled = config.enabled_devices();
    assert_eq!(enabled.len(), 2);
    assert_eq!(enabled[0].number, DeviceNumber(1));
    assert_eq!(enabled[1].number, DeviceNumber(2));
  }

  #[test]
  fn duplicate_device_numbers_rejected() {
    let config = GatewayConfig {
      devices: vec![
        DeviceConfig {
          number: DeviceNumber(1),
          name: "a".into(),
          address: "AA".into(),
          enabled: true,
        },
        DeviceConfig {
          number: DeviceNumber(1),
          name: "b".into(),
          address: "BB".into(),
          enabled: true,
        },
      ],
      ..GatewayConfig::default()
    };
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
  }

  #[test]
  fn no_enabled_devices_rejected() {
    let config = GatewayConfig::default();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
  }

  #[test]
  fn missing_file_is_an_io_error() {
    let err = GatewayConfig::load("/nonexistent/railwatch.json").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
  }

  #[test]
  fn load_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(two_device_json().as_bytes()).unwrap();
    let config = GatewayConfig::load(file.path()).unwrap();
    assert_eq!(config.enabled_devices().len(), 2);
  }
}
