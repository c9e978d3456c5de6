//! Link Driver: a narrow capability wrapper over the host radio stack.
//!
//! Exactly six operations, each with a mandatory timeout and a distinct
//! error kind. Keeping the surface this small makes the per-device
//! state machine testable against a stub and confines OS-level radio
//! control to the `recovery` module; nothing above this layer may talk
//! to the radio stack directly.

pub mod sim;

use std::time::Duration;

use thiserror::Error;

/// GATT service carrying the sensor's streaming and configuration
/// characteristics.
pub const IMU_SERVICE_UUID: &str = "0000ffe5-0000-1000-8000-00805f9a34fb";
/// Notify characteristic: sample frames out.
pub const NOTIFY_CHARACTERISTIC_UUID: &str = "0000ffe4-0000-1000-8000-00805f9a34fb";
/// Write characteristic: register packets in.
pub const WRITE_CHARACTERISTIC_UUID: &str = "0000ffe9-0000-1000-8000-00805f9a34fb";

#[derive(Debug, Error)]
pub enum LinkError {
  #[error("operation timed out after {0:?}")]
  Timeout(Duration),
  #[error("link is not connected")]
  NotConnected,
  #[error("characteristic {0} not found")]
  CharacteristicMissing(String),
  #[error("radio is busy")]
  RadioBusy,
  #[error("radio stack failure: {0}")]
  Stack(String),
}

/// A characteristic handle resolved by discovery, identified by UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic(pub String);

/// The two characteristics every sensor must expose.
#[derive(Debug, Clone)]
pub struct DiscoveredCharacteristics {
  pub notify: Characteristic,
  pub write: Characteristic,
}

/// Raw-notification sink. Runs on whatever thread the radio stack
/// dispatches on; implementations must do nothing beyond a single
/// bounded enqueue.
pub type NotificationCallback = Box<dyn FnMut(&[u8]) + Send>;

/// One established wireless link.
pub trait Link: Send {
  fn discover_required_characteristics(
    &mut self,
    service_uuid: &str,
    notify_uuid: &str,
    write_uuid: &str,
    timeout: Duration,
  ) -> Result<DiscoveredCharacteristics, LinkError>;

  fn subscribe_notifications(
    &mut self,
    characteristic: &Characteristic,
    callback: NotificationCallback,
    timeout: Duration,
  ) -> Result<(), LinkError>;

  fn unsubscribe(&mut self, timeout: Duration) -> Result<(), LinkError>;

  fn write(
    &mut self,
    characteristic: &Characteristic,
    payload: &[u8],
    timeout: Duration,
  ) -> Result<(), LinkError>;

  fn disconnect(&mut self, timeout: Duration) -> Result<(), LinkError>;
}

/// The host radio stack: the only way to obtain a [`Link`].
pub trait RadioStack: Send + Sync {
  fn connect(&self, address: &str, timeout: Duration) -> Result<Box<dyn Link>, LinkError>;
}
