//! Blocking link work, off the event loop.
//!
//! Connect, cleanup and OS-recovery sequences block on the radio stack
//! with per-step timeouts, so they run on a short-lived worker thread
//! and report back over the coordinator's event channel. The
//! coordinator never spawns more than one of these at a time; that is
//! what serializes all connect traffic fleet-wide.

use std::{sync::Arc, thread, time::Duration};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_extras::channel as mio_channel;

use crate::{
  config::{DeviceNumber, TimeoutConfig},
  link::{
    Link, LinkError, NotificationCallback, RadioStack, IMU_SERVICE_UUID,
    NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID,
  },
  queue::ByteQueueSender,
  recovery::{RecoveryExecutor, RecoveryOutcome},
  wire,
};
use super::{ConnectPhase, WorkerEvent};

/// Pause between the packets of the rate-configuration sequence, giving
/// the sensor time to apply each register write.
const CONFIG_WRITE_GAP: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub(crate) struct ConnectFailure {
  pub phase: &'static str,
  pub error: LinkError,
}

pub(super) fn spawn_connect(
  radio: Arc<dyn RadioStack>,
  device: DeviceNumber,
  address: String,
  timeouts: TimeoutConfig,
  rate_hz: f64,
  queue_tx: ByteQueueSender,
  events: mio_channel::Sender<WorkerEvent>,
) {
  spawn_named(format!("railwatch-link-{device}"), move || {
    let result = connect_procedure(&*radio, device, &address, &timeouts, rate_hz, queue_tx, &events);
    let _ = events.send(WorkerEvent::ConnectDone { device, result });
  });
}

fn connect_procedure(
  radio: &dyn RadioStack,
  device: DeviceNumber,
  address: &str,
  timeouts: &TimeoutConfig,
  rate_hz: f64,
  queue_tx: ByteQueueSender,
  events: &mio_channel::Sender<WorkerEvent>,
) -> Result<Box<dyn Link>, ConnectFailure> {
  let connect_timeout = Duration::from_secs_f64(timeouts.connect_s);
  let discover_timeout = Duration::from_secs_f64(timeouts.discover_s);
  let write_timeout = Duration::from_secs_f64(timeouts.config_write_s);
  let cleanup_timeout = Duration::from_secs_f64(timeouts.cleanup_step_s);

  let mut link = radio
    .connect(address, connect_timeout)
    .map_err(|error| ConnectFailure {
      phase: "connect",
      error,
    })?;
  let _ = events.send(WorkerEvent::ConnectProgress {
    device,
    phase: ConnectPhase::LinkEstablished,
  });

  let chars = match link.discover_required_characteristics(
    IMU_SERVICE_UUID,
    NOTIFY_CHARACTERISTIC_UUID,
    WRITE_CHARACTERISTIC_UUID,
    discover_timeout,
  ) {
    Ok(chars) => chars,
    Err(error) => {
      teardown(link.as_mut(), cleanup_timeout);
      return Err(ConnectFailure {
        phase: "discover",
        error,
      });
    }
  };
  let _ = events.send(WorkerEvent::ConnectProgress {
    device,
    phase: ConnectPhase::CharacteristicsDiscovered,
  });

  // Pin the sensor to the configured streaming rate. Best-effort: a
  // sensor that rejects or times out the write still streams at its
  // stored rate, which is livable.
  for packet in wire::rate_config_sequence(rate_hz) {
    if let Err(error) = link.write(&chars.write, &packet, write_timeout) {
      warn!("{address}: rate configuration write failed (non-fatal): {error}");
      break;
    }
    thread::sleep(CONFIG_WRITE_GAP);
  }

  let callback: NotificationCallback = Box::new(move |bytes| queue_tx.push(bytes));
  if let Err(error) = link.subscribe_notifications(&chars.notify, callback, discover_timeout) {
    teardown(link.as_mut(), cleanup_timeout);
    return Err(ConnectFailure {
      phase: "subscribe",
      error,
    });
  }

  Ok(link)
}

/// Tear a half-open link down. Errors are logged and swallowed; the
/// link object is dropped regardless.
fn teardown(link: &mut dyn Link, timeout: Duration) {
  if let Err(e) = link.unsubscribe(timeout) {
    debug!("teardown unsubscribe: {e}");
  }
  if let Err(e) = link.disconnect(timeout) {
    debug!("teardown disconnect: {e}");
  }
}

pub(super) fn spawn_cleanup(
  device: DeviceNumber,
  link: Option<Box<dyn Link>>,
  timeouts: TimeoutConfig,
  events: mio_channel::Sender<WorkerEvent>,
) {
  spawn_named(format!("railwatch-cleanup-{device}"), move || {
    if let Some(mut link) = link {
      // Consumer cancellation and queue draining already happened on
      // the loop; only the link itself is torn down here.
      teardown(link.as_mut(), Duration::from_secs_f64(timeouts.cleanup_step_s));
    }
    let _ = events.send(WorkerEvent::CleanupDone { device });
  });
}

pub(super) fn spawn_recovery(
  executor: Arc<dyn RecoveryExecutor>,
  device: DeviceNumber,
  address: String,
  events: mio_channel::Sender<WorkerEvent>,
) {
  spawn_named(format!("railwatch-recovery-{device}"), move || {
    let outcome = match executor.soft_remove(&address) {
      Ok(()) => Ok(RecoveryOutcome::SoftRemoved),
      Err(soft_err) => {
        warn!("soft removal of {address} failed ({soft_err}); escalating to interface reset");
        match executor.hard_reset() {
          Ok(()) => Ok(RecoveryOutcome::HardReset),
          Err(hard_err) => Err(format!("soft: {soft_err}; hard: {hard_err}")),
        }
      }
    };
    let _ = events.send(WorkerEvent::RecoveryDone { device, outcome });
  });
}

fn spawn_named(name: String, body: impl FnOnce() + Send + 'static) {
  if let Err(e) = thread::Builder::new().name(name.clone()).spawn(body) {
    error!("failed to spawn {name}: {e}");
  }
}
