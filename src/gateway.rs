//! Public entry object.
//!
//! `Gateway::start` wires the whole system together — store, writer,
//! telemetry, coordinator — and runs the event loop on its own thread.
//! The handle answers status queries and owns the single idempotent
//! shutdown path.

use std::{
  collections::BTreeMap,
  fs, io,
  path::PathBuf,
  sync::{mpsc, Arc},
  thread,
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_extras::channel as mio_channel;
use thiserror::Error;

use crate::{
  config::{ConfigError, GatewayConfig},
  fleet::{FleetCommand, FleetCoordinator, FleetStatus},
  link::RadioStack,
  recovery::RecoveryExecutor,
  store::{SqliteStore, StoreError},
  telemetry::{TelemetryPublisher, Transport},
  time::Clock,
  writer::{spawn_writer, EventWriter},
};

const STATUS_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GatewayError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("event store startup failure: {0}")]
  Store(#[from] StoreError),
  #[error("startup I/O failure: {0}")]
  Io(#[from] io::Error),
  #[error("the gateway event loop is not responding")]
  Unresponsive,
}

pub struct Gateway {
  control_tx: mio_channel::Sender<FleetCommand>,
  loop_join: Option<thread::JoinHandle<()>>,
  publisher: Option<TelemetryPublisher>,
  shut_down: bool,
}

impl Gateway {
  /// Validate the configuration, open the store, start the workers and
  /// the event loop. Any error here is a startup failure; after a
  /// successful return, operational errors are handled internally and
  /// never surface.
  pub fn start(
    cfg: GatewayConfig,
    radio: Arc<dyn RadioStack>,
    recovery: Arc<dyn RecoveryExecutor>,
    transport: Arc<dyn Transport>,
  ) -> Result<Gateway, GatewayError> {
    cfg.validate()?;
    let clock = Clock::new();

    let output_dir = PathBuf::from(&cfg.output.directory);
    fs::create_dir_all(&output_dir)?;
    let store = SqliteStore::open(output_dir.join(&cfg.output.database_filename))?;

    let publisher = TelemetryPublisher::spawn(&cfg.telemetry, transport);
    let telemetry = publisher.sender();

    let device_names: BTreeMap<_, _> = cfg
      .enabled_devices()
      .into_iter()
      .map(|d| (d.number, d.name))
      .collect();
    let (writer_events_tx, writer_events_rx) = mio_channel::channel();
    let writer_handle = spawn_writer(
      EventWriter::new(output_dir, Box::new(store), clock),
      device_names,
      telemetry.clone(),
      writer_events_tx,
    );

    let (control_tx, control_rx) = mio_channel::channel();
    let coordinator = FleetCoordinator::new(
      cfg,
      clock,
      radio,
      recovery,
      writer_handle,
      telemetry,
      control_rx,
      writer_events_rx,
    )?;
    let loop_join = thread::Builder::new()
      .name("railwatch-fleet".to_string())
      .spawn(move || coordinator.run())?;

    Ok(Gateway {
      control_tx,
      loop_join: Some(loop_join),
      publisher: Some(publisher),
      shut_down: false,
    })
  }

  /// Snapshot of fleet state, answered by the event loop.
  pub fn status(&self) -> Result<FleetStatus, GatewayError> {
    let (reply_tx, reply_rx) = mpsc::channel();
    self
      .control_tx
      .send(FleetCommand::QueryStatus(reply_tx))
      .map_err(|_| GatewayError::Unresponsive)?;
    reply_rx
      .recv_timeout(STATUS_QUERY_TIMEOUT)
      .map_err(|_| GatewayError::Unresponsive)
  }

  /// Stop the detector (flushing any active recording), disconnect the
  /// fleet, drain the writer and the telemetry workers. Idempotent.
  pub fn shutdown(&mut self) {
    if self.shut_down {
      return;
    }
    self.shut_down = true;

    let _ = self.control_tx.send(FleetCommand::Shutdown);
    if let Some(join) = self.loop_join.take() {
      // The coordinator drops the writer handle on exit, which drains
      // pending event writes before this join returns.
      let _ = join.join();
    }
    if let Some(mut publisher) = self.publisher.take() {
      publisher.shutdown();
    }
    info!("gateway shut down");
  }
}

impl Drop for Gateway {
  fn drop(&mut self) {
    self.shutdown();
  }
}
