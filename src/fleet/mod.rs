//! Fleet coordinator: the single-threaded event loop that owns every
//! device supervisor, the detector and the calibrator.
//!
//! All business state lives on this thread. Everything else reaches it
//! through pollable channels: raw-byte queues from the radio callbacks,
//! worker completions from the (single) link worker, writer outcomes,
//! control commands, and a timer that carries every periodic action and
//! deadline. Fleet-wide policies that no single supervisor can enforce
//! alone — serial connects, the global reconnect throttle, recovery
//! escalation with cooldowns, the paused flag — live here too.

mod worker;

use std::{
  collections::{HashMap, VecDeque},
  io,
  sync::Arc,
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::{Events, Poll, PollOpt, Ready, Token};
use mio_extras::{channel as mio_channel, timer};
use serde::Serialize;
use serde_json::json;

use crate::{
  calibrator::{Calibrator, CalibratorAction},
  config::{DeviceNumber, GatewayConfig},
  detector::{Detector, DetectorOutcome, FleetView, TriggerSummary},
  link::{Link, RadioStack},
  queue::{byte_queue, ByteQueueSender},
  recovery::RecoveryExecutor,
  sample::Sample,
  supervisor::{DeviceSupervisor, HealthVerdict, LinkState, SupervisorEvent},
  telemetry::{EventNotice, TelemetrySender},
  time::{Clock, Timestamp},
  writer::{EventWriterHandle, WriterEvent},
};
use worker::ConnectFailure;

const CONTROL_TOKEN: Token = Token(0);
const TIMER_TOKEN: Token = Token(1);
const WORKER_TOKEN: Token = Token(2);
const WRITER_TOKEN: Token = Token(3);
const DEVICE_TOKEN_BASE: usize = 16;

/// Radio-callback byte queue depth, in notification slices.
const RAW_QUEUE_CAPACITY: usize = 100;
/// Pause after a successful connect before the next one starts.
const CONNECT_GAP_S: f64 = 1.0;
/// Cleanup-to-reconnect stabilization delay.
const RECONNECT_BACKOFF_S: f64 = 1.0;
/// Console status report period.
const STATUS_REPORT_S: f64 = 30.0;
/// Calibrator state machine tick.
const CALIBRATION_TICK_S: f64 = 1.0;
/// Quiet period after setting the paused flag before recovery runs.
const RECOVERY_PAUSE_SETTLE_S: f64 = 2.0;
/// Delay between recovery completion and clearing the paused flag.
const RECOVERY_RESUME_DELAY_S: f64 = 5.0;
/// Re-check period when an escalation is deferred by a sibling's
/// in-flight recovery.
const RECOVERY_BUSY_RETRY_S: f64 = 10.0;
/// Gap between per-device disconnects during shutdown.
const SHUTDOWN_GAP_S: f64 = 0.5;

fn device_token(slot: usize) -> Token {
  Token(DEVICE_TOKEN_BASE + slot)
}

/// Commands from the gateway handle.
pub enum FleetCommand {
  Shutdown,
  QueryStatus(std::sync::mpsc::Sender<FleetStatus>),
}

pub(crate) enum ConnectPhase {
  LinkEstablished,
  CharacteristicsDiscovered,
}

/// Completions posted by the link worker thread.
pub(crate) enum WorkerEvent {
  ConnectProgress {
    device: DeviceNumber,
    phase: ConnectPhase,
  },
  ConnectDone {
    device: DeviceNumber,
    result: Result<Box<dyn Link>, ConnectFailure>,
  },
  CleanupDone {
    device: DeviceNumber,
  },
  RecoveryDone {
    device: DeviceNumber,
    outcome: Result<crate::recovery::RecoveryOutcome, String>,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
  HealthPoll,
  StatusReport,
  HealthSnapshot,
  CalibrationTick,
  FirstSampleDeadline(DeviceNumber),
  ReconnectBackoff(DeviceNumber),
  NextInitialConnect,
  RecoveryPauseSettled(DeviceNumber),
  RecoveryResume(DeviceNumber),
  RecoveryRetry(DeviceNumber),
  ShutdownGap,
}

/// Per-device slice of a status report.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
  pub number: u16,
  pub name: String,
  pub state: String,
  pub ready: bool,
  pub last_sample_age_s: Option<f64>,
  pub consecutive_failures: u32,
  pub buffer_len: usize,
  pub buffer_capacity: usize,
  pub unhealthy_percentage: Option<f64>,
  pub bias_z: f64,
  pub samples_total: u64,
  pub current: Option<Sample>,
}

/// Snapshot answered to status queries and shipped as the health
/// telemetry payload.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
  pub uptime_s: f64,
  pub recording: bool,
  pub paused: bool,
  pub total_events: u64,
  pub connect_attempts: u64,
  pub connect_failures: u64,
  pub devices: Vec<DeviceStatus>,
}

/// `FleetView` over the supervisor array, for the detector.
struct SupervisorsView<'a>(&'a [DeviceSupervisor]);

impl FleetView for SupervisorsView<'_> {
  fn device_numbers(&self) -> Vec<DeviceNumber> {
    self.0.iter().map(|s| s.number()).collect()
  }

  fn ready_devices(&self) -> Vec<DeviceNumber> {
    self
      .0
      .iter()
      .filter(|s| s.is_ready())
      .map(|s| s.number())
      .collect()
  }

  fn ring_snapshot(&self, device: DeviceNumber) -> Vec<(Timestamp, Sample)> {
    self
      .0
      .iter()
      .find(|s| s.number() == device)
      .map(|s| s.ring_snapshot())
      .unwrap_or_default()
  }
}

pub struct FleetCoordinator {
  clock: Clock,
  cfg: GatewayConfig,
  poll: Poll,
  timer: timer::Timer<TimerEvent>,
  control_rx: mio_channel::Receiver<FleetCommand>,
  worker_tx: mio_channel::Sender<WorkerEvent>,
  worker_rx: mio_channel::Receiver<WorkerEvent>,
  writer_rx: mio_channel::Receiver<WriterEvent>,
  radio: Arc<dyn RadioStack>,
  recovery: Arc<dyn RecoveryExecutor>,
  writer: EventWriterHandle,
  telemetry: TelemetrySender,
  supervisors: Vec<DeviceSupervisor>,
  detector: Detector,
  calibrator: Calibrator,

  /// Fleet-wide connect exclusion: the device currently holding the
  /// connect/reconnect/cleanup slot. Nothing else may start link work
  /// while this is occupied.
  connect_slot: Option<DeviceNumber>,
  pending_reconnects: VecDeque<DeviceNumber>,
  last_reconnect_start: Option<Timestamp>,
  initial_queue: VecDeque<DeviceNumber>,
  initial_phase: bool,
  /// Radio operations paused for host-radio recovery: suspends health
  /// checks and all reconnect dispatch.
  paused: bool,
  shutting_down: bool,
  /// Devices still awaiting their shutdown teardown, ascending.
  shutdown_queue: VecDeque<DeviceNumber>,
  /// The device whose shutdown teardown is on the cleanup worker.
  shutdown_pending: Option<DeviceNumber>,
  /// Set once the last teardown finished; the event loop exits on it.
  shutdown_complete: bool,

  last_recovery_per_device: HashMap<DeviceNumber, Timestamp>,
  last_recovery_global: Option<Timestamp>,
  recovery_rounds: HashMap<DeviceNumber, u32>,
  first_sample_deadlines: HashMap<DeviceNumber, timer::Timeout>,

  total_events: u64,
  connect_attempts: u64,
  connect_failures: u64,
}

impl FleetCoordinator {
  pub fn new(
    cfg: GatewayConfig,
    clock: Clock,
    radio: Arc<dyn RadioStack>,
    recovery: Arc<dyn RecoveryExecutor>,
    writer: EventWriterHandle,
    telemetry: TelemetrySender,
    control_rx: mio_channel::Receiver<FleetCommand>,
    writer_rx: mio_channel::Receiver<WriterEvent>,
  ) -> io::Result<Self> {
    let poll = Poll::new()?;
    let timer = timer::Builder::default()
      .tick_duration(Duration::from_millis(10))
      .build();
    let (worker_tx, worker_rx) = mio_channel::channel();

    poll.register(&control_rx, CONTROL_TOKEN, Ready::readable(), PollOpt::edge())?;
    poll.register(&timer, TIMER_TOKEN, Ready::readable(), PollOpt::edge())?;
    poll.register(&worker_rx, WORKER_TOKEN, Ready::readable(), PollOpt::edge())?;
    poll.register(&writer_rx, WRITER_TOKEN, Ready::readable(), PollOpt::edge())?;

    let ring_capacity = cfg.buffer.ring_capacity();
    let health_window = cfg.health_monitoring.sliding_window_size;
    let supervisors: Vec<DeviceSupervisor> = cfg
      .enabled_devices()
      .iter()
      .map(|d| DeviceSupervisor::new(d, ring_capacity, health_window))
      .collect();
    let initial_queue: VecDeque<DeviceNumber> =
      supervisors.iter().map(|s| s.number()).collect();

    let now = clock.now();
    Ok(FleetCoordinator {
      detector: Detector::new(cfg.detection.clone()),
      calibrator: Calibrator::new(cfg.calibration.clone(), now),
      clock,
      cfg,
      poll,
      timer,
      control_rx,
      worker_tx,
      worker_rx,
      writer_rx,
      radio,
      recovery,
      writer,
      telemetry,
      supervisors,
      connect_slot: None,
      pending_reconnects: VecDeque::new(),
      last_reconnect_start: None,
      initial_queue,
      initial_phase: true,
      paused: false,
      shutting_down: false,
      shutdown_queue: VecDeque::new(),
      shutdown_pending: None,
      shutdown_complete: false,
      last_recovery_per_device: HashMap::new(),
      last_recovery_global: None,
      recovery_rounds: HashMap::new(),
      first_sample_deadlines: HashMap::new(),
      total_events: 0,
      connect_attempts: 0,
      connect_failures: 0,
    })
  }

  /// The event loop. Returns only after a shutdown command completed.
  pub fn run(mut self) {
    info!(
      "fleet coordinator starting: {} device(s)",
      self.supervisors.len()
    );
    self.arm_timer(TimerEvent::HealthPoll, self.cfg.health_monitoring.check_interval_s);
    self.arm_timer(TimerEvent::StatusReport, STATUS_REPORT_S);
    self.arm_timer(TimerEvent::CalibrationTick, CALIBRATION_TICK_S);
    if self.cfg.telemetry.health.enabled {
      self.arm_timer(TimerEvent::HealthSnapshot, self.cfg.telemetry.health.interval_s);
    }
    println!(
      "Connecting {} device(s) sequentially...",
      self.supervisors.len()
    );
    self.start_next_initial_connect();

    let mut events = Events::with_capacity(128);
    loop {
      if let Err(e) = self.poll.poll(&mut events, None) {
        error!("poll failed: {e}");
        break;
      }
      for event in &events {
        match event.token() {
          CONTROL_TOKEN => self.handle_control(),
          TIMER_TOKEN => {
            while let Some(timer_event) = self.timer.poll() {
              self.handle_timer(timer_event);
            }
          }
          WORKER_TOKEN => {
            while let Ok(worker_event) = self.worker_rx.try_recv() {
              self.handle_worker(worker_event);
            }
          }
          WRITER_TOKEN => {
            while let Ok(writer_event) = self.writer_rx.try_recv() {
              self.handle_writer(writer_event);
            }
          }
          Token(t) if t >= DEVICE_TOKEN_BASE => {
            self.handle_device_data(t - DEVICE_TOKEN_BASE);
          }
          Token(t) => trace!("spurious token {t}"),
        }
      }
      if self.shutdown_complete {
        info!("fleet shutdown complete");
        return;
      }
    }
  }

  // ---- dispatch -------------------------------------------------

  /// Status queries keep being answered while a shutdown teardown is
  /// in progress; the loop exits only once the last device is down.
  fn handle_control(&mut self) {
    while let Ok(command) = self.control_rx.try_recv() {
      match command {
        FleetCommand::Shutdown => self.begin_shutdown(),
        FleetCommand::QueryStatus(reply) => {
          let _ = reply.send(self.status());
        }
      }
    }
  }

  fn handle_timer(&mut self, event: TimerEvent) {
    match event {
      TimerEvent::HealthPoll => {
        self.arm_timer(TimerEvent::HealthPoll, self.cfg.health_monitoring.check_interval_s);
        if !self.paused && !self.shutting_down {
          self.poll_health();
        }
        self.try_dispatch_reconnect();
      }
      TimerEvent::StatusReport => {
        self.arm_timer(TimerEvent::StatusReport, STATUS_REPORT_S);
        self.print_status();
      }
      TimerEvent::HealthSnapshot => {
        self.arm_timer(TimerEvent::HealthSnapshot, self.cfg.telemetry.health.interval_s);
        let payload = serde_json::to_value(self.status()).unwrap_or_else(|_| json!({}));
        self.telemetry.publish_health(payload);
      }
      TimerEvent::CalibrationTick => {
        self.arm_timer(TimerEvent::CalibrationTick, CALIBRATION_TICK_S);
        self.run_calibrator();
      }
      TimerEvent::FirstSampleDeadline(device) => self.on_first_sample_deadline(device),
      TimerEvent::ReconnectBackoff(device) => self.on_backoff_elapsed(device),
      TimerEvent::NextInitialConnect => self.start_next_initial_connect(),
      TimerEvent::RecoveryPauseSettled(device) => self.on_recovery_pause_settled(device),
      TimerEvent::RecoveryResume(device) => self.on_recovery_resume(device),
      TimerEvent::RecoveryRetry(device) => self.attempt_escalation(device),
      TimerEvent::ShutdownGap => self.advance_shutdown(),
    }
  }

  fn handle_worker(&mut self, event: WorkerEvent) {
    match event {
      WorkerEvent::ConnectProgress { device, phase } => {
        if let Some(slot) = self.slot_of(device) {
          let sup = &mut self.supervisors[slot];
          match phase {
            ConnectPhase::LinkEstablished => {
              sup.transition(SupervisorEvent::LinkEstablished);
            }
            ConnectPhase::CharacteristicsDiscovered => {
              sup.transition(SupervisorEvent::CharacteristicsDiscovered);
            }
          }
        }
      }
      WorkerEvent::ConnectDone { device, result } => self.on_connect_done(device, result),
      WorkerEvent::CleanupDone { device } => self.on_cleanup_done(device),
      WorkerEvent::RecoveryDone { device, outcome } => {
        match outcome {
          Ok(kind) => info!("host-radio recovery for device {device} finished: {kind:?}"),
          Err(e) => error!("host-radio recovery for device {device} failed: {e}"),
        }
        self.arm_timer(TimerEvent::RecoveryResume(device), RECOVERY_RESUME_DELAY_S);
      }
    }
  }

  fn handle_writer(&mut self, event: WriterEvent) {
    match event {
      WriterEvent::Saved(saved) => {
        self.total_events += 1;
        info!(
          "event {} persisted ({} devices, {:.2} s, max {:.3} g)",
          saved.event_id,
          saved.per_device.len(),
          saved.duration_s,
          saved.max_acceleration_g
        );
      }
      WriterEvent::Failed { reason } => {
        error!("event persistence failed: {reason}");
      }
    }
  }

  // ---- sample path ----------------------------------------------

  fn handle_device_data(&mut self, slot: usize) {
    if slot >= self.supervisors.len() {
      return;
    }
    let awaiting_first = self.supervisors[slot].state() == LinkState::AwaitingFirstSample;
    let samples = self.supervisors[slot].drain_samples(self.cfg.health_monitoring.data_timeout_s);
    if samples.is_empty() {
      return;
    }
    if awaiting_first {
      self.on_first_sample(slot);
    }
    if self.supervisors[slot].state() != LinkState::Ready {
      // Bytes from a link mid-teardown; history is updated, but the
      // detector only sees ready devices.
      return;
    }

    let device = self.supervisors[slot].number();
    let bias = self.supervisors[slot].bias_z();
    for (at, sample) in samples {
      let outcome = {
        let view = SupervisorsView(&self.supervisors);
        self.detector.on_sample(device, at, &sample, bias, &view)
      };
      match outcome {
        DetectorOutcome::None => {}
        DetectorOutcome::Triggered(summary) => self.on_triggered(at, summary),
        DetectorOutcome::Completed(recording) => {
          info!(
            "recording complete: {} samples over {:.2} s",
            recording.total_samples(),
            recording.duration_s()
          );
          // Move semantics: the writer owns the snapshot from here on.
          self.writer.submit(recording);
        }
      }
      if self.calibrator.is_sampling() {
        self.calibrator.on_sample(device, at, &sample);
      }
    }
  }

  fn on_triggered(&mut self, at: Timestamp, summary: TriggerSummary) {
    self.calibrator.abort(at);
    let wall = self.clock.wall(summary.trigger.at);
    println!("\nTRAIN DETECTED!");
    println!("  Device: {}", summary.trigger.device);
    println!("  Time: {}", wall.format("%Y-%m-%d %H:%M:%S%.3f"));
    println!("  Magnitude: {:.3} g", summary.trigger.magnitude_z);
    for (device, samples) in &summary.preroll {
      println!("  Captured {samples} pre-roll samples from device {device}");
    }
    self.telemetry.publish_event(EventNotice::Start(json!({
      "trigger_device": summary.trigger.device.0,
      "trigger_time": wall.to_rfc3339(),
      "magnitude_z_g": summary.trigger.magnitude_z,
      "threshold_g": summary.trigger.threshold_g,
      "preroll": summary
        .preroll
        .iter()
        .map(|(d, n)| json!({"device": d.0, "samples": n}))
        .collect::<Vec<_>>(),
    })));
  }

  fn run_calibrator(&mut self) {
    if self.shutting_down {
      return;
    }
    let now = self.clock.now();
    let ready: Vec<DeviceNumber> = self
      .supervisors
      .iter()
      .filter(|s| s.is_ready())
      .map(|s| s.number())
      .collect();
    match self.calibrator.poll(now, &ready, self.detector.is_idle()) {
      CalibratorAction::None => {}
      CalibratorAction::Apply(biases) => {
        for sup in &mut self.supervisors {
          if let Some(bias) = biases.get(&sup.number()) {
            sup.set_bias_z(*bias);
          }
        }
      }
      CalibratorAction::Rejected { device, std_dev } => {
        debug!("calibration rejected by device {device} (std-dev {std_dev:.3} g)");
      }
    }
  }

  // ---- connect orchestration ------------------------------------

  fn slot_of(&self, device: DeviceNumber) -> Option<usize> {
    self.supervisors.iter().position(|s| s.number() == device)
  }

  fn start_next_initial_connect(&mut self) {
    if self.shutting_down || self.paused || self.connect_slot.is_some() {
      return;
    }
    while let Some(device) = self.initial_queue.pop_front() {
      let Some(slot) = self.slot_of(device) else {
        continue;
      };
      if self.supervisors[slot].state() != LinkState::Disconnected {
        continue;
      }
      println!(
        "Connecting device {} ({})...",
        device,
        self.supervisors[slot].address()
      );
      self.supervisors[slot].transition(SupervisorEvent::ConnectRequested);
      self.begin_connect(slot);
      return;
    }
    self.maybe_finish_initial_phase();
  }

  fn maybe_finish_initial_phase(&mut self) {
    if !self.initial_phase || !self.initial_queue.is_empty() || self.connect_slot.is_some() {
      return;
    }
    self.initial_phase = false;
    let ready: Vec<String> = self
      .supervisors
      .iter()
      .filter(|s| s.is_ready())
      .map(|s| format!("{} ({})", s.number(), s.name()))
      .collect();
    println!(
      "\nFleet ready: {}/{} device(s) connected",
      ready.len(),
      self.supervisors.len()
    );
    for line in &ready {
      println!("  Device {line}");
    }
    println!(
      "Detection active: threshold {:.2} g\n",
      self.cfg.detection.threshold_g
    );
  }

  /// Spawn the connect worker for `slot`. The caller has already moved
  /// the supervisor into CONNECTING and must have the slot free.
  fn begin_connect(&mut self, slot: usize) {
    let device = self.supervisors[slot].number();
    debug_assert!(self.connect_slot.is_none() || self.connect_slot == Some(device));
    self.connect_slot = Some(device);
    self.connect_attempts += 1;

    let (queue_tx, queue_rx): (ByteQueueSender, _) = byte_queue(RAW_QUEUE_CAPACITY, self.clock);
    if let Err(e) = self.poll.register(
      &queue_rx,
      device_token(slot),
      Ready::readable(),
      PollOpt::edge(),
    ) {
      error!("device {device}: queue registration failed: {e}");
    }
    self.supervisors[slot].attach_queue(queue_rx);

    worker::spawn_connect(
      Arc::clone(&self.radio),
      device,
      self.supervisors[slot].address().to_string(),
      self.cfg.timeouts.clone(),
      self.cfg.buffer.sample_rate_hz,
      queue_tx,
      self.worker_tx.clone(),
    );
  }

  fn on_connect_done(
    &mut self,
    device: DeviceNumber,
    result: Result<Box<dyn Link>, ConnectFailure>,
  ) {
    let Some(slot) = self.slot_of(device) else {
      return;
    };
    if self.shutting_down {
      // Too late to be useful; tear a fresh link straight down.
      if let Ok(link) = result {
        worker::spawn_cleanup(
          device,
          Some(link),
          self.cfg.timeouts.clone(),
          self.worker_tx.clone(),
        );
      }
      return;
    }
    match result {
      Ok(link) => {
        self.supervisors[slot].attach_link(link);
        // The worker has subscribed; now the stream has to prove
        // itself before the device counts as connected.
        let deadline = self.arm_timer(
          TimerEvent::FirstSampleDeadline(device),
          self.cfg.timeouts.first_sample_s,
        );
        self.first_sample_deadlines.insert(device, deadline);
      }
      Err(failure) => {
        warn!(
          "device {device}: connect failed during {}: {}",
          failure.phase, failure.error
        );
        if self.initial_phase {
          println!("Device {device}: connect failed ({})", failure.error);
        }
        self.connect_failures += 1;
        self.supervisors[slot].transition(SupervisorEvent::ConnectAttemptFailed);
        self.release_queue(slot);
        self.connect_slot = None;
        let failures = self.supervisors[slot].record_failure();
        if failures >= self.cfg.health_monitoring.max_consecutive_failures {
          self.supervisors[slot].transition(SupervisorEvent::FailureLimitReached);
          self.attempt_escalation(device);
        }
        if self.initial_phase {
          self.arm_timer(TimerEvent::NextInitialConnect, CONNECT_GAP_S);
        } else {
          self.try_dispatch_reconnect();
        }
      }
    }
  }

  fn on_first_sample(&mut self, slot: usize) {
    let device = self.supervisors[slot].number();
    if let Some(deadline) = self.first_sample_deadlines.remove(&device) {
      self.timer.cancel_timeout(&deadline);
    }
    self.supervisors[slot].transition(SupervisorEvent::FirstSampleReceived);
    self.connect_slot = None;
    info!("device {device}: READY (data flowing)");
    if self.initial_phase {
      println!("Device {device}: READY");
      self.arm_timer(TimerEvent::NextInitialConnect, CONNECT_GAP_S);
    }
  }

  fn on_first_sample_deadline(&mut self, device: DeviceNumber) {
    let Some(slot) = self.slot_of(device) else {
      return;
    };
    self.first_sample_deadlines.remove(&device);
    if self.shutting_down || self.supervisors[slot].state() != LinkState::AwaitingFirstSample {
      return;
    }
    warn!("device {device}: no first sample within {} s", self.cfg.timeouts.first_sample_s);
    if self.initial_phase {
      println!("Device {device}: connect failed (no data)");
    }
    self.connect_failures += 1;
    self.supervisors[slot].transition(SupervisorEvent::ConnectAttemptFailed);
    let failures = self.supervisors[slot].record_failure();
    if failures >= self.cfg.health_monitoring.max_consecutive_failures {
      self.supervisors[slot].transition(SupervisorEvent::FailureLimitReached);
    }
    // The link exists and is subscribed: full ordered cleanup, keeping
    // the connect slot until it finishes.
    self.begin_cleanup(slot);
  }

  /// Cancel the byte-queue consumer and hand the link to the cleanup
  /// worker. The connect slot stays held for the duration.
  fn begin_cleanup(&mut self, slot: usize) {
    let device = self.supervisors[slot].number();
    self.connect_slot = Some(device);
    self.release_queue(slot);
    let (link, _queue) = self.supervisors[slot].detach_for_cleanup();
    worker::spawn_cleanup(device, link, self.cfg.timeouts.clone(), self.worker_tx.clone());
  }

  fn release_queue(&mut self, slot: usize) {
    if let Some(queue) = self.supervisors[slot].queue() {
      if let Err(e) = self.poll.deregister(queue) {
        debug!("queue deregister: {e}");
      }
    }
  }

  fn on_cleanup_done(&mut self, device: DeviceNumber) {
    if self.shutting_down {
      self.on_shutdown_cleanup_done(device);
      return;
    }
    let Some(slot) = self.slot_of(device) else {
      return;
    };
    match self.supervisors[slot].state() {
      LinkState::Reconnecting => {
        // Backoff before the fresh attempt; the slot stays ours so no
        // sibling can squeeze a connect in between.
        self.arm_timer(TimerEvent::ReconnectBackoff(device), RECONNECT_BACKOFF_S);
      }
      LinkState::Failed => {
        self.connect_slot = None;
        self.attempt_escalation(device);
      }
      _ => {
        self.connect_slot = None;
        if self.initial_phase {
          self.arm_timer(TimerEvent::NextInitialConnect, CONNECT_GAP_S);
        } else {
          self.try_dispatch_reconnect();
        }
      }
    }
  }

  fn on_backoff_elapsed(&mut self, device: DeviceNumber) {
    let Some(slot) = self.slot_of(device) else {
      return;
    };
    if self.supervisors[slot].state() != LinkState::Reconnecting {
      return;
    }
    if self.paused || self.shutting_down {
      // Recovery owns the radio; the reconnect is re-queued once the
      // pause lifts.
      self.connect_slot = None;
      self.pending_reconnects.push_back(device);
      return;
    }
    self.supervisors[slot].transition(SupervisorEvent::BackoffElapsed);
    self.begin_connect(slot);
  }

  // ---- health / reconnect policy --------------------------------

  fn poll_health(&mut self) {
    let now = self.clock.now();
    let mut wants_reconnect: Vec<DeviceNumber> = Vec::new();
    for sup in &mut self.supervisors {
      match sup.state() {
        LinkState::Ready => {
          if sup
            .last_sample_age(now)
            .map(|age| age > self.cfg.health_monitoring.data_timeout_s)
            .unwrap_or(false)
          {
            sup.record_missed_interval(now);
          }
          match sup.health_verdict(now, &self.cfg.health_monitoring) {
            HealthVerdict::Healthy => {}
            HealthVerdict::Stale { age_s } => {
              warn!(
                "device {}: stale ({age_s:.1} s without data), reconnecting",
                sup.number()
              );
              wants_reconnect.push(sup.number());
            }
            HealthVerdict::WindowUnhealthy { percentage } => {
              warn!(
                "device {}: sliding window {percentage:.0}% unhealthy, reconnecting",
                sup.number()
              );
              wants_reconnect.push(sup.number());
            }
          }
        }
        LinkState::Disconnected => {
          if !self.initial_phase {
            wants_reconnect.push(sup.number());
          }
        }
        _ => {}
      }
    }
    for device in wants_reconnect {
      self.request_reconnect(device);
    }
  }

  fn request_reconnect(&mut self, device: DeviceNumber) {
    if self.shutting_down
      || self.paused
      || self.connect_slot == Some(device)
      || self.pending_reconnects.contains(&device)
    {
      return;
    }
    debug!("device {device}: reconnect queued");
    self.pending_reconnects.push_back(device);
  }

  /// Start at most one queued reconnect, respecting the fleet-wide
  /// connect exclusion and the global reconnect throttle.
  fn try_dispatch_reconnect(&mut self) {
    if self.shutting_down || self.paused || self.connect_slot.is_some() {
      return;
    }
    let now = self.clock.now();
    if let Some(last) = self.last_reconnect_start {
      if now.since(last) < self.cfg.reconnect.global_cooldown_s {
        return;
      }
    }
    while let Some(device) = self.pending_reconnects.pop_front() {
      let Some(slot) = self.slot_of(device) else {
        continue;
      };
      match self.supervisors[slot].state() {
        LinkState::Ready => {
          self.last_reconnect_start = Some(now);
          self.supervisors[slot].transition(SupervisorEvent::ConnectionLost);
          self.begin_cleanup(slot);
          return;
        }
        LinkState::Disconnected => {
          self.last_reconnect_start = Some(now);
          self.supervisors[slot].transition(SupervisorEvent::ConnectRequested);
          self.begin_connect(slot);
          return;
        }
        LinkState::Reconnecting => {
          // Parked here by a recovery pause after its cleanup finished;
          // the backoff has long elapsed.
          self.last_reconnect_start = Some(now);
          self.supervisors[slot].transition(SupervisorEvent::BackoffElapsed);
          self.begin_connect(slot);
          return;
        }
        // Anything else is already being handled.
        _ => continue,
      }
    }
  }

  // ---- host-radio recovery escalation ---------------------------

  fn attempt_escalation(&mut self, device: DeviceNumber) {
    let Some(slot) = self.slot_of(device) else {
      return;
    };
    if self.supervisors[slot].state() != LinkState::Failed || self.shutting_down {
      return;
    }
    if self.paused {
      // A sibling's recovery is in flight; check back later.
      self.arm_timer(TimerEvent::RecoveryRetry(device), RECOVERY_BUSY_RETRY_S);
      return;
    }
    let rounds = self.recovery_rounds.get(&device).copied().unwrap_or(0);
    if rounds >= self.cfg.reconnect.max_retries {
      error!(
        "device {device}: {rounds} recovery rounds exhausted; leaving FAILED until restart"
      );
      return;
    }

    let now = self.clock.now();
    let per_device_wait = self
      .last_recovery_per_device
      .get(&device)
      .map(|last| self.cfg.reconnect.os_cleanup_cooldown_s - now.since(*last))
      .unwrap_or(0.0);
    let global_wait = self
      .last_recovery_global
      .map(|last| self.cfg.reconnect.os_cleanup_global_cooldown_s - now.since(last))
      .unwrap_or(0.0);
    let wait = per_device_wait.max(global_wait);
    if wait > 0.0 {
      info!(
        "device {device}: host-radio recovery deferred {:.0} s by cooldown",
        wait
      );
      self.arm_timer(TimerEvent::RecoveryRetry(device), wait + 0.1);
      return;
    }

    // Quiesce the fleet before touching the OS radio state: no health
    // checks, no reconnects, until the recovery resumes us.
    warn!("device {device}: escalating to host-radio recovery; radio operations paused");
    self.paused = true;
    self.recovery_rounds.insert(device, rounds + 1);
    self.arm_timer(TimerEvent::RecoveryPauseSettled(device), RECOVERY_PAUSE_SETTLE_S);
  }

  fn on_recovery_pause_settled(&mut self, device: DeviceNumber) {
    let Some(slot) = self.slot_of(device) else {
      return;
    };
    if self.shutting_down {
      return;
    }
    let now = self.clock.now();
    self.last_recovery_per_device.insert(device, now);
    self.last_recovery_global = Some(now);
    worker::spawn_recovery(
      Arc::clone(&self.recovery),
      device,
      self.supervisors[slot].address().to_string(),
      self.worker_tx.clone(),
    );
  }

  fn on_recovery_resume(&mut self, device: DeviceNumber) {
    self.paused = false;
    if let Some(slot) = self.slot_of(device) {
      self.supervisors[slot].reset_failures();
      self.supervisors[slot].transition(SupervisorEvent::RecoveryComplete);
    }
    info!("radio operations resumed after recovery of device {device}");
    self.request_reconnect(device);
    if self.initial_phase {
      // A recovery during the startup sequence left the rest of the
      // fleet waiting.
      self.start_next_initial_connect();
    }
    self.try_dispatch_reconnect();
  }

  // ---- status & shutdown ----------------------------------------

  pub fn status(&self) -> FleetStatus {
    let now = self.clock.now();
    FleetStatus {
      uptime_s: now.as_secs_f64(),
      recording: self.detector.is_recording(),
      paused: self.paused,
      total_events: self.total_events,
      connect_attempts: self.connect_attempts,
      connect_failures: self.connect_failures,
      devices: self
        .supervisors
        .iter()
        .map(|sup| DeviceStatus {
          number: sup.number().0,
          name: sup.name().to_string(),
          state: sup.state().to_string(),
          ready: sup.is_ready(),
          last_sample_age_s: sup.last_sample_age(now),
          consecutive_failures: sup.consecutive_failures(),
          buffer_len: sup.ring_len(),
          buffer_capacity: sup.ring_capacity(),
          unhealthy_percentage: sup.health_stats(now).map(|s| s.unhealthy_percentage),
          bias_z: sup.bias_z(),
          samples_total: sup.samples_total(),
          current: sup.current_sample(),
        })
        .collect(),
    }
  }

  fn print_status(&self) {
    let status = self.status();
    println!("\n==================== FLEET STATUS ====================");
    println!("Uptime: {:.1} h", status.uptime_s / 3600.0);
    println!("Total events: {}", status.total_events);
    println!(
      "Connects: {} attempts, {} failures",
      status.connect_attempts, status.connect_failures
    );
    if status.recording {
      println!("Recording: IN PROGRESS");
    }
    if status.paused {
      println!("Radio operations: PAUSED (recovery)");
    }
    for dev in &status.devices {
      println!(
        "  Device {}: {} (buffer {}/{}{})",
        dev.number,
        dev.state,
        dev.buffer_len,
        dev.buffer_capacity,
        dev
          .unhealthy_percentage
          .map(|p| format!(", window {p:.0}% unhealthy"))
          .unwrap_or_default()
      );
      if let Some(current) = &dev.current {
        println!(
          "    Acc: X={:6.3} g Y={:6.3} g Z={:6.3} g (bias {:.3})",
          current.acc_x, current.acc_y, current.acc_z, dev.bias_z
        );
      }
    }
    println!("======================================================\n");
  }

  /// Idempotent shutdown entry: flush any active recording, then
  /// disconnect supervisors in ascending device order with a settling
  /// gap. Each teardown runs on the cleanup worker and the gap on the
  /// timer; the loop stays responsive (including to status queries)
  /// until the last device is down.
  fn begin_shutdown(&mut self) {
    if self.shutting_down {
      return;
    }
    self.shutting_down = true;
    info!("shutting down fleet");

    if let Some(recording) = self.detector.flush(self.clock.now()) {
      info!("flushing in-progress recording to the writer");
      self.writer.submit(recording);
    }

    self.shutdown_queue = self.supervisors.iter().map(|s| s.number()).collect();
    self.advance_shutdown();
  }

  /// Hand the next linked device to the cleanup worker, or finish.
  /// Devices without a link have nothing to tear down and take no gap.
  fn advance_shutdown(&mut self) {
    while let Some(device) = self.shutdown_queue.pop_front() {
      let Some(slot) = self.slot_of(device) else {
        continue;
      };
      self.release_queue(slot);
      let (link, queue) = self.supervisors[slot].detach_for_cleanup();
      drop(queue);
      if link.is_some() {
        self.shutdown_pending = Some(device);
        worker::spawn_cleanup(device, link, self.cfg.timeouts.clone(), self.worker_tx.clone());
        return;
      }
    }
    self.shutdown_complete = true;
  }

  fn on_shutdown_cleanup_done(&mut self, device: DeviceNumber) {
    if self.shutdown_pending != Some(device) {
      // A teardown that was already in flight when the shutdown began;
      // the shutdown sequence is not waiting on it.
      return;
    }
    self.shutdown_pending = None;
    println!("Device {device}: disconnected");
    if self.shutdown_queue.is_empty() {
      self.shutdown_complete = true;
    } else {
      self.arm_timer(TimerEvent::ShutdownGap, SHUTDOWN_GAP_S);
    }
  }

  fn arm_timer(&mut self, event: TimerEvent, delay_s: f64) -> timer::Timeout {
    self
      .timer
      .set_timeout(Duration::from_secs_f64(delay_s.max(0.0)), event)
  }
}
