//! Software radio stack with simulated IMU sensors.
//!
//! Backs the integration test suite and the binary's `--simulate` mode:
//! each subscribed device streams plausible frames from its own thread
//! (reproducing the real stack's cross-thread callback dispatch), and a
//! [`SimControl`] handle injects vibration bursts and link faults at
//! runtime.

use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex,
  },
  thread,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  link::{
    Characteristic, DiscoveredCharacteristics, Link, LinkError, NotificationCallback, RadioStack,
    NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID,
  },
  sample::Sample,
  wire,
};

/// Stream shape of one simulated sensor.
#[derive(Debug, Clone)]
pub struct SimProfile {
  pub sample_rate_hz: f64,
  /// Resting Z reading, in g. Defaults to gravity for an upright mount.
  pub rest_acc_z_g: f64,
  /// Peak of the deterministic rest noise, in g.
  pub noise_g: f64,
  /// Split every eighth frame across two notifications to exercise the
  /// frame assembler.
  pub chunk_split: bool,
}

impl Default for SimProfile {
  fn default() -> Self {
    SimProfile {
      sample_rate_hz: 50.0,
      rest_acc_z_g: 1.0,
      noise_g: 0.02,
      chunk_split: true,
    }
  }
}

#[derive(Debug)]
struct Burst {
  amplitude_g: f64,
  samples_left: u64,
}

struct SimDevice {
  address: String,
  profile: SimProfile,
  /// Bumped on every successful connect; emitters from older
  /// generations exit on their next tick.
  generation: AtomicU64,
  connected: AtomicBool,
  stalled: AtomicBool,
  connect_attempts: AtomicU32,
  fail_connects: AtomicU32,
  missing_characteristics: AtomicBool,
  burst: Mutex<Option<Burst>>,
  written: Mutex<Vec<Vec<u8>>>,
}

/// Runtime control over one simulated sensor.
#[derive(Clone)]
pub struct SimControl {
  device: Arc<SimDevice>,
}

impl SimControl {
  /// Add `amplitude_g` to the Z axis for the next `duration_s` of
  /// stream time.
  pub fn start_burst(&self, amplitude_g: f64, duration_s: f64) {
    let samples = (duration_s * self.device.profile.sample_rate_hz).ceil() as u64;
    *self.device.burst.lock().unwrap() = Some(Burst {
      amplitude_g,
      samples_left: samples.max(1),
    });
  }

  /// Freeze the stream without dropping the link: the wedged-stack
  /// failure mode that staleness detection exists for. Persists across
  /// reconnects until [`SimControl::resume`].
  pub fn stall(&self) {
    self.device.stalled.store(true, Ordering::SeqCst);
  }

  pub fn resume(&self) {
    self.device.stalled.store(false, Ordering::SeqCst);
  }

  /// Fail the next `n` connect attempts with a stack error.
  pub fn fail_next_connects(&self, n: u32) {
    self.device.fail_connects.store(n, Ordering::SeqCst);
  }

  /// Make discovery report the notify characteristic as missing.
  pub fn refuse_characteristics(&self, refuse: bool) {
    self
      .device
      .missing_characteristics
      .store(refuse, Ordering::SeqCst);
  }

  pub fn connect_attempts(&self) -> u32 {
    self.device.connect_attempts.load(Ordering::SeqCst)
  }

  pub fn is_connected(&self) -> bool {
    self.device.connected.load(Ordering::SeqCst)
  }

  /// Register packets the gateway has written to this sensor.
  pub fn written_packets(&self) -> Vec<Vec<u8>> {
    self.device.written.lock().unwrap().clone()
  }
}

/// The simulated host radio stack.
pub struct SimulatedRadio {
  devices: Mutex<HashMap<String, Arc<SimDevice>>>,
}

impl SimulatedRadio {
  pub fn new() -> Self {
    SimulatedRadio {
      devices: Mutex::new(HashMap::new()),
    }
  }

  pub fn add_device(&self, address: &str, profile: SimProfile) -> SimControl {
    let device = Arc::new(SimDevice {
      address: address.to_string(),
      profile,
      generation: AtomicU64::new(0),
      connected: AtomicBool::new(false),
      stalled: AtomicBool::new(false),
      connect_attempts: AtomicU32::new(0),
      fail_connects: AtomicU32::new(0),
      missing_characteristics: AtomicBool::new(false),
      burst: Mutex::new(None),
      written: Mutex::new(Vec::new()),
    });
    self
      .devices
      .lock()
      .unwrap()
      .insert(address.to_string(), Arc::clone(&device));
    SimControl { device }
  }

  pub fn control(&self, address: &str) -> Option<SimControl> {
    self
      .devices
      .lock()
      .unwrap()
      .get(address)
      .map(|device| SimControl {
        device: Arc::clone(device),
      })
  }
}

impl Default for SimulatedRadio {
  fn default() -> Self {
    SimulatedRadio::new()
  }
}

impl RadioStack for SimulatedRadio {
  fn connect(&self, address: &str, _timeout: Duration) -> Result<Box<dyn Link>, LinkError> {
    let device = self
      .devices
      .lock()
      .unwrap()
      .get(address)
      .cloned()
      .ok_or_else(|| LinkError::Stack(format!("unknown address {address}")))?;

    device.connect_attempts.fetch_add(1, Ordering::SeqCst);

    let pending_failures = device.fail_connects.load(Ordering::SeqCst);
    if pending_failures > 0 {
      device
        .fail_connects
        .store(pending_failures - 1, Ordering::SeqCst);
      return Err(LinkError::Stack("simulated connect failure".to_string()));
    }

    let generation = device.generation.fetch_add(1, Ordering::SeqCst) + 1;
    device.connected.store(true, Ordering::SeqCst);
    debug!("sim: {} connected (generation {})", device.address, generation);

    Ok(Box::new(SimLink {
      device,
      generation,
      connected: true,
      stop: Arc::new(AtomicBool::new(false)),
      emitter: None,
    }))
  }
}

struct SimLink {
  device: Arc<SimDevice>,
  generation: u64,
  connected: bool,
  stop: Arc<AtomicBool>,
  emitter: Option<thread::JoinHandle<()>>,
}

impl SimLink {
  fn stop_emitter(&mut self) {
    self.stop.store(true, Ordering::SeqCst);
    if let Some(handle) = self.emitter.take() {
      let _ = handle.join();
    }
  }
}

impl Link for SimLink {
  fn discover_required_characteristics(
    &mut self,
    _service_uuid: &str,
    notify_uuid: &str,
    write_uuid: &str,
    _timeout: Duration,
  ) -> Result<DiscoveredCharacteristics, LinkError> {
    if !self.connected {
      return Err(LinkError::NotConnected);
    }
    if self.device.missing_characteristics.load(Ordering::SeqCst) {
      return Err(LinkError::CharacteristicMissing(notify_uuid.to_string()));
    }
    Ok(DiscoveredCharacteristics {
      notify: Characteristic(notify_uuid.to_string()),
      write: Characteristic(write_uuid.to_string()),
    })
  }

  fn subscribe_notifications(
    &mut self,
    characteristic: &Characteristic,
    callback: NotificationCallback,
    _timeout: Duration,
  ) -> Result<(), LinkError> {
    if !self.connected {
      return Err(LinkError::NotConnected);
    }
    if characteristic.0 != NOTIFY_CHARACTERISTIC_UUID {
      return Err(LinkError::CharacteristicMissing(characteristic.0.clone()));
    }
    if self.emitter.is_some() {
      return Err(LinkError::RadioBusy);
    }

    let device = Arc::clone(&self.device);
    let stop = Arc::clone(&self.stop);
    let generation = self.generation;
    let handle = thread::Builder::new()
      .name(format!("sim-imu-{}", device.address))
      .spawn(move || emitter_loop(device, generation, stop, callback))
      .map_err(|e| LinkError::Stack(format!("emitter spawn failed: {e}")))?;
    self.emitter = Some(handle);
    Ok(())
  }

  fn unsubscribe(&mut self, _timeout: Duration) -> Result<(), LinkError> {
    if !self.connected {
      return Err(LinkError::NotConnected);
    }
    self.stop_emitter();
    Ok(())
  }

  fn write(
    &mut self,
    characteristic: &Characteristic,
    payload: &[u8],
    _timeout: Duration,
  ) -> Result<(), LinkError> {
    if !self.connected {
      return Err(LinkError::NotConnected);
    }
    if characteristic.0 != WRITE_CHARACTERISTIC_UUID {
      return Err(LinkError::CharacteristicMissing(characteristic.0.clone()));
    }
    self.device.written.lock().unwrap().push(payload.to_vec());
    Ok(())
  }

  fn disconnect(&mut self, _timeout: Duration) -> Result<(), LinkError> {
    self.stop_emitter();
    if self.connected {
      self.connected = false;
      // Only the current link generation owns the connected flag.
      if self.device.generation.load(Ordering::SeqCst) == self.generation {
        self.device.connected.store(false, Ordering::SeqCst);
      }
    }
    Ok(())
  }
}

impl Drop for SimLink {
  fn drop(&mut self) {
    self.stop_emitter();
  }
}

fn emitter_loop(
  device: Arc<SimDevice>,
  generation: u64,
  stop: Arc<AtomicBool>,
  mut callback: NotificationCallback,
) {
  let profile = device.profile.clone();
  let period = Duration::from_secs_f64(1.0 / profile.sample_rate_hz.max(0.1));
  let mut next_emit = Instant::now() + period;
  // Deterministic per-link noise source.
  let mut noise_state: u64 = 0x9E37_79B9_7F4A_7C15 ^ generation;
  let mut frame_index: u64 = 0;

  loop {
    if stop.load(Ordering::SeqCst) || device.generation.load(Ordering::SeqCst) != generation {
      return;
    }
    let now = Instant::now();
    if next_emit > now {
      thread::sleep(next_emit - now);
    }
    next_emit += period;

    if device.stalled.load(Ordering::SeqCst) {
      continue;
    }

    let mut acc_z = profile.rest_acc_z_g + noise(&mut noise_state) * profile.noise_g;
    if let Some(burst) = device.burst.lock().unwrap().as_mut() {
      if burst.samples_left > 0 {
        acc_z += burst.amplitude_g;
        burst.samples_left -= 1;
      }
    }

    let sample = Sample {
      acc_x: noise(&mut noise_state) * profile.noise_g,
      acc_y: noise(&mut noise_state) * profile.noise_g,
      acc_z,
      ..Sample::ZERO
    };
    let frame = wire::frame_bytes(&sample);

    if profile.chunk_split && frame_index % 8 == 7 {
      callback(&frame[..9]);
      callback(&frame[9..]);
    } else {
      callback(&frame);
    }
    frame_index += 1;
  }
}

fn noise(state: &mut u64) -> f64 {
  *state = state
    .wrapping_mul(6364136223846793005)
    .wrapping_add(1442695040888963407);
  ((*state >> 33) as f64) / (u32::MAX >> 1) as f64 - 1.0
}
