//! Event persistence.
//!
//! Consumes completed recordings on a worker thread — never on the
//! detector's callback path — and writes one directory per event:
//! per-device CSV series plus a metadata.json written last, whose
//! presence is the "event complete" marker. One row goes to the event
//! store; the end-of-event telemetry fans out after a successful save.

use std::{
  collections::BTreeMap,
  fs,
  io::Write,
  path::{Path, PathBuf},
  sync::mpsc,
  thread,
};

use chrono::SecondsFormat;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio_extras::channel as mio_channel;
use serde_json::json;
use thiserror::Error;

use crate::{
  config::DeviceNumber,
  detector::EventRecording,
  store::{EventRow, EventStore},
  telemetry::{ArchiveJob, EventNotice, TelemetrySender},
  time::Clock,
};

/// Free-space floor below which the writer warns (and continues).
const FREE_SPACE_WARN_BYTES: u64 = 100 * 1024 * 1024;

const CSV_HEADER: [&str; 10] = [
  "timestamp", "AccX", "AccY", "AccZ", "AngX", "AngY", "AngZ", "AsX", "AsY", "AsZ",
];

#[derive(Debug, Error)]
pub enum WriteError {
  #[error("event I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("event CSV error: {0}")]
  Csv(#[from] csv::Error),
  #[error("metadata write failed: {0}")]
  Metadata(std::io::Error),
}

/// Completion report sent back to the event loop.
#[derive(Debug)]
pub enum WriterEvent {
  Saved(SavedEvent),
  Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct SavedEvent {
  pub event_id: String,
  pub path: PathBuf,
  pub duration_s: f64,
  pub max_acceleration_g: f64,
  pub trigger_device: DeviceNumber,
  pub per_device: Vec<(DeviceNumber, usize)>,
}

pub struct EventWriter {
  output_dir: PathBuf,
  store: Box<dyn EventStore>,
  clock: Clock,
}

impl EventWriter {
  pub fn new(output_dir: impl Into<PathBuf>, store: Box<dyn EventStore>, clock: Clock) -> Self {
    EventWriter {
      output_dir: output_dir.into(),
      store,
      clock,
    }
  }

  /// Persist one recording: CSVs, metadata.json last, then the store
  /// row. Returns what was written for reporting.
  pub fn persist(&mut self, recording: &EventRecording) -> Result<SavedEvent, WriteError> {
    warn_if_low_space(&self.output_dir);

    let (event_id, event_dir) = self.claim_event_dir(recording)?;
    fs::create_dir_all(&event_dir)?;

    let mut per_device: Vec<(DeviceNumber, usize)> = Vec::new();
    for (device, series) in &recording.series {
      if series.is_empty() {
        continue;
      }
      self.write_device_csv(&event_dir, *device, series)?;
      per_device.push((*device, series.len()));
    }

    let duration_s = recording.duration_s();
    let max_acceleration_g = recording.max_acceleration_g();
    let trigger_wall = self.clock.wall(recording.trigger.at);

    let metadata = json!({
      "event_id": event_id,
      "trigger_device": recording.trigger.device.0,
      "trigger_time": trigger_wall.to_rfc3339_opts(SecondsFormat::Micros, true),
      "duration_seconds": duration_s,
      "threshold_g": recording.trigger.threshold_g,
      "max_acceleration_g": max_acceleration_g,
      "devices": per_device.iter().map(|(d, _)| d.0).collect::<Vec<u16>>(),
    });
    // metadata.json is written last: its presence marks the event
    // complete. A failure here leaves a visibly-incomplete directory
    // and skips the database insert.
    if let Err(e) = write_metadata(&event_dir, &metadata) {
      return Err(WriteError::Metadata(e));
    }

    let row = EventRow {
      event_id: event_id.clone(),
      start_time: trigger_wall,
      end_time: self.clock.wall(recording.end_time),
      duration_s,
      trigger_device: recording.trigger.device.0,
      max_acceleration_g,
      num_devices: per_device.len(),
      data_path: event_dir.display().to_string(),
      created_at: chrono::Utc::now(),
    };
    if let Err(e) = self.store.insert_event(&row) {
      // Files are on disk; the index row is the only loss.
      error!("event store insert failed for {event_id}: {e}");
    }

    Ok(SavedEvent {
      event_id,
      path: event_dir,
      duration_s,
      max_acceleration_g,
      trigger_device: recording.trigger.device,
      per_device,
    })
  }

  /// Event id from the trigger wall time, with a numeric suffix when
  /// the directory already exists. Once claimed the id never changes.
  fn claim_event_dir(&self, recording: &EventRecording) -> Result<(String, PathBuf), WriteError> {
    let wall = self.clock.wall(recording.trigger.at);
    let base = format!(
      "{}_{:03}",
      wall.format("%Y%m%d_%H%M%S"),
      wall.timestamp_subsec_millis()
    );
    let mut event_id = base.clone();
    let mut suffix = 0u32;
    loop {
      let dir = self.output_dir.join(format!("event_{event_id}"));
      if !dir.exists() {
        return Ok((event_id, dir));
      }
      suffix += 1;
      event_id = format!("{base}_{suffix}");
    }
  }

  fn write_device_csv(
    &self,
    event_dir: &Path,
    device: DeviceNumber,
    series: &[(crate::time::Timestamp, crate::sample::Sample)],
  ) -> Result<(), WriteError> {
    let path = event_dir.join(format!("device_{}.csv", device.0));
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(CSV_HEADER)?;
    for (at, sample) in series {
      let wall = self.clock.wall(*at);
      writer.write_record([
        wall.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        format!("{:.3}", sample.acc_x),
        format!("{:.3}", sample.acc_y),
        format!("{:.3}", sample.acc_z),
        format!("{:.3}", sample.angle_x),
        format!("{:.3}", sample.angle_y),
        format!("{:.3}", sample.angle_z),
        format!("{:.3}", sample.gyro_x),
        format!("{:.3}", sample.gyro_y),
        format!("{:.3}", sample.gyro_z),
      ])?;
    }
    writer.flush()?;
    Ok(())
  }
}

fn write_metadata(event_dir: &Path, metadata: &serde_json::Value) -> std::io::Result<()> {
  let mut file = fs::File::create(event_dir.join("metadata.json"))?;
  let text = serde_json::to_string_pretty(metadata).expect("metadata is valid json");
  file.write_all(text.as_bytes())?;
  file.sync_all()
}

#[cfg(unix)]
fn warn_if_low_space(dir: &Path) {
  match nix::sys::statvfs::statvfs(dir) {
    Ok(stat) => {
      let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
      if available < FREE_SPACE_WARN_BYTES {
        warn!(
          "low disk space under {}: {} MB free",
          dir.display(),
          available / (1024 * 1024)
        );
      }
    }
    Err(e) => debug!("statvfs on {} failed: {e}", dir.display()),
  }
}

#[cfg(not(unix))]
fn warn_if_low_space(_dir: &Path) {}

/// Handle held by the gateway; the detector's handoff endpoint.
pub struct EventWriterHandle {
  tx: Option<mpsc::Sender<EventRecording>>,
  join: Option<thread::JoinHandle<()>>,
}

impl EventWriterHandle {
  /// Move a completed recording to the worker. Returns immediately.
  pub fn submit(&self, recording: EventRecording) {
    if let Some(tx) = &self.tx {
      if tx.send(recording).is_err() {
        error!("event writer is gone; recording dropped");
      }
    }
  }

  /// Close the queue and wait for in-flight writes to finish.
  pub fn shutdown(&mut self) {
    self.tx = None;
    if let Some(join) = self.join.take() {
      let _ = join.join();
    }
  }
}

impl Drop for EventWriterHandle {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Start the writer worker.
///
/// `device_names` feeds the per-device summary notifications;
/// `events_tx` reports save outcomes back to the event loop.
pub fn spawn_writer(
  mut writer: EventWriter,
  device_names: BTreeMap<DeviceNumber, String>,
  telemetry: TelemetrySender,
  events_tx: mio_channel::Sender<WriterEvent>,
) -> EventWriterHandle {
  let (tx, rx) = mpsc::channel::<EventRecording>();
  let join = thread::Builder::new()
    .name("railwatch-writer".to_string())
    .spawn(move || {
      for recording in rx {
        match writer.persist(&recording) {
          Ok(saved) => {
            print_save_report(&saved);
            publish_saved(&telemetry, &saved, &device_names);
            let _ = events_tx.send(WriterEvent::Saved(saved));
          }
          Err(e) => {
            error!("failed to persist event: {e}");
            let _ = events_tx.send(WriterEvent::Failed {
              reason: e.to_string(),
            });
          }
        }
      }
    })
    .expect("writer worker spawn");
  EventWriterHandle {
    tx: Some(tx),
    join: Some(join),
  }
}

fn print_save_report(saved: &SavedEvent) {
  println!("\nEvent saved: {}", saved.event_id);
  println!("  Duration: {:.2} s", saved.duration_s);
  println!("  Max acceleration: {:.3} g", saved.max_acceleration_g);
  for (device, samples) in &saved.per_device {
    println!("  Device {device}: {samples} samples");
  }
  println!("  Path: {}", saved.path.display());
}

fn publish_saved(
  telemetry: &TelemetrySender,
  saved: &SavedEvent,
  device_names: &BTreeMap<DeviceNumber, String>,
) {
  telemetry.publish_event(EventNotice::End(json!({
    "event_id": saved.event_id,
    "duration_seconds": saved.duration_s,
    "max_acceleration_g": saved.max_acceleration_g,
    "trigger_device": saved.trigger_device.0,
    "num_devices": saved.per_device.len(),
  })));
  for (device, samples) in &saved.per_device {
    telemetry.publish_event(EventNotice::DeviceSummary(json!({
      "event_id": saved.event_id,
      "device": device.0,
      "name": device_names.get(device).cloned().unwrap_or_default(),
      "samples": samples,
    })));
  }
  telemetry.publish_archive(ArchiveJob {
    event_id: saved.event_id.clone(),
    directory: saved.path.clone(),
  });
}
