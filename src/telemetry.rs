//! Fire-and-forget outbound telemetry.
//!
//! Three independent channels — health snapshots, event notifications,
//! event archive upload — each with its own worker thread, bounded
//! queue and endpoint. A full queue drops the payload, a failed request
//! bumps a counter and logs at debug level; nothing here ever blocks or
//! fails any other subsystem.

use std::{
  path::PathBuf,
  sync::{
    atomic::{AtomicU64, Ordering},
    mpsc::{self, SyncSender, TrySendError},
    Arc, Mutex,
  },
  thread,
  time::Duration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde_json::Value;
use thiserror::Error;

use crate::config::TelemetryConfig;

/// Queue depth per channel. Deep enough to ride out a slow endpoint,
/// small enough that stale health snapshots do not pile up.
const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("http error: {0}")]
  Http(String),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Outbound HTTP seam. The production implementation is a blocking
/// reqwest client; tests substitute a recorder.
pub trait Transport: Send + Sync {
  fn post_json(&self, url: &str, payload: &Value, timeout: Duration) -> Result<(), TransportError>;

  fn upload_file(
    &self,
    url: &str,
    file: &std::path::Path,
    fields: &[(String, String)],
    bearer_token: Option<&str>,
    timeout: Duration,
  ) -> Result<(), TransportError>;
}

pub struct HttpTransport {
  client: reqwest::blocking::Client,
}

impl HttpTransport {
  pub fn new() -> Self {
    HttpTransport {
      client: reqwest::blocking::Client::new(),
    }
  }
}

impl Default for HttpTransport {
  fn default() -> Self {
    HttpTransport::new()
  }
}

impl Transport for HttpTransport {
  fn post_json(&self, url: &str, payload: &Value, timeout: Duration) -> Result<(), TransportError> {
    self
      .client
      .post(url)
      .timeout(timeout)
      .json(payload)
      .send()
      .and_then(|response| response.error_for_status())
      .map_err(|e| TransportError::Http(e.to_string()))?;
    Ok(())
  }

  fn upload_file(
    &self,
    url: &str,
    file: &std::path::Path,
    fields: &[(String, String)],
    bearer_token: Option<&str>,
    timeout: Duration,
  ) -> Result<(), TransportError> {
    let mut form = reqwest::blocking::multipart::Form::new().file("file", file)?;
    for (key, value) in fields {
      form = form.text(key.clone(), value.clone());
    }
    let mut request = self.client.post(url).timeout(timeout).multipart(form);
    if let Some(token) = bearer_token {
      request = request.bearer_auth(token);
    }
    request
      .send()
      .and_then(|response| response.error_for_status())
      .map_err(|e| TransportError::Http(e.to_string()))?;
    Ok(())
  }
}

/// Per-event outbound notifications.
#[derive(Debug)]
pub enum EventNotice {
  Start(Value),
  End(Value),
  DeviceSummary(Value),
}

/// Upload request for a completed event directory.
#[derive(Debug)]
pub struct ArchiveJob {
  pub event_id: String,
  pub directory: PathBuf,
}

#[derive(Debug, Default)]
pub struct ChannelCounters {
  attempts: AtomicU64,
  failures: AtomicU64,
  dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
  pub attempts: u64,
  pub failures: u64,
  pub dropped: u64,
}

impl ChannelCounters {
  fn attempt(&self) {
    self.attempts.fetch_add(1, Ordering::Relaxed);
  }

  fn failure(&self) {
    self.failures.fetch_add(1, Ordering::Relaxed);
  }

  fn drop_payload(&self) {
    self.dropped.fetch_add(1, Ordering::Relaxed);
  }

  pub fn stats(&self) -> ChannelStats {
    ChannelStats {
      attempts: self.attempts.load(Ordering::Relaxed),
      failures: self.failures.load(Ordering::Relaxed),
      dropped: self.dropped.load(Ordering::Relaxed),
    }
  }
}

#[derive(Debug, Default)]
pub struct TelemetryCounters {
  pub health: ChannelCounters,
  pub event: ChannelCounters,
  pub archive: ChannelCounters,
}

/// Cheap cloneable handle other subsystems publish through.
#[derive(Clone)]
pub struct TelemetrySender {
  health: Option<SyncSender<Value>>,
  event: Option<SyncSender<EventNotice>>,
  archive: Option<SyncSender<ArchiveJob>>,
  counters: Arc<TelemetryCounters>,
}

impl TelemetrySender {
  /// A handle with every channel disabled; useful standalone in tests.
  pub fn disabled() -> Self {
    TelemetrySender {
      health: None,
      event: None,
      archive: None,
      counters: Arc::new(TelemetryCounters::default()),
    }
  }

  pub fn publish_health(&self, payload: Value) {
    Self::offer(&self.health, payload, &self.counters.health, "health");
  }

  pub fn publish_event(&self, notice: EventNotice) {
    Self::offer(&self.event, notice, &self.counters.event, "event");
  }

  pub fn publish_archive(&self, job: ArchiveJob) {
    Self::offer(&self.archive, job, &self.counters.archive, "archive");
  }

  pub fn counters(&self) -> &TelemetryCounters {
    &self.counters
  }

  fn offer<T>(
    sender: &Option<SyncSender<T>>,
    payload: T,
    counters: &ChannelCounters,
    channel: &str,
  ) {
    let Some(sender) = sender else {
      return;
    };
    match sender.try_send(payload) {
      Ok(()) => {}
      Err(TrySendError::Full(_)) => {
        counters.drop_payload();
        debug!("telemetry {channel} queue full, payload dropped");
      }
      Err(TrySendError::Disconnected(_)) => {
        counters.drop_payload();
        debug!("telemetry {channel} worker gone, payload dropped");
      }
    }
  }
}

/// Owns the worker threads. Dropping (or `shutdown`) closes the
/// publisher's own channel ends; workers drain and exit once every
/// cloned [`TelemetrySender`] is gone too.
pub struct TelemetryPublisher {
  sender: TelemetrySender,
  workers: Vec<thread::JoinHandle<()>>,
}

impl TelemetryPublisher {
  pub fn spawn(cfg: &TelemetryConfig, transport: Arc<dyn Transport>) -> Self {
    let counters = Arc::new(TelemetryCounters::default());
    let mut workers = Vec::new();

    let health = cfg.health.enabled.then(|| {
      let (tx, rx) = mpsc::sync_channel::<Value>(CHANNEL_CAPACITY);
      let url = cfg.health.url();
      let timeout = Duration::from_secs_f64(cfg.health.timeout_s);
      let transport = Arc::clone(&transport);
      let counters = Arc::clone(&counters);
      workers.push(spawn_worker("railwatch-telemetry-health", move || {
        for payload in rx {
          counters.health.attempt();
          if let Err(e) = transport.post_json(&url, &payload, timeout) {
            counters.health.failure();
            debug!("health snapshot upload failed: {e}");
          }
        }
      }));
      tx
    });

    let event = cfg.event.enabled.then(|| {
      let (tx, rx) = mpsc::sync_channel::<EventNotice>(CHANNEL_CAPACITY);
      let cfg_event = cfg.event.clone();
      let timeout = Duration::from_secs_f64(cfg_event.timeout_s);
      let transport = Arc::clone(&transport);
      let counters = Arc::clone(&counters);
      workers.push(spawn_worker("railwatch-telemetry-event", move || {
        for notice in rx {
          let (path, payload) = match &notice {
            EventNotice::Start(payload) => (&cfg_event.start_path, payload),
            EventNotice::End(payload) => (&cfg_event.end_path, payload),
            EventNotice::DeviceSummary(payload) => (&cfg_event.device_summary_path, payload),
          };
          let url = format!("{}{}", cfg_event.base_url, path);
          counters.event.attempt();
          if let Err(e) = transport.post_json(&url, payload, timeout) {
            counters.event.failure();
            debug!("event notification upload failed: {e}");
          }
        }
      }));
      tx
    });

    let archive = cfg.archive.enabled.then(|| {
      let (tx, rx) = mpsc::sync_channel::<ArchiveJob>(CHANNEL_CAPACITY);
      let cfg_archive = cfg.archive.clone();
      let timeout = Duration::from_secs_f64(cfg_archive.timeout_s);
      let settle = Duration::from_secs_f64(cfg_archive.settle_delay_s);
      let transport = Arc::clone(&transport);
      let counters = Arc::clone(&counters);
      workers.push(spawn_worker("railwatch-telemetry-archive", move || {
        for job in rx {
          // Let the writer finish flushing and the disk settle before
          // shipping the directory.
          thread::sleep(settle);
          counters.archive.attempt();
          if let Err(e) = upload_directory(&*transport, &cfg_archive, &job, timeout) {
            counters.archive.failure();
            debug!("archive upload of {} failed: {e}", job.event_id);
          } else {
            info!("event {} archived", job.event_id);
          }
        }
      }));
      tx
    });

    TelemetryPublisher {
      sender: TelemetrySender {
        health,
        event,
        archive,
        counters,
      },
      workers,
    }
  }

  pub fn sender(&self) -> TelemetrySender {
    self.sender.clone()
  }

  /// Close our channel ends and wait for the workers to drain. Any
  /// still-cloned sender keeps its channel open; callers drop those
  /// before shutting the publisher down.
  pub fn shutdown(&mut self) {
    self.sender.health = None;
    self.sender.event = None;
    self.sender.archive = None;
    for worker in self.workers.drain(..) {
      let _ = worker.join();
    }
  }
}

impl Drop for TelemetryPublisher {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn spawn_worker(name: &str, body: impl FnOnce() + Send + 'static) -> thread::JoinHandle<()> {
  thread::Builder::new()
    .name(name.to_string())
    .spawn(body)
    .expect("telemetry worker spawn")
}

fn upload_directory(
  transport: &dyn Transport,
  cfg: &crate::config::ArchiveConfig,
  job: &ArchiveJob,
  timeout: Duration,
) -> Result<(), TransportError> {
  let fields = vec![
    ("event_id".to_string(), job.event_id.clone()),
    ("folder_id".to_string(), cfg.folder_id.clone()),
  ];
  let token = (!cfg.api_token.is_empty()).then_some(cfg.api_token.as_str());
  let mut entries: Vec<PathBuf> = std::fs::read_dir(&job.directory)?
    .filter_map(|entry| entry.ok())
    .map(|entry| entry.path())
    .filter(|path| path.is_file())
    .collect();
  entries.sort();
  for file in entries {
    transport.upload_file(&cfg.url, &file, &fields, token, timeout)?;
  }
  Ok(())
}

// ----------------------------------------------
// ----------------------------------------------

/// Transport that records every call instead of talking to a network.
/// Used by the test suites and the simulated gateway mode.
#[derive(Default)]
pub struct RecordingTransport {
  pub posts: Mutex<Vec<(String, Value)>>,
  pub uploads: Mutex<Vec<(String, PathBuf)>>,
  pub fail: std::sync::atomic::AtomicBool,
}

impl RecordingTransport {
  pub fn new() -> Self {
    RecordingTransport::default()
  }

  pub fn post_count(&self) -> usize {
    self.posts.lock().unwrap().len()
  }

  fn check_fail(&self) -> Result<(), TransportError> {
    if self.fail.load(Ordering::SeqCst) {
      Err(TransportError::Http("injected failure".to_string()))
    } else {
      Ok(())
    }
  }
}

impl Transport for RecordingTransport {
  fn post_json(&self, url: &str, payload: &Value, _timeout: Duration) -> Result<(), TransportError> {
    self
      .posts
      .lock()
      .unwrap()
      .push((url.to_string(), payload.clone()));
    self.check_fail()
  }

  fn upload_file(
    &self,
    url: &str,
    file: &std::path::Path,
    _fields: &[(String, String)],
    _bearer_token: Option<&str>,
    _timeout: Duration,
  ) -> Result<(), TransportError> {
    self
      .uploads
      .lock()
      .unwrap()
      .push((url.to_string(), file.to_path_buf()));
    self.check_fail()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::config::{ArchiveConfig, EventEndpointConfig, HealthEndpointConfig};

  fn all_enabled() -> TelemetryConfig {
    TelemetryConfig {
      health: HealthEndpointConfig {
        enabled: true,
        ..HealthEndpointConfig::default()
      },
      event: EventEndpointConfig {
        enabled: true,
        ..EventEndpointConfig::default()
      },
      archive: ArchiveConfig {
        enabled: true,
        settle_delay_s: 0.0,
        ..ArchiveConfig::default()
      },
    }
  }

  fn drain(publisher: &mut TelemetryPublisher, sender: TelemetrySender) {
    drop(sender);
    publisher.shutdown();
  }

  #[test]
  fn health_posts_reach_the_configured_url() {
    let transport = Arc::new(RecordingTransport::new());
    let mut publisher = TelemetryPublisher::spawn(&all_enabled(), Arc::clone(&transport) as _);
    let sender = publisher.sender();

    sender.publish_health(json!({"devices": []}));
    drain(&mut publisher, sender);

    let posts = transport.posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "http://localhost:8000/api/imu/status");
  }

  #[test]
  fn event_notices_route_per_kind() {
    let transport = Arc::new(RecordingTransport::new());
    let mut publisher = TelemetryPublisher::spawn(&all_enabled(), Arc::clone(&transport) as _);
    let sender = publisher.sender();

    sender.publish_event(EventNotice::Start(json!({"event_id": "e"})));
    sender.publish_event(EventNotice::End(json!({"event_id": "e"})));
    sender.publish_event(EventNotice::DeviceSummary(json!({"device": 1})));
    drain(&mut publisher, sender);

    let urls: Vec<String> = transport
      .posts
      .lock()
      .unwrap()
      .iter()
      .map(|(url, _)| url.clone())
      .collect();
    assert_eq!(
      urls,
      vec![
        "http://localhost:8000/api/event/start",
        "http://localhost:8000/api/event/end",
        "http://localhost:8000/api/event/device",
      ]
    );
  }

  #[test]
  fn failures_count_and_do_not_propagate() {
    let transport = Arc::new(RecordingTransport::new());
    transport.fail.store(true, Ordering::SeqCst);
    let mut publisher = TelemetryPublisher::spawn(&all_enabled(), Arc::clone(&transport) as _);
    let sender = publisher.sender();

    sender.publish_health(json!({}));
    sender.publish_health(json!({}));
    let counters = Arc::clone(&sender.counters);
    drain(&mut publisher, sender);

    let stats = counters.health.stats();
    assert_eq!(stats.attempts, 2);
    assert_eq!(stats.failures, 2);
  }

  #[test]
  fn archive_uploads_every_file_in_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("device_1.csv"), "a").unwrap();
    std::fs::write(dir.path().join("metadata.json"), "{}").unwrap();

    let transport = Arc::new(RecordingTransport::new());
    let mut publisher = TelemetryPublisher::spawn(&all_enabled(), Arc::clone(&transport) as _);
    let sender = publisher.sender();

    sender.publish_archive(ArchiveJob {
      event_id: "e1".to_string(),
      directory: dir.path().to_path_buf(),
    });
    drain(&mut publisher, sender);

    let uploads = transport.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 2);
  }

  #[test]
  fn disabled_channels_swallow_payloads() {
    let transport = Arc::new(RecordingTransport::new());
    let mut publisher =
      TelemetryPublisher::spawn(&TelemetryConfig::default(), Arc::clone(&transport) as _);
    let sender = publisher.sender();
    sender.publish_health(json!({}));
    sender.publish_event(EventNotice::Start(json!({})));
    drain(&mut publisher, sender);
    assert_eq!(transport.post_count(), 0);
  }
}
