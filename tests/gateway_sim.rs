//! End-to-end gateway scenarios against the simulated radio stack:
//! startup, triggering, recording, persistence, telemetry, shutdown.

mod common;

use std::{fs, time::Duration};

use common::{all_ready, start_fleet, wait_for};
use railwatch::{
  config::HealthEndpointConfig,
  store::SqliteStore,
};

fn event_dirs(output: &std::path::Path) -> Vec<std::path::PathBuf> {
  let mut dirs: Vec<_> = fs::read_dir(output)
    .unwrap()
    .filter_map(|e| e.ok())
    .map(|e| e.path())
    .filter(|p| {
      p.is_dir()
        && p
          .file_name()
          .and_then(|n| n.to_str())
          .map(|n| n.starts_with("event_"))
          .unwrap_or(false)
    })
    .collect();
  dirs.sort();
  dirs
}

#[test]
fn fleet_connects_and_streams() {
  let harness = start_fleet(|_| {});
  let status = wait_for(&harness.gateway, Duration::from_secs(10), "fleet ready", all_ready);
  assert_eq!(status.devices.len(), 2);
  for control in &harness.controls {
    assert!(control.is_connected());
    assert_eq!(control.connect_attempts(), 1);
  }

  // Samples flow and the ring buffers fill.
  wait_for(
    &harness.gateway,
    Duration::from_secs(5),
    "ring buffers filling",
    |s| s.devices.iter().all(|d| d.buffer_len > 20),
  );

  // The connect sequence wrote the rate configuration packets
  // (unlock, output rate, save).
  for control in &harness.controls {
    let written = control.written_packets();
    assert_eq!(written.len(), 3);
    assert_eq!(written[0], vec![0xFF, 0xAA, 0x69, 0x88, 0xB5]);
    assert_eq!(written[1], vec![0xFF, 0xAA, 0x03, 0x08, 0x00]);
    assert_eq!(written[2], vec![0xFF, 0xAA, 0x00, 0x00, 0x00]);
  }
}

#[test]
fn burst_produces_one_complete_event_on_disk() {
  let mut harness = start_fleet(|_| {});
  wait_for(&harness.gateway, Duration::from_secs(10), "fleet ready", all_ready);
  // Let the ring buffers accumulate pre-roll history.
  std::thread::sleep(Duration::from_millis(1200));

  harness.controls[0].start_burst(3.0, 1.5);

  let status = wait_for(
    &harness.gateway,
    Duration::from_secs(5),
    "recording to start",
    |s| s.recording,
  );
  assert!(status.recording);

  wait_for(
    &harness.gateway,
    Duration::from_secs(15),
    "event to persist",
    |s| !s.recording && s.total_events == 1,
  );

  let dirs = event_dirs(harness.output_path());
  assert_eq!(dirs.len(), 1, "exactly one event directory");
  let event_dir = &dirs[0];

  // metadata.json present => every listed device CSV present and
  // non-empty.
  let metadata: serde_json::Value =
    serde_json::from_str(&fs::read_to_string(event_dir.join("metadata.json")).unwrap()).unwrap();
  let devices = metadata["devices"].as_array().unwrap();
  assert!(!devices.is_empty());
  for device in devices {
    let csv = event_dir.join(format!("device_{}.csv", device.as_u64().unwrap()));
    let text = fs::read_to_string(&csv).unwrap();
    assert!(text.lines().count() > 1, "{csv:?} has data rows");
  }

  // Pre-roll: the triggering device's series reaches back before the
  // burst. At 50 Hz with >1 s of quiet streaming beforehand, the
  // series must be well longer than the burst alone.
  let trigger_csv = event_dir.join("device_1.csv");
  let rows = fs::read_to_string(&trigger_csv).unwrap().lines().count() - 1;
  assert!(rows > 80, "expected pre-roll + burst samples, got {rows}");

  // The event is indexed exactly once.
  let store = SqliteStore::open(harness.output_path().join("events.db")).unwrap();
  assert_eq!(store.event_count().unwrap(), 1);

  // Both devices participated (global trigger semantics).
  assert_eq!(devices.len(), 2);

  harness.gateway.shutdown();
}

#[test]
fn second_burst_makes_second_distinct_event() {
  let mut harness = start_fleet(|_| {});
  wait_for(&harness.gateway, Duration::from_secs(10), "fleet ready", all_ready);
  std::thread::sleep(Duration::from_millis(600));

  for expected in 1..=2u64 {
    harness.controls[1].start_burst(4.0, 1.0);
    wait_for(
      &harness.gateway,
      Duration::from_secs(15),
      "event persisted",
      |s| !s.recording && s.total_events == expected,
    );
  }

  let dirs = event_dirs(harness.output_path());
  assert_eq!(dirs.len(), 2);
  assert_ne!(dirs[0], dirs[1]);
  let store = SqliteStore::open(harness.output_path().join("events.db")).unwrap();
  assert_eq!(store.event_count().unwrap(), 2);

  harness.gateway.shutdown();
}

#[test]
fn shutdown_flushes_active_recording() {
  let mut harness = start_fleet(|_| {});
  wait_for(&harness.gateway, Duration::from_secs(10), "fleet ready", all_ready);
  std::thread::sleep(Duration::from_millis(600));

  // A burst long enough that the recording is still running when the
  // shutdown lands.
  harness.controls[0].start_burst(3.0, 30.0);
  wait_for(
    &harness.gateway,
    Duration::from_secs(5),
    "recording to start",
    |s| s.recording,
  );

  harness.gateway.shutdown();

  let dirs = event_dirs(harness.output_path());
  assert_eq!(dirs.len(), 1, "flushed recording reached the writer");
  assert!(dirs[0].join("metadata.json").exists());
}

#[test]
fn health_snapshots_are_published() {
  let harness = start_fleet(|cfg| {
    cfg.telemetry.health = HealthEndpointConfig {
      enabled: true,
      interval_s: 0.3,
      ..HealthEndpointConfig::default()
    };
  });
  wait_for(&harness.gateway, Duration::from_secs(10), "fleet ready", all_ready);
  std::thread::sleep(Duration::from_millis(1500));

  let posts = harness.transport.posts.lock().unwrap().clone();
  assert!(posts.len() >= 2, "expected periodic health posts, got {}", posts.len());
  let (url, payload) = &posts[0];
  assert_eq!(url, "http://localhost:8000/api/imu/status");
  assert!(payload["devices"].as_array().unwrap().len() == 2);
  assert!(payload["uptime_s"].as_f64().unwrap() > 0.0);
}

#[test]
fn status_reports_consistent_shape() {
  let harness = start_fleet(|_| {});
  let status = wait_for(&harness.gateway, Duration::from_secs(10), "fleet ready", all_ready);
  for device in &status.devices {
    assert!(device.buffer_capacity == 100); // 50 Hz x 2 s
    assert!(device.consecutive_failures == 0);
    assert!(device.last_sample_age_s.unwrap() < 1.0);
  }
  assert_eq!(status.total_events, 0);
  assert!(status.connect_attempts >= 2);
}
