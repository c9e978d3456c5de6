//! Host-radio recovery: OS-level commands that force a wedged radio
//! stack back to a usable state.
//!
//! This is the only module that touches OS radio control. Two rungs:
//! a soft per-device removal, and a destructive interface reset that
//! drops every link and is attempted only when the soft path fails.
//! The fleet coordinator gates both behind cooldowns and the fleet-wide
//! pause flag.

use std::{
  process::{Child, Command, Stdio},
  thread,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use thiserror::Error;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// Settling delay after a destructive interface reset.
const RESET_SETTLE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RecoveryError {
  #[error("recovery command {0} timed out")]
  Timeout(String),
  #[error("recovery command {command} exited with {status}")]
  CommandFailed { command: String, status: String },
  #[error("recovery command {command} could not be spawned: {source}")]
  Spawn {
    command: String,
    source: std::io::Error,
  },
}

/// How far a recovery attempt had to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
  SoftRemoved,
  /// The interface was reset; every device lost its link.
  HardReset,
}

/// Seam between the coordinator and the OS. Implementations run on the
/// link worker thread, never on the event loop.
pub trait RecoveryExecutor: Send + Sync {
  /// Soft rung: forget one device at the OS level.
  fn soft_remove(&self, address: &str) -> Result<(), RecoveryError>;

  /// Hard rung: reset the whole radio interface. Destructive.
  fn hard_reset(&self) -> Result<(), RecoveryError>;
}

/// Production executor: `bluetoothctl remove` for the soft rung,
/// `hciconfig <iface> reset` for the hard one.
pub struct CommandRecovery {
  interface: String,
}

impl CommandRecovery {
  pub fn new(interface: impl Into<String>) -> Self {
    CommandRecovery {
      interface: interface.into(),
    }
  }
}

impl Default for CommandRecovery {
  fn default() -> Self {
    CommandRecovery::new("hci0")
  }
}

impl RecoveryExecutor for CommandRecovery {
  fn soft_remove(&self, address: &str) -> Result<(), RecoveryError> {
    info!("host-radio recovery: removing device {address}");
    run_with_timeout("bluetoothctl", &["remove", address], COMMAND_TIMEOUT)
  }

  fn hard_reset(&self) -> Result<(), RecoveryError> {
    warn!(
      "host-radio recovery: hard reset of {} (all links will drop)",
      self.interface
    );
    run_with_timeout("hciconfig", &[&self.interface, "reset"], COMMAND_TIMEOUT)?;
    thread::sleep(RESET_SETTLE);
    Ok(())
  }
}

fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<(), RecoveryError> {
  let command_line = format!("{program} {}", args.join(" "));
  let mut child: Child = Command::new(program)
    .args(args)
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .spawn()
    .map_err(|source| RecoveryError::Spawn {
      command: command_line.clone(),
      source,
    })?;

  let deadline = Instant::now() + timeout;
  loop {
    match child.try_wait() {
      Ok(Some(status)) => {
        if status.success() {
          debug!("{command_line}: ok");
          return Ok(());
        }
        return Err(RecoveryError::CommandFailed {
          command: command_line,
          status: status.to_string(),
        });
      }
      Ok(None) => {
        if Instant::now() >= deadline {
          let _ = child.kill();
          let _ = child.wait();
          return Err(RecoveryError::Timeout(command_line));
        }
        thread::sleep(Duration::from_millis(100));
      }
      Err(source) => {
        return Err(RecoveryError::Spawn {
          command: command_line,
          source,
        });
      }
    }
  }
}

// ----------------------------------------------
// ----------------------------------------------

/// Executor that records calls instead of touching the OS. Used by the
/// test suites and the simulated gateway mode, where the recovery
/// *gating* is what matters, not the commands.
#[derive(Default)]
pub struct RecordingRecovery {
  pub soft_removals: std::sync::Mutex<Vec<String>>,
  pub hard_resets: std::sync::atomic::AtomicU32,
  /// When set, soft removal fails so escalation reaches the hard rung.
  pub fail_soft: std::sync::atomic::AtomicBool,
}

impl RecordingRecovery {
  pub fn new() -> Self {
    RecordingRecovery::default()
  }

  pub fn soft_removal_count(&self) -> usize {
    self.soft_removals.lock().unwrap().len()
  }

  pub fn hard_reset_count(&self) -> u32 {
    self.hard_resets.load(std::sync::atomic::Ordering::SeqCst)
  }
}

impl RecoveryExecutor for RecordingRecovery {
  fn soft_remove(&self, address: &str) -> Result<(), RecoveryError> {
    self
      .soft_removals
      .lock()
      .unwrap()
      .push(address.to_string());
    if self.fail_soft.load(std::sync::atomic::Ordering::SeqCst) {
      return Err(RecoveryError::CommandFailed {
        command: format!("recorded remove {address}"),
        status: "injected".to_string(),
      });
    }
    Ok(())
  }

  fn hard_reset(&self) -> Result<(), RecoveryError> {
    self
      .hard_resets
      .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn run_with_timeout_success_and_failure() {
    assert!(run_with_timeout("true", &[], Duration::from_secs(5)).is_ok());
    assert!(matches!(
      run_with_timeout("false", &[], Duration::from_secs(5)),
      Err(RecoveryError::CommandFailed { .. })
    ));
  }

  #[test]
  fn run_with_timeout_kills_hung_commands() {
    let start = Instant::now();
    let result = run_with_timeout("sleep", &["30"], Duration::from_millis(300));
    assert!(matches!(result, Err(RecoveryError::Timeout(_))));
    assert!(start.elapsed() < Duration::from_secs(5));
  }

  #[test]
  fn missing_binary_is_a_spawn_error() {
    let result = run_with_timeout("railwatch-no-such-binary", &[], Duration::from_secs(1));
    assert!(matches!(result, Err(RecoveryError::Spawn { .. })));
  }

  #[test]
  fn recording_executor_tracks_calls() {
    let recovery = RecordingRecovery::new();
    recovery.soft_remove("AA:BB").unwrap();
    recovery.hard_reset().unwrap();
    assert_eq!(recovery.soft_removal_count(), 1);
    assert_eq!(recovery.hard_reset_count(), 1);

    recovery
      .fail_soft
      .store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(recovery.soft_remove("CC:DD").is_err());
  }
}
