//! Railwatch: a multi-sensor vibration-triggered train event recorder.
//!
//! A small fleet of wireless IMU sensors streams 9-axis samples to this
//! gateway, which keeps every link alive for weeks at a time, detects
//! passing trains from Z-axis excursions, records a bounded window of
//! raw samples from the whole fleet around each event, and publishes
//! events and health telemetry without ever stalling acquisition.
//!
//! # Architecture
//!
//! All business logic runs on one event-loop thread owned by
//! [`fleet::FleetCoordinator`]: per-device connection supervisors, the
//! trigger/stop detector, and the bias calibrator. The only code
//! outside that thread is strictly queue-decoupled:
//!
//! * radio notification callbacks, which perform exactly one bounded
//!   enqueue ([`queue`]);
//! * one link worker at a time, running the blocking
//!   connect/cleanup/recovery sequences ([`fleet`]);
//! * the event writer ([`writer`]) and the telemetry workers
//!   ([`telemetry`]).
//!
//! The host radio stack is injected via [`link::RadioStack`]; a full
//! software simulator lives in [`link::sim`]. Construct a
//! [`gateway::Gateway`] to run the whole system.

pub mod buffer;
pub mod calibrator;
pub mod config;
pub mod detector;
pub mod fleet;
pub mod gateway;
pub mod link;
pub mod queue;
pub mod recovery;
pub mod sample;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod time;
pub mod wire;
pub mod writer;

pub use config::{DeviceConfig, DeviceNumber, GatewayConfig};
pub use gateway::{Gateway, GatewayError};
pub use sample::Sample;
pub use time::{Clock, Timestamp};
