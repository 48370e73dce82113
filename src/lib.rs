//! Core library for the pressure_link application.
//!
//! Links a host to a remote pressure sensor over a serial port: opens and
//! closes the port, sends identification commands, and turns the device's
//! line-based telemetry into typed events for a consumer (GUI, console, logger).
//!
//! The entry point is [`LinkManager`]. Hardware access goes through the
//! [`adapters::PortBackend`] trait so the same manager drives a real port or the
//! simulated device in [`adapters::mock`].

pub mod adapters;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;
mod receiver;
pub mod sender;

pub use config::{LinkTimings, Settings, STANDARD_BAUD_RATES};
pub use connection::{ConnectionConfig, ConnectionState, LinkManager};
pub use error::{ConfigError, ConnectionError, ReceiveError, SendError, SettingsError};
pub use events::{EventKind, EventStream, LifecycleEvent, Subscription, TelemetryEvent};
pub use protocol::decode;
pub use sender::OutboundRecord;
