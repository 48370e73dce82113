//! Custom error types for the pressure link.
//!
//! Every failure the link can produce is described by one of the enums in this
//! module. They are built with `thiserror` so each variant carries a
//! human-readable `Display` and converts from its underlying cause with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`ConfigError`**: invalid port, baud or timing input, detected before any I/O.
//! - **`ConnectionError`**: returned from `connect`. Wraps `ConfigError` and
//!   covers open failures (busy, permission, not found) and double connects.
//! - **`SendError`**: returned from `send`. Either the link is not connected,
//!   the command is blank, or the write itself failed.
//! - **`ReceiveError`**: raised inside the receiver thread. It is never returned
//!   to a caller; its message is delivered as a `Lifecycle(Error)` event.
//! - **`SettingsError`**: loading or validating the `figment` configuration.
//!
//! Decoding a telemetry line never fails, so there is no decode error type:
//! unmatched lines are classified as messages.

use std::io;

use thiserror::Error;

/// Invalid connection parameters supplied by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No serial port selected")]
    EmptyPort,

    #[error("Invalid baud rate {0}: must be a positive integer no larger than {max}", max = u32::MAX)]
    InvalidBaud(i64),

    #[error("Baud rate '{0}' is not a number")]
    UnparsableBaud(String),

    #[error("Join timeout {join_timeout:?} must exceed poll interval plus read timeout ({minimum:?})")]
    JoinTimeoutTooShort {
        join_timeout: std::time::Duration,
        minimum: std::time::Duration,
    },
}

/// Failures returned synchronously from `connect`.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serial port already open on '{0}'")]
    AlreadyConnected(String),

    #[error("Failed to open serial port '{port}': {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    FeatureDisabled,
}

/// Failures returned synchronously from `send`.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Serial port not connected")]
    NotConnected,

    #[error("Refusing to send an empty command")]
    Empty,

    #[error("Failed to write to serial port: {0}")]
    Io(#[from] io::Error),
}

/// Failures inside the receiver loop. Reported through the event stream.
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("Serial read error: {0}")]
    Io(#[from] io::Error),

    #[error("Received line is not valid UTF-8: {0}")]
    Decode(#[from] std::str::Utf8Error),

    #[error("Received more than {max} bytes without a line terminator")]
    Overflow { max: usize },
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for SettingsError {
    fn from(err: figment::Error) -> Self {
        SettingsError::Load(Box::new(err))
    }
}
