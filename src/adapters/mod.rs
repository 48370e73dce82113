//! Hardware adapter implementations
//!
//! This module defines the two seams between the link and the serial hardware:
//! [`PortBackend`] enumerates and opens ports, and [`SerialIo`] is an opened
//! handle. `serial_adapter` talks to real ports through the `serialport` crate;
//! `mock` provides an in-process simulated device for tests and demos.

pub mod mock;
pub mod serial_adapter;

pub use mock::{SimulatedBackend, SimulatedDevice};
pub use serial_adapter::NativeBackend;

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::error::ConnectionError;

/// An opened serial handle.
///
/// Reads time out after the duration given to [`PortBackend::open`] and report
/// `io::ErrorKind::TimedOut`, the same way `serialport` does.
pub trait SerialIo: Read + Write + Send {
    /// Number of received bytes waiting to be read.
    fn bytes_to_read(&self) -> io::Result<u32>;

    /// Open an independent stream onto the same device.
    ///
    /// The receiver reads from one clone while commands are written to another,
    /// so neither side shares a buffer with the other.
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>>;
}

/// Enumerates and opens serial devices.
pub trait PortBackend: Send + Sync {
    /// Identifiers of currently available devices, sorted. Never fails.
    fn list_ports(&self) -> Vec<String>;

    /// Open `config.port()` with the given read timeout.
    fn open(
        &self,
        config: &ConnectionConfig,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialIo>, ConnectionError>;
}
