//! Serial adapter for RS-232 / USB-CDC devices.
//!
//! Wraps the `serialport` crate. Without the `instrument_serial` feature the
//! backend still compiles: it reports no ports and refuses to open.

use std::time::Duration;

use crate::adapters::{PortBackend, SerialIo};
use crate::connection::ConnectionConfig;
use crate::error::ConnectionError;

#[cfg(feature = "instrument_serial")]
use std::io::{self, Read, Write};
#[cfg(feature = "instrument_serial")]
use tracing::{debug, warn};

/// Backend for real serial hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl NativeBackend {
    /// Create the native backend.
    pub fn new() -> Self {
        Self
    }
}

impl PortBackend for NativeBackend {
    fn list_ports(&self) -> Vec<String> {
        #[cfg(feature = "instrument_serial")]
        {
            match serialport::available_ports() {
                Ok(ports) => {
                    let mut names: Vec<String> =
                        ports.into_iter().map(|p| p.port_name).collect();
                    names.sort();
                    names.dedup();
                    names
                }
                Err(e) => {
                    warn!("Failed to enumerate serial ports: {}", e);
                    Vec::new()
                }
            }
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Vec::new()
        }
    }

    fn open(
        &self,
        config: &ConnectionConfig,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialIo>, ConnectionError> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(config.port(), config.baud_rate())
                .timeout(read_timeout)
                .open()
                .map_err(|e| ConnectionError::Open {
                    port: config.port().to_string(),
                    source: io::Error::from(e),
                })?;

            debug!(
                "Serial port '{}' opened at {} baud",
                config.port(),
                config.baud_rate()
            );
            Ok(Box::new(NativePort { port }))
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (config, read_timeout);
            Err(ConnectionError::FeatureDisabled)
        }
    }
}

/// An open `serialport` handle.
#[cfg(feature = "instrument_serial")]
struct NativePort {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "instrument_serial")]
impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

#[cfg(feature = "instrument_serial")]
impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

#[cfg(feature = "instrument_serial")]
impl SerialIo for NativePort {
    fn bytes_to_read(&self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::from)
    }

    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(NativePort { port }))
    }
}
