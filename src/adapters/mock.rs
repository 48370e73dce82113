//! Simulated serial devices
//!
//! Provides an in-process stand-in for a pressure sensor so the link can be
//! exercised without hardware. A [`SimulatedDevice`] is attached to a
//! [`SimulatedBackend`] under a port name; the test side pushes lines "from the
//! device" and inspects what the host wrote.
//!
//! Behaviour mirrors a real port closely enough for the receiver loop:
//! - reads block for up to the read timeout and then fail with `TimedOut`
//! - a device can only be opened once until every handle clone is dropped
//! - read and write failures can be injected
//! - a read can be stalled past its timeout, and writes slowed, to emulate a
//!   misbehaving driver

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::adapters::{PortBackend, SerialIo};
use crate::connection::ConnectionConfig;
use crate::error::ConnectionError;
use crate::protocol::{PRESSURE_PREFIX, PRESSURE_UNIT};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct DeviceState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    read_fault: Option<io::ErrorKind>,
    write_fault: Option<io::ErrorKind>,
    open_fault: Option<io::ErrorKind>,
    read_stall: Option<Duration>,
    write_delay: Option<Duration>,
    last_baud: Option<u32>,
}

#[derive(Default)]
struct DeviceShared {
    state: Mutex<DeviceState>,
    data_ready: Condvar,
    open_handles: AtomicUsize,
    opens: AtomicUsize,
}

/// A simulated pressure sensor.
///
/// Cloning yields another reference to the same device.
#[derive(Clone, Default)]
pub struct SimulatedDevice {
    shared: Arc<DeviceShared>,
}

impl SimulatedDevice {
    /// Create a device with empty buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a line for the host to read. A `\n` terminator is appended.
    pub fn push_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.push_bytes(&bytes);
    }

    /// Queue raw bytes for the host to read.
    pub fn push_bytes(&self, bytes: &[u8]) {
        lock(&self.shared.state).inbound.extend(bytes.iter().copied());
        self.shared.data_ready.notify_all();
    }

    /// Queue a pressure reading in the device's wire format.
    pub fn push_pressure(&self, hpa: f64) {
        self.push_line(&format!("{}{:.1}{}", PRESSURE_PREFIX, hpa, PRESSURE_UNIT));
    }

    /// Everything the host has written, split into lines.
    pub fn written_lines(&self) -> Vec<String> {
        let state = lock(&self.shared.state);
        String::from_utf8_lossy(&state.outbound)
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Raw bytes the host has written.
    pub fn written_bytes(&self) -> Vec<u8> {
        lock(&self.shared.state).outbound.clone()
    }

    /// Make the next read fail with the given error kind.
    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        lock(&self.shared.state).read_fault = Some(kind);
        self.shared.data_ready.notify_all();
    }

    /// Make the next read block for `stall` before it starts waiting for data.
    ///
    /// The stall ignores the read timeout, like a driver that hangs.
    pub fn stall_next_read(&self, stall: Duration) {
        lock(&self.shared.state).read_stall = Some(stall);
        self.shared.data_ready.notify_all();
    }

    /// Make every subsequent write take at least `delay`.
    pub fn delay_writes(&self, delay: Duration) {
        lock(&self.shared.state).write_delay = Some(delay);
    }

    /// Make every subsequent write fail with the given error kind.
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        lock(&self.shared.state).write_fault = Some(kind);
    }

    /// Make every subsequent open fail with the given error kind.
    pub fn fail_opens(&self, kind: io::ErrorKind) {
        lock(&self.shared.state).open_fault = Some(kind);
    }

    /// Number of live handles (including clones) onto this device.
    pub fn open_handles(&self) -> usize {
        self.shared.open_handles.load(Ordering::SeqCst)
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Baud rate used by the most recent open.
    pub fn last_baud(&self) -> Option<u32> {
        lock(&self.shared.state).last_baud
    }

    fn handle(&self, read_timeout: Duration) -> SimulatedPort {
        self.shared.open_handles.fetch_add(1, Ordering::SeqCst);
        SimulatedPort {
            device: self.clone(),
            read_timeout,
        }
    }
}

/// A handle onto a [`SimulatedDevice`].
pub struct SimulatedPort {
    device: SimulatedDevice,
    read_timeout: Duration,
}

impl Drop for SimulatedPort {
    fn drop(&mut self) {
        self.device.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Read for SimulatedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let shared = &self.device.shared;
        let stall = lock(&shared.state).read_stall.take();
        if let Some(stall) = stall {
            thread::sleep(stall);
        }

        let guard = lock(&shared.state);
        let (mut state, _) = shared
            .data_ready
            .wait_timeout_while(guard, self.read_timeout, |s| {
                s.inbound.is_empty() && s.read_fault.is_none()
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(kind) = state.read_fault.take() {
            return Err(io::Error::new(kind, "simulated read failure"));
        }
        if state.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"));
        }

        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let delay = lock(&self.device.shared.state).write_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = lock(&self.device.shared.state);
        if let Some(kind) = state.write_fault {
            return Err(io::Error::new(kind, "simulated write failure"));
        }
        state.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialIo for SimulatedPort {
    fn bytes_to_read(&self) -> io::Result<u32> {
        let state = lock(&self.device.shared.state);
        // A pending fault or stall is surfaced by the next read.
        if state.read_fault.is_some() || state.read_stall.is_some() {
            return Ok(1);
        }
        Ok(u32::try_from(state.inbound.len()).unwrap_or(u32::MAX))
    }

    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        Ok(Box::new(self.device.handle(self.read_timeout)))
    }
}

/// A set of simulated devices addressable by port name.
#[derive(Default)]
pub struct SimulatedBackend {
    devices: Mutex<BTreeMap<String, SimulatedDevice>>,
}

impl SimulatedBackend {
    /// Create a backend with no devices attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a fresh device under `port` and return it.
    pub fn attach(&self, port: &str) -> SimulatedDevice {
        let device = SimulatedDevice::new();
        lock(&self.devices).insert(port.to_string(), device.clone());
        device
    }

    /// Remove the device registered under `port`.
    pub fn detach(&self, port: &str) -> Option<SimulatedDevice> {
        lock(&self.devices).remove(port)
    }
}

impl PortBackend for SimulatedBackend {
    fn list_ports(&self) -> Vec<String> {
        lock(&self.devices).keys().cloned().collect()
    }

    fn open(
        &self,
        config: &ConnectionConfig,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialIo>, ConnectionError> {
        let open_error = |kind: io::ErrorKind, msg: &str| ConnectionError::Open {
            port: config.port().to_string(),
            source: io::Error::new(kind, msg.to_string()),
        };

        let device = lock(&self.devices)
            .get(config.port())
            .cloned()
            .ok_or_else(|| open_error(io::ErrorKind::NotFound, "No such device"))?;

        {
            let mut state = lock(&device.shared.state);
            if let Some(kind) = state.open_fault {
                return Err(open_error(kind, "simulated open failure"));
            }
            if device.open_handles() > 0 {
                return Err(open_error(io::ErrorKind::Other, "Device or resource busy"));
            }
            state.last_baud = Some(config.baud_rate());
        }

        device.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(device.handle(read_timeout)))
    }
}
