//! Serial link lifecycle.
//!
//! [`LinkManager`] owns the open handle and the receiver thread. Every state
//! transition, open and close goes through its single control mutex:
//!
//! ```text
//! Disconnected --connect--> Connected --disconnect--> Disconnecting --> Disconnected
//! Connected --receiver error--> Connected   (error event; caller must disconnect)
//! ```
//!
//! Concurrent `disconnect` calls are safe: whichever arrives second waits for
//! the first to finish, so neither returns while the port is still open.
//!
//! A fatal receive error does not disconnect on its own. The port stays open
//! until `disconnect` is called, so a consumer can inspect the error first.
//!
//! # Example
//!
//! ```no_run
//! use pressure_link::LinkManager;
//!
//! fn main() -> anyhow::Result<()> {
//!     let link = LinkManager::native();
//!     let _sub = link.subscribe(|event| println!("{}", event))?;
//!
//!     link.connect("/dev/ttyUSB0", 9600)?;
//!     link.send("20231234")?;
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     link.disconnect();
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adapters::{NativeBackend, PortBackend, SerialIo};
use crate::config::LinkTimings;
use crate::error::{ConfigError, ConnectionError, SendError};
use crate::events::{EventDispatcher, EventKind, EventStream, LifecycleEvent, Subscription};
use crate::receiver::{ExitGuard, ReceiverLoop};
use crate::sender::{CommandSender, OutboundRecord};
use crate::TelemetryEvent;

/// Port and baud rate for one connection. Only constructible with valid values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    port: String,
    baud_rate: u32,
}

impl ConnectionConfig {
    /// Validate a port identifier and baud rate.
    pub fn new(port: impl Into<String>, baud: i64) -> Result<Self, ConfigError> {
        let port = port.into().trim().to_string();
        if port.is_empty() {
            return Err(ConfigError::EmptyPort);
        }
        let baud_rate = u32::try_from(baud)
            .ok()
            .filter(|b| *b > 0)
            .ok_or(ConfigError::InvalidBaud(baud))?;
        Ok(Self { port, baud_rate })
    }

    /// Validate user-entered text, e.g. from a form field.
    pub fn parse(port: &str, baud: &str) -> Result<Self, ConfigError> {
        let baud_text = baud.trim();
        let baud = baud_text
            .parse::<i64>()
            .map_err(|_| ConfigError::UnparsableBaud(baud_text.to_string()))?;
        Self::new(port, baud)
    }

    /// Device identifier.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bps)", self.port, self.baud_rate)
    }
}

/// Link state as seen by consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No port open.
    Disconnected,
    /// Port open; receiver running unless it reported an error.
    Connected,
    /// `disconnect` in progress.
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(label)
    }
}

type SharedWriter = Arc<Mutex<Option<Box<dyn SerialIo>>>>;

fn lock_writer(
    writer: &Mutex<Option<Box<dyn SerialIo>>>,
) -> MutexGuard<'_, Option<Box<dyn SerialIo>>> {
    writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resources of one open connection.
struct Session {
    config: ConnectionConfig,
    writer: SharedWriter,
    stop: Arc<AtomicBool>,
    exited: mpsc::Receiver<()>,
    receiver: JoinHandle<()>,
}

/// A receiver that outlived `join_timeout` and still owns its read handle.
struct Detached {
    port: String,
    exited: mpsc::Receiver<()>,
    receiver: JoinHandle<()>,
}

struct Control {
    state: ConnectionState,
    /// Set from connect until teardown completes.
    port: Option<String>,
    session: Option<Session>,
    detached: Option<Detached>,
}

/// Owns the serial handle and drives connect/disconnect.
pub struct LinkManager {
    backend: Arc<dyn PortBackend>,
    timings: LinkTimings,
    dispatcher: Arc<EventDispatcher>,
    sender: CommandSender,
    control: Mutex<Control>,
    teardown_done: Condvar,
    live_receivers: Arc<AtomicUsize>,
}

impl LinkManager {
    /// Manager over `backend` with default timings.
    pub fn new(backend: Arc<dyn PortBackend>) -> Self {
        Self::build(backend, LinkTimings::default())
    }

    /// Manager over `backend` with explicit timings.
    ///
    /// Fails when `join_timeout` does not outlast one poll cycle.
    pub fn with_timings(
        backend: Arc<dyn PortBackend>,
        timings: LinkTimings,
    ) -> Result<Self, ConfigError> {
        timings.validate()?;
        Ok(Self::build(backend, timings))
    }

    fn build(backend: Arc<dyn PortBackend>, timings: LinkTimings) -> Self {
        Self {
            backend,
            timings,
            dispatcher: Arc::new(EventDispatcher::new()),
            sender: CommandSender::new(),
            control: Mutex::new(Control {
                state: ConnectionState::Disconnected,
                port: None,
                session: None,
                detached: None,
            }),
            teardown_done: Condvar::new(),
            live_receivers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Manager over real serial hardware.
    pub fn native() -> Self {
        Self::new(Arc::new(NativeBackend::new()))
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Timings in effect.
    pub fn timings(&self) -> LinkTimings {
        self.timings
    }

    /// Currently available ports, sorted.
    pub fn list_ports(&self) -> Vec<String> {
        self.backend.list_ports()
    }

    /// Current lifecycle state.
    pub fn current_state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Identifier of the open port, if any. Still set while disconnecting.
    pub fn port(&self) -> Option<String> {
        self.lock().port.clone()
    }

    /// Configuration of the open connection, if any.
    pub fn connection(&self) -> Option<ConnectionConfig> {
        self.lock().session.as_ref().map(|s| s.config.clone())
    }

    /// Whether a receiver thread is alive for the current connection.
    ///
    /// False after a fatal receive error even though the state is still
    /// `Connected`.
    pub fn receiver_running(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| !s.receiver.is_finished())
    }

    /// Receiver threads alive across all connections of this manager,
    /// including any detached by a forced release.
    pub fn live_receivers(&self) -> usize {
        self.live_receivers.load(Ordering::SeqCst)
    }

    /// Validate `port`/`baud` and connect.
    pub fn connect(&self, port: &str, baud: i64) -> Result<(), ConnectionError> {
        let config = ConnectionConfig::new(port, baud)?;
        self.connect_with(config)
    }

    /// Open the port, start the receiver and emit `Connected`.
    pub fn connect_with(&self, config: ConnectionConfig) -> Result<(), ConnectionError> {
        let mut control = self.lock();
        if control.state != ConnectionState::Disconnected {
            let open_port = control.port.clone().unwrap_or_default();
            return Err(ConnectionError::AlreadyConnected(open_port));
        }
        self.reap_detached(&mut control);

        let reader = self.backend.open(&config, self.timings.read_timeout)?;
        let writer = reader.try_clone_io().map_err(|e| ConnectionError::Open {
            port: config.port().to_string(),
            source: e,
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let (start_tx, start_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();

        let receiver = ReceiverLoop {
            reader,
            dispatcher: Arc::clone(&self.dispatcher),
            stop: Arc::clone(&stop),
            poll_interval: self.timings.poll_interval,
            port: config.port().to_string(),
        };
        self.live_receivers.fetch_add(1, Ordering::SeqCst);
        let guard = ExitGuard {
            live: Arc::clone(&self.live_receivers),
            exited: exit_tx,
        };

        // On spawn failure the closure, and with it the reader and guard, is
        // dropped; the writer goes out of scope with this frame.
        let handle = thread::Builder::new()
            .name("pressure-rx".to_string())
            .spawn(move || receiver.run(start_rx, guard))?;

        control.state = ConnectionState::Connected;
        control.port = Some(config.port().to_string());
        info!("Connected to {}", config);
        self.dispatcher
            .emit(EventKind::lifecycle(LifecycleEvent::Connected));
        // The receiver only exits before reading this if it was dropped, which
        // cannot happen while we hold the handle.
        let _ = start_tx.send(());

        control.session = Some(Session {
            config,
            writer: Arc::new(Mutex::new(Some(writer))),
            stop,
            exited: exit_rx,
            receiver: handle,
        });
        Ok(())
    }

    /// Give a receiver detached by an earlier forced release up to
    /// `join_timeout` to drop its read handle before the port is reopened.
    fn reap_detached(&self, control: &mut Control) {
        let Some(detached) = control.detached.take() else {
            return;
        };
        match detached.exited.recv_timeout(self.timings.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if detached.receiver.join().is_err() {
                    warn!("Receiver thread for '{}' panicked", detached.port);
                }
                debug!("Detached receiver for '{}' released", detached.port);
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Detached receiver for '{}' is still running", detached.port);
                control.detached = Some(detached);
            }
        }
    }

    /// Stop the receiver, close the port and emit `Disconnected`.
    ///
    /// Does nothing when already disconnected. A call made while another
    /// `disconnect` is tearing down waits for it to finish and emits nothing.
    ///
    /// Waits at most `join_timeout` for the receiver. A receiver that has not
    /// exited by then is detached with its read handle, which it drops after
    /// its current read returns; the next `connect` waits for that. The
    /// control lock is not held while waiting, so `send` and `connect` fail
    /// fast during teardown instead of queueing behind it.
    pub fn disconnect(&self) {
        let session = {
            let mut control = self.lock();
            match control.session.take() {
                Some(session) => {
                    control.state = ConnectionState::Disconnecting;
                    session
                }
                None => {
                    while control.state == ConnectionState::Disconnecting {
                        control = self
                            .teardown_done
                            .wait(control)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                    return;
                }
            }
        };

        let Session {
            config,
            writer,
            stop,
            exited,
            receiver,
        } = session;

        stop.store(true, Ordering::SeqCst);
        let detached = match exited.recv_timeout(self.timings.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if receiver.join().is_err() {
                    warn!("Receiver thread for '{}' panicked", config.port());
                }
                None
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Receiver for '{}' did not stop within {:?}; detaching it",
                    config.port(),
                    self.timings.join_timeout
                );
                Some(Detached {
                    port: config.port().to_string(),
                    exited,
                    receiver,
                })
            }
        };
        // Waits for an in-flight send before closing the handle.
        drop(lock_writer(&writer).take());

        let mut control = self.lock();
        if detached.is_some() {
            control.detached = detached;
        }
        control.state = ConnectionState::Disconnected;
        control.port = None;
        info!("Disconnected from {}", config.port());
        self.dispatcher
            .emit(EventKind::lifecycle(LifecycleEvent::Disconnected));
        drop(control);
        self.teardown_done.notify_all();
    }

    /// Write one command line to the device.
    ///
    /// The write happens under the writer's own lock, so state queries do not
    /// wait on a slow port.
    pub fn send(&self, text: &str) -> Result<OutboundRecord, SendError> {
        let writer = {
            let control = self.lock();
            if control.state != ConnectionState::Connected {
                return Err(SendError::NotConnected);
            }
            control
                .session
                .as_ref()
                .map(|s| Arc::clone(&s.writer))
                .ok_or(SendError::NotConnected)?
        };
        let mut handle = lock_writer(&writer);
        let port = handle.as_mut().ok_or(SendError::NotConnected)?;
        self.sender.send(port.as_mut(), text)
    }

    /// Commands sent over the lifetime of this manager, oldest first.
    pub fn history(&self) -> Vec<OutboundRecord> {
        self.sender.history()
    }

    /// Deliver every subsequent event to `handler` on its own thread.
    pub fn subscribe<F>(&self, handler: F) -> std::io::Result<Subscription>
    where
        F: FnMut(TelemetryEvent) + Send + 'static,
    {
        self.dispatcher.subscribe(handler)
    }

    /// Queue every subsequent event for the caller to drain.
    pub fn subscribe_stream(&self) -> EventStream {
        self.dispatcher.subscribe_stream()
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.disconnect();
        self.dispatcher.close();
        debug!("Link manager dropped");
    }
}
