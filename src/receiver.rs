//! Background receive loop.
//!
//! One thread per connection polls the reader stream, splits the input into
//! lines, decodes each line and emits the result. It stops when the stop flag
//! is raised (checked once per poll cycle) or on the first fatal error, which is
//! reported as a `Lifecycle(Error)` event. It never touches `ConnectionState`
//! and never closes the port: `LinkManager::disconnect` does both.

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::adapters::SerialIo;
use crate::error::ReceiveError;
use crate::events::{EventDispatcher, EventKind, LifecycleEvent};
use crate::protocol::{self, LineBuffer};

/// Largest single read issued per poll.
const READ_CHUNK: usize = 1024;

/// Everything the receiver thread owns.
pub(crate) struct ReceiverLoop {
    pub(crate) reader: Box<dyn SerialIo>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) poll_interval: Duration,
    pub(crate) port: String,
}

/// Marks the thread as gone on every exit path, including a panic.
pub(crate) struct ExitGuard {
    pub(crate) live: Arc<AtomicUsize>,
    pub(crate) exited: Sender<()>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        let _ = self.exited.send(());
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

impl ReceiverLoop {
    /// Thread body. Waits on `start` so nothing is emitted before the
    /// `Connected` event; a dropped `start` sender aborts the loop.
    pub(crate) fn run(mut self, start: Receiver<()>, _guard: ExitGuard) {
        if start.recv().is_err() {
            debug!("Receiver for '{}' cancelled before start", self.port);
            return;
        }
        debug!("Receiver for '{}' started", self.port);

        match self.poll_until_stopped() {
            Ok(()) => debug!("Receiver for '{}' stopped", self.port),
            Err(_) if self.stop.load(Ordering::SeqCst) => {
                debug!("Ignoring receive error on '{}' during shutdown", self.port);
            }
            Err(e) => {
                error!("Receiver for '{}' failed: {}", self.port, e);
                self.dispatcher
                    .emit(EventKind::lifecycle(LifecycleEvent::Error(e.to_string())));
            }
        }
    }

    fn poll_until_stopped(&mut self) -> Result<(), ReceiveError> {
        let mut lines = LineBuffer::new();
        let mut chunk = [0u8; READ_CHUNK];

        while !self.stop.load(Ordering::SeqCst) {
            let available = self.reader.bytes_to_read()?;
            if available == 0 {
                thread::sleep(self.poll_interval);
                continue;
            }

            let want = usize::try_from(available).unwrap_or(READ_CHUNK).min(READ_CHUNK);
            match self.reader.read(&mut chunk[..want]) {
                Ok(0) => {
                    thread::sleep(self.poll_interval);
                    continue;
                }
                Ok(n) => lines.push(&chunk[..n]),
                Err(e) if is_transient(&e) => continue,
                Err(e) => return Err(e.into()),
            }

            while let Some(line) = lines.next_line()? {
                if line.is_empty() {
                    continue;
                }
                trace!("[{}] <- {}", self.port, line);
                self.dispatcher.emit(protocol::decode(&line));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{PortBackend, SimulatedBackend};
    use crate::connection::ConnectionConfig;
    use std::sync::mpsc;
    use std::time::Instant;

    fn spawn_loop(
        backend: &SimulatedBackend,
        dispatcher: &Arc<EventDispatcher>,
    ) -> (Arc<AtomicBool>, mpsc::Receiver<()>, thread::JoinHandle<()>) {
        let config = ConnectionConfig::new("sim0", 9600).unwrap();
        let reader = backend.open(&config, Duration::from_millis(20)).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let (start_tx, start_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        let live = Arc::new(AtomicUsize::new(1));

        let receiver = ReceiverLoop {
            reader,
            dispatcher: Arc::clone(dispatcher),
            stop: Arc::clone(&stop),
            poll_interval: Duration::from_millis(5),
            port: "sim0".to_string(),
        };
        let guard = ExitGuard {
            live,
            exited: exit_tx,
        };
        let handle = thread::spawn(move || receiver.run(start_rx, guard));
        start_tx.send(()).unwrap();
        (stop, exit_rx, handle)
    }

    fn wait_for_events(
        stream: &mut crate::events::EventStream,
        count: usize,
    ) -> Vec<EventKind> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = Vec::new();
        while seen.len() < count && Instant::now() < deadline {
            match stream.try_next() {
                Some(event) => seen.push(event.kind),
                None => thread::sleep(Duration::from_millis(2)),
            }
        }
        seen
    }

    #[test]
    fn test_lines_are_decoded_in_order() {
        let backend = SimulatedBackend::new();
        let device = backend.attach("sim0");
        let dispatcher = Arc::new(EventDispatcher::new());
        let mut stream = dispatcher.subscribe_stream();
        let (stop, exit_rx, handle) = spawn_loop(&backend, &dispatcher);

        device.push_bytes(b"PRESSURE:1.5hPa\r\n\r\nbooting");
        device.push_bytes(b"\nPRESSURE: 2\n");

        let seen = wait_for_events(&mut stream, 3);
        assert_eq!(
            seen,
            vec![
                EventKind::Pressure { hpa: 1.5 },
                EventKind::message("booting"),
                EventKind::Pressure { hpa: 2.0 },
            ]
        );

        stop.store(true, Ordering::SeqCst);
        exit_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_read_failure_emits_error_and_exits() {
        let backend = SimulatedBackend::new();
        let device = backend.attach("sim0");
        let dispatcher = Arc::new(EventDispatcher::new());
        let mut stream = dispatcher.subscribe_stream();
        let (_stop, exit_rx, handle) = spawn_loop(&backend, &dispatcher);

        device.fail_next_read(ErrorKind::BrokenPipe);
        exit_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        handle.join().unwrap();

        let event = stream.try_next().unwrap();
        assert!(matches!(
            event.lifecycle(),
            Some(LifecycleEvent::Error(msg)) if msg.contains("simulated read failure")
        ));
        // Reader handle was dropped with the thread.
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn test_error_after_stop_is_suppressed() {
        let backend = SimulatedBackend::new();
        let device = backend.attach("sim0");
        let dispatcher = Arc::new(EventDispatcher::new());
        let mut stream = dispatcher.subscribe_stream();
        let (stop, exit_rx, handle) = spawn_loop(&backend, &dispatcher);

        stop.store(true, Ordering::SeqCst);
        device.fail_next_read(ErrorKind::BrokenPipe);
        exit_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        handle.join().unwrap();

        assert!(stream.try_next().is_none());
    }
}
