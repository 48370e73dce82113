//! Telemetry events and their delivery to consumers.
//!
//! Producers (the receiver thread and `LinkManager`) call
//! [`EventDispatcher::emit`]; the dispatcher stamps the event and appends it to
//! one unbounded FIFO queue per subscriber. Producers therefore never wait on a
//! consumer, and each consumer sees every event in production order.
//!
//! Two ways to consume:
//! - [`EventDispatcher::subscribe`] runs a handler on a dedicated delivery thread.
//! - [`EventDispatcher::subscribe_stream`] hands back the queue so a consumer can
//!   drain it from its own context (a UI frame loop, an async task).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Notification about the connection itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The port was opened and the receiver started.
    Connected,
    /// The port was closed.
    Disconnected,
    /// The receiver failed and stopped. The port stays open until `disconnect`.
    Error(String),
}

/// What a telemetry event carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Atmospheric pressure reading in hPa.
    Pressure {
        /// Reading in hectopascal
        hpa: f64,
    },
    /// Any line that is not a pressure reading.
    Message {
        /// The line as received, trimmed
        text: String,
    },
    /// Connection lifecycle notification.
    Lifecycle {
        /// Which transition happened
        event: LifecycleEvent,
    },
}

impl EventKind {
    /// Shorthand for a `Message` kind.
    pub fn message(text: impl Into<String>) -> Self {
        EventKind::Message { text: text.into() }
    }

    /// Shorthand for a `Lifecycle` kind.
    pub fn lifecycle(event: LifecycleEvent) -> Self {
        EventKind::Lifecycle { event }
    }
}

/// A stamped event as delivered to consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Capture time, never earlier than the previous event's
    pub timestamp: DateTime<Utc>,
    /// Payload
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TelemetryEvent {
    /// Pressure in hPa if this is a reading.
    pub fn pressure(&self) -> Option<f64> {
        match self.kind {
            EventKind::Pressure { hpa } => Some(hpa),
            _ => None,
        }
    }

    /// Lifecycle transition if this is one.
    pub fn lifecycle(&self) -> Option<&LifecycleEvent> {
        match &self.kind {
            EventKind::Lifecycle { event } => Some(event),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Pressure { hpa } => write!(f, "Pressure: {:.1} hPa", hpa),
            EventKind::Message { text } => f.write_str(text),
            EventKind::Lifecycle { event } => match event {
                LifecycleEvent::Connected => f.write_str("Connected"),
                LifecycleEvent::Disconnected => f.write_str("Disconnected"),
                LifecycleEvent::Error(msg) => write!(f, "Receive error: {}", msg),
            },
        }
    }
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self.timestamp.with_timezone(&Local);
        write!(f, "[{}] {}", local.format("%H:%M:%S"), self.kind)
    }
}

struct Subscriber {
    id: u64,
    tx: UnboundedSender<TelemetryEvent>,
}

struct DispatchInner {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    last_stamp: Option<DateTime<Utc>>,
}

fn lock_inner(inner: &Mutex<DispatchInner>) -> MutexGuard<'_, DispatchInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fan-out of telemetry events to subscribers, in production order.
pub struct EventDispatcher {
    inner: Arc<Mutex<DispatchInner>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    /// Create a dispatcher with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DispatchInner {
                subscribers: Vec::new(),
                next_id: 0,
                last_stamp: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchInner> {
        lock_inner(&self.inner)
    }

    /// Stamp `kind` and queue it for every live subscriber.
    ///
    /// Stamping happens under the dispatcher lock, so two producers racing each
    /// other still yield non-decreasing timestamps in queue order.
    pub fn emit(&self, kind: EventKind) -> TelemetryEvent {
        let mut inner = self.lock();
        let now = Utc::now();
        let timestamp = match inner.last_stamp {
            Some(last) if last > now => last,
            _ => now,
        };
        inner.last_stamp = Some(timestamp);

        let event = TelemetryEvent { timestamp, kind };
        inner
            .subscribers
            .retain(|sub| sub.tx.send(event.clone()).is_ok());
        event
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|sub| !sub.tx.is_closed());
        inner.subscribers.len()
    }

    fn register(&self) -> (u64, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, tx });
        (id, EventStream { rx })
    }

    /// Receive every subsequent event as a queue drained by the caller.
    pub fn subscribe_stream(&self) -> EventStream {
        self.register().1
    }

    /// Run `handler` for every subsequent event on a dedicated delivery thread.
    pub fn subscribe<F>(&self, mut handler: F) -> std::io::Result<Subscription>
    where
        F: FnMut(TelemetryEvent) + Send + 'static,
    {
        let (id, mut stream) = self.register();
        let worker = thread::Builder::new()
            .name("pressure-dispatch".to_string())
            .spawn(move || {
                while let Some(event) = stream.rx.blocking_recv() {
                    handler(event);
                }
                debug!("Event delivery thread {} finished", id);
            })?;
        Ok(Subscription {
            id,
            dispatcher: Arc::downgrade(&self.inner),
            worker: Some(worker),
        })
    }

    /// Drop every subscriber queue. Delivery threads exit once drained.
    pub fn close(&self) {
        self.lock().subscribers.clear();
    }
}

/// Handle to a handler-based subscription.
///
/// Dropping it leaves the delivery thread running until the dispatcher closes.
pub struct Subscription {
    id: u64,
    dispatcher: Weak<Mutex<DispatchInner>>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Whether the delivery thread has exited.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop receiving new events, let the handler drain what is already
    /// queued, then join the delivery thread.
    pub fn cancel(self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            lock_inner(&inner).subscribers.retain(|sub| sub.id != self.id);
        }
        self.join();
    }

    /// Wait for the delivery thread to drain and exit.
    ///
    /// Only returns once the subscription was cancelled or the dispatcher has
    /// been closed or dropped.
    pub fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Event handler panicked");
            }
        }
    }
}

/// A subscriber queue drained by the consumer.
pub struct EventStream {
    rx: UnboundedReceiver<TelemetryEvent>,
}

impl EventStream {
    /// Next queued event without waiting. `None` if the queue is empty or closed.
    pub fn try_next(&mut self) -> Option<TelemetryEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Everything currently queued.
    pub fn drain(&mut self) -> Vec<TelemetryEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Wait for the next event. `None` once the dispatcher is gone.
    pub async fn next(&mut self) -> Option<TelemetryEvent> {
        self.rx.recv().await
    }

    /// Block the current (non-async) thread for the next event.
    pub fn blocking_next(&mut self) -> Option<TelemetryEvent> {
        self.rx.blocking_recv()
    }
}
