//! Connect/disconnect behaviour of `LinkManager` against simulated devices.

use pressure_link::adapters::{SimulatedBackend, SimulatedDevice};
use pressure_link::{
    ConfigError, ConnectionError, ConnectionState, EventKind, EventStream, LifecycleEvent,
    LinkManager, LinkTimings, SendError, TelemetryEvent,
};
use std::io::ErrorKind;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn fast_timings() -> LinkTimings {
    LinkTimings {
        poll_interval: Duration::from_millis(5),
        read_timeout: Duration::from_millis(20),
        join_timeout: Duration::from_secs(1),
    }
}

/// Timings with a join timeout short enough to outwait in a test.
fn short_join_timings() -> LinkTimings {
    LinkTimings {
        join_timeout: Duration::from_millis(300),
        ..fast_timings()
    }
}

/// Helper to create a manager with one simulated device on "sim0".
fn create_test_link() -> (LinkManager, SimulatedDevice) {
    let backend = Arc::new(SimulatedBackend::new());
    let device = backend.attach("sim0");
    (LinkManager::with_timings(backend, fast_timings()).unwrap(), device)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

fn collect(stream: &mut EventStream, count: usize) -> Vec<TelemetryEvent> {
    let mut events = Vec::new();
    wait_until(Duration::from_secs(2), || {
        events.extend(stream.drain());
        events.len() >= count
    });
    events
}

fn lifecycle_count(events: &[TelemetryEvent], wanted: &LifecycleEvent) -> usize {
    events
        .iter()
        .filter(|e| e.lifecycle() == Some(wanted))
        .count()
}

#[test]
fn test_connect_then_disconnect_states() {
    let (link, device) = create_test_link();
    let mut stream = link.subscribe_stream();
    assert_eq!(link.current_state(), ConnectionState::Disconnected);

    link.connect("sim0", 9600).unwrap();
    assert_eq!(link.current_state(), ConnectionState::Connected);
    assert_eq!(device.open_handles(), 2);

    link.disconnect();
    assert_eq!(link.current_state(), ConnectionState::Disconnected);
    assert_eq!(device.open_handles(), 0);
    assert_eq!(link.live_receivers(), 0);

    let kinds: Vec<EventKind> = stream.drain().into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::lifecycle(LifecycleEvent::Connected),
            EventKind::lifecycle(LifecycleEvent::Disconnected),
        ]
    );
}

#[test]
fn test_fresh_subscriber_after_disconnect_sees_nothing() {
    let (link, device) = create_test_link();
    link.connect("sim0", 9600).unwrap();
    device.push_pressure(1013.2);
    link.disconnect();

    let mut late = link.subscribe_stream();
    device.push_line("PRESSURE:999");
    std::thread::sleep(Duration::from_millis(50));
    assert!(late.try_next().is_none());
}

#[test]
fn test_disconnect_is_idempotent() {
    let (link, _device) = create_test_link();
    let mut stream = link.subscribe_stream();

    // Disconnecting a link that was never connected is a silent no-op.
    link.disconnect();
    link.connect("sim0", 9600).unwrap();
    link.disconnect();
    link.disconnect();

    let events = stream.drain();
    assert_eq!(lifecycle_count(&events, &LifecycleEvent::Disconnected), 1);
    assert_eq!(link.current_state(), ConnectionState::Disconnected);
}

#[test]
fn test_send_while_disconnected_does_no_io() {
    let (link, device) = create_test_link();

    let err = link.send("20231234").unwrap_err();
    assert!(matches!(err, SendError::NotConnected));
    assert!(device.written_bytes().is_empty());
    assert!(link.history().is_empty());

    link.connect("sim0", 9600).unwrap();
    link.disconnect();
    assert!(matches!(link.send("20231234"), Err(SendError::NotConnected)));
    assert!(device.written_bytes().is_empty());
}

#[test]
fn test_send_write_failure_is_reported() {
    let (link, device) = create_test_link();
    link.connect("sim0", 9600).unwrap();
    device.fail_writes(ErrorKind::BrokenPipe);

    let err = link.send("20231234").unwrap_err();
    assert!(matches!(err, SendError::Io(_)));
    assert!(err.to_string().contains("simulated write failure"));
    assert_eq!(link.current_state(), ConnectionState::Connected);
}

#[test]
fn test_rapid_connect_disconnect_cycles_leave_no_receivers() {
    let (link, device) = create_test_link();
    let mut stream = link.subscribe_stream();

    for cycle in 0..100 {
        let start = Instant::now();
        link.connect("sim0", 9600).unwrap();
        if cycle % 10 == 0 {
            device.push_pressure(f64::from(cycle));
        }
        link.disconnect();

        assert!(
            start.elapsed() < fast_timings().join_timeout,
            "cycle {} took {:?}",
            cycle,
            start.elapsed()
        );
        assert_eq!(link.live_receivers(), 0, "receiver alive after cycle {}", cycle);
        assert_eq!(device.open_handles(), 0, "handle open after cycle {}", cycle);
    }

    let events = stream.drain();
    assert_eq!(lifecycle_count(&events, &LifecycleEvent::Connected), 100);
    assert_eq!(lifecycle_count(&events, &LifecycleEvent::Disconnected), 100);
    assert_eq!(device.open_count(), 100);
}

#[test]
fn test_port_in_use_elsewhere_fails_to_open() {
    let backend = Arc::new(SimulatedBackend::new());
    backend.attach("sim0");
    let first = LinkManager::with_timings(backend.clone(), fast_timings()).unwrap();
    let second = LinkManager::with_timings(backend, fast_timings()).unwrap();

    first.connect("sim0", 9600).unwrap();
    let err = second.connect("sim0", 9600).unwrap_err();
    assert!(matches!(err, ConnectionError::Open { .. }));
    assert_eq!(second.current_state(), ConnectionState::Disconnected);

    first.disconnect();
    second.connect("sim0", 9600).unwrap();
}

#[test]
fn test_missing_port_fails_to_open() {
    let (link, _device) = create_test_link();
    let err = link.connect("sim9", 9600).unwrap_err();
    assert!(matches!(err, ConnectionError::Open { ref port, .. } if port == "sim9"));
}

#[test]
fn test_receive_error_keeps_port_open_until_disconnect() {
    let (link, device) = create_test_link();
    let mut stream = link.subscribe_stream();
    link.connect("sim0", 9600).unwrap();

    device.fail_next_read(ErrorKind::BrokenPipe);
    assert!(wait_until(Duration::from_secs(2), || !link.receiver_running()));

    // No implicit auto-disconnect.
    assert_eq!(link.current_state(), ConnectionState::Connected);
    assert_eq!(device.open_handles(), 1);

    let events = collect(&mut stream, 2);
    assert!(matches!(
        events[1].lifecycle(),
        Some(LifecycleEvent::Error(msg)) if msg.contains("simulated read failure")
    ));

    link.disconnect();
    assert_eq!(device.open_handles(), 0);
    assert_eq!(link.current_state(), ConnectionState::Disconnected);
    let tail = stream.drain();
    assert_eq!(lifecycle_count(&tail, &LifecycleEvent::Disconnected), 1);
}

#[test]
fn test_list_ports_reflects_attached_devices() {
    let backend = Arc::new(SimulatedBackend::new());
    let link = LinkManager::with_timings(backend.clone(), fast_timings()).unwrap();
    assert!(link.list_ports().is_empty());

    backend.attach("/dev/ttyUSB1");
    backend.attach("/dev/ttyUSB0");
    assert_eq!(link.list_ports(), vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);

    backend.detach("/dev/ttyUSB0");
    assert_eq!(link.list_ports(), vec!["/dev/ttyUSB1"]);
}

#[test]
fn test_racing_disconnects_both_return_after_release() {
    let (link, device) = create_test_link();
    let mut stream = link.subscribe_stream();

    for round in 0..50 {
        link.connect("sim0", 9600).unwrap();
        let barrier = Barrier::new(2);

        let race = || {
            barrier.wait();
            link.disconnect();
            (device.open_handles(), link.current_state())
        };
        let observed = thread::scope(|s| {
            let first = s.spawn(race);
            let second = s.spawn(race);
            [first.join().unwrap(), second.join().unwrap()]
        });

        for (handles, state) in observed {
            assert_eq!(handles, 0, "port still open after disconnect in round {}", round);
            assert_eq!(state, ConnectionState::Disconnected, "round {}", round);
        }
        assert_eq!(link.live_receivers(), 0);
    }

    let events = stream.drain();
    assert_eq!(lifecycle_count(&events, &LifecycleEvent::Connected), 50);
    assert_eq!(lifecycle_count(&events, &LifecycleEvent::Disconnected), 50);
}

#[test]
fn test_short_join_timeout_is_rejected() {
    let backend = Arc::new(SimulatedBackend::new());
    let timings = LinkTimings {
        poll_interval: Duration::from_millis(500),
        read_timeout: Duration::from_millis(20),
        join_timeout: Duration::from_millis(10),
    };

    let err = LinkManager::with_timings(backend, timings).err().unwrap();
    assert!(matches!(
        err,
        ConfigError::JoinTimeoutTooShort { minimum, .. } if minimum == Duration::from_millis(520)
    ));
}

#[test]
fn test_stalled_receiver_is_detached_and_reaped_on_reconnect() {
    let backend = Arc::new(SimulatedBackend::new());
    let device = backend.attach("sim0");
    let link = LinkManager::with_timings(backend, short_join_timings()).unwrap();
    let mut stream = link.subscribe_stream();

    link.connect("sim0", 9600).unwrap();
    device.stall_next_read(Duration::from_millis(500));
    thread::sleep(Duration::from_millis(30));

    let start = Instant::now();
    link.disconnect();
    let elapsed = start.elapsed();

    // Bounded by the join timeout, not by the stalled read.
    assert!(elapsed >= short_join_timings().join_timeout);
    assert!(elapsed < Duration::from_millis(500), "disconnect took {:?}", elapsed);
    assert_eq!(link.current_state(), ConnectionState::Disconnected);
    assert_eq!(link.live_receivers(), 1);
    // Only the detached reader is left; the writer is closed.
    assert_eq!(device.open_handles(), 1);

    // Reconnecting waits for the detached reader to let go of the port.
    link.connect("sim0", 9600).unwrap();
    assert_eq!(link.live_receivers(), 1);
    assert_eq!(device.open_handles(), 2);

    link.disconnect();
    assert_eq!(device.open_handles(), 0);
    assert_eq!(link.live_receivers(), 0);

    let events = stream.drain();
    assert_eq!(lifecycle_count(&events, &LifecycleEvent::Disconnected), 2);
}

#[test]
fn test_connect_during_teardown_names_the_port() {
    let backend = Arc::new(SimulatedBackend::new());
    let device = backend.attach("sim0");
    let link = LinkManager::with_timings(backend, short_join_timings()).unwrap();

    link.connect("sim0", 9600).unwrap();
    device.stall_next_read(Duration::from_millis(200));
    thread::sleep(Duration::from_millis(30));

    thread::scope(|s| {
        let teardown = s.spawn(|| link.disconnect());
        assert!(wait_until(Duration::from_secs(1), || {
            link.current_state() == ConnectionState::Disconnecting
        }));
        assert_eq!(link.port().as_deref(), Some("sim0"));

        let err = link.connect("sim0", 9600).unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyConnected(ref p) if p == "sim0"));
        assert!(err.to_string().contains("'sim0'"));

        teardown.join().unwrap();
    });

    assert_eq!(link.current_state(), ConnectionState::Disconnected);
    assert!(link.port().is_none());
}

#[test]
fn test_slow_write_does_not_block_state_queries() {
    let (link, device) = create_test_link();
    link.connect("sim0", 9600).unwrap();
    device.delay_writes(Duration::from_millis(300));

    thread::scope(|s| {
        let writer = s.spawn(|| link.send("20231234"));
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        assert_eq!(link.current_state(), ConnectionState::Connected);
        assert_eq!(link.port().as_deref(), Some("sim0"));
        assert!(start.elapsed() < Duration::from_millis(100));

        assert_eq!(writer.join().unwrap().unwrap().text, "20231234");
    });

    link.disconnect();
    assert_eq!(device.written_lines(), vec!["20231234"]);
}
