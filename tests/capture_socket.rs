//! Capture Transport Socket Tests

#![cfg(feature = "capture")]

mod test_helper;

use proxycore::prelude::*;
use proxycore::{
    server_transport_socket_factory, CaptureFormat, CaptureSocketFactory, Direction,
    RawBufferSocketFactory, Trace,
};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;
use test_helper::*;

struct Client {
    connection: ConnectionPtr,
    events: Rc<RefCell<Recorded>>,
    received: Rc<RefCell<Received>>,
}

fn connect(
    dispatcher: &Dispatcher,
    address: &Address,
    factory: &dyn TransportSocketFactory,
    half_close: bool,
) -> Client {
    let connection = dispatcher
        .create_client_connection(address, None, factory.create_transport_socket())
        .unwrap();
    let (callbacks, events) = RecordingCallbacks::new();
    let (filter, received) = CollectFilter::new();
    {
        let mut conn = connection.borrow_mut();
        conn.enable_half_close(half_close);
        conn.add_connection_callbacks(callbacks);
        conn.add_read_filter(filter);
        conn.initialize_read_filters();
        conn.connect();
    }
    Client {
        connection,
        events,
        received,
    }
}

/// Starts an echo listener whose transport comes from `config`.
fn capture_listener(
    handler: &mut ConnectionHandler,
    config: &config::Config,
    address: &str,
) -> Address {
    let listener = ListenerConfig::from_config(
        config,
        "capture",
        1,
        address.parse().unwrap(),
        Rc::new(EchoFilterChainFactory),
    )
    .unwrap();
    handler.add_listener(listener).unwrap()
}

fn capture_config(prefix: &Path, format: Option<&str>) -> config::Config {
    let mut builder = config::Config::builder()
        .set_override("capture.capture_path_prefix", prefix.to_str().unwrap())
        .unwrap();
    if let Some(format) = format {
        builder = builder.set_override("capture.capture_format", format).unwrap();
    }
    builder.build().unwrap()
}

fn trace_files(dir: &TempDir) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    files
}

// ============================================================================
// Server Side Capture
// ============================================================================

#[test]
fn binary_trace_records_reads_and_writes() {
    let dispatcher = new_dispatcher();
    let dir = TempDir::new().unwrap();
    let config = capture_config(&dir.path().join("server"), Some("binary"));
    let mut handler = ConnectionHandler::new(&dispatcher);
    let address = capture_listener(&mut handler, &config, "internal:binary");

    let client = connect(&dispatcher, &address, &RawBufferSocketFactory, false);
    client
        .connection
        .borrow_mut()
        .write(&mut buffer_of(b"hello"), false);
    run_until(&dispatcher, || client.received.borrow().data == b"hello");

    client.connection.borrow_mut().close(CloseType::NoFlush);
    run_until(&dispatcher, || handler.num_connections() == 0);

    let files = trace_files(&dir);
    assert_eq!(files.len(), 1);
    let trace = Trace::decode(&std::fs::read(&files[0]).unwrap()).unwrap();
    assert_eq!(
        files[0].file_name().unwrap().to_str().unwrap(),
        format!("server_{}.bin", trace.connection_id)
    );
    assert_ne!(trace.connection_id, client.connection.borrow().id());

    let events = &trace.events;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].direction, Direction::Read);
    assert_eq!(events[0].data, b"hello");
    assert!(!events[0].end_stream);
    assert_eq!(events[1].direction, Direction::Write);
    assert_eq!(events[1].data, b"hello");
    assert_eq!(events[2].direction, Direction::Read);
    assert!(events[2].data.is_empty());
    assert!(events[2].end_stream);
    assert!(events[0].timestamp_us <= events[2].timestamp_us);
}

#[test]
fn text_trace_is_the_default_format() {
    let dispatcher = new_dispatcher();
    let dir = TempDir::new().unwrap();
    let config = capture_config(&dir.path().join("server"), None);
    let mut handler = ConnectionHandler::new(&dispatcher);
    let address = capture_listener(&mut handler, &config, "internal:text");

    let client = connect(&dispatcher, &address, &RawBufferSocketFactory, false);
    client
        .connection
        .borrow_mut()
        .write(&mut buffer_of(b"line\n"), false);
    run_until(&dispatcher, || client.received.borrow().data == b"line\n");

    drop(client);
    run_until(&dispatcher, || handler.num_connections() == 0);

    let files = trace_files(&dir);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].extension().unwrap(), "txt");

    let text = std::fs::read_to_string(&files[0]).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 6);
    assert!(lines[0].starts_with("read ts="));
    assert!(lines[0].ends_with("len=5 end_stream=false"));
    assert_eq!(lines[1], "line\\n");
    assert!(lines[2].starts_with("write ts="));
    assert_eq!(lines[3], "line\\n");
    assert!(lines[4].ends_with("len=0 end_stream=true"));
    assert_eq!(lines[5], "");
}

// ============================================================================
// Client Side Capture
// ============================================================================

#[test]
fn write_end_stream_is_recorded_once() {
    let dispatcher = new_dispatcher();
    let dir = TempDir::new().unwrap();
    let mut handler = ConnectionHandler::new(&dispatcher);
    let address = capture_listener(&mut handler, &empty_config(), "internal:plain");

    let factory = CaptureSocketFactory::new(
        Rc::new(RawBufferSocketFactory),
        dir.path().join("client").to_str().unwrap(),
        CaptureFormat::Binary,
    );
    assert!(!factory.implements_secure_transport());
    let client = connect(&dispatcher, &address, &factory, true);
    client
        .connection
        .borrow_mut()
        .write(&mut buffer_of(b"ping"), true);

    run_until(&dispatcher, || client.events.borrow().closed());
    run_iterations(&dispatcher, 2);

    let files = trace_files(&dir);
    assert_eq!(files.len(), 1);
    let trace = Trace::decode(&std::fs::read(&files[0]).unwrap()).unwrap();
    assert_eq!(trace.connection_id, client.connection.borrow().id());

    let writes: Vec<_> = trace
        .events
        .iter()
        .filter(|event| event.direction == Direction::Write)
        .collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].data, b"ping");
    assert!(writes[0].end_stream);

    let last = trace.events.last().unwrap();
    assert_eq!(last.direction, Direction::Read);
    assert!(last.end_stream);
}

#[test]
fn unwritable_trace_path_does_not_affect_the_connection() {
    let dispatcher = new_dispatcher();
    let dir = TempDir::new().unwrap();
    let config = capture_config(&dir.path().join("missing").join("server"), Some("text"));
    let mut handler = ConnectionHandler::new(&dispatcher);
    let address = capture_listener(&mut handler, &config, "internal:unwritable");

    let client = connect(&dispatcher, &address, &RawBufferSocketFactory, false);
    client
        .connection
        .borrow_mut()
        .write(&mut buffer_of(b"data"), false);
    run_until(&dispatcher, || client.received.borrow().data == b"data");

    client.connection.borrow_mut().close(CloseType::NoFlush);
    run_until(&dispatcher, || handler.num_connections() == 0);
    assert!(trace_files(&dir).is_empty());
}

#[test]
fn capture_wraps_configured_transport() {
    let dir = TempDir::new().unwrap();
    let config = capture_config(&dir.path().join("factory"), Some("binary"));
    let factory = server_transport_socket_factory(&config, "capture").unwrap();
    assert!(!factory.implements_secure_transport());

    // Nothing is written until a socket closes.
    let _socket = factory.create_transport_socket();
    assert!(trace_files(&dir).is_empty());
}

#[test]
fn trace_decode_rejects_garbage() {
    let err = Trace::decode(&[0xff, 0xff, 0xff]).unwrap_err();
    assert!(matches!(err, Error::CaptureEncoding(_)));
}
