//! BufferedIoSocketHandle Tests

mod test_helper;

use proxycore::{Buffer, BufferedIoSocketHandle, IoErrorKind, IoHandle, OwnedBuffer, Ready};
use std::cell::RefCell;
use std::io::{IoSlice, IoSliceMut};
use std::net::Shutdown;
use std::rc::Rc;
use test_helper::*;

fn read_all(handle: &mut BufferedIoSocketHandle) -> Vec<u8> {
    let mut buffer = OwnedBuffer::new();
    handle.read(&mut buffer, usize::MAX).unwrap();
    buffer.to_vec()
}

#[test]
fn read_before_data_is_again() {
    let (mut client, _server) = BufferedIoSocketHandle::pair(0);
    let mut buffer = OwnedBuffer::new();
    let mut buf = [0u8; 8];

    let err = client.read(&mut buffer, 8).unwrap_err();
    assert_eq!(err.kind(), IoErrorKind::Again);
    assert!(err.is_again());
    assert_eq!(client.recv(&mut buf, false).unwrap_err().kind(), IoErrorKind::Again);
    let mut slices = [IoSliceMut::new(&mut buf)];
    assert_eq!(client.readv(8, &mut slices).unwrap_err().kind(), IoErrorKind::Again);
}

#[test]
fn read_after_write_end_is_eof() {
    let (mut client, _server) = BufferedIoSocketHandle::pair(0);
    client.set_write_end();
    let mut buffer = OwnedBuffer::new();
    let mut buf = [0u8; 8];

    assert!(client.is_peer_shut_down_write());
    assert_eq!(client.read(&mut buffer, 8).unwrap(), 0);
    assert_eq!(client.recv(&mut buf, false).unwrap(), 0);
    let mut slices = [IoSliceMut::new(&mut buf)];
    assert_eq!(client.readv(8, &mut slices).unwrap(), 0);
}

#[test]
fn fragmented_writes_read_back_verbatim() {
    let (mut client, mut server) = BufferedIoSocketHandle::pair(0);

    assert_eq!(client.write(&mut OwnedBuffer::from("ab")).unwrap(), 2);
    assert_eq!(client.writev(&[IoSlice::new(b"c")]).unwrap(), 1);
    assert_eq!(
        client.writev(&[IoSlice::new(b"d"), IoSlice::new(b"ef")]).unwrap(),
        3
    );

    assert!(server.is_readable());
    assert_eq!(read_all(&mut server), b"abcdef");
    assert!(!server.is_readable());
}

#[test]
fn write_drains_source_buffer() {
    let (mut client, mut server) = BufferedIoSocketHandle::pair(0);
    let mut data = OwnedBuffer::from("payload");

    client.write(&mut data).unwrap();
    assert!(data.is_empty());
    assert_eq!(read_all(&mut server), b"payload");
}

#[test]
fn read_respects_max_length() {
    let (mut client, mut server) = BufferedIoSocketHandle::pair(0);
    client.write(&mut OwnedBuffer::from("0123456789")).unwrap();

    let mut buffer = OwnedBuffer::new();
    assert_eq!(server.read(&mut buffer, 4).unwrap(), 4);
    assert_eq!(buffer.as_slice(), b"0123");
    assert_eq!(server.read(&mut buffer, 100).unwrap(), 6);
    assert_eq!(buffer.as_slice(), b"0123456789");
}

#[test]
fn readv_fills_slices_in_order() {
    let (mut client, mut server) = BufferedIoSocketHandle::pair(0);
    client.write(&mut OwnedBuffer::from("abcdefg")).unwrap();

    let mut first = [0u8; 3];
    let mut second = [0u8; 3];
    let mut slices = [IoSliceMut::new(&mut first), IoSliceMut::new(&mut second)];
    assert_eq!(server.readv(5, &mut slices).unwrap(), 5);
    assert_eq!(&first, b"abc");
    assert_eq!(&second[..2], b"de");
    assert_eq!(read_all(&mut server), b"fg");
}

#[test]
fn recv_peek_keeps_data() {
    let (mut client, mut server) = BufferedIoSocketHandle::pair(0);
    client.write(&mut OwnedBuffer::from("peek")).unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(server.recv(&mut buf, true).unwrap(), 4);
    assert_eq!(&buf, b"peek");
    assert_eq!(server.recv(&mut buf, false).unwrap(), 4);
    assert_eq!(server.recv(&mut buf, false).unwrap_err().kind(), IoErrorKind::Again);
}

#[test]
fn shutdown_write_gives_peer_eof() {
    let (mut client, mut server) = BufferedIoSocketHandle::pair(0);
    client.write(&mut OwnedBuffer::from("last")).unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    // A second shutdown is a no-op.
    client.shutdown(Shutdown::Write).unwrap();

    assert_eq!(read_all(&mut server), b"last");
    let mut buffer = OwnedBuffer::new();
    assert_eq!(server.read(&mut buffer, 8).unwrap(), 0);

    // The peer has seen end of stream, so further writes are rejected.
    let err = client.write(&mut OwnedBuffer::from("more")).unwrap_err();
    assert_eq!(err.kind(), IoErrorKind::InvalidArgument);
}

#[test]
fn shutdown_read_is_not_supported() {
    let (mut client, _server) = BufferedIoSocketHandle::pair(0);
    let err = client.shutdown(Shutdown::Read).unwrap_err();
    assert_eq!(err.kind(), IoErrorKind::NotSupported);
}

#[test]
fn close_gives_peer_eof_and_stops_its_writes() {
    let (mut client, mut server) = BufferedIoSocketHandle::pair(0);
    client.write(&mut OwnedBuffer::from("bye")).unwrap();
    client.close().unwrap();
    assert!(!client.is_open());

    assert_eq!(read_all(&mut server), b"bye");
    let mut buffer = OwnedBuffer::new();
    assert_eq!(server.read(&mut buffer, 8).unwrap(), 0);

    let err = server.write(&mut OwnedBuffer::from("late")).unwrap_err();
    assert_eq!(err.kind(), IoErrorKind::InvalidArgument);

    // I/O on the closed end itself is a caller error.
    let err = client.read(&mut buffer, 8).unwrap_err();
    assert_eq!(err.kind(), IoErrorKind::InvalidArgument);
    client.close().unwrap();
}

#[test]
fn dropped_endpoint_gives_peer_eof() {
    let (mut client, server) = BufferedIoSocketHandle::pair(0);
    client.write(&mut OwnedBuffer::from("last")).unwrap();
    drop(client);
    let mut server = server;

    assert!(server.is_peer_shut_down_write());
    assert_eq!(read_all(&mut server), b"last");
    let mut buffer = OwnedBuffer::new();
    assert_eq!(server.read(&mut buffer, 8).unwrap(), 0);

    let err = server.write(&mut OwnedBuffer::from("gone")).unwrap_err();
    assert_eq!(err.kind(), IoErrorKind::InvalidArgument);
}

#[test]
fn high_watermark_blocks_writer_until_drained() {
    let (mut client, mut server) = BufferedIoSocketHandle::pair(8);

    client.write(&mut OwnedBuffer::from("12345678")).unwrap();
    assert!(!client.is_peer_writable());
    let err = client.write(&mut OwnedBuffer::from("9")).unwrap_err();
    assert_eq!(err.kind(), IoErrorKind::Again);

    let mut buffer = OwnedBuffer::new();
    server.read(&mut buffer, 5).unwrap();
    assert!(client.is_peer_writable());
    client.write(&mut OwnedBuffer::from("9")).unwrap();
    assert_eq!(read_all(&mut server), b"6789");
}

#[test]
fn socket_only_operations_are_not_supported() {
    let (mut client, _server) = BufferedIoSocketHandle::pair(0);
    let address: proxycore::Address = "127.0.0.1:0".parse().unwrap();

    assert!(client.connect(&address).is_ok());
    assert_eq!(client.bind(&address).unwrap_err().kind(), IoErrorKind::NotSupported);
    assert_eq!(client.local_address().unwrap_err().kind(), IoErrorKind::NotSupported);
    assert_eq!(client.set_no_delay(true).unwrap_err().kind(), IoErrorKind::NotSupported);
    assert!(client.take_error().unwrap().is_none());
}

#[test]
fn file_event_reports_new_data_on_next_iteration() {
    let dispatcher = new_dispatcher();
    let (mut client, server) = BufferedIoSocketHandle::pair(0);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let seen_cb = seen.clone();
    let _event = server.create_file_event(
        &dispatcher,
        Box::new(move |events| seen_cb.borrow_mut().push(events)),
        Ready::READ,
    );
    run_iterations(&dispatcher, 2);
    assert!(seen.borrow().is_empty());

    client.write(&mut OwnedBuffer::from("x")).unwrap();
    // Nothing is delivered from inside the write.
    assert!(seen.borrow().is_empty());

    run_iterations(&dispatcher, 1);
    assert_eq!(*seen.borrow(), vec![Ready::READ]);
}

#[test]
fn file_event_reports_closed_when_only_closed_is_enabled() {
    let dispatcher = new_dispatcher();
    let (mut client, server) = BufferedIoSocketHandle::pair(0);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let seen_cb = seen.clone();
    let _event = server.create_file_event(
        &dispatcher,
        Box::new(move |events| seen_cb.borrow_mut().push(events)),
        Ready::CLOSED,
    );
    client.close().unwrap();
    run_iterations(&dispatcher, 1);
    assert_eq!(*seen.borrow(), vec![Ready::CLOSED]);
}

#[test]
fn file_event_reports_writable_peer_when_enabled() {
    let dispatcher = new_dispatcher();
    let (client, _server) = BufferedIoSocketHandle::pair(0);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let seen_cb = seen.clone();
    let _event = client.create_file_event(
        &dispatcher,
        Box::new(move |events| seen_cb.borrow_mut().push(events)),
        Ready::READ | Ready::WRITE,
    );
    run_iterations(&dispatcher, 1);
    assert_eq!(*seen.borrow(), vec![Ready::WRITE]);
}
