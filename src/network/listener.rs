//! Accepting TCP connections on the dispatcher.

use super::{Address, ConnectionSocket, IoSocketHandle};
use crate::error::Error;
use crate::event::{Dispatcher, FileEvent, Ready};

use mio::net::TcpListener;
use std::cell::RefCell;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, trace, warn};

/// Receives the sockets accepted by a listener.
pub trait ListenerCallbacks {
    fn on_accept(&mut self, socket: ConnectionSocket);
}

/// A listening TCP socket registered with a dispatcher.
///
/// Accepted sockets are passed to the callbacks while the listener is
/// enabled. Dropping the listener closes the socket.
pub struct TcpListenerImpl {
    file_event: Box<dyn FileEvent>,
    _listener: Rc<TcpListener>,
    local_address: SocketAddr,
}

impl TcpListenerImpl {
    /// Binds `address` and starts accepting.
    pub fn bind(
        dispatcher: &Dispatcher,
        address: SocketAddr,
        callbacks: Weak<RefCell<dyn ListenerCallbacks>>,
    ) -> Result<Self, Error> {
        let listener = Rc::new(TcpListener::bind(address)?);
        let local_address = listener.local_addr()?;
        info!(%local_address, "Listening for connections");

        let accept_listener = Rc::downgrade(&listener);
        let file_event = dispatcher.create_file_event(
            listener.as_raw_fd(),
            Box::new(move |_events| {
                if let Some(listener) = accept_listener.upgrade() {
                    on_accept_ready(&listener, &callbacks);
                }
            }),
            Ready::READ,
        );

        Ok(Self {
            file_event,
            _listener: listener,
            local_address,
        })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    /// Resumes accepting after [`TcpListenerImpl::disable`].
    pub fn enable(&self) {
        self.file_event.set_enabled(Ready::READ);
        // Connections queued while disabled do not produce a new edge.
        self.file_event.activate(Ready::READ);
    }

    /// Stops accepting. Pending connections stay queued in the kernel.
    pub fn disable(&self) {
        debug!(local_address = %self.local_address, "Listener disabled");
        self.file_event.set_enabled(Ready::EMPTY);
    }
}

impl Drop for TcpListenerImpl {
    fn drop(&mut self) {
        debug!(local_address = %self.local_address, "Closing listener");
    }
}

fn on_accept_ready(listener: &TcpListener, callbacks: &Weak<RefCell<dyn ListenerCallbacks>>) {
    let local_addr = listener.local_addr().expect("Failed to get local address");

    // Collect everything that is ready first, then hand the sockets out, so
    // the callbacks never run in the middle of the accept loop.
    let mut new_streams = Vec::new();
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                trace!(%local_addr, %peer_addr, "Accepted socket");
                new_streams.push((stream, peer_addr));
            }
            Err(err) => match err.raw_os_error() {
                // Running out of descriptors leaves the process unable to
                // make progress on anything.
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    panic!("Out of file descriptors accepting on {local_addr}: {err}");
                }
                _ => match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, %local_addr, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, %local_addr, "Error accepting connection");
                        break;
                    }
                },
            },
        }
    }

    for (stream, peer_addr) in new_streams {
        let Some(callbacks) = callbacks.upgrade() else {
            debug!(%local_addr, "Listener callbacks gone, dropping socket");
            return;
        };
        let local_address = stream.local_addr().unwrap_or(local_addr);
        if let Err(err) = stream.set_nodelay(true) {
            debug!(?err, %peer_addr, "Failed to set TCP_NODELAY");
        }
        info!(%local_address, %peer_addr, "Accepting connection");
        let socket = ConnectionSocket::new(
            Box::new(IoSocketHandle::new(stream)),
            Address::Ip(local_address),
            Address::Ip(peer_addr),
        );
        callbacks.borrow_mut().on_accept(socket);
    }
}
