//! Owns the listeners of one dispatcher and the connections they accept.

use crate::config::get_namespaced_usize;
use crate::error::Error;
use crate::event::Dispatcher;
use crate::network::{
    Address, CloseType, Connection, ConnectionCallbacks, ConnectionEvent, ConnectionPtr,
    ConnectionSocket, ListenerCallbacks, State, TcpListenerImpl, TransportSocketFactory,
};
use crate::transport_sockets::server_transport_socket_factory;
use ::config::{Config, ConfigError};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tracing::{debug, info, instrument, warn};

const DEFAULT_PER_CONNECTION_BUFFER_LIMIT: usize = 1024 * 1024;

/// Installs the network filters of a newly accepted connection.
pub trait FilterChainFactory {
    /// Adds read and write filters to `connection`. Returns false if the
    /// connection should not be served.
    fn create_network_filter_chain(&self, connection: &mut dyn Connection) -> bool;
}

/// How a listener is set up.
#[derive(Clone)]
pub struct ListenerConfig {
    pub name: String,
    /// Listeners sharing a tag are stopped and removed together.
    pub tag: u64,
    /// An IP address to bind, or an internal address served by userspace
    /// pipes.
    pub address: Address,
    pub per_connection_buffer_limit: usize,
    pub transport_socket_factory: Rc<dyn TransportSocketFactory>,
    pub filter_chain_factory: Rc<dyn FilterChainFactory>,
}

impl ListenerConfig {
    /// Reads `per_connection_buffer_limit` and the transport socket settings
    /// for the listener `name`.
    pub fn from_config(
        config: &Config,
        name: &str,
        tag: u64,
        address: Address,
        filter_chain_factory: Rc<dyn FilterChainFactory>,
    ) -> Result<Self, Error> {
        let per_connection_buffer_limit =
            match get_namespaced_usize(config, name, "per_connection_buffer_limit") {
                Ok(limit) => limit,
                Err(ConfigError::NotFound(_)) => DEFAULT_PER_CONNECTION_BUFFER_LIMIT,
                Err(err) => return Err(err.into()),
            };

        Ok(Self {
            name: name.to_string(),
            tag,
            address,
            per_connection_buffer_limit,
            transport_socket_factory: server_transport_socket_factory(config, name)?,
            filter_chain_factory,
        })
    }
}

type ConnectionMap = Rc<RefCell<HashMap<u64, ConnectionPtr>>>;

enum ListenSocket {
    Tcp(TcpListenerImpl),
    Pipe(String),
}

/// One listener and the connections it accepted that are still open.
pub struct ActiveListener {
    config: ListenerConfig,
    dispatcher: Dispatcher,
    socket: Option<ListenSocket>,
    connections: ConnectionMap,
}

impl ActiveListener {
    fn new(dispatcher: &Dispatcher, config: ListenerConfig) -> Result<Rc<RefCell<Self>>, Error> {
        let listener = Rc::new(RefCell::new(Self {
            config: config.clone(),
            dispatcher: dispatcher.clone(),
            socket: None,
            connections: Rc::default(),
        }));

        let socket = match &config.address {
            Address::Ip(address) => {
                let dyn_listener: Rc<RefCell<dyn ListenerCallbacks>> = listener.clone();
                let callbacks: Weak<RefCell<dyn ListenerCallbacks>> = Rc::downgrade(&dyn_listener);
                ListenSocket::Tcp(TcpListenerImpl::bind(dispatcher, *address, callbacks)?)
            }
            Address::Internal(name) => {
                let weak = Rc::downgrade(&listener);
                dispatcher.register_pipe_factory(
                    name,
                    Rc::new(move |_dispatcher: &Dispatcher, socket: ConnectionSocket| {
                        if let Some(listener) = weak.upgrade() {
                            listener.borrow_mut().new_connection(socket);
                        }
                    }),
                )?;
                ListenSocket::Pipe(name.clone())
            }
        };
        listener.borrow_mut().socket = Some(socket);
        Ok(listener)
    }

    pub fn tag(&self) -> u64 {
        self.config.tag
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The bound address. For IP listeners bound to port 0 this carries the
    /// port the kernel picked.
    pub fn address(&self) -> Address {
        match &self.socket {
            Some(ListenSocket::Tcp(listener)) => Address::Ip(listener.local_address()),
            _ => self.config.address.clone(),
        }
    }

    pub fn num_connections(&self) -> usize {
        self.connections.borrow().len()
    }

    /// Stops accepting. Open connections are left alone.
    fn stop(&mut self) {
        match &self.socket {
            Some(ListenSocket::Tcp(listener)) => listener.disable(),
            Some(ListenSocket::Pipe(name)) => {
                self.dispatcher.unregister_pipe_factory(name);
                // The name may be registered again by another listener.
                self.socket = None;
            }
            None => {}
        }
    }

    fn close_connections(&mut self) {
        let connections = std::mem::take(&mut *self.connections.borrow_mut());
        for (id, connection) in connections {
            debug!(id, listener = %self.config.name, "Closing connection of removed listener");
            connection.borrow_mut().close(CloseType::NoFlush);
            self.dispatcher.deferred_delete(connection);
        }
    }

    #[instrument(skip(self, socket), fields(listener = %self.config.name))]
    fn new_connection(&mut self, socket: ConnectionSocket) {
        let transport_socket = self.config.transport_socket_factory.create_transport_socket();
        let connection = self
            .dispatcher
            .create_server_connection(socket, transport_socket);

        let id = {
            let mut conn = connection.borrow_mut();
            conn.set_buffer_limits(self.config.per_connection_buffer_limit);

            let served = self
                .config
                .filter_chain_factory
                .create_network_filter_chain(&mut *conn)
                && conn.initialize_read_filters();
            if !served {
                debug!(id = conn.id(), "Closing connection: no filters");
                conn.close(CloseType::NoFlush);
            }
            if conn.state() == State::Closed {
                None
            } else {
                let id = conn.id();
                conn.add_connection_callbacks(Box::new(ActiveConnectionCallbacks {
                    connections: Rc::downgrade(&self.connections),
                    id,
                }));
                Some(id)
            }
        };

        match id {
            Some(id) => {
                debug!(id, "New connection tracked");
                self.connections.borrow_mut().insert(id, connection);
            }
            None => self.dispatcher.deferred_delete(connection),
        }
    }
}

impl ListenerCallbacks for ActiveListener {
    fn on_accept(&mut self, socket: ConnectionSocket) {
        self.new_connection(socket);
    }
}

impl Drop for ActiveListener {
    fn drop(&mut self) {
        if let Some(ListenSocket::Pipe(name)) = &self.socket {
            self.dispatcher.unregister_pipe_factory(name);
        }
    }
}

// Removes a connection from its listener once it closes.
struct ActiveConnectionCallbacks {
    connections: Weak<RefCell<HashMap<u64, ConnectionPtr>>>,
    id: u64,
}

impl ConnectionCallbacks for ActiveConnectionCallbacks {
    fn on_event(&mut self, connection: &mut dyn Connection, event: ConnectionEvent) {
        if event == ConnectionEvent::Connected {
            return;
        }
        let Some(connections) = self.connections.upgrade() else {
            return;
        };
        let removed = connections.borrow_mut().remove(&self.id);
        if let Some(removed) = removed {
            debug!(id = self.id, ?event, "Connection closed, untracking");
            // Still borrowed by the caller.
            connection.dispatcher().deferred_delete(removed);
        }
    }
}

/// Listeners by tag and the connections accepted on them.
pub struct ConnectionHandler {
    dispatcher: Dispatcher,
    listeners: Vec<Rc<RefCell<ActiveListener>>>,
}

impl ConnectionHandler {
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            listeners: Vec::new(),
        }
    }

    /// Starts a listener. Returns the bound address.
    pub fn add_listener(&mut self, config: ListenerConfig) -> Result<Address, Error> {
        let name = config.name.clone();
        let tag = config.tag;
        let listener = ActiveListener::new(&self.dispatcher, config)?;
        let address = listener.borrow().address();
        info!(%name, tag, %address, "Added listener");
        self.listeners.push(listener);
        Ok(address)
    }

    /// Stops and removes the listeners tagged `tag`, closing their
    /// connections.
    pub fn remove_listeners(&mut self, tag: u64) -> Result<(), Error> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.listeners)
            .into_iter()
            .partition(|listener| listener.borrow().tag() == tag);
        self.listeners = kept;
        if removed.is_empty() {
            warn!(tag, "No listener to remove");
            return Err(Error::ListenerNotFound { tag });
        }

        for listener in removed {
            {
                let mut active = listener.borrow_mut();
                info!(name = %active.name(), tag, "Removing listener");
                active.stop();
                active.close_connections();
            }
            self.dispatcher.deferred_delete(listener);
        }
        Ok(())
    }

    /// Stops accepting on the listeners tagged `tag`. Their connections stay
    /// open.
    pub fn stop_listeners(&mut self, tag: u64) -> Result<(), Error> {
        let mut found = false;
        for listener in &self.listeners {
            let mut active = listener.borrow_mut();
            if active.tag() == tag {
                info!(name = %active.name(), tag, "Stopping listener");
                active.stop();
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(Error::ListenerNotFound { tag })
        }
    }

    pub fn stop_all_listeners(&mut self) {
        for listener in &self.listeners {
            listener.borrow_mut().stop();
        }
    }

    /// Open connections across all listeners.
    pub fn num_connections(&self) -> usize {
        self.listeners
            .iter()
            .map(|listener| listener.borrow().num_connections())
            .sum()
    }

    /// The bound addresses of the listeners tagged `tag`.
    pub fn listener_addresses(&self, tag: u64) -> Vec<Address> {
        self.listeners
            .iter()
            .map(|listener| listener.borrow())
            .filter(|listener| listener.tag() == tag)
            .map(|listener| listener.address())
            .collect()
    }
}
