//! Accepting connections and tying them to their filter chains.

mod connection_handler;

pub use connection_handler::{ActiveListener, ConnectionHandler, FilterChainFactory, ListenerConfig};
