//! Transport sockets beyond the raw pass-through, and selecting one from
//! configuration.
//!
//! # Configuration Keys
//!
//! Looked up as `{name}.{key}` first, then `{key}`:
//!
//! - `transport_type`: "raw" (default) or "tls"
//! - `tls_server_cert`, `tls_server_key`: server side TLS material
//! - `tls_ca_cert`: CA used by TLS clients to verify the server
//! - `tls_server_name`: SNI and verified name for TLS clients (default
//!   "localhost")
//! - `tls_alpn_protocols`: comma separated ALPN protocols to offer
//! - `capture_path_prefix`: when set, traffic is recorded by a
//!   [`CaptureSocket`]
//! - `capture_format`: "text" (default) or "binary"

#[cfg(feature = "capture")]
mod capture;
#[cfg(feature = "tls")]
mod tls;
#[cfg(feature = "tls")]
mod tls_config;

#[cfg(feature = "capture")]
pub use capture::{CaptureFormat, CaptureSocket, CaptureSocketFactory, Direction, Trace, TraceEvent};
#[cfg(feature = "tls")]
pub use tls::{TlsClientSocketFactory, TlsServerSocketFactory, TlsSocket};

use crate::config::get_namespaced_optional_string;
use crate::error::Error;
use crate::network::{RawBufferSocketFactory, TransportSocketFactory};
use ::config::Config;

use std::rc::Rc;
use tracing::debug;

const DEFAULT_TRANSPORT_TYPE: &str = "raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Server,
    Client,
}

/// Creates the transport socket factory for accepted connections.
pub fn server_transport_socket_factory(
    config: &Config,
    name: &str,
) -> Result<Rc<dyn TransportSocketFactory>, Error> {
    transport_socket_factory(config, name, Side::Server)
}

/// Creates the transport socket factory for client connections.
pub fn client_transport_socket_factory(
    config: &Config,
    name: &str,
) -> Result<Rc<dyn TransportSocketFactory>, Error> {
    transport_socket_factory(config, name, Side::Client)
}

fn transport_socket_factory(
    config: &Config,
    name: &str,
    side: Side,
) -> Result<Rc<dyn TransportSocketFactory>, Error> {
    let transport_type = get_namespaced_optional_string(config, name, "transport_type")?
        .unwrap_or_else(|| DEFAULT_TRANSPORT_TYPE.to_string());
    debug!(name, %transport_type, ?side, "Creating transport socket factory");

    let factory: Rc<dyn TransportSocketFactory> = match transport_type.as_str() {
        "raw" => Rc::new(RawBufferSocketFactory),
        #[cfg(feature = "tls")]
        "tls" => match side {
            Side::Server => Rc::new(TlsServerSocketFactory::new(tls_config::server_config_from(
                config, name,
            )?)),
            Side::Client => {
                let (client_config, server_name) = tls_config::client_config_from(config, name)?;
                Rc::new(TlsClientSocketFactory::new(client_config, server_name))
            }
        },
        _ => {
            let mut valid = vec!["raw".to_string()];
            #[cfg(feature = "tls")]
            {
                valid.push("tls".to_string());
            }

            return Err(Error::InvalidTransportType {
                got: transport_type,
                valid,
            });
        }
    };

    with_capture(config, name, factory)
}

#[cfg(feature = "capture")]
fn with_capture(
    config: &Config,
    name: &str,
    factory: Rc<dyn TransportSocketFactory>,
) -> Result<Rc<dyn TransportSocketFactory>, Error> {
    let Some(path_prefix) = get_namespaced_optional_string(config, name, "capture_path_prefix")?
    else {
        return Ok(factory);
    };
    let format = match get_namespaced_optional_string(config, name, "capture_format")? {
        Some(format) => format.parse()?,
        None => CaptureFormat::Text,
    };
    debug!(name, %path_prefix, ?format, "Capturing transport traffic");
    Ok(Rc::new(CaptureSocketFactory::new(factory, path_prefix, format)))
}

#[cfg(not(feature = "capture"))]
fn with_capture(
    _config: &Config,
    _name: &str,
    factory: Rc<dyn TransportSocketFactory>,
) -> Result<Rc<dyn TransportSocketFactory>, Error> {
    Ok(factory)
}
