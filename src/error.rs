use crate::network::IoError;
use thiserror::Error;

/// The error type for proxycore operations.
///
/// This covers failures that can be reported to the caller of a constructor or
/// setup call: creating a dispatcher, binding a listener, opening a client
/// socket, loading TLS material, or reading configuration.
///
/// Failures that happen once a connection exists are not reported through this
/// type. They close the connection and are observed as
/// [`ConnectionEvent::RemoteClose`](crate::ConnectionEvent::RemoteClose) or
/// [`ConnectionEvent::LocalClose`](crate::ConnectionEvent::LocalClose).
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A socket operation on an I/O handle failed.
    #[error("Socket error: {0}")]
    Socket(#[from] IoError),

    /// The provided address could not be parsed or is not usable for the
    /// requested operation.
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    /// A userspace pipe was requested for an internal address that has no
    /// registered listener.
    #[error("No pipe listener registered for '{address}'")]
    NoPipeListener {
        /// The internal address that was requested.
        address: String,
    },

    /// A pipe listener is already registered for this internal address.
    #[error("Pipe listener already registered for '{address}'")]
    PipeListenerExists {
        /// The internal address that was registered twice.
        address: String,
    },

    /// Attempted to operate on a listener tag that doesn't exist.
    #[error("Listener {tag} not found")]
    ListenerNotFound {
        /// The listener tag that was not found.
        tag: u64,
    },

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// A TLS server transport was requested but `tls_server_cert` and
    /// `tls_server_key` are not configured.
    #[error("TLS server configuration not provided")]
    TlsServerConfigMissing,

    /// A TLS client transport was requested but `tls_ca_cert` is not
    /// configured.
    #[error("TLS client configuration not provided")]
    TlsClientConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for `transport_type` configuration key.
    ///
    /// Must be one of: "raw" or "tls" (when the `tls` feature is enabled).
    #[error("Invalid transport type '{got}', expected one of: {}", .valid.join(", "))]
    InvalidTransportType { got: String, valid: Vec<String> },

    /// Invalid value for `capture_format` configuration key.
    #[error("Invalid capture format '{0}', expected one of: text, binary")]
    InvalidCaptureFormat(String),

    /// A capture trace could not be encoded or decoded.
    #[error("Capture trace encoding error: {0}")]
    CaptureEncoding(String),
}
