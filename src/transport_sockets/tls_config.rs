use crate::config::{get_namespaced_optional_string, get_namespaced_string};
use crate::error::Error;
use ::config::Config;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

const DEFAULT_SERVER_NAME: &str = "localhost";

/// Builds the server side TLS settings from `tls_server_cert`,
/// `tls_server_key` and the optional `tls_alpn_protocols`.
pub(crate) fn server_config_from(config: &Config, name: &str) -> Result<Arc<ServerConfig>, Error> {
    let (Ok(cert_path), Ok(key_path)) = (
        get_namespaced_string(config, name, "tls_server_cert"),
        get_namespaced_string(config, name, "tls_server_key"),
    ) else {
        return Err(Error::TlsServerConfigMissing);
    };
    let mut server_config = load_tls_server_config(&cert_path, &key_path)?;
    server_config.alpn_protocols = alpn_protocols_from(config, name)?;
    Ok(Arc::new(server_config))
}

/// Builds the client side TLS settings from `tls_ca_cert`,
/// `tls_server_name` and the optional `tls_alpn_protocols`.
pub(crate) fn client_config_from(
    config: &Config,
    name: &str,
) -> Result<(Arc<ClientConfig>, ServerName<'static>), Error> {
    let ca_cert_path = get_namespaced_string(config, name, "tls_ca_cert")
        .map_err(|_| Error::TlsClientConfigMissing)?;
    let mut client_config = load_tls_client_config(&ca_cert_path)?;
    client_config.alpn_protocols = alpn_protocols_from(config, name)?;

    let server_name_value = get_namespaced_optional_string(config, name, "tls_server_name")?
        .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
    let server_name = ServerName::try_from(server_name_value.clone())
        .map_err(|_| Error::TlsInvalidServerName(server_name_value))?;

    Ok((Arc::new(client_config), server_name))
}

// A comma separated list, in order of preference.
fn alpn_protocols_from(config: &Config, name: &str) -> Result<Vec<Vec<u8>>, Error> {
    let protocols = get_namespaced_optional_string(config, name, "tls_alpn_protocols")?;
    Ok(protocols
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|protocol| !protocol.is_empty())
                .map(|protocol| protocol.as_bytes().to_vec())
                .collect()
        })
        .unwrap_or_default())
}

pub(crate) fn load_tls_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<ServerConfig, Error> {
    let cert_file = File::open(cert_path).map_err(|e| Error::TlsCertificateLoad {
        path: cert_path.to_string(),
        source: e,
    })?;
    let cert_chain: Vec<CertificateDer> = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    if cert_chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "No certificates found in {cert_path}"
        )));
    }

    let key_file = File::open(key_path).map_err(|e| Error::TlsKeyLoad {
        path: key_path.to_string(),
        source: e,
    })?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("No private key found in {key_path}")))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))
}

pub(crate) fn load_tls_client_config(ca_cert_path: &str) -> Result<ClientConfig, Error> {
    let ca_cert_file = File::open(ca_cert_path).map_err(|e| Error::TlsCertificateLoad {
        path: ca_cert_path.to_string(),
        source: e,
    })?;
    let ca_certs: Vec<CertificateDer> = certs(&mut BufReader::new(ca_cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::TlsInvalidCertificate(format!("Failed to parse CA certificates: {e}"))
        })?;

    if ca_certs.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "No CA certificates found in {ca_cert_path}"
        )));
    }

    let mut root_cert_store = RootCertStore::empty();
    for cert in ca_certs {
        root_cert_store
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth())
}
