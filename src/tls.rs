//! Loads the proxy's forged TLS identity and builds the `rustls` contexts
//! used for MITM `CONNECT` interception (§4.4, §6, §10).

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// The proxy's single static identity, used to terminate TLS as a server on
/// the client-facing leg of every MITM'd `CONNECT` (§1, §6 — one shared
/// cert/key pair, not a per-host certificate authority).
pub struct TlsIdentity {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsIdentity {
    /// Loads and parses `cert_file`/`key_file`. A load or parse failure is
    /// startup-fatal (§7).
    pub fn load(cert_file: &Path, key_file: &Path) -> Result<Self, crate::errors::ProxyError> {
        let certs = load_certs(cert_file)
            .map_err(|e| crate::errors::ProxyError::Startup(format!("cert_file: {e}")))?;
        let key = load_key(key_file)
            .map_err(|e| crate::errors::ProxyError::Startup(format!("key_file: {e}")))?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| crate::errors::ProxyError::Startup(format!("server config: {e}")))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// The acceptor used to terminate TLS on the client-facing leg.
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    /// The connector used to originate TLS on the origin-facing leg,
    /// validated against the Mozilla/WebPKI root store (§10).
    pub fn connector(&self) -> TlsConnector {
        self.connector.clone()
    }
}

/// Builds a `ServerName` for the origin-facing TLS handshake from a raw
/// `Host` hostname extracted by the framer.
pub fn server_name(hostname: &[u8]) -> Result<ServerName<'static>, crate::errors::ProxyError> {
    let hostname = std::str::from_utf8(hostname)
        .map_err(|_| crate::errors::ProxyError::ResourceExhausted("non-utf8 hostname"))?
        .to_string();
    ServerName::try_from(hostname)
        .map_err(|_| crate::errors::ProxyError::ResourceExhausted("invalid hostname"))
}

fn load_certs(path: &Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader).collect()
}

fn load_key(path: &Path) -> std::io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key found"))
}
