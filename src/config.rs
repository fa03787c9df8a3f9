//! Command-line surface (§6) lowered into a [`ProxyConfig`].

use crate::limits::ProxyLimits;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// A single-process HTTP/1.1 forward proxy with an LRU response cache and
/// optional CONNECT interception.
#[derive(Debug, Parser)]
#[command(name = "forkproxy", version, about)]
pub struct Cli {
    /// TCP port to listen on.
    pub port: u16,

    /// PEM-encoded certificate for MITM TLS interception. Requires `key_file`.
    pub cert_file: Option<PathBuf>,

    /// PEM-encoded private key matching `cert_file`.
    pub key_file: Option<PathBuf>,

    /// Address to bind the listener to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Maximum number of cached responses.
    #[arg(long, default_value_t = ProxyLimits::default().cache_capacity)]
    pub cache_capacity: usize,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            port: 0,
            cert_file: None,
            key_file: None,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            cache_capacity: ProxyLimits::default().cache_capacity,
        }
    }
}

/// How the proxy handles `CONNECT` requests.
#[derive(Debug, Clone)]
pub enum ConnectMode {
    /// Relay bytes verbatim between client and origin (§4.4).
    OpaqueTunnel,
    /// Terminate TLS on both legs using a static certificate/key pair (§4.4).
    Mitm {
        cert_file: PathBuf,
        key_file: PathBuf,
    },
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub connect_mode: ConnectMode,
    pub limits: ProxyLimits,
}

impl ProxyConfig {
    /// Validates and lowers a parsed [`Cli`] into a [`ProxyConfig`].
    ///
    /// Returns an error string (suitable for a startup-fatal log line, §7)
    /// if `cert_file` is given without `key_file` or vice versa.
    pub fn from_cli(cli: Cli) -> Result<Self, String> {
        let connect_mode = match (cli.cert_file, cli.key_file) {
            (Some(cert_file), Some(key_file)) => ConnectMode::Mitm {
                cert_file,
                key_file,
            },
            (None, None) => ConnectMode::OpaqueTunnel,
            _ => {
                return Err(
                    "cert_file and key_file must both be given to enable MITM mode".to_string(),
                )
            }
        };

        let mut limits = ProxyLimits::default();
        limits.cache_capacity = cli.cache_capacity;

        Ok(Self {
            listen_addr: SocketAddr::new(cli.bind, cli.port),
            connect_mode,
            limits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_port_resolves_to_opaque_tunnel_mode() {
        let cli = Cli {
            port: 8080,
            ..Cli::default()
        };
        let config = ProxyConfig::from_cli(cli).unwrap();
        assert!(matches!(config.connect_mode, ConnectMode::OpaqueTunnel));
        assert_eq!(config.listen_addr.port(), 8080);
    }

    #[test]
    fn cert_and_key_resolve_to_mitm_mode() {
        let cli = Cli {
            port: 8443,
            cert_file: Some(PathBuf::from("cert.pem")),
            key_file: Some(PathBuf::from("key.pem")),
            ..Cli::default()
        };
        let config = ProxyConfig::from_cli(cli).unwrap();
        assert!(matches!(config.connect_mode, ConnectMode::Mitm { .. }));
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let cli = Cli {
            port: 8443,
            cert_file: Some(PathBuf::from("cert.pem")),
            ..Cli::default()
        };
        assert!(ProxyConfig::from_cli(cli).is_err());
    }
}
