//! TLS support for encrypted connections
//!
//! Builds a `tokio_rustls` connector from [`TlsConfig`]: trusted roots come
//! from the configured CA bundle (file or in-memory PEM) or, when neither is
//! set, from the bundled web PKI roots.

use bitriver_redis_core::{
    config::TlsConfig,
    error::{RedisError, RedisResult},
    types::ServerAddr,
};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Client-side TLS connector shared by every connection of a client
#[derive(Clone)]
pub struct TlsConnector {
    config: TlsConfig,
    inner: tokio_rustls::TlsConnector,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Create a connector from TLS settings
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Tls`] if the CA bundle cannot be read or holds
    /// no usable certificate.
    pub fn new(config: TlsConfig) -> RedisResult<Self> {
        let roots = Self::root_store(&config)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| RedisError::Tls(format!("Unsupported protocol versions: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            config,
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    fn root_store(config: &TlsConfig) -> RedisResult<RootCertStore> {
        let mut root_store = RootCertStore::empty();

        let mut certs = Vec::new();
        if let Some(ref path) = config.ca_cert_path {
            let file = File::open(path)
                .map_err(|e| RedisError::Tls(format!("{}: {e}", path.display())))?;
            certs.extend(read_certs(&mut BufReader::new(file))?);
        }
        if let Some(ref pem) = config.ca_cert_pem {
            certs.extend(read_certs(&mut pem.as_slice())?);
        }

        if config.ca_cert_path.is_none() && config.ca_cert_pem.is_none() {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            return Ok(root_store);
        }

        if certs.is_empty() {
            return Err(RedisError::Tls("No CA certificates found".to_string()));
        }
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| RedisError::Tls(format!("Failed to add CA: {e}")))?;
        }
        Ok(root_store)
    }

    /// Name presented for SNI and checked against the server certificate
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Tls`] if the name is not a valid DNS name or IP.
    pub fn server_name(&self, addr: &ServerAddr) -> RedisResult<ServerName<'static>> {
        let name = self
            .config
            .server_name
            .clone()
            .unwrap_or_else(|| addr.host.clone());
        ServerName::try_from(name)
            .map_err(|e| RedisError::Tls(format!("Invalid server name: {e}")))
    }

    /// Run the TLS handshake over an established TCP stream
    ///
    /// # Errors
    ///
    /// A failed handshake is reported as [`RedisError::Dial`].
    pub async fn connect(
        &self,
        addr: &ServerAddr,
        stream: TcpStream,
    ) -> RedisResult<TlsStream<TcpStream>> {
        let name = self.server_name(addr)?;
        self.inner
            .connect(name, stream)
            .await
            .map_err(|e| RedisError::Dial(format!("TLS handshake with {addr} failed: {e}")))
    }

    /// Get the TLS configuration
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

fn read_certs(reader: &mut dyn BufRead) -> RedisResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RedisError::Tls(format!("Invalid PEM: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uses_web_roots() {
        assert!(TlsConnector::new(TlsConfig::new()).is_ok());
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsConfig::new().with_ca_cert("/nonexistent/ca.pem");
        assert!(matches!(TlsConnector::new(config), Err(RedisError::Tls(_))));
    }

    #[test]
    fn test_pem_without_certificates() {
        let config = TlsConfig::new().with_ca_pem(b"not a certificate".to_vec());
        assert!(matches!(TlsConnector::new(config), Err(RedisError::Tls(_))));
    }

    #[test]
    fn test_server_name_defaults_to_host() {
        let connector = TlsConnector::new(TlsConfig::new()).unwrap();
        let name = connector
            .server_name(&ServerAddr::new("cache.example.com", 6380))
            .unwrap();
        assert_eq!(name.to_str(), "cache.example.com");

        let ip = connector
            .server_name(&ServerAddr::new("127.0.0.1", 6380))
            .unwrap();
        assert!(matches!(ip, ServerName::IpAddress(_)));
    }

    #[test]
    fn test_server_name_override() {
        let connector =
            TlsConnector::new(TlsConfig::new().with_server_name("redis.internal")).unwrap();
        let name = connector
            .server_name(&ServerAddr::new("10.0.0.5", 6380))
            .unwrap();
        assert_eq!(name.to_str(), "redis.internal");
    }
}
