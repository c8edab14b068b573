//! Client TLS for HTTPS-CONNECT upstreams.
//!
//! The CONNECT exchange with an HTTPS proxy runs inside a TLS session to
//! the proxy itself. Trust comes from a configured CA bundle; the
//! insecure escape hatch exists because such proxies commonly present
//! self-signed certificates.

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::{Arc, Once};

use anyhow::{bail, Context, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::TlsOptions;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Prepared TLS client for the configured proxy.
pub struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClient {
    pub fn from_options(options: &TlsOptions) -> Result<Self> {
        init_crypto_provider();

        let config = if options.insecure {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
                .with_no_client_auth()
        } else if let Some(path) = &options.ca_file {
            let file = File::open(path)
                .with_context(|| format!("Unable to open CA bundle {}", path.display()))?;
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
                let cert = cert
                    .with_context(|| format!("Malformed certificate in {}", path.display()))?;
                roots
                    .add(cert)
                    .with_context(|| format!("Rejected certificate in {}", path.display()))?;
            }
            if roots.is_empty() {
                bail!("CA bundle {} contains no certificates", path.display());
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            bail!(
                "https-connect requires SHUNT_PROXY_TLS_CA_FILE \
                 (or SHUNT_PROXY_TLS_INSECURE=1)"
            );
        };

        let server_name = ServerName::try_from(options.server_name.clone())
            .context("SHUNT_PROXY_TLS_HOSTNAME is not a valid server name")?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Wrap an established TCP connection to the proxy in TLS.
    pub async fn connect(&self, tcp: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        self.connector.connect(self.server_name.clone(), tcp).await
    }
}

/// Accepts any certificate. Only reachable through the explicit insecure
/// configuration flag.
#[derive(Debug)]
struct NoVerification {
    provider: rustls::crypto::CryptoProvider,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_trust_configuration_is_rejected() {
        let options = TlsOptions {
            server_name: "proxy.example.com".to_string(),
            ca_file: None,
            insecure: false,
        };
        assert!(TlsClient::from_options(&options).is_err());
    }

    #[test]
    fn insecure_mode_builds_without_roots() {
        let options = TlsOptions {
            server_name: "127.0.0.1".to_string(),
            ca_file: None,
            insecure: true,
        };
        assert!(TlsClient::from_options(&options).is_ok());
    }
}
