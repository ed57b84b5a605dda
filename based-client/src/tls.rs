//! TLS client configuration for `wss://` connections.

use crate::error::ClientError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// TLS settings for the socket connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// PEM file with CA certificates to trust instead of the webpki roots.
    pub ca_cert_path: Option<PathBuf>,
    /// Skip server certificate verification (development only).
    pub insecure: bool,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds the rustls client configuration handed to the websocket connector.
pub fn client_config(config: &TlsClientConfig) -> Result<Arc<rustls::ClientConfig>, ClientError> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::TlsConfig(e.to_string()))?;

    if config.insecure {
        tracing::warn!("TLS certificate verification disabled");
        let client_config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier { provider }))
            .with_no_client_auth();
        return Ok(Arc::new(client_config));
    }

    let mut roots = RootCertStore::empty();
    match config.ca_cert_path {
        Some(ref path) => {
            let certs = load_certs(path)?;
            if certs.is_empty() {
                return Err(ClientError::TlsConfig(format!(
                    "no certificates found in {:?}",
                    path
                )));
            }
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let client_config = builder
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(client_config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
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
    use std::io::Write;

    #[test]
    fn test_default_uses_webpki_roots() {
        assert!(client_config(&TlsClientConfig::new()).is_ok());
    }

    #[test]
    fn test_insecure_config() {
        assert!(client_config(&TlsClientConfig::new().with_insecure()).is_ok());
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsClientConfig::new().with_ca_cert("/nonexistent/ca.pem");
        let err = client_config(&config).unwrap_err();
        assert!(err.to_string().contains("cannot open"));
    }

    #[test]
    fn test_ca_file_without_certs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let config = TlsClientConfig::new().with_ca_cert(file.path());
        let err = client_config(&config).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }
}
