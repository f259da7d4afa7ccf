/*!
 * TLS configuration for upgradable transports.
 *
 * Client-side rustls configuration shared by the TCP and WebSocket
 * substrates. Peer verification uses caller-supplied PEM roots;
 * `TlsVerify::Insecure` skips verification entirely and exists for lab
 * gear with self-signed certificates.
 */
use std::sync::Arc;

use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::error::{Error, Result};

/// How the peer's certificate is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVerify {
    /// Verify the certificate chain against the configured roots
    Peer,
    /// Accept any certificate
    Insecure,
}

/// TLS context for a transport's `start_tls`
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Verification mode
    pub verify: TlsVerify,
    /// PEM bundle of root certificates (required for [`TlsVerify::Peer`])
    pub root_certs_pem: Option<Vec<u8>>,
    /// SNI name; defaults to the endpoint host
    pub server_name: Option<String>,
}

impl TlsSettings {
    /// Verify against the given PEM root bundle
    pub fn with_roots(root_certs_pem: Vec<u8>) -> Self {
        Self {
            verify: TlsVerify::Peer,
            root_certs_pem: Some(root_certs_pem),
            server_name: None,
        }
    }

    /// Skip certificate verification
    pub fn insecure() -> Self {
        Self {
            verify: TlsVerify::Insecure,
            root_certs_pem: None,
            server_name: None,
        }
    }

    /// Override the SNI name
    pub fn server_name<S: AsRef<str>>(mut self, name: S) -> Self {
        self.server_name = Some(name.as_ref().to_string());
        self
    }
}

/// Build the rustls client configuration for these settings
pub(crate) fn build_client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>> {
    let config = match settings.verify {
        TlsVerify::Peer => {
            let pem = settings.root_certs_pem.as_deref().ok_or_else(|| {
                Error::fatal("peer verification requires a root certificate bundle")
            })?;
            let mut roots = RootCertStore::empty();
            let certs: Vec<CertificateDer<'static>> =
                rustls_pemfile::certs(&mut std::io::Cursor::new(pem))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| Error::fatal(format!("invalid root certificate PEM: {}", e)))?;
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|e| Error::fatal(format!("unusable root certificate: {}", e)))?;
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        TlsVerify::Insecure => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Resolve the SNI name for a connection
pub(crate) fn resolve_server_name(
    settings: &TlsSettings,
    host: &str,
) -> Result<ServerName<'static>> {
    let name = settings
        .server_name
        .clone()
        .unwrap_or_else(|| host.to_string());
    ServerName::try_from(name).map_err(|e| Error::fatal(format!("invalid TLS server name: {}", e)))
}

/// Certificate verifier that accepts everything
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_config_builds() {
        let settings = TlsSettings::insecure();
        assert!(build_client_config(&settings).is_ok());
    }

    #[test]
    fn test_peer_mode_requires_roots() {
        let settings = TlsSettings {
            verify: TlsVerify::Peer,
            root_certs_pem: None,
            server_name: None,
        };
        assert!(matches!(
            build_client_config(&settings),
            Err(Error::Fatal(_))
        ));
    }

    #[test]
    fn test_server_name_override() {
        let settings = TlsSettings::insecure().server_name("projector.local");
        let name = resolve_server_name(&settings, "10.0.0.5").unwrap();
        assert!(matches!(name, ServerName::DnsName(_)));
    }

    #[test]
    fn test_ip_server_name() {
        let settings = TlsSettings::insecure();
        let name = resolve_server_name(&settings, "10.0.0.5").unwrap();
        assert!(matches!(name, ServerName::IpAddress(_)));
    }
}
