use anyhow::Context;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Builds the server side TLS configuration.
/// When no private key is supplied a self-signed certificate for
/// `hostname` is generated, which is sufficient for opportunistic STARTTLS.
pub fn make_server_config(
    hostname: &str,
    tls_private_key: Option<&Path>,
    tls_certificate: Option<&Path>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut certificates = vec![];
    let private_key = match tls_private_key {
        Some(key) => PrivateKeyDer::from_pem_file(key)
            .with_context(|| format!("loading private key from {}", key.display()))?,
        None => {
            let key = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
            certificates.push(CertificateDer::from_slice(key.cert.der()).into_owned());
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()))
        }
    };

    if let Some(cert_file) = tls_certificate {
        certificates = CertificateDer::pem_file_iter(cert_file)
            .with_context(|| format!("opening certificates from {}", cert_file.display()))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("loading certificates from {}", cert_file.display()))?;
    }
    if certificates.is_empty() {
        anyhow::bail!("a private key was configured without a certificate chain");
    }

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}

pub fn make_acceptor(
    hostname: &str,
    tls_private_key: Option<&Path>,
    tls_certificate: Option<&Path>,
) -> anyhow::Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(make_server_config(
        hostname,
        tls_private_key,
        tls_certificate,
    )?))
}

/// A client connector that accepts any server certificate.
/// Used to exercise the server side handshake in tests.
#[cfg(any(test, feature = "test-util"))]
pub fn make_insecure_connector() -> anyhow::Result<tokio_rustls::TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(danger::NoCertificateVerification::new(provider.clone()));
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

#[cfg(any(test, feature = "test-util"))]
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct NoCertificateVerification(Arc<CryptoProvider>);

    impl NoCertificateVerification {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn self_signed() {
        make_server_config("mx.example.com", None, None).unwrap();
    }

    #[test]
    fn key_without_chain() {
        let dir = tempfile::tempdir().unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let key_path = dir.path().join("key.pem");
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        let err = make_server_config("mx.example.com", Some(&key_path), None).unwrap_err();
        assert!(err.to_string().contains("without a certificate"));
    }

    #[test]
    fn load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let generated = rcgen::generate_simple_self_signed(vec!["mx.example.com".to_string()])
            .unwrap();
        let key_path = dir.path().join("key.pem");
        let cert_path = dir.path().join("cert.pem");
        std::fs::write(&key_path, generated.key_pair.serialize_pem()).unwrap();
        std::fs::write(&cert_path, generated.cert.pem()).unwrap();
        make_server_config("mx.example.com", Some(&key_path), Some(&cert_path)).unwrap();
    }
}
