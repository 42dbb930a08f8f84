// Client-side TLS trust for QUIC connections to the event store.
//
// QUIC always runs TLS 1.3, so "no certificate configured" cannot mean a
// plaintext transport. It means the client does not negotiate trust: any
// server certificate is accepted and the session is only encrypted.
use quinn::ClientConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
    #[error("failed to read certificate file {path}")]
    ReadCertificate {
        path: PathBuf,
        #[source]
        source: rustls::pki_types::pem::Error,
    },
    #[error("certificate file {path} contains no certificates")]
    NoCertificates { path: PathBuf },
    #[error("certificate in {path} rejected")]
    InvalidCertificate {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },
    #[error("failed to build QUIC crypto config")]
    Crypto(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// How the client decides whether to trust the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustMode {
    /// Trust only servers whose chain ends in a certificate from this PEM file.
    Certificate(PathBuf),
    /// Accept any server certificate.
    Unverified,
}

impl TrustMode {
    pub fn from_cert_file(cert_file: Option<&Path>) -> Self {
        match cert_file {
            Some(path) => Self::Certificate(path.to_path_buf()),
            None => Self::Unverified,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Certificate(_))
    }

    /// Build the quinn client config. Fails fast on an unreadable or invalid
    /// certificate file so misconfiguration never reaches the network.
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        match self {
            Self::Certificate(path) => {
                let roots = load_roots(path)?;
                ClientConfig::with_root_certificates(Arc::new(roots))
                    .map_err(|err| TlsError::Crypto(Box::new(err)))
            }
            Self::Unverified => {
                let provider = Arc::new(rustls::crypto::ring::default_provider());
                let crypto = rustls::ClientConfig::builder_with_provider(provider)
                    .with_protocol_versions(&[&rustls::version::TLS13])
                    .map_err(|err| TlsError::Crypto(Box::new(err)))?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                    .with_no_client_auth();
                let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                    .map_err(|err| TlsError::Crypto(Box::new(err)))?;
                Ok(ClientConfig::new(Arc::new(quic)))
            }
        }
    }
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let read_err = |source| TlsError::ReadCertificate {
        path: path.to_path_buf(),
        source,
    };
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(path).map_err(read_err)? {
        let cert = cert.map_err(read_err)?;
        roots
            .add(cert)
            .map_err(|source| TlsError::InvalidCertificate {
                path: path.to_path_buf(),
                source,
            })?;
    }
    if roots.is_empty() {
        return Err(TlsError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(roots)
}

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
