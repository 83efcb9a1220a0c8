//! Transport security: client-certificate policy and rustls server config construction.
//!
//! Secured listeners accept TLS 1.2 and 1.3 only. When the policy verifies client
//! certificates, the CA file must load or no config is produced at all.

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("invalid CA certificate in {path}: {source}")]
    InvalidCa {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },
    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("tls config: {0}")]
    Rustls(#[from] rustls::Error),
}

/// How secured listeners treat client certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCertPolicy {
    /// No client certificate is requested.
    NoClientCert,
    /// A client certificate must be presented but is not checked against a CA.
    ClientCertNoVerification,
    /// A client certificate must be presented and chain to the configured CA.
    ClientCertVerification,
}

impl ClientCertPolicy {
    /// Map the `serverCertOpt` value. Anything unrecognized gets the strictest policy.
    pub fn from_config_str(s: &str) -> Self {
        match s.trim() {
            "NoClientCert" => Self::NoClientCert,
            "ClientCertNoVerification" => Self::ClientCertNoVerification,
            "ClientCertVerification" => Self::ClientCertVerification,
            other => {
                log::warn!("unknown client cert option {:?}; using ClientCertVerification", other);
                Self::ClientCertVerification
            }
        }
    }

    pub fn verifies_client(self) -> bool {
        matches!(self, Self::ClientCertVerification)
    }
}

/// A rustls server config ready for a secured listener.
#[derive(Clone)]
pub struct ServerTls {
    pub(crate) server_name: String,
    pub policy: ClientCertPolicy,
    pub config: Arc<ServerConfig>,
}

impl std::fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTls")
            .field("server_name", &self.server_name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn read_file(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = read_file(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = read_file(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

fn load_ca_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|source| TlsError::InvalidCa {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(roots)
}

/// Build the server config for a secured listener.
///
/// The CA file is read before anything else when the policy verifies clients, so a bad CA
/// path can never degrade into a listener that skips client verification.
pub fn build_server_tls(
    server_name: &str,
    ca_cert: &Path,
    server_cert: &Path,
    server_key: &Path,
    policy: ClientCertPolicy,
) -> Result<ServerTls, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let verifier: Option<Arc<dyn ClientCertVerifier>> = if policy.verifies_client() {
        let roots = load_ca_roots(ca_cert)?;
        log::info!("loaded {} CA certificate(s) from {}", roots.len(), ca_cert.display());
        Some(WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone()).build()?)
    } else if policy == ClientCertPolicy::ClientCertNoVerification {
        Some(Arc::new(AcceptAnyClientCert::new(&provider)))
    } else {
        None
    };

    let certs = load_certs(server_cert)?;
    let key = load_private_key(server_key)?;

    let builder = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?;
    let builder = match verifier {
        Some(v) => builder.with_client_cert_verifier(v),
        None => builder.with_no_client_auth(),
    };
    let mut config = builder.with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    log::info!("tls config for {} built with client cert policy {:?}", server_name, policy);
    Ok(ServerTls {
        server_name: server_name.to_string(),
        policy,
        config: Arc::new(config),
    })
}

/// Requires a client certificate but accepts any one. Handshake signatures are still checked.
#[derive(Debug)]
pub struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyClientCert {
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn missing(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("vissgw-tls-missing-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn policy_mapping_is_total_and_fails_closed() {
        assert_eq!(ClientCertPolicy::from_config_str("NoClientCert"), ClientCertPolicy::NoClientCert);
        assert_eq!(
            ClientCertPolicy::from_config_str("ClientCertNoVerification"),
            ClientCertPolicy::ClientCertNoVerification
        );
        assert_eq!(
            ClientCertPolicy::from_config_str("ClientCertVerification"),
            ClientCertPolicy::ClientCertVerification
        );
        assert_eq!(ClientCertPolicy::from_config_str(""), ClientCertPolicy::ClientCertVerification);
        assert_eq!(
            ClientCertPolicy::from_config_str("noclientcert"),
            ClientCertPolicy::ClientCertVerification
        );
    }

    #[test]
    fn only_full_verification_needs_the_ca() {
        assert!(!ClientCertPolicy::NoClientCert.verifies_client());
        assert!(!ClientCertPolicy::ClientCertNoVerification.verifies_client());
        assert!(ClientCertPolicy::ClientCertVerification.verifies_client());
    }

    #[test]
    fn every_policy_builds_with_valid_material() {
        let pki = test_pki::TestPki::new();
        for policy in [
            ClientCertPolicy::NoClientCert,
            ClientCertPolicy::ClientCertNoVerification,
            ClientCertPolicy::ClientCertVerification,
        ] {
            let tls = pki.build(policy);
            assert_eq!(tls.policy, policy);
            assert_eq!(tls.server_name, "localhost");
            assert!(tls.config.supports_version(rustls::ProtocolVersion::TLSv1_3));
            assert!(tls.config.supports_version(rustls::ProtocolVersion::TLSv1_2));
            assert!(!tls.config.supports_version(rustls::ProtocolVersion::TLSv1_1));
            assert!(!tls.config.supports_version(rustls::ProtocolVersion::TLSv1_0));
            assert_eq!(tls.config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        }
    }

    #[test]
    fn unreadable_ca_yields_no_config() {
        let ca = missing("Root.CA.crt");
        let result = build_server_tls(
            "localhost",
            &ca,
            &missing("server.crt"),
            &missing("server.key"),
            ClientCertPolicy::ClientCertVerification,
        );
        match result {
            Err(TlsError::Read { path, .. }) => assert_eq!(path, ca),
            other => panic!("expected CA read error, got {:?}", other),
        }
    }

    #[test]
    fn ca_without_certificates_yields_no_config() {
        let dir = std::env::temp_dir().join(format!("vissgw-tls-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let ca = dir.join("Root.CA.crt");
        std::fs::write(&ca, b"not a pem file\n").unwrap();
        let result = build_server_tls(
            "localhost",
            &ca,
            &missing("server.crt"),
            &missing("server.key"),
            ClientCertPolicy::ClientCertVerification,
        );
        assert!(matches!(result, Err(TlsError::NoCertificates(p)) if p == ca));
    }

    #[test]
    fn missing_server_cert_is_an_error_without_client_auth() {
        let cert = missing("server.crt");
        let result = build_server_tls(
            "localhost",
            &missing("Root.CA.crt"),
            &cert,
            &missing("server.key"),
            ClientCertPolicy::NoClientCert,
        );
        assert!(matches!(result, Err(TlsError::Read { path, .. }) if path == cert));
    }
}
