use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use rustls::{
    Certificate, ClientCertVerified, ClientCertVerifier, ClientConfig, ClientSession,
    DistinguishedNames, PrivateKey, RootCertStore, ServerCertVerified, ServerCertVerifier,
    ServerConfig, ServerSession, Session, StreamOwned, TLSError,
};
use rustls::internal::pemfile;
use thiserror::Error;

pub type ServerStream = StreamOwned<ServerSession, TcpStream>;
pub type ClientStream = StreamOwned<ClientSession, TcpStream>;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to open {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("malformed pem file: {}", .0.display())]
    Pem(PathBuf),
    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),
    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),
    #[error("failed to load certificates: {0}")]
    Rustls(#[from] TLSError),
}

/// The transport an accepted request arrived on. Requests read upload
/// payloads from it and query the peer certificate through it.
pub trait Connection: Read + Write {
    fn peer_certificates(&self) -> Option<Vec<Certificate>>;
    fn close(&mut self) -> io::Result<()>;
}

impl Connection for ServerStream {
    fn peer_certificates(&self) -> Option<Vec<Certificate>> {
        self.sess.get_peer_certificates()
    }

    fn close(&mut self) -> io::Result<()> {
        self.sess.send_close_notify();
        while self.sess.wants_write() {
            self.sess.write_tls(&mut self.sock)?;
        }
        self.sock.shutdown(Shutdown::Write)
    }
}

/// A certificate chain with its private key.
#[derive(Clone, Debug)]
pub struct Identity {
    pub certificates: Vec<Certificate>,
    pub key: PrivateKey,
}

impl Identity {
    pub fn new(certificates: Vec<Certificate>, key: PrivateKey) -> Self {
        Self { certificates, key }
    }

    pub fn load<P: AsRef<Path>, K: AsRef<Path>>(certificate: P, key: K) -> Result<Self, TlsError> {
        Ok(Self {
            certificates: load_certificates(certificate.as_ref())?,
            key: load_private_key(key.as_ref())?,
        })
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io { path: path.to_owned(), source })
}

pub fn load_certificates(path: &Path) -> Result<Vec<Certificate>, TlsError> {
    let certificates = pemfile::certs(&mut open(path)?).or(Err(TlsError::Pem(path.to_owned())))?;
    if certificates.is_empty() {
        return Err(TlsError::NoCertificates(path.to_owned()));
    }

    Ok(certificates)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKey, TlsError> {
    let mut keys = pemfile::pkcs8_private_keys(&mut open(path)?).or(Err(TlsError::Pem(path.to_owned())))?;
    if keys.is_empty() {
        keys = pemfile::rsa_private_keys(&mut open(path)?).or(Err(TlsError::Pem(path.to_owned())))?;
    }

    keys.into_iter().next().ok_or_else(|| TlsError::NoPrivateKey(path.to_owned()))
}

// client certificates are self-signed identities, not chains to a known root
struct AcceptAnyClientCertificate;

impl ClientCertVerifier for AcceptAnyClientCertificate {
    fn client_auth_mandatory(&self, _sni: Option<&webpki::DNSName>) -> Option<bool> {
        Some(false)
    }

    fn client_auth_root_subjects(&self, _sni: Option<&webpki::DNSName>) -> Option<DistinguishedNames> {
        Some(DistinguishedNames::new())
    }

    fn verify_client_cert(
        &self,
        _presented_certs: &[Certificate],
        _sni: Option<&webpki::DNSName>,
    ) -> Result<ClientCertVerified, TLSError> {
        Ok(ClientCertVerified::assertion())
    }
}

struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        _presented_certs: &[Certificate],
        _dns_name: webpki::DNSNameRef,
        _ocsp_response: &[u8],
    ) -> Result<ServerCertVerified, TLSError> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Server side config: presents `identity` and asks for, but never requires,
/// a client certificate.
pub fn server_config(identity: Identity) -> Result<ServerConfig, TlsError> {
    let mut config = ServerConfig::new(Arc::new(AcceptAnyClientCertificate));
    config.set_single_cert(identity.certificates, identity.key)?;
    Ok(config)
}

pub fn client_config(insecure_skip_verify: bool, identity: Option<&Identity>) -> Result<ClientConfig, TlsError> {
    let mut config = ClientConfig::new();
    config.root_store.add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);
    if insecure_skip_verify {
        config.dangerous().set_certificate_verifier(Arc::new(SkipServerVerification));
    }
    if let Some(identity) = identity {
        config.set_single_client_cert(identity.certificates.clone(), identity.key.clone())?;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    #[test]
    fn loads_fixture_identity() {
        let identity = Identity::load(fixture("server.crt.pem"), fixture("server.key.pem")).unwrap();
        assert_eq!(identity.certificates.len(), 1);
        assert!(!identity.key.0.is_empty());
        assert!(server_config(identity).is_ok());
    }

    #[test]
    fn missing_file_names_path() {
        match load_certificates(&fixture("missing.pem")) {
            Err(TlsError::Io { path, .. }) => assert!(path.ends_with("missing.pem")),
            other => panic!("unexpected {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn key_file_has_no_certificates() {
        assert!(matches!(
            load_certificates(&fixture("server.key.pem")),
            Err(TlsError::NoCertificates(_))
        ));
    }

    #[test]
    fn certificate_file_has_no_key() {
        assert!(matches!(
            load_private_key(&fixture("server.crt.pem")),
            Err(TlsError::NoPrivateKey(_))
        ));
    }

    #[test]
    fn client_config_accepts_identity() {
        let identity = Identity::load(fixture("client.crt.pem"), fixture("client.key.pem")).unwrap();
        assert!(client_config(true, Some(&identity)).is_ok());
        assert!(client_config(false, None).is_ok());
    }
}
