//! TLS settings and builder
//!
//! `TlsSettings` is a validated, cloneable description of one side of a
//! TLS session. It turns into rustls client/server configurations on
//! demand, so the same settings can be handed to many sockets.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use rustls::client::{ClientSessionMemoryCache, Resumption};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{Result, TlsError};
use crate::verify::ManualTrustVerifier;

/// Sessions cached per resumption peer id
const SESSION_CACHE_SIZE: usize = 32;

/// Protocol versions that can bound a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn protocol(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        }
    }

    pub(crate) fn from_rustls(version: rustls::ProtocolVersion) -> Option<Self> {
        match version {
            rustls::ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
            rustls::ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
            _ => None,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => write!(f, "TLSv1.2"),
            TlsVersion::Tls13 => write!(f, "TLSv1.3"),
        }
    }
}

impl std::str::FromStr for TlsVersion {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "1.2" | "tls1.2" | "tlsv1.2" | "tls12" => Ok(TlsVersion::Tls12),
            "1.3" | "tls1.3" | "tlsv1.3" | "tls13" => Ok(TlsVersion::Tls13),
            other => Err(TlsError::Config(format!("unknown TLS version: {}", other))),
        }
    }
}

/// Which end of the handshake this side plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsRole {
    #[default]
    Client,
    Server,
}

/// Validated settings for one side of a TLS session
#[derive(Clone)]
pub struct TlsSettings {
    role: TlsRole,
    manual_trust: bool,
    min_version: TlsVersion,
    max_version: TlsVersion,
    alpn: Vec<Vec<u8>>,
    cipher_suites: Vec<String>,
    peer_name: Option<String>,
    certificates: Vec<CertificateDer<'static>>,
    private_key: Option<Arc<PrivateKeyDer<'static>>>,
    root_certificates: Vec<CertificateDer<'static>>,
    resumption_peer_id: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            role: TlsRole::Client,
            manual_trust: false,
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            alpn: Vec::new(),
            cipher_suites: Vec::new(),
            peer_name: None,
            certificates: Vec::new(),
            private_key: None,
            root_certificates: Vec::new(),
            resumption_peer_id: None,
        }
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("role", &self.role)
            .field("manual_trust", &self.manual_trust)
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("alpn", &self.alpn.len())
            .field("cipher_suites", &self.cipher_suites)
            .field("peer_name", &self.peer_name)
            .field("certificates", &self.certificates.len())
            .field("private_key", &self.private_key.is_some())
            .field("root_certificates", &self.root_certificates.len())
            .field("resumption_peer_id", &self.resumption_peer_id)
            .finish()
    }
}

impl TlsSettings {
    /// Create a new settings builder
    pub fn builder() -> TlsSettingsBuilder {
        TlsSettingsBuilder::new()
    }

    /// Client settings verifying the peer against the webpki roots
    pub fn client() -> Self {
        Self::default()
    }

    /// Server settings presenting the given chain
    pub fn server(
        certificates: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        Self::builder()
            .server(true)
            .certificates(certificates)
            .private_key(private_key)
            .build()
    }

    pub fn role(&self) -> TlsRole {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == TlsRole::Server
    }

    pub fn manual_trust(&self) -> bool {
        self.manual_trust
    }

    pub fn min_version(&self) -> TlsVersion {
        self.min_version
    }

    pub fn max_version(&self) -> TlsVersion {
        self.max_version
    }

    pub fn alpn(&self) -> &[Vec<u8>] {
        &self.alpn
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn resumption_peer_id(&self) -> Option<&str> {
        self.resumption_peer_id.as_deref()
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.min_version > self.max_version {
            return Err(TlsError::Config(format!(
                "minimum version {} is above maximum version {}",
                self.min_version, self.max_version
            )));
        }

        match self.role {
            TlsRole::Server => {
                if self.certificates.is_empty() || self.private_key.is_none() {
                    return Err(TlsError::Config(
                        "server role needs a certificate chain and a private key".into(),
                    ));
                }
                if self.manual_trust {
                    return Err(TlsError::Config(
                        "manual trust evaluation is only available to clients".into(),
                    ));
                }
            }
            TlsRole::Client => {
                if self.certificates.is_empty() != self.private_key.is_none() {
                    return Err(TlsError::Config(
                        "client certificates and private key must be given together".into(),
                    ));
                }
            }
        }

        if self.alpn.iter().any(|p| p.is_empty() || p.len() > 255) {
            return Err(TlsError::Config(
                "ALPN protocol names must be 1 to 255 bytes".into(),
            ));
        }

        self.selected_suites()?;
        Ok(())
    }

    fn versions(&self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        [TlsVersion::Tls12, TlsVersion::Tls13]
            .into_iter()
            .filter(|v| *v >= self.min_version && *v <= self.max_version)
            .map(TlsVersion::protocol)
            .collect()
    }

    /// Cipher suites in preference order, or the provider defaults
    fn selected_suites(&self) -> Result<Vec<SupportedCipherSuite>> {
        let available = rustls::crypto::ring::default_provider().cipher_suites;
        if self.cipher_suites.is_empty() {
            return Ok(available);
        }

        self.cipher_suites
            .iter()
            .map(|name| {
                available
                    .iter()
                    .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name))
                    .copied()
                    .ok_or_else(|| TlsError::Config(format!("unknown cipher suite: {}", name)))
            })
            .collect()
    }

    fn crypto_provider(&self) -> Result<Arc<CryptoProvider>> {
        let mut provider = rustls::crypto::ring::default_provider();
        provider.cipher_suites = self.selected_suites()?;
        Ok(Arc::new(provider))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        for cert in &self.root_certificates {
            roots
                .add(cert.clone())
                .map_err(|e| TlsError::Config(format!("bad root certificate: {}", e)))?;
        }
        Ok(roots)
    }

    fn key(&self) -> Result<PrivateKeyDer<'static>> {
        self.private_key
            .as_ref()
            .map(|k| k.clone_key())
            .ok_or_else(|| TlsError::Config("missing private key".into()))
    }

    /// Build the rustls client configuration these settings describe
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let provider = self.crypto_provider()?;
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&self.versions())
            .map_err(|e| TlsError::Config(e.to_string()))?;

        let builder = if self.manual_trust {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ManualTrustVerifier::new(&provider)))
        } else {
            builder.with_root_certificates(self.root_store()?)
        };

        let mut config = if self.certificates.is_empty() {
            builder.with_no_client_auth()
        } else {
            builder
                .with_client_auth_cert(self.certificates.clone(), self.key()?)
                .map_err(|e| TlsError::Config(e.to_string()))?
        };

        config.alpn_protocols = self.alpn.clone();
        config.resumption = match &self.resumption_peer_id {
            Some(peer_id) => Resumption::store(session_cache(peer_id)),
            None => Resumption::disabled(),
        };

        Ok(Arc::new(config))
    }

    /// Build the rustls server configuration these settings describe
    ///
    /// Extra root certificates turn on optional client authentication.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let provider = self.crypto_provider()?;
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&self.versions())
            .map_err(|e| TlsError::Config(e.to_string()))?;

        let builder = if self.root_certificates.is_empty() {
            builder.with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            for cert in &self.root_certificates {
                roots
                    .add(cert.clone())
                    .map_err(|e| TlsError::Config(format!("bad root certificate: {}", e)))?;
            }
            let verifier =
                rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .allow_unauthenticated()
                    .build()
                    .map_err(|e| TlsError::Config(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        };

        let mut config = builder
            .with_single_cert(self.certificates.clone(), self.key()?)
            .map_err(|e| TlsError::Config(e.to_string()))?;
        config.alpn_protocols = self.alpn.clone();

        Ok(Arc::new(config))
    }
}

/// Client session stores shared by every socket with the same peer id
fn session_cache(peer_id: &str) -> Arc<ClientSessionMemoryCache> {
    static CACHES: OnceLock<Mutex<HashMap<String, Arc<ClientSessionMemoryCache>>>> =
        OnceLock::new();

    let caches = CACHES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut caches = match caches.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    caches
        .entry(peer_id.to_string())
        .or_insert_with(|| Arc::new(ClientSessionMemoryCache::new(SESSION_CACHE_SIZE)))
        .clone()
}

/// Builder for TlsSettings
#[derive(Debug, Default)]
pub struct TlsSettingsBuilder {
    settings: TlsSettings,
}

impl TlsSettingsBuilder {
    /// Create a new builder with client defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Act as the server end of the handshake
    pub fn server(mut self, server: bool) -> Self {
        self.settings.role = if server {
            TlsRole::Server
        } else {
            TlsRole::Client
        };
        self
    }

    /// Defer certificate-chain acceptance to the socket owner
    pub fn manual_trust(mut self, enabled: bool) -> Self {
        self.settings.manual_trust = enabled;
        self
    }

    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.settings.min_version = version;
        self
    }

    pub fn max_version(mut self, version: TlsVersion) -> Self {
        self.settings.max_version = version;
        self
    }

    /// Add an ALPN protocol, most preferred first
    pub fn alpn_protocol(mut self, protocol: impl Into<Vec<u8>>) -> Self {
        self.settings.alpn.push(protocol.into());
        self
    }

    /// Restrict and order cipher suites by IANA name
    pub fn cipher_suites<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.cipher_suites = names.into_iter().map(Into::into).collect();
        self
    }

    /// Name to verify the peer against instead of the connect host
    pub fn peer_name(mut self, name: impl Into<String>) -> Self {
        self.settings.peer_name = Some(name.into());
        self
    }

    /// Local certificate chain, end entity first
    pub fn certificates(mut self, chain: Vec<CertificateDer<'static>>) -> Self {
        self.settings.certificates = chain;
        self
    }

    pub fn private_key(mut self, key: PrivateKeyDer<'static>) -> Self {
        self.settings.private_key = Some(Arc::new(key));
        self
    }

    /// Trust an extra root in addition to the webpki roots
    pub fn root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.settings.root_certificates.push(cert);
        self
    }

    /// Share resumable sessions with every socket using the same id
    pub fn resumption_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.settings.resumption_peer_id = Some(peer_id.into());
        self
    }

    /// Load the local certificate chain from PEM
    pub fn certificates_pem(self, pem: &[u8]) -> Result<Self> {
        let chain = parse_certificates(pem)?;
        if chain.is_empty() {
            return Err(TlsError::Config("no certificates in PEM input".into()));
        }
        Ok(self.certificates(chain))
    }

    /// Load the private key from PEM
    pub fn private_key_pem(self, pem: &[u8]) -> Result<Self> {
        let key = PrivateKeyDer::from_pem_slice(pem)
            .map_err(|e| TlsError::Config(format!("bad private key: {}", e)))?;
        Ok(self.private_key(key))
    }

    /// Load extra root certificates from PEM
    pub fn root_certificates_pem(mut self, pem: &[u8]) -> Result<Self> {
        let roots = parse_certificates(pem)?;
        if roots.is_empty() {
            return Err(TlsError::Config("no certificates in PEM input".into()));
        }
        self.settings.root_certificates.extend(roots);
        Ok(self)
    }

    /// Build and validate the settings
    pub fn build(self) -> Result<TlsSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Config(format!("bad certificate: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &[u8] = include_bytes!("../tests/data/server.pem");
    const KEY: &[u8] = include_bytes!("../tests/data/server.key");
    const CA: &[u8] = include_bytes!("../tests/data/ca.pem");

    #[test]
    fn test_client_defaults() {
        let settings = TlsSettings::client();
        assert!(!settings.is_server());
        assert!(!settings.manual_trust());
        assert_eq!(settings.min_version(), TlsVersion::Tls12);
        assert_eq!(settings.max_version(), TlsVersion::Tls13);
        assert!(settings.client_config().is_ok());
    }

    #[test]
    fn test_server_needs_chain_and_key() {
        assert!(TlsSettings::builder().server(true).build().unwrap_err().is_config());

        let settings = TlsSettings::builder()
            .server(true)
            .certificates_pem(CERT)
            .unwrap()
            .private_key_pem(KEY)
            .unwrap()
            .build()
            .unwrap();
        assert!(settings.server_config().is_ok());
    }

    #[test]
    fn test_manual_trust_is_client_only() {
        let result = TlsSettings::builder()
            .server(true)
            .manual_trust(true)
            .certificates_pem(CERT)
            .unwrap()
            .private_key_pem(KEY)
            .unwrap()
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_version_bounds() {
        let result = TlsSettings::builder()
            .min_version(TlsVersion::Tls13)
            .max_version(TlsVersion::Tls12)
            .build();
        assert!(result.is_err());

        let settings = TlsSettings::builder()
            .min_version(TlsVersion::Tls13)
            .build()
            .unwrap();
        assert_eq!(settings.versions().len(), 1);
    }

    #[test]
    fn test_cipher_suite_names() {
        let settings = TlsSettings::builder()
            .cipher_suites(["TLS13_CHACHA20_POLY1305_SHA256", "TLS13_AES_128_GCM_SHA256"])
            .build()
            .unwrap();
        let suites = settings.selected_suites().unwrap();
        assert_eq!(suites.len(), 2);
        assert_eq!(
            format!("{:?}", suites[0].suite()),
            "TLS13_CHACHA20_POLY1305_SHA256"
        );

        let result = TlsSettings::builder().cipher_suites(["TLS_NOT_A_SUITE"]).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_version_parse() {
        assert_eq!("1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("TLSv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert!("1.1".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_root_certificates_and_alpn() {
        let settings = TlsSettings::builder()
            .root_certificates_pem(CA)
            .unwrap()
            .alpn_protocol("h2")
            .alpn_protocol(b"http/1.1".to_vec())
            .build()
            .unwrap();
        let config = settings.client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        assert!(TlsSettings::builder().alpn_protocol("").build().is_err());
    }

    #[test]
    fn test_shared_session_cache() {
        let a = session_cache("peer-a");
        let b = session_cache("peer-a");
        let c = session_cache("peer-b");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
