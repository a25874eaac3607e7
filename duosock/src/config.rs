//! Configuration file support
//!
//! ```toml
//! [tcp]
//! prefer_ipv6 = true
//! alternate_address_delay_ms = 300
//!
//! [udp]
//! max_send_size = 9216
//!
//! [tls]
//! min_version = "1.2"
//! alpn = ["h2", "http/1.1"]
//! ca_file = "/etc/duosock/ca.pem"
//! ```

use std::path::{Path, PathBuf};

use duo_tls::{TlsSettings, TlsVersion};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::flags::Options;
use crate::tcp::{DEFAULT_ALTERNATE_ADDRESS_DELAY, DEFAULT_READ_CHUNK_SIZE};
use crate::udp::DEFAULT_MAX_DATAGRAM_SIZE;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tcp: TcpConfig,

    #[serde(default)]
    pub udp: UdpConfig,

    /// TLS settings, used when a connection is secured
    pub tls: Option<TlsConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::BadConfig(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::BadConfig(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tcp.validate()?;
        self.udp.validate()?;
        if let Some(ref tls) = self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# duosock configuration

[tcp]
# Turn off one address family entirely
ipv4_disabled = false
ipv6_disabled = false

# Family tried first when a host resolves to both (IPv4 by default)
# prefer_ipv6 = true

# Keep writing after the peer stops sending
allow_half_duplex = false

# Milliseconds before the other family joins the connect race
alternate_address_delay_ms = 300

# Bytes requested from the kernel per read
read_chunk_size = 65536

[udp]
ipv4_disabled = false
ipv6_disabled = false
# prefer_ipv6 = true

# Largest datagrams accepted and sent, in bytes
max_receive_ipv4_size = 65535
max_receive_ipv6_size = 65535
max_send_size = 65535

# Share the bound port with other sockets
reuse_port = false

# TLS, for `connect --tls` (optional)
# [tls]
# min_version = "1.2"
# max_version = "1.3"
# alpn = ["http/1.1"]
# peer_name = "example.com"
# Extra trust anchors, on top of the bundled web roots
# ca_file = "/etc/duosock/ca.pem"
# Evaluate the peer chain in the delegate instead of against the roots
# manual_trust = false
# Share a session cache between connections to the same peer
# resumption_peer_id = "example.com:443"
#
# Server side needs a certificate chain and its key
# server = true
# cert_file = "/etc/duosock/server.pem"
# key_file = "/etc/duosock/server.key"
"#
        .to_string()
    }
}

/// `[tcp]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default)]
    pub ipv4_disabled: bool,

    #[serde(default)]
    pub ipv6_disabled: bool,

    #[serde(default)]
    pub prefer_ipv4: bool,

    #[serde(default)]
    pub prefer_ipv6: bool,

    #[serde(default)]
    pub allow_half_duplex: bool,

    #[serde(default = "default_alternate_address_delay_ms")]
    pub alternate_address_delay_ms: u64,

    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            ipv4_disabled: false,
            ipv6_disabled: false,
            prefer_ipv4: false,
            prefer_ipv6: false,
            allow_half_duplex: false,
            alternate_address_delay_ms: default_alternate_address_delay_ms(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

impl TcpConfig {
    pub fn validate(&self) -> Result<()> {
        check_families("tcp", self.ipv4_disabled, self.ipv6_disabled)?;
        check_preference("tcp", self.prefer_ipv4, self.prefer_ipv6)?;
        if self.read_chunk_size == 0 {
            return Err(Error::BadConfig("tcp.read_chunk_size must be positive".into()));
        }
        Ok(())
    }

    pub fn options(&self) -> Options {
        let mut options = family_options(
            self.ipv4_disabled,
            self.ipv6_disabled,
            self.prefer_ipv4,
            self.prefer_ipv6,
        );
        options.set(Options::ALLOW_HALF_DUPLEX, self.allow_half_duplex);
        options
    }
}

/// `[udp]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpConfig {
    #[serde(default)]
    pub ipv4_disabled: bool,

    #[serde(default)]
    pub ipv6_disabled: bool,

    #[serde(default)]
    pub prefer_ipv4: bool,

    #[serde(default)]
    pub prefer_ipv6: bool,

    #[serde(default = "default_datagram_size")]
    pub max_receive_ipv4_size: usize,

    #[serde(default = "default_datagram_size")]
    pub max_receive_ipv6_size: usize,

    #[serde(default = "default_datagram_size")]
    pub max_send_size: usize,

    #[serde(default)]
    pub reuse_port: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            ipv4_disabled: false,
            ipv6_disabled: false,
            prefer_ipv4: false,
            prefer_ipv6: false,
            max_receive_ipv4_size: default_datagram_size(),
            max_receive_ipv6_size: default_datagram_size(),
            max_send_size: default_datagram_size(),
            reuse_port: false,
        }
    }
}

impl UdpConfig {
    pub fn validate(&self) -> Result<()> {
        check_families("udp", self.ipv4_disabled, self.ipv6_disabled)?;
        check_preference("udp", self.prefer_ipv4, self.prefer_ipv6)?;

        let limits = [
            ("max_receive_ipv4_size", self.max_receive_ipv4_size, u16::MAX as usize),
            ("max_receive_ipv6_size", self.max_receive_ipv6_size, u32::MAX as usize),
            ("max_send_size", self.max_send_size, u16::MAX as usize),
        ];
        for (name, value, max) in limits {
            if value == 0 || value > max {
                return Err(Error::BadConfig(format!(
                    "udp.{} must be between 1 and {}, got {}",
                    name, max, value
                )));
            }
        }
        Ok(())
    }

    pub fn options(&self) -> Options {
        family_options(
            self.ipv4_disabled,
            self.ipv6_disabled,
            self.prefer_ipv4,
            self.prefer_ipv6,
        )
    }
}

/// `[tls]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Play the server role (needs `cert_file` and `key_file`)
    #[serde(default)]
    pub server: bool,

    /// Hand the peer chain to the delegate for a decision
    #[serde(default)]
    pub manual_trust: bool,

    /// "1.2" or "1.3"
    #[serde(default)]
    pub min_version: Option<String>,

    #[serde(default)]
    pub max_version: Option<String>,

    #[serde(default)]
    pub alpn: Vec<String>,

    /// IANA cipher suite names, in preference order
    #[serde(default)]
    pub cipher_suites: Vec<String>,

    /// Name to verify instead of the connected host
    #[serde(default)]
    pub peer_name: Option<String>,

    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Extra root certificates (PEM)
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    #[serde(default)]
    pub resumption_peer_id: Option<String>,
}

impl TlsConfig {
    pub fn validate(&self) -> Result<()> {
        for version in [&self.min_version, &self.max_version].into_iter().flatten() {
            version
                .parse::<TlsVersion>()
                .map_err(|e| Error::BadConfig(format!("tls: {}", e)))?;
        }
        if self.server && (self.cert_file.is_none() || self.key_file.is_none()) {
            return Err(Error::BadConfig(
                "tls.server requires cert_file and key_file".into(),
            ));
        }
        if self.server && self.manual_trust {
            return Err(Error::BadConfig(
                "tls.manual_trust is only available to clients".into(),
            ));
        }
        Ok(())
    }

    /// Build `TlsSettings`, reading the PEM files
    pub fn to_settings(&self) -> Result<TlsSettings> {
        let mut builder = TlsSettings::builder()
            .server(self.server)
            .manual_trust(self.manual_trust)
            .cipher_suites(self.cipher_suites.iter());

        if let Some(ref version) = self.min_version {
            builder = builder.min_version(version.parse()?);
        }
        if let Some(ref version) = self.max_version {
            builder = builder.max_version(version.parse()?);
        }
        for protocol in &self.alpn {
            builder = builder.alpn_protocol(protocol.as_bytes());
        }
        if let Some(ref name) = self.peer_name {
            builder = builder.peer_name(name);
        }
        if let Some(ref id) = self.resumption_peer_id {
            builder = builder.resumption_peer_id(id);
        }
        if let Some(ref path) = self.cert_file {
            builder = builder.certificates_pem(&read_pem(path)?)?;
        }
        if let Some(ref path) = self.key_file {
            builder = builder.private_key_pem(&read_pem(path)?)?;
        }
        if let Some(ref path) = self.ca_file {
            builder = builder.root_certificates_pem(&read_pem(path)?)?;
        }

        Ok(builder.build()?)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::BadConfig(format!("cannot read {}: {}", path.display(), e)))
}

fn check_families(section: &str, ipv4_disabled: bool, ipv6_disabled: bool) -> Result<()> {
    if ipv4_disabled && ipv6_disabled {
        return Err(Error::BadConfig(format!(
            "{}: both IPv4 and IPv6 are disabled",
            section
        )));
    }
    Ok(())
}

fn check_preference(section: &str, prefer_ipv4: bool, prefer_ipv6: bool) -> Result<()> {
    if prefer_ipv4 && prefer_ipv6 {
        return Err(Error::BadConfig(format!(
            "{}: prefer_ipv4 and prefer_ipv6 are mutually exclusive",
            section
        )));
    }
    Ok(())
}

fn family_options(
    ipv4_disabled: bool,
    ipv6_disabled: bool,
    prefer_ipv4: bool,
    prefer_ipv6: bool,
) -> Options {
    let mut options = Options::default();
    options.set_ipv4_enabled(!ipv4_disabled);
    options.set_ipv6_enabled(!ipv6_disabled);
    if prefer_ipv4 {
        options.set_prefer_ipv4();
    }
    if prefer_ipv6 {
        options.set_prefer_ipv6();
    }
    options
}

fn default_alternate_address_delay_ms() -> u64 {
    DEFAULT_ALTERNATE_ADDRESS_DELAY.as_millis() as u64
}

fn default_read_chunk_size() -> usize {
    DEFAULT_READ_CHUNK_SIZE
}

fn default_datagram_size() -> usize {
    DEFAULT_MAX_DATAGRAM_SIZE
}
