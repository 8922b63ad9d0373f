//! Connection configuration.
//!
//! # Design
//! `ConnectOptions` is fixed for the life of a `Client`. Defaults are filled
//! in by the constructors, never lazily: once built, a TLS config always
//! carries an SNI hostname (the target host unless one was given), so the
//! transport never has to guess. Options deserialize from JSON for hosts that
//! keep connection settings in a file.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Buffered outgoing bytes above which `Transport::write` reports
/// backpressure.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Environment variable that turns on debug logging for the core.
pub const DEBUG_ENV: &str = "HTTP_CONN_DEBUG";

/// TLS settings for a secure connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    /// SNI hostname and the name the certificate is verified against.
    #[serde(default)]
    pub hostname: Option<String>,

    /// DER-encoded trust anchors. Empty means the bundled web PKI roots.
    #[serde(default)]
    pub certificates: Vec<Vec<u8>>,

    /// Verify the peer certificate chain and hostname.
    #[serde(default = "default_verify")]
    pub verify: bool,
}

fn default_verify() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            certificates: Vec::new(),
            verify: true,
        }
    }
}

impl TlsConfig {
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    pub fn with_certificate(mut self, der: Vec<u8>) -> Self {
        self.certificates.push(der);
        self
    }

    pub fn insecure(mut self) -> Self {
        self.verify = false;
        self
    }

    /// The SNI hostname, once defaults have been applied.
    pub fn server_name(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    fn fill_defaults(&mut self, host: &str) {
        if self.hostname.as_deref().map_or(true, str::is_empty) {
            self.hostname = Some(host.to_string());
        }
    }
}

/// Where and how a `Client` connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectOptions {
    host: String,
    port: u16,
    #[serde(default)]
    tls: Option<TlsConfig>,
    #[serde(default = "default_high_water_mark")]
    high_water_mark: usize,
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}

impl ConnectOptions {
    /// Plaintext connection to `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            tls: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    /// TLS connection to `host:port`.
    pub fn secure(host: &str, port: u16, tls: TlsConfig) -> Self {
        Self::new(host, port).with_tls(tls)
    }

    pub fn with_tls(mut self, mut tls: TlsConfig) -> Self {
        tls.fill_defaults(&self.host);
        self.tls = Some(tls);
        self
    }

    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let mut options: ConnectOptions = serde_json::from_str(raw)?;
        let host = options.host.clone();
        if let Some(tls) = options.tls.as_mut() {
            tls.fill_defaults(&host);
        }
        Ok(options)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Value for the `Host` request header. The port is omitted when it is
    /// the scheme default.
    pub fn authority(&self) -> String {
        let default_port = if self.is_secure() { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Whether debug logging was requested through `HTTP_CONN_DEBUG`. Read once
/// per process.
pub fn debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var(DEBUG_ENV)
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false)
    })
}
