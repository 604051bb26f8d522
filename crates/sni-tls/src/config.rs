//! TLS configuration options.

use std::time::Duration;

use rustls::pki_types::CertificateDer;

use crate::error::TlsError;

/// How TLS is negotiated on the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TlsNegotiation {
    /// Handshake records travel inside prelogin envelopes, after the
    /// cleartext prelogin exchange.
    #[default]
    Enveloped,
    /// TLS starts immediately on the raw transport.
    Direct,
}

/// TLS configuration for SNI transports.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TlsConfig {
    /// Accept any server certificate.
    ///
    /// **Warning:** This is insecure and should only be used for testing.
    pub trust_server_certificate: bool,

    /// Root certificates to trust. Empty means the Mozilla root store.
    pub root_certificates: Vec<CertificateDer<'static>>,

    /// Name validated against the server certificate.
    ///
    /// If not set, the name passed to the connector is used.
    pub server_name: Option<String>,

    /// Minimum TLS version to accept.
    pub min_protocol_version: TlsVersion,

    /// Maximum TLS version to accept.
    pub max_protocol_version: TlsVersion,

    /// Where the handshake bytes travel.
    pub negotiation: TlsNegotiation,

    /// Upper bound on the handshake. `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            trust_server_certificate: false,
            root_certificates: Vec::new(),
            server_name: None,
            min_protocol_version: TlsVersion::Tls12,
            max_protocol_version: TlsVersion::Tls13,
            negotiation: TlsNegotiation::Enveloped,
            handshake_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl TlsConfig {
    /// Create a new TLS configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the server certificate without validation.
    ///
    /// **Warning:** This is insecure and should only be used for testing.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Add a root certificate to trust.
    #[must_use]
    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Set the server name for certificate validation.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the minimum TLS version.
    #[must_use]
    pub fn min_protocol_version(mut self, version: TlsVersion) -> Self {
        self.min_protocol_version = version;
        self
    }

    /// Set the maximum TLS version.
    #[must_use]
    pub fn max_protocol_version(mut self, version: TlsVersion) -> Self {
        self.max_protocol_version = version;
        self
    }

    /// Set the negotiation mode.
    #[must_use]
    pub fn negotiation(mut self, negotiation: TlsNegotiation) -> Self {
        self.negotiation = negotiation;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), TlsError> {
        if self.min_protocol_version > self.max_protocol_version {
            return Err(TlsError::Configuration(format!(
                "minimum version {:?} exceeds maximum version {:?}",
                self.min_protocol_version, self.max_protocol_version
            )));
        }
        if self.handshake_timeout == Some(Duration::ZERO) {
            return Err(TlsError::Configuration(
                "handshake timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Protocol versions enabled by this configuration.
    #[must_use]
    pub fn protocol_versions(&self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        [TlsVersion::Tls12, TlsVersion::Tls13]
            .into_iter()
            .filter(|v| (self.min_protocol_version..=self.max_protocol_version).contains(v))
            .map(TlsVersion::to_rustls)
            .collect()
    }
}

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TlsVersion {
    /// TLS 1.2
    #[default]
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Convert to rustls protocol version.
    #[must_use]
    pub fn to_rustls(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}
