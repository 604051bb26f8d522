//! TLS connector for SNI transports.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::{TlsConfig, TlsNegotiation};
use crate::envelope::HandshakeEnvelope;
use crate::error::TlsError;

// =============================================================================
// Certificate verifier for trust-server-certificate mode
// =============================================================================

/// Accepts any server certificate.
///
/// Handshake signatures are still checked with the provider's algorithms so
/// the peer must hold the key for the certificate it presents.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
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
        rustls::crypto::verify_tls12_signature(
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
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// =============================================================================
// TLS Connector
// =============================================================================

/// TLS connector for SNI physical connections.
///
/// In [`TlsNegotiation::Enveloped`] mode the handshake runs inside prelogin
/// envelopes and the returned stream switches to raw TLS records once the
/// handshake completes.
pub struct TlsConnector {
    config: TlsConfig,
    inner: TokioTlsConnector,
}

impl TlsConnector {
    /// Create a new TLS connector with the given configuration.
    pub fn new(config: TlsConfig) -> Result<Self, TlsError> {
        config.validate()?;
        let client_config = Self::build_client_config(&config)?;
        let inner = TokioTlsConnector::from(Arc::new(client_config));

        Ok(Self { config, inner })
    }

    fn build_client_config(config: &TlsConfig) -> Result<ClientConfig, TlsError> {
        let versions = config.protocol_versions();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)?;

        if config.trust_server_certificate {
            tracing::warn!(
                "TrustServerCertificate is enabled - certificate validation is DISABLED. \
                 Connections are vulnerable to man-in-the-middle attacks."
            );

            return Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
                .with_no_client_auth());
        }

        Ok(builder
            .with_root_certificates(Self::build_root_store(config)?)
            .with_no_client_auth())
    }

    fn build_root_store(config: &TlsConfig) -> Result<RootCertStore, TlsError> {
        let mut root_store = RootCertStore::empty();

        if config.root_certificates.is_empty() {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert in &config.root_certificates {
                root_store
                    .add(cert.clone())
                    .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
            }
        }

        Ok(root_store)
    }

    /// Perform the TLS handshake over `stream`.
    ///
    /// The configured [`TlsNegotiation`] decides whether handshake bytes are
    /// enveloped. Either way the returned stream carries raw TLS records once
    /// this returns.
    pub async fn connect<S>(
        &self,
        stream: S,
        server_name: &str,
    ) -> Result<TlsStream<HandshakeEnvelope<S>>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let wrapped = match self.config.negotiation {
            TlsNegotiation::Enveloped => HandshakeEnvelope::new(stream),
            TlsNegotiation::Direct => HandshakeEnvelope::passthrough(stream),
        };
        self.handshake(wrapped, server_name).await
    }

    /// Perform a TLS-first handshake with no envelope, whatever the configured
    /// negotiation mode.
    pub async fn connect_direct<S>(
        &self,
        stream: S,
        server_name: &str,
    ) -> Result<TlsStream<HandshakeEnvelope<S>>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.handshake(HandshakeEnvelope::passthrough(stream), server_name)
            .await
    }

    async fn handshake<S>(
        &self,
        stream: HandshakeEnvelope<S>,
        server_name: &str,
    ) -> Result<TlsStream<HandshakeEnvelope<S>>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = self.config.server_name.as_deref().unwrap_or(server_name);
        let dns_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;

        tracing::debug!(
            server_name = %server_name,
            enveloped = stream.is_enveloping(),
            "performing TLS handshake"
        );

        let connect = self.inner.connect(dns_name, stream);
        let result = match self.config.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| TlsError::HandshakeTimeout(limit))?,
            None => connect.await,
        };
        let mut tls_stream = result.map_err(|e| TlsError::Handshake(e.to_string()))?;

        tls_stream.get_mut().0.finish_handshake();
        tracing::debug!("TLS handshake completed");

        Ok(tls_stream)
    }

    /// Get the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
