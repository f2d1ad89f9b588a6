//! TLS material and QUIC endpoint configuration.
//!
//! Callers provide rustls configs to the node; this module builds them for
//! the common cases: a self-signed development certificate, a client that
//! trusts exactly one certificate, and an insecure client for testing.
//! Everything is TLS 1.3 with the ring provider and ALPN `peerlink/1`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{IdleTimeout, TransportConfig};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::error::{SetupError, SetupResult};

/// ALPN identifier spoken by PeerLink nodes.
pub const PEERLINK_ALPN: &[u8] = b"peerlink/1";

/// QUIC idle timeout. The only read deadline besides keepalive.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(context: &str, err: impl std::fmt::Display) -> SetupError {
    SetupError::Tls(format!("{}: {}", context, err))
}

/// A self-signed certificate and its private key.
pub struct SelfSignedCert {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl SelfSignedCert {
    /// Generate a certificate valid for `server_name` and the loopback
    /// addresses.
    pub fn generate(server_name: &str) -> SetupResult<Self> {
        let mut names = vec![server_name.to_string()];
        for loopback in ["127.0.0.1", "::1"] {
            if loopback != server_name {
                names.push(loopback.to_string());
            }
        }
        let certified = rcgen::generate_simple_self_signed(names)
            .map_err(|e| tls_error("certificate generation failed", e))?;
        Ok(Self {
            key: PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()),
            cert: CertificateDer::from(certified.cert),
        })
    }

    /// DER encoding of the certificate.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    /// Write the DER certificate to `path` so clients can trust it.
    pub fn save_cert(&self, path: &Path) -> SetupResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.cert.as_ref())?;
        Ok(())
    }

    /// Server config presenting this certificate.
    pub fn server_config(&self) -> SetupResult<Arc<rustls::ServerConfig>> {
        let mut config = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| tls_error("unsupported protocol versions", e))?
            .with_no_client_auth()
            .with_single_cert(
                vec![self.cert.clone()],
                PrivateKeyDer::Pkcs8(self.key.clone_key()),
            )
            .map_err(|e| tls_error("invalid server certificate", e))?;
        config.alpn_protocols = vec![PEERLINK_ALPN.to_vec()];
        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for SelfSignedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCert")
            .field("cert_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}

/// Read a DER certificate written by [`SelfSignedCert::save_cert`].
pub fn load_cert(path: &Path) -> SetupResult<CertificateDer<'static>> {
    Ok(CertificateDer::from(std::fs::read(path)?))
}

/// Client config trusting only `cert`.
pub fn client_config_trusting(
    cert: CertificateDer<'static>,
) -> SetupResult<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(cert)
        .map_err(|e| tls_error("invalid trusted certificate", e))?;

    let mut config = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("unsupported protocol versions", e))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![PEERLINK_ALPN.to_vec()];
    Ok(Arc::new(config))
}

/// Client config that accepts any server certificate.
///
/// Peers still authenticate each other through signed hellos, but the TLS
/// layer gives no protection against an active attacker.
pub fn insecure_client_config() -> SetupResult<Arc<rustls::ClientConfig>> {
    let provider = provider();
    let mut config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("unsupported protocol versions", e))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();
    config.alpn_protocols = vec![PEERLINK_ALPN.to_vec()];
    Ok(Arc::new(config))
}

/// Certificate verifier that skips the chain but still checks handshake
/// signatures.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// QUIC transport parameters shared by both endpoint sides.
pub fn transport_config(enable_datagrams: bool) -> TransportConfig {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(IdleTimeout::try_from(IDLE_TIMEOUT).ok());
    if !enable_datagrams {
        transport.datagram_receive_buffer_size(None);
    }
    transport
}

/// Wrap a rustls server config for a QUIC endpoint.
pub fn quic_server_config(
    crypto: Arc<rustls::ServerConfig>,
    enable_datagrams: bool,
) -> SetupResult<quinn::ServerConfig> {
    let crypto = QuicServerConfig::try_from(crypto)
        .map_err(|e| tls_error("server config unusable for QUIC", e))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(enable_datagrams)));
    Ok(config)
}

/// Wrap a rustls client config for QUIC dialing.
pub fn quic_client_config(
    crypto: Arc<rustls::ClientConfig>,
    enable_datagrams: bool,
) -> SetupResult<quinn::ClientConfig> {
    let crypto = QuicClientConfig::try_from(crypto)
        .map_err(|e| tls_error("client config unusable for QUIC", e))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(enable_datagrams)));
    Ok(config)
}
