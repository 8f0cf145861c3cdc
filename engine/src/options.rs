use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};

use crate::error::{HttpError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BODY_MEM_LIMIT: usize = 4 * 1024 * 1024;
const HTTPS_DEFAULT_PORT: u16 = 443;
const HTTP_DEFAULT_PORT: u16 = 80;

/// Request scheme. Only the framing consequences (default port, whether to
/// perform a TLS handshake) are modeled here — URL parsing is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => HTTP_DEFAULT_PORT,
            Scheme::Https => HTTPS_DEFAULT_PORT,
        }
    }
}

/// Caller-supplied configuration for a single logical peer.
///
/// `Options` derives `Default` so embedders can use struct-update syntax:
/// `Options { host: "x".into(), scheme: Scheme::Https, ..Default::default() }`.
/// Fields left unset are resolved by [`Options::set_defaults`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub scheme: Scheme,
    pub host: String,
    /// TCP port. Zero means "not yet defaulted"; `set_defaults` fills it in
    /// from `scheme` when unset.
    #[serde(default)]
    pub port: u16,
    /// Literal peer IP. When set, DNS resolution is bypassed entirely.
    #[serde(default)]
    pub conn_ip: Option<std::net::IpAddr>,
    #[serde(default)]
    pub conn_timeout: Option<Duration>,
    #[serde(default)]
    pub read_timeout: Option<Duration>,
    #[serde(default)]
    pub write_timeout: Option<Duration>,
    #[serde(default)]
    pub disable_sni: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Additional PEM-encoded trust roots, appended to the platform default
    /// store rather than replacing it.
    #[serde(default)]
    pub custom_ca_certs: Vec<String>,
    #[serde(default)]
    pub body_mem_limit: Option<usize>,
    /// Keep-alive pool participation. `None` means "not yet defaulted";
    /// `set_defaults` resolves it based on `force_http1`/`force_http2`.
    #[serde(default)]
    pub reuse_connection: Option<bool>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub force_http1: bool,
    #[serde(default)]
    pub force_http2: bool,
    #[serde(default)]
    pub enable_h2c: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            scheme: Scheme::Http,
            host: String::new(),
            port: 0,
            conn_ip: None,
            conn_timeout: None,
            read_timeout: None,
            write_timeout: None,
            disable_sni: false,
            insecure_skip_verify: false,
            custom_ca_certs: Vec::new(),
            body_mem_limit: None,
            reuse_connection: None,
            proxy_url: None,
            force_http1: false,
            force_http2: false,
            enable_h2c: false,
        }
    }
}

impl Options {
    /// Applies every documented default in place. Idempotent: calling this
    /// twice leaves the options unchanged on the second call.
    pub fn set_defaults(&mut self) {
        if self.port == 0 {
            self.port = self.scheme.default_port();
        }
        self.conn_timeout.get_or_insert(DEFAULT_TIMEOUT);
        self.read_timeout.get_or_insert(DEFAULT_TIMEOUT);
        self.write_timeout.get_or_insert(DEFAULT_TIMEOUT);
        self.body_mem_limit.get_or_insert(DEFAULT_BODY_MEM_LIMIT);
        self.reuse_connection
            .get_or_insert(!(self.force_http1 || self.force_http2));
    }

    /// Resolved ALPN offer list per the force flags. `force_http2` wins when
    /// both are set — this mirrors the source's behavior and is a documented
    /// policy, not a bug (see DESIGN.md open-question (b)).
    fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        if self.force_http2 {
            vec![b"h2".to_vec()]
        } else if self.force_http1 {
            vec![b"http/1.1".to_vec()]
        } else {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        }
    }

    /// Builds a `rustls::ClientConfig` from these options: SNI, ALPN, trust
    /// roots (platform default plus any `custom_ca_certs`, appended rather
    /// than replacing), and certificate verification.
    pub fn build_tls_config(&self) -> Result<Arc<ClientConfig>> {
        let mut config = if self.insecure_skip_verify {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let roots = self.build_root_store()?;
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        config.alpn_protocols = self.alpn_protocols();
        Ok(Arc::new(config))
    }

    fn build_root_store(&self) -> Result<RootCertStore> {
        let mut store = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            tracing::warn!(%err, "failed to load a native root certificate");
        }
        for cert in native.certs {
            // Malformed platform roots are skipped rather than failing the
            // whole handshake; the store still has the certs that parsed.
            let _ = store.add(cert);
        }

        for pem in &self.custom_ca_certs {
            let mut reader = std::io::BufReader::new(pem.as_bytes());
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert: CertificateDer<'static> =
                    cert.map_err(|e| HttpError::tls(format!("invalid custom CA cert: {e}")))?;
                store
                    .add(cert)
                    .map_err(|e| HttpError::tls(format!("failed to add custom CA cert: {e}")))?;
            }
        }

        Ok(store)
    }

    /// The SNI name offered during the TLS handshake, unless `disable_sni`.
    pub fn server_name(&self) -> Result<Option<ServerName<'static>>> {
        if self.disable_sni {
            return Ok(None);
        }
        ServerName::try_from(self.host.clone())
            .map(Some)
            .map_err(|e| HttpError::tls(format!("invalid SNI host name: {e}")))
    }
}

/// Accepts any server certificate. Used only when the caller explicitly opts
/// into `insecure_skip_verify`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
