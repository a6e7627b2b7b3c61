//! TLS for the gateway listener.
//!
//! # Architecture
//!
//! ```text
//! startup
//!   → CertificateAuthority::ensure(rest-certs, rest-host)   (root + client + server PEM set)
//!   → build_server_config(server.pem, server-key.pem)       (rustls, TLS 1.3 only)
//!   → TlsListener                                           (handshakes off the accept path)
//!   → axum::serve
//! ```
//!
//! # Modules
//!
//! - [`authority`]: certificate chain generation, persistence and loading
//! - [`listener`]: `axum::serve::Listener` that terminates TLS

pub mod authority;
pub mod listener;

use std::sync::Arc;

use rustls::ServerConfig;
use tracing::debug;

pub use authority::{CertificateAuthority, CertificateSet, PemPair, load_certs, load_private_key};
pub use listener::TlsListener;

use crate::{Error, Result};

/// Build a `rustls::ServerConfig` presenting the server leaf of `set`.
///
/// TLS 1.3 is the only negotiated version. ALPN advertises HTTP/1.1 so that
/// WebSocket upgrades work on the same port.
///
/// # Errors
///
/// Returns an error if the certificate or key cannot be loaded, or if they
/// do not match.
pub fn build_server_config(set: &CertificateSet) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(&set.server_cert_path())?;
    let key = load_private_key(&set.server_key_path())?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut tls_cfg = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Certificate(format!("Unsupported TLS version set: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Certificate(format!("TLS config error (cert/key mismatch?): {e}")))?;

    tls_cfg.alpn_protocols = vec![b"http/1.1".to_vec()];

    debug!(server_cert = %set.server_cert_path().display(), "TLS config built");

    Ok(Arc::new(tls_cfg))
}
