//! Rune authorization gate
//!
//! The gateway never parses or caches runes. Each REST call and each socket
//! connect attempt asks the backend, which owns the rune format and its
//! revocation rules.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use serde_json::{Value, json};
use tracing::debug;

use crate::rpc::RpcBackend;

/// Header carrying the rune (matched case-insensitively)
pub const RUNE_HEADER: &str = "rune";

/// Method probed when a socket connects: a minimal identity check
pub const PROBE_METHOD: &str = "getinfo";

/// Where an authorization decision is surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// `POST /v1/<method>`
    Rest,
    /// WebSocket connect
    Socket,
}

/// Why a caller was refused
#[derive(Debug, Clone, PartialEq)]
pub enum Denial {
    /// No rune was supplied
    MissingCredential,
    /// The backend rejected the rune; carries its error object verbatim
    Rejected(Value),
}

impl Denial {
    /// Error object placed under `"error"` in the response body
    #[must_use]
    pub fn error_object(&self) -> Value {
        match self {
            Self::MissingCredential => json!({
                "code": 403,
                "message": "Not authorized: Missing rune"
            }),
            Self::Rejected(err) => err.clone(),
        }
    }

    /// HTTP status for this denial on `surface`.
    ///
    /// REST callers get 401 for both cases (the body code tells them apart);
    /// socket connects get 403 for a missing rune and 401 for a rejected one.
    #[must_use]
    pub fn http_status(&self, surface: Surface) -> StatusCode {
        match (self, surface) {
            (Self::MissingCredential, Surface::Socket) => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Outcome of an authorization check
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The backend accepted the rune
    Allow,
    /// The caller is refused
    Deny(Denial),
}

impl Decision {
    /// Whether the caller may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Turns an opaque rune into an allow/deny decision by asking the backend
#[derive(Clone)]
pub struct AuthorizationGate {
    backend: Arc<dyn RpcBackend>,
}

impl AuthorizationGate {
    /// Create a gate delegating to `backend`
    pub fn new(backend: Arc<dyn RpcBackend>) -> Self {
        Self { backend }
    }

    /// Decide whether `rune` authorizes `method` with `params`
    pub async fn authorize(&self, rune: Option<&str>, method: &str, params: &Value) -> Decision {
        let Some(rune) = rune else {
            debug!(method = %method, "Missing rune");
            return Decision::Deny(Denial::MissingCredential);
        };

        match self.backend.check_rune(rune, method, params).await {
            Ok(_) => Decision::Allow,
            Err(e) => {
                debug!(method = %method, error = %e, "Rune rejected");
                Decision::Deny(Denial::Rejected(e.to_error_object()))
            }
        }
    }

    /// Check a socket connect attempt with the probe method
    pub async fn authorize_connect(&self, rune: Option<&str>) -> Decision {
        self.authorize(rune, PROBE_METHOD, &json!({})).await
    }
}

/// Extract the rune from request headers
#[must_use]
pub fn rune_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers.get(RUNE_HEADER).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use parking_lot::Mutex;

    /// Accepts rune "good" for every method, "getinfo-only" only for getinfo
    #[derive(Default)]
    struct ScopedBackend {
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl RpcBackend for ScopedBackend {
        async fn call(&self, method: &str, params: Value) -> Result<Value> {
            assert_eq!(method, "checkrune");
            self.seen.lock().push(params.clone());
            match (params["rune"].as_str(), params["method"].as_str()) {
                (Some("good"), _) | (Some("getinfo-only"), Some("getinfo")) => {
                    Ok(json!({"valid": true}))
                }
                (Some("getinfo-only"), Some(m)) => Err(Error::json_rpc(
                    1502,
                    format!("Not permitted: method is not equal to getinfo (got {m})"),
                )),
                _ => Err(Error::json_rpc(1501, "Not authorized: Not derived from master")),
            }
        }
    }

    fn gate() -> (AuthorizationGate, Arc<ScopedBackend>) {
        let backend = Arc::new(ScopedBackend::default());
        (AuthorizationGate::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn missing_rune_never_reaches_backend() {
        let (gate, backend) = gate();
        let decision = gate.authorize(None, "getinfo", &json!({})).await;
        assert_eq!(decision, Decision::Deny(Denial::MissingCredential));
        assert!(backend.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn backend_success_allows() {
        let (gate, backend) = gate();
        let params = json!({"label": "x"});
        let decision = gate.authorize(Some("good"), "invoice", &params).await;
        assert!(decision.is_allowed());

        let seen = backend.seen.lock();
        assert_eq!(seen[0]["method"], "invoice");
        assert_eq!(seen[0]["params"], params);
    }

    #[tokio::test]
    async fn backend_error_is_surfaced_verbatim() {
        let (gate, _) = gate();
        let decision = gate.authorize(Some("getinfo-only"), "pay", &json!({})).await;
        let Decision::Deny(Denial::Rejected(err)) = decision else {
            panic!("expected rejection");
        };
        assert_eq!(err["code"], 1502);
        assert!(err["message"].as_str().unwrap().contains("getinfo"));
    }

    #[tokio::test]
    async fn connect_uses_probe_method() {
        let (gate, backend) = gate();
        assert!(gate.authorize_connect(Some("getinfo-only")).await.is_allowed());
        assert_eq!(backend.seen.lock()[0]["method"], PROBE_METHOD);
    }

    #[test]
    fn status_table() {
        let missing = Denial::MissingCredential;
        let rejected = Denial::Rejected(json!({"code": 1501, "message": "no"}));
        assert_eq!(missing.http_status(Surface::Rest), StatusCode::UNAUTHORIZED);
        assert_eq!(missing.http_status(Surface::Socket), StatusCode::FORBIDDEN);
        assert_eq!(rejected.http_status(Surface::Rest), StatusCode::UNAUTHORIZED);
        assert_eq!(rejected.http_status(Surface::Socket), StatusCode::UNAUTHORIZED);
        assert_eq!(missing.error_object()["code"], 403);
    }

    #[test]
    fn rune_header_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("Rune", HeaderValue::from_static("abc"));
        assert_eq!(rune_from_headers(&headers), Some("abc"));
        assert_eq!(rune_from_headers(&HeaderMap::new()), None);
    }
}
