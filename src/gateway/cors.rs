//! Origin policy and security headers

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, Method, header};
use regex::Regex;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;

use crate::{Error, Result};

/// Which browser origins may call the gateway
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    any: bool,
    patterns: Vec<Regex>,
}

impl OriginPolicy {
    /// Build a policy from configured patterns.
    ///
    /// A leading `*` accepts every origin. Otherwise each pattern is a regular
    /// expression that must match at the start of the origin; patterns that
    /// fail to compile are skipped.
    #[must_use]
    pub fn from_patterns(patterns: &[String]) -> Self {
        if patterns.first().is_some_and(|p| p == "*") {
            return Self {
                any: true,
                patterns: Vec::new(),
            };
        }

        let patterns = patterns
            .iter()
            .filter_map(|p| match Regex::new(&format!("^(?:{p})")) {
                Ok(re) => Some(re),
                Err(e) => {
                    info!(pattern = %p, error = %e, "Skipping invalid CORS origin pattern");
                    None
                }
            })
            .collect();

        Self {
            any: false,
            patterns,
        }
    }

    /// Check an origin string
    #[must_use]
    pub fn allows(&self, origin: &str) -> bool {
        self.any || self.patterns.iter().any(|re| re.is_match(origin))
    }

    /// Check the `Origin` header of a request; requests without one pass
    #[must_use]
    pub fn allows_request(&self, headers: &HeaderMap) -> bool {
        match headers.get(header::ORIGIN) {
            None => true,
            Some(origin) => origin.to_str().is_ok_and(|o| self.allows(o)),
        }
    }

    /// CORS layer enforcing this policy
    #[must_use]
    pub fn cors_layer(self: &Arc<Self>) -> CorsLayer {
        let origin = if self.any {
            AllowOrigin::any()
        } else {
            let policy = Arc::clone(self);
            AllowOrigin::predicate(move |origin: &HeaderValue, _| {
                origin.to_str().is_ok_and(|o| policy.allows(o))
            })
        };

        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    }
}

/// Layer attaching `Content-Security-Policy: <csp>` to every response
pub fn csp_layer(csp: &str) -> Result<SetResponseHeaderLayer<HeaderValue>> {
    let value = HeaderValue::from_str(csp)
        .map_err(|e| Error::Config(format!("`rest-csp` is not a valid header value: {e}")))?;
    Ok(SetResponseHeaderLayer::overriding(
        header::CONTENT_SECURITY_POLICY,
        value,
    ))
}
