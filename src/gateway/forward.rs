//! REST → RPC translation
//!
//! `POST /v1/<method>` becomes a backend call after the rune check;
//! `GET /v1/list-methods` renders the backend's `help` output.

use std::sync::Arc;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{FromRequest, Multipart, Request},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::auth::{AuthorizationGate, Decision, Surface};
use crate::error::rpc_codes;
use crate::rpc::{HELP_METHOD, RpcBackend};
use crate::{Error, Result};

/// Divider placed between entries of the method listing
fn divider() -> String {
    format!("\n{}\n\n", "-".repeat(171))
}

/// Status and JSON body produced by a forward
#[derive(Debug, Clone, PartialEq)]
pub struct Forwarded {
    /// HTTP status
    pub status: StatusCode,
    /// Backend result, or `{"error": ...}`
    pub body: Value,
}

impl Forwarded {
    fn error(status: StatusCode, error: Value) -> Self {
        Self {
            status,
            body: json!({ "error": error }),
        }
    }
}

impl IntoResponse for Forwarded {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Maps REST calls onto the backend and backend outcomes onto HTTP
#[derive(Clone)]
pub struct RpcForwarder {
    backend: Arc<dyn RpcBackend>,
    gate: AuthorizationGate,
}

impl RpcForwarder {
    /// Create a forwarder
    pub fn new(backend: Arc<dyn RpcBackend>, gate: AuthorizationGate) -> Self {
        Self { backend, gate }
    }

    /// Authorize then invoke `method`.
    ///
    /// Denied → 401, backend error → 500 with the backend error verbatim,
    /// success → 201 with the backend result.
    pub async fn forward(&self, rune: Option<&str>, method: &str, params: Value) -> Forwarded {
        if let Decision::Deny(denial) = self.gate.authorize(rune, method, &params).await {
            return Forwarded::error(denial.http_status(Surface::Rest), denial.error_object());
        }

        match self.backend.call(method, params).await {
            Ok(result) => {
                debug!(method = %method, "Forwarded call succeeded");
                Forwarded {
                    status: StatusCode::CREATED,
                    body: result,
                }
            }
            Err(e) => {
                debug!(method = %method, error = %e, "Forwarded call failed");
                Forwarded::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_error_object())
            }
        }
    }

    /// Fetch `help` from the backend and render the listing
    pub async fn list_methods(&self) -> Result<String> {
        let help = self.backend.call(HELP_METHOD, json!([])).await?;
        render_method_list(&help)
    }
}

/// Render the `help` array of a `help` result as plain text.
///
/// Missing fields of an entry render empty; a result without a `help` array
/// is an internal error.
pub fn render_method_list(help: &Value) -> Result<String> {
    let field = |cmd: &Value, key: &str| -> String {
        match cmd.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    };

    let commands = help.get("help").and_then(Value::as_array).ok_or_else(|| {
        Error::json_rpc(
            rpc_codes::INTERNAL_ERROR,
            "help result has no `help` array",
        )
    })?;

    Ok(commands
        .iter()
        .map(|cmd| {
            format!(
                "Command: {}\n Category: {}\n Description: {}\n Verbose: {}\n",
                field(cmd, "command"),
                field(cmd, "category"),
                field(cmd, "description"),
                field(cmd, "verbose"),
            )
        })
        .collect::<Vec<_>>()
        .join(divider().as_str()))
}

/// Build the listing response: 200 `text/html`, or 500 with the backend error
pub fn list_methods_response(listing: Result<String>) -> Response {
    match listing {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => {
            debug!(error = %e, "list-methods failed");
            Forwarded::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_error_object())
                .into_response()
        }
    }
}

/// How a request body is turned into call parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Json,
    Form,
    Multipart,
    Other,
}

impl BodyKind {
    fn of(headers: &HeaderMap) -> Self {
        let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        else {
            return Self::Other;
        };
        let mime = content_type.split(';').next().unwrap_or_default().trim();

        if mime.eq_ignore_ascii_case("application/json") || mime.ends_with("+json") {
            Self::Json
        } else if mime.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
            Self::Form
        } else if mime.eq_ignore_ascii_case("multipart/form-data") {
            Self::Multipart
        } else {
            Self::Other
        }
    }
}

/// Extract call parameters from a request body.
///
/// JSON bodies are parsed as-is (empty → `{}`). Urlencoded and multipart
/// form bodies become an object of their text fields, first value winning
/// for repeated names; uploaded files are left out. Any other content type
/// yields `{}`.
///
/// # Errors
///
/// Returns [`Error::Json`] for an unparseable JSON body and
/// [`Error::JsonRpc`] with a parse error code for a malformed form body.
pub async fn params_from_body(headers: &HeaderMap, body: Bytes) -> Result<Value> {
    let kind = BodyKind::of(headers);
    if kind == BodyKind::Other || body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }

    match kind {
        BodyKind::Json => Ok(serde_json::from_slice(&body)?),
        BodyKind::Form => {
            let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&body)
                .map_err(|e| form_error(format!("Invalid form body: {e}")))?;
            Ok(Value::Object(text_fields(pairs)))
        }
        BodyKind::Multipart => multipart_params(headers, body).await,
        BodyKind::Other => Ok(Value::Object(Map::new())),
    }
}

async fn multipart_params(headers: &HeaderMap, body: Bytes) -> Result<Value> {
    let mut request = Request::new(Body::from(body));
    *request.headers_mut() = headers.clone();

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| form_error(format!("Invalid multipart body: {e}")))?;

    let mut pairs = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| form_error(format!("Invalid multipart body: {e}")))?
    {
        if field.file_name().is_some() {
            continue;
        }
        let Some(name) = field.name().map(ToString::to_string) else {
            continue;
        };
        let value = field
            .text()
            .await
            .map_err(|e| form_error(format!("Invalid multipart field `{name}`: {e}")))?;
        pairs.push((name, value));
    }
    Ok(Value::Object(text_fields(pairs)))
}

fn text_fields(pairs: Vec<(String, String)>) -> Map<String, Value> {
    let mut fields = Map::new();
    for (name, value) in pairs {
        fields.entry(name).or_insert(Value::String(value));
    }
    fields
}

fn form_error(message: String) -> Error {
    Error::json_rpc(rpc_codes::PARSE_ERROR, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::HeaderValue;

    struct Backend;

    #[async_trait]
    impl RpcBackend for Backend {
        async fn call(&self, method: &str, params: Value) -> Result<Value> {
            match method {
                "checkrune" if params["rune"] == "good" => Ok(json!({"valid": true})),
                "checkrune" => Err(Error::json_rpc(1501, "Not authorized")),
                "getinfo" => Ok(json!({"id": "02abc", "alias": "node"})),
                "help" => Ok(json!({"help": [
                    {"command": "getinfo", "category": "utility", "description": "Show info", "verbose": "Long info"},
                    {"command": "pay", "category": "payment", "description": "Pay", "verbose": "Long pay"}
                ]})),
                _ => Err(Error::json_rpc(-32602, "Unknown command")),
            }
        }
    }

    fn forwarder() -> RpcForwarder {
        let backend: Arc<dyn RpcBackend> = Arc::new(Backend);
        RpcForwarder::new(backend.clone(), AuthorizationGate::new(backend))
    }

    #[tokio::test]
    async fn success_is_201_with_result() {
        let out = forwarder().forward(Some("good"), "getinfo", json!({})).await;
        assert_eq!(out.status, StatusCode::CREATED);
        assert_eq!(out.body["alias"], "node");
    }

    #[tokio::test]
    async fn backend_error_is_500_with_error_object() {
        let out = forwarder().forward(Some("good"), "bogus", json!({})).await;
        assert_eq!(out.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(out.body, json!({"error": {"code": -32602, "message": "Unknown command"}}));
    }

    #[tokio::test]
    async fn missing_rune_is_401_with_403_code() {
        let out = forwarder().forward(None, "getinfo", json!({})).await;
        assert_eq!(out.status, StatusCode::UNAUTHORIZED);
        assert_eq!(out.body["error"]["code"], 403);
    }

    #[tokio::test]
    async fn rejected_rune_is_401_with_backend_error() {
        let out = forwarder().forward(Some("bad"), "getinfo", json!({})).await;
        assert_eq!(out.status, StatusCode::UNAUTHORIZED);
        assert_eq!(out.body["error"]["code"], 1501);
        assert!(out.body.get("alias").is_none());
    }

    #[tokio::test]
    async fn listing_renders_every_command() {
        let text = forwarder().list_methods().await.unwrap();
        assert!(text.starts_with("Command: getinfo\n Category: utility\n"));
        assert!(text.contains("Verbose: Long pay\n"));
        assert_eq!(text.matches(&divider()).count(), 1);
    }

    #[test]
    fn listing_tolerates_missing_fields() {
        let text = render_method_list(&json!({"help": [{"command": "stop"}]})).unwrap();
        assert_eq!(text, "Command: stop\n Category: \n Description: \n Verbose: \n");
        assert_eq!(render_method_list(&json!({"help": []})).unwrap(), "");
    }

    #[tokio::test]
    async fn listing_without_help_array_is_internal_error() {
        for help in [json!({}), json!({"help": "stop"}), json!(null)] {
            let err = render_method_list(&help).unwrap_err();
            assert_eq!(err.to_error_object()["code"], rpc_codes::INTERNAL_ERROR);
        }

        let response = list_methods_response(render_method_list(&json!({"commands": []})));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["code"], rpc_codes::INTERNAL_ERROR);
    }

    fn with_content_type(content_type: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers
    }

    #[tokio::test]
    async fn json_body_params() {
        let headers = with_content_type("application/json");
        let params = params_from_body(&headers, Bytes::from_static(br#"{"amount_msat": 1000}"#))
            .await
            .unwrap();
        assert_eq!(params["amount_msat"], 1000);

        assert_eq!(params_from_body(&headers, Bytes::new()).await.unwrap(), json!({}));
        assert!(matches!(
            params_from_body(&headers, Bytes::from_static(b"{nope")).await,
            Err(Error::Json(_))
        ));
    }

    #[tokio::test]
    async fn form_body_params() {
        let headers = with_content_type("application/x-www-form-urlencoded");
        let params = params_from_body(
            &headers,
            Bytes::from_static(b"label=coffee&amount_msat=1000&label=tea"),
        )
        .await
        .unwrap();
        assert_eq!(params, json!({"label": "coffee", "amount_msat": "1000"}));
    }

    #[tokio::test]
    async fn multipart_text_fields_become_params() {
        let headers = with_content_type("multipart/form-data; boundary=XyZ");
        let body = concat!(
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"label\"\r\n",
            "\r\n",
            "coffee\r\n",
            "--XyZ\r\n",
            "Content-Disposition: form-data; name=\"receipt\"; filename=\"r.txt\"\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "paid\r\n",
            "--XyZ--\r\n",
        );
        let params = params_from_body(&headers, Bytes::from_static(body.as_bytes()))
            .await
            .unwrap();
        assert_eq!(params, json!({"label": "coffee"}));
    }

    #[tokio::test]
    async fn truncated_multipart_is_parse_error() {
        let headers = with_content_type("multipart/form-data; boundary=XyZ");
        let body = "--XyZ\r\nContent-Disposition: form-data; name=\"label\"\r\n\r\ncof";
        let err = params_from_body(&headers, Bytes::from_static(body.as_bytes()))
            .await
            .unwrap_err();
        assert_eq!(err.to_error_object()["code"], rpc_codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn other_content_types_yield_empty_params() {
        let body = Bytes::from_static(br#"{"label":"coffee"}"#);
        for headers in [with_content_type("text/plain"), HeaderMap::new()] {
            let params = params_from_body(&headers, body.clone()).await.unwrap();
            assert_eq!(params, json!({}));
        }
    }

    #[tokio::test]
    async fn array_json_params_pass_through() {
        let headers = with_content_type("application/json");
        let params = params_from_body(&headers, Bytes::from_static(b"[1, 2]"))
            .await
            .unwrap();
        assert_eq!(params, json!([1, 2]));
    }
}
