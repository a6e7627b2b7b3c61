//! Error types for the rune gateway

use std::io;

use serde_json::{Value, json};
use thiserror::Error;

/// Result type alias for the rune gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (required option absent or malformed)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate generation, persistence or loading failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Error returned by the backend daemon, carried verbatim
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i64,
        /// Error message
        message: String,
        /// Optional data
        data: Option<Value>,
    },

    /// Transport error (socket, connection or queue failure)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A gateway is already bound to this port in the current process
    #[error("Gateway already running on port {0}")]
    AlreadyRunning(u16),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i64, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i64 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Config(_) => rpc_codes::INVALID_REQUEST,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Render the error object placed under `"error"` in HTTP bodies.
    ///
    /// Backend errors are reproduced verbatim; locally synthesized errors use
    /// the JSON-RPC code from [`Error::to_rpc_code`].
    #[must_use]
    pub fn to_error_object(&self) -> Value {
        match self {
            Self::JsonRpc {
                code,
                message,
                data: Some(data),
            } => json!({ "code": code, "message": message, "data": data }),
            Self::JsonRpc { code, message, .. } => json!({ "code": code, "message": message }),
            other => json!({ "code": other.to_rpc_code(), "message": other.to_string() }),
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i64 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i64 = -32600;
    /// Internal error
    pub const INTERNAL_ERROR: i64 = -32603;
}
