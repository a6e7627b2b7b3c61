//! Rune Gateway Library
//!
//! REST and WebSocket gateway in front of a JSON-RPC daemon reachable over a
//! Unix socket.
//!
//! # Features
//!
//! - **REST → RPC**: `POST /v1/<method>` forwards to the daemon after a rune check
//! - **Method listing**: `GET /v1/list-methods` renders the daemon's `help`
//! - **WebSocket relay**: backend notifications fanned out to every session
//! - **Rune authorization**: delegated to the daemon's `checkrune`, never cached
//! - **Self-managed TLS**: root CA plus client/server leaves generated on first start
//! - **Origin policy**: regex CORS allow-list shared by HTTP and WebSocket, CSP on every response

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod protocol;
pub mod rpc;
pub mod tls;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Config(format!("Cannot install log subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Config(format!("Cannot install log subscriber: {e}")))?,
    }

    Ok(())
}
