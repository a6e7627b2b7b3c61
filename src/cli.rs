//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{GatewayConfig, Protocol};

/// REST and WebSocket gateway for a JSON-RPC daemon
#[derive(Parser, Debug)]
#[command(name = "rune-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "RUNE_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "RUNE_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "RUNE_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Port to listen on; without one the gateway stays disabled
    #[arg(long, global = true)]
    pub rest_port: Option<u16>,

    /// Host to bind to
    #[arg(long, global = true)]
    pub rest_host: Option<String>,

    /// Listener protocol (http, https)
    #[arg(long, global = true)]
    pub rest_protocol: Option<Protocol>,

    /// Directory holding the certificate set
    #[arg(long, global = true)]
    pub rest_certs: Option<PathBuf>,

    /// Path of the daemon's JSON-RPC socket
    #[arg(long, global = true)]
    pub rpc_socket: Option<PathBuf>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Generate or verify the certificate set and print its location
    Certs,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut GatewayConfig) {
        if let Some(port) = self.rest_port {
            config.rest_port = Some(port);
        }
        if let Some(ref host) = self.rest_host {
            config.rest_host.clone_from(host);
        }
        if let Some(protocol) = self.rest_protocol {
            config.rest_protocol = protocol;
        }
        if let Some(ref certs) = self.rest_certs {
            config.rest_certs.clone_from(certs);
        }
        if let Some(ref socket) = self.rpc_socket {
            config.rpc_socket.clone_from(socket);
        }
    }
}
