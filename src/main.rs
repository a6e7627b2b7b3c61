//! rune-gateway: REST and WebSocket front for a JSON-RPC daemon

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tokio::signal;
use tracing::{error, info, warn};

use rune_gateway::{
    cli::{Cli, Command},
    config::GatewayConfig,
    feed::run_feed,
    gateway::GatewayInstances,
    rpc::UnixSocketRpc,
    setup_tracing,
    tls::CertificateAuthority,
};

// One worker: HTTP handlers, sessions, the drain task and the feed all
// interleave on this thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match GatewayConfig::load(cli.config.as_deref()) {
        Ok(mut config) => {
            cli.apply(&mut config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Some(Command::Certs) => run_certs(&config),
        Some(Command::Serve) | None => run_server(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Generate or verify the certificate set
fn run_certs(config: &GatewayConfig) -> anyhow::Result<()> {
    let set = CertificateAuthority::ensure(&config.rest_certs, &config.rest_host)
        .with_context(|| format!("cannot prepare certificates in {}", config.rest_certs.display()))?;

    if set.generated {
        println!("Generated certificate set in {}", set.dir.display());
    } else {
        println!("Certificate set in {} is valid", set.dir.display());
    }
    println!("  CA:     {}", set.ca_cert_path().display());
    println!("  Cert:   {}", set.server_cert_path().display());
    println!("  Key:    {}", set.server_key_path().display());
    Ok(())
}

async fn run_server(config: GatewayConfig) -> anyhow::Result<()> {
    // Without a port the gateway stays inert rather than failing its host
    if let Err(e) = config.validate() {
        if config.rest_port.is_none() {
            warn!("{e}; REST gateway disabled");
            return Ok(());
        }
        return Err(e).context("invalid configuration");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %config.rpc_socket.display(),
        "Starting rune gateway"
    );

    let backend = Arc::new(UnixSocketRpc::new(&config.rpc_socket));
    let instances = GatewayInstances::new();
    let running = instances
        .start(config, backend)
        .await
        .context("failed to start REST server")?;

    let notifications = running.notifications();
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = run_feed(stdin, notifications).await {
            warn!(error = %e, "Notification feed failed");
        }
    });

    running.run(shutdown_signal()).await?;
    info!("Gateway shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
