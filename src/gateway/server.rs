//! Gateway server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::broadcast::{NotificationBroadcaster, NotificationSender, SessionRegistry};
use super::cors::OriginPolicy;
use super::router::{AppState, create_router};
use crate::config::{GatewayConfig, Protocol};
use crate::rpc::RpcBackend;
use crate::tls::{CertificateAuthority, TlsListener, build_server_config};
use crate::{Error, Result};

/// REST + WebSocket gateway in front of one backend
pub struct Gateway {
    config: GatewayConfig,
    backend: Arc<dyn RpcBackend>,
}

impl Gateway {
    /// Create a new gateway
    pub fn new(config: GatewayConfig, backend: Arc<dyn RpcBackend>) -> Self {
        Self { config, backend }
    }

    /// Start, then serve until `shutdown` resolves or the broadcaster stops
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.start().await?.run(shutdown).await
    }

    /// Bind the listener and start serving in the background.
    ///
    /// With `https`, the certificate set under `rest-certs` is generated on
    /// first use and the listener presents the server leaf.
    pub async fn start(self) -> Result<RunningGateway> {
        let port = self.config.validate()?;
        let host = self.config.rest_host.as_str();

        let tls = match self.config.rest_protocol {
            Protocol::Https => {
                let set = CertificateAuthority::ensure(&self.config.rest_certs, host)?;
                Some(build_server_config(&set)?)
            }
            Protocol::Http => None,
        };

        let origins = Arc::new(OriginPolicy::from_patterns(&self.config.rest_cors_origins));
        let sessions = Arc::new(SessionRegistry::new());
        let broadcaster = NotificationBroadcaster::spawn(
            Arc::clone(&sessions),
            self.config.queue_capacity,
            self.config.drain_interval,
        );
        let state = Arc::new(AppState::new(
            Arc::clone(&self.backend),
            origins,
            Arc::clone(&sessions),
        ));
        let app = create_router(state, &self.config.rest_csp)?;

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| Error::Transport(format!("Cannot bind {host}:{port}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };

        let server = match tls {
            Some(tls) => {
                let listener = TlsListener::new(listener, tls)?;
                tokio::spawn(async move {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                })
            }
            None => tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
            }),
        };

        // Port 0 binds an ephemeral port; announce the one actually bound
        let mut announced = self.config;
        announced.rest_port = Some(local_addr.port());
        info!("REST server running at {}", announced.base_url());

        Ok(RunningGateway {
            local_addr,
            broadcaster,
            sessions,
            shutdown: Some(shutdown_tx),
            server,
            registration: None,
        })
    }
}

/// Handle on a started gateway
pub struct RunningGateway {
    local_addr: SocketAddr,
    broadcaster: NotificationBroadcaster,
    sessions: Arc<SessionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<std::io::Result<()>>,
    registration: Option<PortRegistration>,
}

impl RunningGateway {
    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Producer handle for backend notifications
    #[must_use]
    pub fn notifications(&self) -> NotificationSender {
        self.broadcaster.sender()
    }

    /// Connected WebSocket sessions
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Whether the server task is still serving
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.server.is_finished()
    }

    /// Resolve once the close sentinel has been processed
    pub async fn stopped(&self) {
        self.broadcaster.stopped().await;
    }

    /// Serve until `shutdown` resolves or the broadcaster stops, then stop
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::select! {
            () = shutdown => debug!("Shutdown requested"),
            () = self.stopped() => info!("Notification broadcaster stopped, shutting down"),
        }
        self.stop().await
    }

    /// Stop accepting, drop every session and wait for the server task
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.sessions.clear();

        let served = (&mut self.server)
            .await
            .map_err(|e| Error::Transport(format!("Server task failed: {e}")))?;
        info!(addr = %self.local_addr, "REST server stopped");
        drop(self.registration.take());
        served.map_err(Error::from)
    }
}

/// Releases a port from [`GatewayInstances`] when dropped
struct PortRegistration {
    active: Arc<DashSet<u16>>,
    port: u16,
}

impl Drop for PortRegistration {
    fn drop(&mut self) {
        self.active.remove(&self.port);
    }
}

/// Gateways started by this process, keyed by configured port
#[derive(Debug, Clone, Default)]
pub struct GatewayInstances {
    active: Arc<DashSet<u16>>,
}

impl GatewayInstances {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a gateway for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if a gateway for the same port was
    /// started and not yet stopped, or any startup error of [`Gateway::start`].
    pub async fn start(
        &self,
        config: GatewayConfig,
        backend: Arc<dyn RpcBackend>,
    ) -> Result<RunningGateway> {
        let port = config.validate()?;
        if !self.active.insert(port) {
            return Err(Error::AlreadyRunning(port));
        }
        let registration = PortRegistration {
            active: Arc::clone(&self.active),
            port,
        };

        let mut running = Gateway::new(config, backend).start().await?;
        running.registration = Some(registration);
        Ok(running)
    }

    /// Whether a gateway for `port` is running
    #[must_use]
    pub fn is_running(&self, port: u16) -> bool {
        self.active.contains(&port)
    }
}
