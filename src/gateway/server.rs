//! Gateway server

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::pipeline::Gateway;
use super::router::create_router;
use super::upstream::UpstreamApp;
use crate::config::{Config, GatewayMode};
use crate::{Error, Result};

/// Standalone gateway server in front of an upstream application
pub struct Server {
    /// Configuration
    config: Config,
    /// Request pipeline
    gateway: Gateway,
    /// Wrapped application
    app: Router,
}

impl Server {
    /// Create a server proxying to the configured upstream application
    pub fn new(config: Config) -> Result<Self> {
        let gateway = Gateway::from_config(&config)?;
        let app = UpstreamApp::new(
            config.app.upstream_url()?,
            config.app.timeout(),
            config.server.max_body_size,
        )?
        .into_router();
        Ok(Self::with_app(config, gateway, app))
    }

    /// Create a server wrapping an in-process application
    pub fn with_app(config: Config, gateway: Gateway, app: Router) -> Self {
        Self {
            config,
            gateway,
            app,
        }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        Ok(TcpListener::bind(addr).await?)
    }

    /// Run until Ctrl+C / SIGTERM
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;

        info!("============================================================");
        info!("WWWHISPER GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %local, "Listening");
        match self.config.mode()? {
            GatewayMode::Enforcing { backend_url } => {
                info!(backend = %backend_url, "AUTHORIZATION enforced");
            }
            GatewayMode::Disabled => {
                warn!("AUTHORIZATION disabled - application is open to all requests");
            }
        }
        if let Some(ref app_url) = self.config.app.url {
            info!(app = %app_url, "Upstream application");
        }
        info!("============================================================");

        let router = create_router(self.gateway, self.app);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
