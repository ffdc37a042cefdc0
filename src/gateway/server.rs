//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::auth::{Authorizer, HttpKeyFetcher, KeyCache, StaticRoles, TokenVerifier};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::upload::{ObjectKeyBuilder, S3Presigner, UploadAuthorizationService};
use crate::{Error, Result};

/// Upload gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Upload pipeline shared by all requests
    service: Arc<UploadAuthorizationService>,
}

impl Gateway {
    /// Wire the pipeline from configuration. No network access happens here;
    /// the key set is fetched on the first authenticated request.
    pub fn new(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let service = Arc::new(build_service(&config, clock)?);
        Ok(Self { config, service })
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = Arc::new(AppState {
            service: Arc::clone(&self.service),
        });
        let app = create_router(state, &self.config.server);

        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %addr,
            bucket = %self.config.storage.bucket,
            jwks_uri = %self.config.auth.jwks_uri,
            "Upload gateway listening"
        );

        let signalled = Arc::new(Notify::new());
        let notify = Arc::clone(&signalled);
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                notify.notify_one();
            })
            .into_future();

        let drain_limit = self.config.server.shutdown_timeout;
        tokio::select! {
            res = server => res.map_err(|e| Error::Internal(e.to_string()))?,
            () = async {
                signalled.notified().await;
                tokio::time::sleep(drain_limit).await;
            } => {
                warn!(timeout = ?drain_limit, "In-flight requests still running at shutdown timeout, dropping them");
            }
        }

        info!("Upload gateway stopped");
        Ok(())
    }
}

/// Assemble the upload pipeline for `config` around `clock`.
pub fn build_service(config: &Config, clock: Arc<dyn Clock>) -> Result<UploadAuthorizationService> {
    let fetcher = HttpKeyFetcher::new(&config.auth.jwks_uri, config.auth.fetch_timeout)
        .map_err(|e| Error::Config(format!("JWKS client: {e}")))?;
    let keys = Arc::new(KeyCache::new(
        Arc::new(fetcher),
        Arc::clone(&clock),
        config.auth.key_freshness,
    ));
    let verifier = TokenVerifier::new(&config.auth, Arc::clone(&clock));
    let roles = Arc::new(StaticRoles::new(config.auth.roles.clone()));
    let authorizer = Arc::new(Authorizer::new(&config.auth, keys, verifier, roles));

    let signer = Arc::new(S3Presigner::from_config(&config.storage, Arc::clone(&clock))?);

    Ok(UploadAuthorizationService::new(
        authorizer,
        ObjectKeyBuilder::from_config(&config.object_key),
        signer,
        clock,
    ))
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
