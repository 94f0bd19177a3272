//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::proxy::ProxyDispatcher;
use super::router::{AppState, create_router};
use crate::auth::{ChainDeps, build_chain};
use crate::config::{AccessTokenVerifyMethod, Config};
use crate::identity::roles::build_role_assigner;
use crate::identity::{
    AccountResolver, InMemoryRoleService, InMemorySigningKeyStore, InMemoryUserBackend,
    SigningKeyStore, UserBackend,
};
use crate::oidc::{ClaimsCache, OidcClient};
use crate::routing::{PolicySelector, Router, RoutingError, ServiceRegistry, StaticServiceRegistry};
use crate::{Error, Result};

/// How often expired claims are swept from the cache.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Edge proxy server.
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared state handed to every request.
    state: Arc<AppState>,
    /// Cancelled on shutdown; stops background tasks.
    shutdown: CancellationToken,
}

impl Gateway {
    /// Assemble the gateway from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();

        let oidc = if config.oidc.enabled() {
            if config.oidc.access_token_verify_method == AccessTokenVerifyMethod::None {
                warn!("Access token verification is disabled; tokens are trusted as-is");
            }
            let client = OidcClient::new(&config.oidc, shutdown.clone())
                .map_err(|e| Error::config(format!("OIDC client: {e}")))?;
            Some(Arc::new(client))
        } else {
            None
        };
        let claims_cache = Arc::new(ClaimsCache::new(config.oidc.user_info_cache.size));

        let registry: Arc<dyn ServiceRegistry> =
            Arc::new(StaticServiceRegistry::from_config(&config.services));

        let users: Arc<dyn UserBackend> = Arc::new(InMemoryUserBackend::from_config(
            &config.directory,
            config.identity.auto_provision_claims.clone(),
            config.oidc.issuer.clone(),
        ));
        let signing_keys: Arc<dyn SigningKeyStore> =
            Arc::new(InMemorySigningKeyStore::from_config(&config.directory));
        let roles = Arc::new(InMemoryRoleService::from_config(&config.directory));
        let assigner = build_role_assigner(&config.role_assignment, roles)
            .map_err(|e| Error::config(format!("role assignment: {e}")))?;
        let resolver = Arc::new(AccountResolver::new(
            &config.identity,
            Arc::clone(&users),
            assigner,
        ));

        let selector = PolicySelector::from_config(config.policy_selector.as_ref(), &config.policies)
            .map_err(RoutingError::from)?;
        let router = Arc::new(Router::new(&config.policies, selector)?);

        let chain = Arc::new(build_chain(
            &config,
            &ChainDeps {
                users,
                signing_keys,
                oidc: oidc.clone(),
                claims_cache: Arc::clone(&claims_cache),
            },
        ));

        let proxy = Arc::new(
            ProxyDispatcher::new(
                Arc::clone(&registry),
                config.server.upstream_connect_timeout,
                config.server.request_timeout,
                config.insecure_backends,
            )
            .map_err(|e| Error::Internal(e.to_string()))?,
        );

        let state = Arc::new(AppState {
            router,
            chain,
            resolver,
            registry,
            proxy,
            oidc,
            claims_cache,
            auth_timeout: config.auth.timeout,
            public_scheme: config.server.public_scheme.clone(),
            rewrite_well_known: config.oidc.rewrite_well_known,
        });

        Ok(Self {
            config,
            state,
            shutdown,
        })
    }

    /// Shared state
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// The axum app, without binding a socket.
    pub fn app(&self) -> axum::Router {
        create_router(self.state())
    }

    /// Token that stops the gateway when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the gateway.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        self.log_banner(addr);

        // Sweep expired claims so idle tokens do not pin memory
        let cache = Arc::clone(&self.state.claims_cache);
        let sweep_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = cache.evict_expired();
                        if evicted > 0 {
                            debug!(evicted, "Swept expired claims");
                        }
                    }
                    () = sweep_shutdown.cancelled() => break,
                }
            }
        });

        let app = self
            .app()
            .into_make_service_with_connect_info::<SocketAddr>();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(self.shutdown.clone()))
            .into_future();

        let drain_timeout = self.config.server.shutdown_timeout;
        let drain_shutdown = self.shutdown.clone();
        let drain_deadline = async move {
            drain_shutdown.cancelled().await;
            tokio::time::sleep(drain_timeout).await;
        };

        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = drain_deadline => {
                warn!(timeout = ?drain_timeout, "Graceful shutdown timed out, dropping open connections");
            }
        }

        info!("Edge proxy stopped");
        Ok(())
    }

    fn log_banner(&self, addr: SocketAddr) {
        info!("============================================================");
        info!("Edge proxy v{} listening on http://{addr}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        for (policy, routes) in self.state.router.summary() {
            info!(policy = %policy, routes, "Loaded policy");
        }
        info!(authenticators = ?self.state.chain.names(), "Authentication chain");
        if self.config.oidc.enabled() {
            info!(issuer = %self.config.oidc.issuer, "OIDC provider");
        } else {
            warn!("No OIDC issuer configured; bearer tokens are not accepted");
        }
        info!("  GET  http://{addr}/healthz  (liveness)");
    }
}

/// Resolves when SIGINT or SIGTERM arrives, or when `shutdown` is cancelled elsewhere.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Shutdown signal received"),
        () = terminate => info!("Shutdown signal received"),
        () = shutdown.cancelled() => debug!("Shutdown requested"),
    }
    shutdown.cancel();
}
