//! HTTP app and shared state

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::HeaderName,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::logout::backchannel_logout_handler;
use super::pipeline::proxy_handler;
use super::proxy::ProxyDispatcher;
use super::well_known::openid_configuration_handler;
use crate::auth::AuthenticationChain;
use crate::identity::AccountResolver;
use crate::oidc::{ClaimsCache, OidcClient};
use crate::routing::{self, ServiceRegistry};

/// Request id header set on every request and echoed on the response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared application state.
pub struct AppState {
    /// Policy selector plus route table.
    pub router: Arc<routing::Router>,
    /// Authentication chain
    pub chain: Arc<AuthenticationChain>,
    /// Identity resolution
    pub resolver: Arc<AccountResolver>,
    /// Service nodes for service routes.
    pub registry: Arc<dyn ServiceRegistry>,
    /// Upstream dispatcher
    pub proxy: Arc<ProxyDispatcher>,
    /// OIDC provider, when an issuer is configured.
    pub oidc: Option<Arc<OidcClient>>,
    /// Token to claims cache, shared with the OIDC authenticator.
    pub claims_cache: Arc<ClaimsCache>,
    /// Deadline for the authentication phase.
    pub auth_timeout: Duration,
    /// Scheme used when the client sends no `X-Forwarded-Proto`.
    pub public_scheme: String,
    /// Relay the provider's discovery document.
    pub rewrite_well_known: bool,
}

/// Create the router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    let mut app = Router::new()
        .route("/healthz", get(health_handler))
        // Other methods on this path belong to the backends
        .route(
            "/backchannel_logout",
            post(backchannel_logout_handler).fallback(proxy_handler),
        );
    if state.rewrite_well_known && state.oidc.is_some() {
        app = app.route(
            "/.well-known/openid-configuration",
            get(openid_configuration_handler),
        );
    }

    app.fallback(proxy_handler)
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .with_state(state)
}

/// Liveness
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "authenticators": state.chain.names(),
        "claims_cache": state.claims_cache.len(),
    }))
}
