//! Request pipeline: authenticate, resolve, select, route, rewrite, forward

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, error, warn};

use super::proxy::{ACCESS_TOKEN_HEADER, error_status};
use super::router::AppState;
use crate::auth::ChainOutcome;
use crate::identity::{Identity, ResolveError};
use crate::routing::{RoutingError, has_dot_segments, rewrite, selector::read_cookie};

/// JSON error body with a short reason.
pub fn error_response(status: StatusCode, reason: &str) -> Response {
    (status, Json(json!({ "error": reason }))).into_response()
}

fn unauthorized(challenges: &[String]) -> Response {
    let mut response = error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    for challenge in challenges {
        if let Ok(value) = HeaderValue::from_str(challenge) {
            response.headers_mut().append(header::WWW_AUTHENTICATE, value);
        }
    }
    response
}

/// Whether the route an anonymous caller would hit is unprotected.
fn preliminary_unprotected(state: &AppState, parts: &Parts) -> bool {
    state
        .router
        .route(parts, &Identity::anonymous())
        .is_ok_and(|info| info.unprotected)
}

/// Scheme the client used to reach us.
fn public_scheme(state: &AppState, parts: &Parts) -> String {
    parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| state.public_scheme.clone(), str::to_string)
}

/// `Set-Cookie` value pinning the selected policy, when one is due.
fn selector_cookie(
    state: &AppState,
    parts: &Parts,
    identity: &Identity,
    policy: &str,
) -> Option<HeaderValue> {
    let name = state.router.selector().cookie_name()?;
    if !identity.is_authenticated() {
        return None;
    }
    if read_cookie(&parts.headers, name).as_deref() == Some(policy) {
        return None;
    }
    HeaderValue::from_str(&format!("{name}={policy}; Path=/; HttpOnly")).ok()
}

/// Fallback handler that runs every proxied request.
pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let (mut parts, body) = request.into_parts();
    // Only the gateway may set this
    parts.headers.remove(ACCESS_TOKEN_HEADER);

    // Exemptions and routes are checked against the raw path, so it must be
    // the path the backend sees
    if has_dot_segments(parts.uri.path()) {
        warn!(path = %parts.uri.path(), "Rejecting path with dot segments");
        return error_response(StatusCode::BAD_REQUEST, "invalid path");
    }

    let unprotected = preliminary_unprotected(&state, &parts);
    let outcome = match tokio::time::timeout(
        state.auth_timeout,
        state.chain.authenticate(&parts, unprotected),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(path = %parts.uri.path(), timeout = ?state.auth_timeout, "Authentication timed out");
            return error_response(StatusCode::GATEWAY_TIMEOUT, "authentication timed out");
        }
    };

    let identity = match outcome {
        ChainOutcome::Exempt => Identity::anonymous(),
        ChainOutcome::Rejected(challenges) => return unauthorized(&challenges),
        ChainOutcome::Authenticated(authenticated) => match state
            .resolver
            .resolve(authenticated)
            .await
        {
            Ok(identity) => identity,
            Err(ResolveError::Unauthenticated(reason)) => {
                debug!(path = %parts.uri.path(), reason = %reason, "Identity rejected");
                return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            Err(ResolveError::Internal(reason)) => {
                error!(path = %parts.uri.path(), reason = %reason, "Identity resolution failed");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "identity resolution failed");
            }
        },
    };

    let info = match state.router.route(&parts, &identity) {
        Ok(info) => info,
        Err(e) => {
            warn!(path = %parts.uri.path(), error = %e, "Routing failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "no route");
        }
    };

    let target = match rewrite(&info, state.registry.as_ref(), &parts.uri).await {
        Ok(target) => target,
        Err(RoutingError::Registry(e)) => {
            error!(path = %parts.uri.path(), policy = %info.policy, error = %e, "No upstream node available");
            return error_response(StatusCode::BAD_GATEWAY, "upstream unavailable");
        }
        Err(e) => {
            error!(path = %parts.uri.path(), policy = %info.policy, error = %e, "Rewrite failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid route");
        }
    };

    let cookie = selector_cookie(&state, &parts, &identity, &info.policy);
    let scheme = public_scheme(&state, &parts);
    debug!(
        path = %parts.uri.path(),
        policy = %info.policy,
        route_type = %info.route_type,
        endpoint = %info.endpoint,
        "Routing request"
    );

    let request = Request::from_parts(parts, body);
    match state
        .proxy
        .forward(request, &target, identity.access_token.as_deref(), &scheme)
        .await
    {
        Ok(mut response) => {
            if let Some(cookie) = cookie {
                response.headers_mut().append(header::SET_COOKIE, cookie);
            }
            response
        }
        Err(e) => error_response(error_status(&e), "upstream unavailable"),
    }
}
