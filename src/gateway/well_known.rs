//! Relays the provider's discovery document

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use super::pipeline::error_response;
use super::router::AppState;

/// `GET /.well-known/openid-configuration`
pub async fn openid_configuration_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(client) = &state.oidc else {
        return error_response(StatusCode::NOT_FOUND, "not found");
    };
    match client.discovery_document().await {
        Ok(document) => Json(document).into_response(),
        Err(e) => {
            error!(url = %client.discovery_url(), error = %e, "Could not fetch discovery document");
            error_response(StatusCode::BAD_GATEWAY, "identity provider unavailable")
        }
    }
}
