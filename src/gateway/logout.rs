//! OIDC back-channel logout

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Form, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::router::AppState;

fn invalid_request(description: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "invalid_request",
            "error_description": description,
        })),
    )
        .into_response()
}

/// `POST /backchannel_logout`: evict every cached session entry of the token's `sid`.
pub async fn backchannel_logout_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let Some(client) = &state.oidc else {
        return invalid_request("no identity provider configured");
    };
    let Some(raw) = form.get("logout_token").filter(|t| !t.is_empty()) else {
        return invalid_request("missing logout_token");
    };

    let token = match client.verify_logout_token(raw).await {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "Rejected logout token");
            return invalid_request(&e.to_string());
        }
    };

    if let Some(sid) = &token.session_id {
        let evicted = state.claims_cache.evict_session(sid);
        info!(evicted, subject = ?token.subject, "Back-channel logout");
    } else {
        info!(subject = ?token.subject, "Back-channel logout without session id");
    }
    (StatusCode::OK, Json(Value::Null)).into_response()
}
