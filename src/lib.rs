//! Edge Proxy Library
//!
//! Front-door gateway for a cloud storage deployment. Every inbound request
//! is authenticated, mapped to a canonical user, routed by policy and
//! forwarded to the backend service that owns the path.
//!
//! # Features
//!
//! - **Policy routing**: static, claims or regex policy selection, then
//!   query, regex and prefix route matching with a root fallback
//! - **Pluggable authentication**: OIDC bearer tokens, basic auth, app
//!   passwords, public links, pre-signed URLs and client API keys
//! - **Identity resolution**: user lookup, auto-provisioning, group sync and
//!   role assignment
//! - **Reverse proxy**: streaming forwarding to static backends or
//!   round-robin service nodes with failover

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod claims;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod oidc;
pub mod routing;
pub mod signing;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
