//! Edge Proxy - front-door gateway for cloud storage
//!
//! Policy routing, pluggable authentication and identity resolution.

use std::process::ExitCode;

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use tracing::{error, info};

use edge_proxy::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    routing::{PolicySelector, Router, RoutingError},
    setup_tracing,
    signing::{self, MAX_EXPIRES_SECS},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::SignUrl {
            ref url,
            ref user,
            ref key,
            ref method,
            expires,
        }) => run_sign_url(url, user, key, method, expires),
        Some(Command::Serve { ref host, port }) => run_server(&cli, host.clone(), port).await,
        None => run_server(&cli, None, None).await,
    }
}

/// Load and validate the configuration, then print what it routes.
fn run_check_config(cli: &Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()).and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let router = PolicySelector::from_config(config.policy_selector.as_ref(), &config.policies)
        .map_err(RoutingError::from)
        .and_then(|selector| Router::new(&config.policies, selector));
    match router {
        Ok(router) => {
            println!("✅ Configuration is valid");
            for (policy, routes) in router.summary() {
                println!("   policy {policy}: {routes} route(s)");
            }
            println!("   services: {}", config.services.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Print a signed URL valid from now for `expires` seconds.
fn run_sign_url(raw: &str, user: &str, key: &str, method: &str, expires: u32) -> ExitCode {
    if expires == 0 || i64::from(expires) > MAX_EXPIRES_SECS {
        eprintln!("❌ --expires must be between 1 and {MAX_EXPIRES_SECS}");
        return ExitCode::FAILURE;
    }
    let url = match url::Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("❌ Invalid URL '{raw}': {e}");
            return ExitCode::FAILURE;
        }
    };
    let Some(host) = url.host_str() else {
        eprintln!("❌ URL '{raw}' has no host");
        return ExitCode::FAILURE;
    };
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let date = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    println!(
        "{}",
        signing::sign_url(
            url.scheme(),
            &authority,
            url.path(),
            user,
            &date,
            expires,
            &method.to_ascii_uppercase(),
            key.as_bytes(),
        )
    );
    ExitCode::SUCCESS
}

async fn run_server(cli: &Cli, host: Option<String>, port: Option<u16>) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        policies = config.policies.len(),
        services = config.services.len(),
        "Starting edge proxy"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
