//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Edge Proxy - policy routing and authentication in front of cloud storage services.
#[derive(Parser, Debug)]
#[command(name = "edge-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML).
    #[arg(short, long, env = "EDGE_PROXY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(
        long,
        default_value = "info",
        env = "EDGE_PROXY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json).
    #[arg(long, env = "EDGE_PROXY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode).
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy server (default).
    Serve {
        /// Host to bind to.
        #[arg(long, env = "EDGE_PROXY_HOST")]
        host: Option<String>,

        /// Port to listen on.
        #[arg(short, long, env = "EDGE_PROXY_PORT")]
        port: Option<u16>,
    },

    /// Load and validate the configuration, then print the route summary.
    CheckConfig,

    /// Print a pre-signed URL.
    SignUrl {
        /// Absolute URL to sign.
        #[arg(required = true)]
        url: String,

        /// Username the URL acts as.
        #[arg(long)]
        user: String,

        /// The user's signing key.
        #[arg(long, env = "EDGE_PROXY_SIGNING_KEY")]
        key: String,

        /// HTTP method the URL is valid for.
        #[arg(long, default_value = "GET")]
        method: String,

        /// Validity in seconds (at most 604800).
        #[arg(long, default_value_t = 60)]
        expires: u32,
    },
}
