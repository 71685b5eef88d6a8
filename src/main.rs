//! bchgate - BCH REST gateway with tiered access control and live event relay

use bchgate::{
    api::{server::ApiServer, TierLimits, TokenIssuer},
    config::{ConfigLoader, GatewayConfig},
    errors::{ConfigError, GatewayResult},
};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "bchgate")]
#[command(about = "BCH REST gateway: tiered access control and real-time event relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen host (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Upstream ZeroMQ endpoint, e.g. tcp://127.0.0.1:28332
        #[arg(long)]
        feed_endpoint: Option<String>,
    },

    /// Mint a signed tier token with the configured secret
    IssueToken {
        /// Token subject (stable caller id)
        #[arg(long)]
        subject: String,

        /// Tier label: basic or pro-N
        #[arg(long)]
        tier: String,

        /// Lifetime in seconds
        #[arg(long, default_value = "2592000")]
        ttl_secs: u64,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let loader = match path {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };
    loader.load()
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bchgate=info,tower_http=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    feed_endpoint: Option<String>,
) -> GatewayResult<()> {
    let mut config = load_config(config.as_ref())?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(endpoint) = feed_endpoint {
        config.feed.endpoint = Some(endpoint);
    }
    config.validate()?;

    tracing::info!("🚀 Starting bchgate v{}", env!("CARGO_PKG_VERSION"));
    ApiServer::new(config).run().await
}

fn issue_token(
    config: Option<PathBuf>,
    subject: &str,
    tier: &str,
    ttl_secs: u64,
) -> GatewayResult<String> {
    let config = load_config(config.as_ref())?;
    let secret = config
        .auth
        .jwt_secret
        .as_deref()
        .ok_or_else(|| ConfigError::MissingRequired("auth.jwt_secret".to_string()))?;

    let issuer = TokenIssuer::new(secret, TierLimits::from(&config.rate_limit));
    issuer
        .issue(subject, tier, Duration::from_secs(ttl_secs))
        .map_err(|e| {
            ConfigError::InvalidValue {
                field: "tier".to_string(),
                value: tier.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let result = match Cli::parse().command {
        Command::Serve {
            config,
            host,
            port,
            feed_endpoint,
        } => serve(config, host, port, feed_endpoint).await,
        Command::IssueToken {
            subject,
            tier,
            ttl_secs,
            config,
        } => issue_token(config, &subject, &tier, ttl_secs).map(|token| println!("{}", token)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
