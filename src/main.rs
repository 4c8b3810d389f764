use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bwtester::client::{self, ClientOptions};
use bwtester::config::{BwtesterConfig, LoggingConfig};
use bwtester::params::DirectionSpec;
use bwtester::report::format_summary;
use bwtester::server::{self, ServerOptions};

#[derive(Parser)]
#[command(
    name = "bwtester",
    about = "Two-way UDP bandwidth tester with verified payloads",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true, env = "BWTESTER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a bandwidth test against a server
    Client {
        /// Local control address (data channel uses the next port)
        #[arg(short = 'c', long = "local")]
        local: Option<String>,

        /// Server control address
        #[arg(short = 's', long = "server")]
        server: Option<String>,

        /// Client->server direction: duration,packet_size,num_packets
        #[arg(long = "cs")]
        client_to_server: Option<DirectionSpec>,

        /// Server->client direction: duration,packet_size,num_packets
        #[arg(long = "sc")]
        server_to_client: Option<DirectionSpec>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Answer bandwidth tests
    Server {
        /// Control address to listen on
        #[arg(short = 's', long = "listen")]
        listen: Option<String>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_addr(value: Option<String>, fallback: Option<&str>, what: &str) -> Result<SocketAddr> {
    let Some(raw) = value.or_else(|| fallback.map(str::to_string)) else {
        bail!("{} address must be specified", what);
    };
    raw.parse()
        .with_context(|| format!("invalid {} address: {}", what, raw))
}

fn direction(value: Option<DirectionSpec>, fallback: &str, what: &str) -> Result<DirectionSpec> {
    match value {
        Some(spec) => Ok(spec),
        None => fallback
            .parse()
            .with_context(|| format!("invalid {} direction in config: {}", what, fallback)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BwtesterConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Client {
            local,
            server,
            client_to_server,
            server_to_client,
            json,
        } => {
            let cfg = &config.client;
            let options = ClientOptions {
                local: parse_addr(local, cfg.local_address.as_deref(), "local")?,
                server: parse_addr(server, cfg.server_address.as_deref(), "server")?,
                client_to_server: direction(client_to_server, &cfg.client_to_server, "client->server")?,
                server_to_client: direction(server_to_client, &cfg.server_to_client, "server->client")?,
                retry: cfg.retry_policy(),
            };

            if !json {
                println!("Client->server test: {}", options.client_to_server);
                println!("Server->client test: {}", options.server_to_client);
            }

            let report = client::run(options).await.context("bandwidth test failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!();
                println!("{}", format_summary(&report.server_to_client));
                if let Some(cs) = &report.client_to_server {
                    println!();
                    println!("{}", format_summary(cs));
                }
            }

            if let Some(failure) = report.failure {
                bail!(failure);
            }
        }
        Commands::Server { listen } => {
            let cfg = &config.server;
            let mut options = ServerOptions::new(parse_addr(listen, Some(cfg.listen_address.as_str()), "listen")?);
            options.retention = Duration::from_secs(cfg.result_retention_secs);
            options.cleanup_interval = Duration::from_secs(cfg.cleanup_interval_secs.max(1));

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, shutting down");
                    on_signal.cancel();
                }
            });

            server::run(options, cancel).await?;
        }
    }

    Ok(())
}
