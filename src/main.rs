use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LogFormat, LoggingConfig};
use gatekeeper::metrics::Metrics;
use gatekeeper::origin;
use gatekeeper::ratelimit::{RatelimitRequest, Service};

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about = "Sliding-window distributed rate limiter")]
struct Cli {
    /// YAML configuration file; defaults plus GATEKEEPER__* overrides when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engine until Ctrl+C or SIGTERM
    Serve,

    /// Issue batched checks against the configured origin and print the responses
    Check {
        /// Identifier every limit applies to
        #[arg(long)]
        identifier: String,

        /// Limit as NAME:LIMIT:SECONDS; repeat for a batch
        #[arg(long = "limit", required = true, value_parser = parse_limit)]
        limits: Vec<LimitArg>,

        /// Cost of each check
        #[arg(long, default_value_t = 1)]
        cost: i64,

        /// Number of batches to issue
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Print Prometheus metrics after the checks
        #[arg(long)]
        metrics: bool,
    },

    /// Print the effective configuration as YAML
    PrintConfig,
}

#[derive(Debug, Clone)]
struct LimitArg {
    name: String,
    limit: i64,
    duration: Duration,
}

fn parse_limit(s: &str) -> Result<LimitArg, String> {
    let mut parts = s.rsplitn(3, ':');
    let (Some(seconds), Some(limit), Some(name)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected NAME:LIMIT:SECONDS, got {:?}", s));
    };
    let limit = limit
        .parse::<i64>()
        .map_err(|e| format!("invalid limit {:?}: {}", limit, e))?;
    let seconds = seconds
        .parse::<u64>()
        .map_err(|e| format!("invalid seconds {:?}: {}", seconds, e))?;
    Ok(LimitArg {
        name: name.to_string(),
        limit,
        duration: Duration::from_secs(seconds),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GatekeeperConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatekeeperConfig::from_env().context("loading configuration")?,
    };

    init_tracing(&config.logging);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Check {
            identifier,
            limits,
            cost,
            count,
            metrics,
        } => check(config, identifier, limits, cost, count, metrics).await,
        Command::PrintConfig => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

/// Logs go to stderr so `check` output stays machine readable.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn start(config: &GatekeeperConfig) -> anyhow::Result<Service> {
    let origin = origin::connect(&config.origin)
        .await
        .context("connecting to origin")?;
    let metrics = Arc::new(Metrics::new(prometheus::Registry::new())?);

    let service = Service::builder(origin)
        .config(config.service.clone())
        .breaker(config.breaker.clone())
        .metrics(metrics)
        .build()?;
    Ok(service)
}

async fn serve(config: GatekeeperConfig) -> anyhow::Result<()> {
    info!("Starting Gatekeeper Rate Limiting Engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(origin = ?config.origin, "Configuration loaded");

    let service = start(&config).await?;
    info!("Rate limit service ready");

    shutdown_signal().await;

    service.close().await?;
    info!("Gatekeeper stopped");
    Ok(())
}

async fn check(
    config: GatekeeperConfig,
    identifier: String,
    limits: Vec<LimitArg>,
    cost: i64,
    count: usize,
    print_metrics: bool,
) -> anyhow::Result<()> {
    let service = start(&config).await?;

    for _ in 0..count {
        let batch = limits
            .iter()
            .map(|l| {
                RatelimitRequest::new(&l.name, &identifier, l.limit, l.duration).with_cost(cost)
            })
            .collect();
        let responses = service.ratelimit_many(batch).await?;
        println!("{}", serde_json::to_string(&responses)?);
    }

    service.close().await?;

    if print_metrics {
        print!("{}", service.metrics().render());
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit() {
        let limit = parse_limit("requests-per-minute:100:60").unwrap();
        assert_eq!(limit.name, "requests-per-minute");
        assert_eq!(limit.limit, 100);
        assert_eq!(limit.duration, Duration::from_secs(60));

        // Only the last two fields are numeric
        let limit = parse_limit("tenant:reads:5:1").unwrap();
        assert_eq!(limit.name, "tenant:reads");

        assert!(parse_limit("rpm:100").is_err());
        assert!(parse_limit("rpm:many:60").is_err());
        assert!(parse_limit("rpm:100:-1").is_err());
    }

    #[test]
    fn test_cli_parses_check() {
        let cli = Cli::try_parse_from([
            "gatekeeper",
            "check",
            "--identifier",
            "key_1",
            "--limit",
            "rpm:5:60",
            "--limit",
            "rpd:100:86400",
            "--count",
            "3",
        ])
        .unwrap();

        match cli.command {
            Command::Check { limits, count, cost, .. } => {
                assert_eq!(limits.len(), 2);
                assert_eq!(count, 3);
                assert_eq!(cost, 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
