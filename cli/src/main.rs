//! failover CLI: validate router configs and rehearse provider outages.
//!
//! # Commands
//! ```text
//! failover check     --config <file.yaml|file.json>
//! failover providers --config <file>
//! failover simulate  --config <file> [--requests N] [--concurrency C] [--store <db>]
//! failover version
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use failover_core::{CooldownBackoff, FailoverConfig};
use failover_observability::{init_tracing, LogConfig};

mod simulate;

#[derive(Parser)]
#[command(
    name = "failover",
    about = "Circuit-breaker failover router: config checks and outage simulation",
    long_about = "
Validate a provider failover configuration and run a synthetic load
simulation against it. Each provider may carry a `simulate:` block:

  providers:
    - id: primary
      priority: 1
      simulate: { latency_ms: 40, fail_every: 3 }

ENVIRONMENT VARIABLES:
  RUST_LOG    Overrides the configured log filter
",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the configured providers in priority order
    Providers {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Drive synthetic traffic through the router and print provider health
    Simulate {
        #[arg(short, long)]
        config: PathBuf,
        /// Number of requests to dispatch
        #[arg(long, default_value_t = 200)]
        requests: usize,
        /// Requests in flight at once
        #[arg(long, default_value_t = 8)]
        concurrency: usize,
        /// SQLite file used to rehydrate windows and persist snapshots
        #[arg(long)]
        store: Option<PathBuf>,
        /// Print the health report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print version
    Version,
}

/// Extra top-level keys the CLI understands next to the router config.
#[derive(Debug, Default, Deserialize)]
struct CliSection {
    #[serde(default)]
    logging: Option<LogConfig>,
}

fn load(path: &Path) -> Result<(FailoverConfig, CliSection)> {
    let config = FailoverConfig::from_path(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let raw = std::fs::read_to_string(path)?;
    let section: CliSection = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&raw)?
    } else {
        serde_yaml::from_str(&raw)?
    };
    Ok((config, section))
}

fn config_path(command: &Commands) -> Option<&Path> {
    match command {
        Commands::Check { config }
        | Commands::Providers { config }
        | Commands::Simulate { config, .. } => Some(config),
        Commands::Version => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = config_path(&cli.command).map(load).transpose()?;

    let mut log_config = loaded
        .as_ref()
        .and_then(|(_, section)| section.logging.clone())
        .unwrap_or_default();
    if cli.verbose {
        log_config.level = "debug".into();
    }
    log_config.json |= cli.json_logs;
    init_tracing(&log_config);

    match (cli.command, loaded) {
        (Commands::Version, _) => {
            println!("failover {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        (Commands::Check { config }, Some((cfg, _))) => {
            println!(
                "OK  {}: {} provider(s), selection = {:?}",
                config.display(),
                cfg.providers.len(),
                cfg.selection
            );
            Ok(())
        }
        (Commands::Providers { .. }, Some((cfg, _))) => {
            print_providers(&cfg);
            Ok(())
        }
        (
            Commands::Simulate {
                config,
                requests,
                concurrency,
                store,
                json,
            },
            Some((cfg, _)),
        ) => {
            let opts = simulate::Options {
                config_path: config,
                requests,
                concurrency: concurrency.max(1),
                store,
                json,
            };
            simulate::run(cfg, opts).await
        }
        (_, None) => anyhow::bail!("no configuration loaded"),
    }
}

fn print_providers(config: &FailoverConfig) {
    let mut providers: Vec<_> = config.providers.iter().collect();
    providers.sort_by_key(|p| p.priority);

    println!(
        "{:<16} {:>8} {:>10} {:>9} {:>8} {:>12} {:>6} {:>8}",
        "PROVIDER", "PRIORITY", "TIMEOUT", "FAILURES", "ERR>", "COOLDOWN", "TRIALS", "WINDOW"
    );
    for p in providers {
        let cooldown = match &p.cooldown_backoff {
            CooldownBackoff::Fixed => format!("{}ms", p.open_cooldown_ms),
            CooldownBackoff::Exponential { .. } => format!("{}ms+exp", p.open_cooldown_ms),
        };
        println!(
            "{:<16} {:>8} {:>8}ms {:>9} {:>8.2} {:>12} {:>6} {:>8}",
            p.id.as_str(),
            p.priority,
            p.timeout_ms,
            p.failure_threshold,
            p.error_rate_threshold,
            cooldown,
            p.half_open_trial_quota,
            p.window_capacity,
        );
    }
    println!("\nselection: {:?}", config.selection);
}
