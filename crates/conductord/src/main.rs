//! conductord — the Conductor command-line front end.
//!
//! # Usage
//!
//! ```text
//! conductord validate request.json
//! conductord estimate request.json
//! conductord --config conductor.toml simulate request.json --previous 1.9 --break-image
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use conductor_core::ConductorConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "conductord",
    about = "Conductor — deployment orchestrator",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to conductor.toml. Built-in defaults when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (overrides [logging].json).
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run pre-flight validation against the simulated substrate.
    Validate {
        /// Deployment request (JSON).
        request: PathBuf,
    },
    /// Print the resolved strategy and the estimated rollout time.
    Estimate {
        /// Deployment request (JSON).
        request: PathBuf,
    },
    /// Run a full rollout against an in-memory cluster, streaming events
    /// and log lines to stdout.
    Simulate {
        /// Deployment request (JSON).
        request: PathBuf,

        /// Deploy this version first so there is something to replace and
        /// roll back to.
        #[arg(long)]
        previous: Option<String>,

        /// Make the new environment fail health probes and report bad
        /// canary metrics.
        #[arg(long)]
        fail_health: bool,

        /// Make the requested image crash on start, failing any strategy.
        #[arg(long)]
        break_image: bool,

        /// Shrink all waits to milliseconds.
        #[arg(long)]
        fast: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config, cli.log_format);

    match cli.command {
        Command::Validate { request } => commands::validate(&config, &request).await,
        Command::Estimate { request } => commands::estimate(&config, &request),
        Command::Simulate {
            request,
            previous,
            fail_health,
            break_image,
            fast,
        } => {
            let options = commands::SimulateOptions {
                previous,
                fail_health,
                break_image,
                fast,
            };
            commands::simulate(config, &request, options).await
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ConductorConfig> {
    match path {
        Some(path) => ConductorConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(ConductorConfig::default()),
    }
}

fn init_tracing(config: &ConductorConfig, format: Option<LogFormat>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let json = match format {
        Some(format) => format == LogFormat::Json,
        None => config.logging.json,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn simulate_flags_parse() {
        let cli = Cli::parse_from([
            "conductord",
            "--log-format",
            "json",
            "simulate",
            "request.json",
            "--previous",
            "1.9",
            "--fail-health",
            "--fast",
        ]);
        assert!(cli.log_format == Some(LogFormat::Json));
        match cli.command {
            Command::Simulate {
                previous,
                fail_health,
                break_image,
                fast,
                ..
            } => {
                assert_eq!(previous.as_deref(), Some("1.9"));
                assert!(fail_health && fast && !break_image);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn demo_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/conductor.toml");
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config, ConductorConfig::default());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("conductor.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("conductor.toml"));
    }
}
