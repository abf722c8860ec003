//! prefgate CLI
//!
//! Thin wrapper over `prefgate-core`: runs YAML settings-screen scenarios
//! and prints the resulting screen.
//!
//! Exit codes: 0 on success, 1 when a scenario's expectations fail, 2 for
//! usage, config or scenario errors.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use prefgate_core::config::Config;
use prefgate_core::error::format_error_with_remediation;
use prefgate_core::logging::init_logging;
use prefgate_core::simulation::{Scenario, run_scenario};

const EXIT_EXPECTATION_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(
    name = "prefgate",
    version,
    about = "Run settings-screen scenarios against the permission and capability-gating core"
)]
struct Cli {
    /// Config file (default: $PREFGATE_CONFIG, then the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scenario and print the final screen
    Simulate {
        /// Scenario YAML file
        scenario: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },

    /// Validate a scenario without running it
    Check {
        /// Scenario YAML file
        scenario: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn report_error(err: &anyhow::Error) {
    if let Some(core) = err.downcast_ref::<prefgate_core::Error>() {
        eprintln!("{}", format_error_with_remediation(core));
        let context = err.to_string();
        if context != core.to_string() {
            eprintln!("  while: {context}");
        }
    } else {
        eprintln!("Error: {err:#}");
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load_with(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
        config.validate().map_err(prefgate_core::Error::from)?;
    }
    init_logging(&config.general.log_config()).map_err(prefgate_core::Error::from)?;

    match cli.command {
        Command::Simulate { scenario, format } => simulate(&scenario, format, &config).await,
        Command::Check { scenario } => check(&scenario),
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_scenario(path: &Path) -> Result<Scenario> {
    Scenario::load(path).with_context(|| format!("loading scenario {}", path.display()))
}

async fn simulate(path: &Path, format: OutputFormat, config: &Config) -> Result<ExitCode> {
    let scenario = load_scenario(path)?;
    let report = run_scenario(&scenario, config).await?;

    match format {
        OutputFormat::Plain => print!("{}", report.render_plain()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if report.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::warn!(
            scenario = %report.name,
            failures = report.failures.len(),
            "scenario expectations failed"
        );
        Ok(ExitCode::from(EXIT_EXPECTATION_FAILED))
    }
}

fn check(path: &Path) -> Result<ExitCode> {
    let scenario = load_scenario(path)?;
    println!(
        "ok: {} ({} requests, {} item expectations)",
        scenario.name,
        scenario.requests.len(),
        scenario.expect.items.len()
    );
    Ok(ExitCode::SUCCESS)
}
