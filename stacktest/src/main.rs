//! stacktest - end-to-end scenarios against a docker-compose metrics stack
//!
//! Launches the stack, waits for it to report readiness, drives synthetic
//! carbon traffic into it and checks the ingest rate through graphite.

#![forbid(unsafe_code)]

mod cases;
mod context;
mod runner;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use stacktest_common::StackConfig;
use stacktest_common::logging::init_logging;
use tracing::{error, info};

use context::StackContext;
use runner::{EXIT_CASE_FAILED, EXIT_OK};

#[derive(Parser)]
#[command(name = "stacktest")]
#[command(author, version, about = "End-to-end tests for a docker-compose metrics stack")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "STACKTEST_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Also write JSON logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the stack, send carbon traffic and verify it is ingested
    Carbon(CarbonArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct CarbonArgs {
    /// Run only this case (repeatable)
    #[arg(long = "case", value_name = "NAME")]
    cases: Vec<String>,

    /// List cases and exit
    #[arg(long)]
    list: bool,

    /// Repository root containing docker/launch.sh
    #[arg(long)]
    stack_root: Option<PathBuf>,

    /// Compose environment to launch
    #[arg(long)]
    environment: Option<String>,

    /// Carbon points per second
    #[arg(long)]
    rate: Option<u32>,

    /// How long to wait for the stack to come up (e.g. 40s, 2m)
    #[arg(long, value_parser = humantime::parse_duration)]
    startup_timeout: Option<Duration>,

    /// Write each output stream of the stack to <DIR>/<stream>.log
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Echo stack output through the log
    #[arg(long)]
    echo: bool,

    /// Skip docker-compose down before launching
    #[arg(long)]
    no_pre_clean: bool,
}

impl CarbonArgs {
    fn apply(&self, config: &mut StackConfig) {
        if let Some(root) = &self.stack_root {
            config.stack_root = root.clone();
        }
        if let Some(env) = &self.environment {
            config.environment = env.clone();
        }
        if let Some(rate) = self.rate {
            config.metrics_per_second = rate;
        }
        if let Some(timeout) = self.startup_timeout {
            config.startup_timeout = timeout;
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }
        if self.echo {
            config.echo_output = true;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            init_logging("info", None);
            error!("{e:#}");
            ExitCode::from(EXIT_CASE_FAILED)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let mut config = StackConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if cli.verbose {
        config.log_level = "debug".to_string();
    }

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(EXIT_OK)
        }
        Commands::Carbon(args) => {
            if args.list {
                for case in &cases::CASES {
                    println!("{:<24} {}", case.name, case.about);
                }
                return Ok(EXIT_OK);
            }
            args.apply(&mut config);
            config.validate()?;

            let json_log = cli
                .log_file
                .clone()
                .or_else(|| config.log_dir.as_ref().map(|d| d.join("stacktest.jsonl")));
            init_logging(&config.log_level, json_log.as_deref());

            let selected = cases::select(&args.cases).map_err(anyhow::Error::msg)?;
            run_carbon(config, &selected, !args.no_pre_clean)
        }
    }
}

fn run_carbon(config: StackConfig, selected: &[&cases::Case], pre_clean: bool) -> Result<u8> {
    if pre_clean && let Some(code) = runner::pre_clean_exit(runner::pre_clean(&config)) {
        return Ok(code);
    }

    info!(
        root = %config.stack_root.display(),
        environment = %config.environment,
        "launching stack"
    );
    let mut ctx = StackContext::from_config(config);
    let report = runner::execute(&mut ctx, selected).context("launching stack")?;

    info!("{}", report.summary());
    Ok(report.exit_code())
}
