use std::env;
use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{
    SetupConfig, DEFAULT_GETH_VERSION, DEFAULT_GO_VERSION, DEFAULT_MONIKER, DEFAULT_STORY_VERSION,
    DEFAULT_TCP_PORT,
};
use crate::dispatch::{dispatch, Action, ActionReport};
use crate::errors::SetupError;
use crate::host::{DryRunHost, Host, SystemHost};
use crate::steps::{ActionParams, Provisioner};

pub type CliResult<T = ()> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] SetupError),
    #[error("{action} aborted: a fail-fast step stopped after a failed action")]
    Aborted { action: Action },
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Aborted { .. } => 1,
            CliError::Other(_) => 1,
        }
    }
}

const EXIT_CODES_HELP: &str = "Exit codes:
  0 - action completed (failed commands are reported, not fatal)
  1 - a fail-fast step aborted
  2 - invalid arguments or configuration";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Manage and install a Story node",
    long_about = None,
    after_help = EXIT_CODES_HELP
)]
pub struct Cli {
    /// Action to perform
    #[arg(value_enum)]
    pub action: Action,

    /// Node's moniker (used by initialize_node and full_install)
    #[arg(long, default_value = DEFAULT_MONIKER)]
    pub moniker: String,

    /// Node's tcp-port (accepted for compatibility, currently unused)
    #[arg(long = "tcp-port", default_value = DEFAULT_TCP_PORT)]
    pub tcp_port: String,

    /// Story version tag or branch
    #[arg(long = "story-version", default_value = DEFAULT_STORY_VERSION)]
    pub story_version: String,

    /// Story Geth version tag or branch
    #[arg(long = "geth-version", default_value = DEFAULT_GETH_VERSION)]
    pub geth_version: String,

    /// Go toolchain version
    #[arg(long = "go-version", default_value = DEFAULT_GO_VERSION)]
    pub go_version: String,

    /// Optional TOML file overriding paths, URLs, peers, and service settings
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print every action instead of executing it
    #[arg(long)]
    pub dry_run: bool,

    /// Stop every step at its first failed action
    #[arg(long)]
    pub fail_fast: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn params(&self) -> ActionParams {
        ActionParams {
            moniker: self.moniker.clone(),
            tcp_port: self.tcp_port.clone(),
            story_version: self.story_version.clone(),
            geth_version: self.geth_version.clone(),
            go_version: self.go_version.clone(),
        }
    }

    pub fn load_config(&self) -> CliResult<SetupConfig> {
        match &self.config {
            Some(path) => Ok(SetupConfig::load(path)?),
            None => Ok(SetupConfig::default()),
        }
    }
}

pub fn run_cli() -> CliResult {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let report = execute(&cli)?;
    if report.aborted() {
        return Err(CliError::Aborted {
            action: report.action,
        });
    }
    Ok(())
}

/// Run the parsed command line and print the per-step summary.
pub fn execute(cli: &Cli) -> CliResult<ActionReport> {
    let config = cli.load_config()?;
    let cwd = env::current_dir().context("failed to resolve the working directory")?;
    let layout = config.layout(&cwd)?;
    debug!(target = "story_setup::cli", ?layout, "resolved layout");

    let mut host: Box<dyn Host> = if cli.dry_run {
        Box::new(DryRunHost::new(config.use_sudo))
    } else {
        Box::new(SystemHost::new(config.use_sudo))
    };

    let mut provisioner =
        Provisioner::new(host.as_mut(), config, layout, cli.params()).fail_fast(cli.fail_fast);
    let report = dispatch(cli.action, &mut provisioner);

    println!();
    for line in report.summary_lines() {
        println!("{line}");
    }
    info!(
        target = "story_setup::cli",
        action = %report.action,
        outcome = %report.outcome(),
        "action finished"
    );
    Ok(report)
}

fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("warn,story_setup={level}"))
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
