/*!
 * cda CLI - Command Line Interface
 *
 * Concrete collaborators are wired here: every external system is driven
 * through its command-line adapter on the local host.
 */

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{error, info};

use cda::{
    adapters::command_line_services,
    config::{ClusterConfig, LogLevel, Phase, StepSet},
    error::{CdaError, EXIT_FATAL, EXIT_SUCCESS},
    exec::{remote::ConnectTiming, EndpointRegistry},
    logging::{self, LogSettings},
    Orchestrator,
};

#[derive(Parser)]
#[command(name = "cda")]
#[command(version, about = "Deploy and tear down clusters across local and remote hosts", long_about = None)]
struct Cli {
    /// Log level
    #[arg(long = "log-level", value_enum, default_value = "info", global = true)]
    log_level: LogLevelArg,

    /// Write JSON logs to this file instead of stdout
    #[arg(long = "log-file", value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Install backend address, overriding the configuration file
    #[arg(long = "backend-url", value_name = "URL", global = true)]
    backend_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy the cluster described by a configuration file
    Deploy {
        /// Cluster configuration (TOML)
        #[arg(short = 'c', long = "config", value_name = "FILE")]
        config: PathBuf,

        /// Comma separated steps to run
        #[arg(long = "steps", value_name = "STEPS", default_value = "pre,masters,workers,post")]
        steps: String,
    },

    /// Tear the cluster down
    Teardown {
        /// Cluster configuration (TOML)
        #[arg(short = 'c', long = "config", value_name = "FILE")]
        config: PathBuf,

        /// Remove the workers and keep the masters
        #[arg(long = "workers-only")]
        workers_only: bool,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            match e.downcast_ref::<CdaError>() {
                Some(err) => error!(category = ?err.category(), "{:#}", e),
                None => error!("{:#}", e),
            }
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<CdaError>()
        .map(CdaError::exit_code)
        .unwrap_or(EXIT_FATAL)
}

fn load_config(path: &Path, backend_url: Option<String>) -> anyhow::Result<ClusterConfig> {
    let mut config = ClusterConfig::from_file(path)
        .with_context(|| format!("failed to load cluster config {}", path.display()))?;
    if backend_url.is_some() {
        config.backend_url = backend_url;
    }
    Ok(config)
}

fn orchestrator(config: ClusterConfig, steps: StepSet) -> anyhow::Result<Orchestrator> {
    let registry = EndpointRegistry::with_ssh(ConnectTiming::from(&config.timing));
    let services = command_line_services(&config, &registry)?;
    Ok(Orchestrator::new(config, steps, services, registry.into())?)
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = LogSettings {
        level: cli.log_level.into(),
        file: cli.log_file.clone(),
        verbose: cli.verbose,
    };
    if let Err(e) = logging::init_logging(&settings) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }
    info!("cda {}", cda::VERSION);

    match cli.command {
        Commands::Deploy { config, steps } => {
            let steps = StepSet::from_str(&steps)?;
            let config = load_config(&config, cli.backend_url)?;
            orchestrator(config, steps)?.deploy()?;
        }
        Commands::Teardown {
            config,
            workers_only,
        } => {
            let config = load_config(&config, cli.backend_url)?;
            // Without the masters step, worker records are removed individually
            let steps = if workers_only {
                StepSet::only(&[Phase::Workers])
            } else {
                StepSet::all()
            };
            orchestrator(config, steps)?.teardown(workers_only)?;
        }
    }
    Ok(())
}
