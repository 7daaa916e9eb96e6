//! backend-spawn — entry point
//!
//! All stdout is JSON only. Tracing logs go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use backend_spawn::schema::{ConfigData, ErrorResponse, Response};
use backend_spawn::spawn::SpawnError;

#[derive(Debug, Parser)]
#[command(name = "backend-spawn")]
#[command(about = "Supervisor for package-backend dispatcher scripts", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a backend script, streaming its stdout lines as JSON records.
    Run {
        /// Override the config file path.
        #[arg(long)]
        config: Option<String>,

        /// Replacement environment in KEY=VALUE format (repeatable).
        /// When absent, the child inherits this process's environment.
        #[arg(long = "env", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
        env_vars: Vec<String>,

        /// Backend script and arguments to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Print the effective configuration.
    Config {
        /// Override the config file path.
        #[arg(long)]
        config: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout remains JSON-only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Distinguish a script that could not be started from generic
            // internal errors.
            if matches!(
                e.downcast_ref::<SpawnError>(),
                Some(SpawnError::SpawnFailed { .. })
            ) {
                ErrorResponse::new("spawn_failed", format!("{e:#}")).print();
            } else {
                ErrorResponse::new("internal_error", format!("{e:#}")).print();
            }
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            config,
            env_vars,
            command,
        } => backend_spawn::run::execute(backend_spawn::run::RunOpts {
            command,
            config: config.as_deref(),
            env_vars,
        }),

        Command::Config { config } => {
            let path = backend_spawn::config::resolve_config_path(config.as_deref());
            let effective = backend_spawn::config::SpawnConfig::load_file(&path)?;
            Response::new(
                "config",
                ConfigData {
                    path: path.display().to_string(),
                    nice: effective.nice,
                },
            )
            .print();
            Ok(0)
        }
    }
}
