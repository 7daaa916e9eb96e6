//! Implementation of the `run` sub-command.
//!
//! Drives one invocation end-to-end: load the configuration, spawn the
//! backend script, stream every stdout line as a JSON record, and finish
//! with the terminal exit record. The process exit code is 0 only when the
//! child's classification is `success`.

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::SpawnConfig;
use crate::invocation::Invocation;
use crate::schema::{ExitData, LineData, Response, SpawnData};
use crate::spawn::{ExitClass, SpawnEvent, Supervisor};

/// Options for the `run` sub-command.
#[derive(Debug)]
pub struct RunOpts<'a> {
    /// Backend script and arguments to execute.
    pub command: Vec<String>,
    /// Override for the config file path.
    pub config: Option<&'a str>,
    /// Replacement environment as KEY=VALUE strings; empty = inherit.
    pub env_vars: Vec<String>,
}

impl<'a> Default for RunOpts<'a> {
    fn default() -> Self {
        RunOpts {
            command: vec![],
            config: None,
            env_vars: vec![],
        }
    }
}

/// Execute `run`: spawn, stream events, return the process exit code.
pub fn execute(opts: RunOpts) -> Result<i32> {
    if opts.command.is_empty() {
        anyhow::bail!("no command specified for run");
    }

    let config = SpawnConfig::load(opts.config)?;
    debug!(nice = config.nice, "configuration loaded");

    let envp = if opts.env_vars.is_empty() {
        None
    } else {
        Some(opts.env_vars)
    };
    let invocation = Invocation::new(opts.command, envp);

    let (supervisor, events) = Supervisor::new(config);
    supervisor
        .run(&invocation)
        .with_context(|| format!("launch {}", invocation.argv0()))?;

    if let Some(pid) = supervisor.pid() {
        Response::new(
            "spawn",
            SpawnData {
                pid,
                argv: invocation.argv.clone(),
            },
        )
        .print();
    }

    // The supervisor guarantees every line record precedes the single exit
    // record, so this loop always terminates at the exit event.
    let mut class = ExitClass::Unknown;
    for event in events {
        match event {
            SpawnEvent::Line(line) => Response::new("line", LineData { line }).print(),
            SpawnEvent::Exit(c) => {
                class = c;
                Response::new(
                    "exit",
                    ExitData {
                        class: c.as_str().to_string(),
                    },
                )
                .print();
                break;
            }
        }
    }

    Ok(if class == ExitClass::Success { 0 } else { 1 })
}
