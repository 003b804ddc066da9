//! pline — entry point.
//!
//! A one-shot command-line adapter over the engine's request-facing
//! operations. All stdout is JSON only; tracing logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pline::actions::{ErrorResponse, Response, Server, SweepData};
use pline::config::{resolve_data_root, Config};
use pline::descriptor::Descriptor;
use pline::notify::LogMailer;
use pline::pipeline::StagedFile;
use pline::server::ServerContext;

#[derive(Debug, Parser)]
#[command(name = "pline")]
#[command(about = "Pipeline job-execution engine", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file with a [server_settings] table.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Override the data root directory.
    #[arg(long, global = true)]
    datadir: Option<String>,

    /// Override the plugin root directory.
    #[arg(long, global = true)]
    plugindir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Report server health, limits, and tracked job ids.
    Check,

    /// List plugin descriptor paths under the plugin root.
    Plugins,

    /// Report descriptor and log tail for comma-separated job ids.
    Status {
        /// Comma-separated job ids.
        ids: String,
    },

    /// Submit a pipeline, run it to completion, and report the outcome.
    Run {
        /// Pipeline JSON: {"email":..,"steps":[...]} or a bare step array.
        #[arg(long)]
        pipeline: String,

        /// Stage an input file, [STEP:]NAME=PATH (STEP is 0-based, default 0).
        #[arg(long = "file", value_name = "SPEC", action = clap::ArgAction::Append)]
        files: Vec<String>,

        /// Give up waiting after this many seconds (0 = wait forever).
        #[arg(long, default_value = "0")]
        timeout: u64,
    },

    /// Terminate a job and its queued successors.
    Terminate {
        /// Job id.
        id: String,
    },

    /// Terminate a job, then remove its directory recursively.
    Rmdir {
        /// Job id.
        id: String,
    },

    /// Re-run a finished job from its existing descriptor.
    Restart {
        /// Job id.
        id: String,

        /// Give up waiting after this many seconds (0 = wait forever).
        #[arg(long, default_value = "0")]
        timeout: u64,
    },

    /// Run the cleanup pass (expiry, quota, temp files) unconditionally.
    Sweep,
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

    if let Err(e) = run(cli) {
        match e.downcast_ref::<pline::error::Error>() {
            Some(core) => ErrorResponse::from_error(core).print(),
            None => ErrorResponse::new("internal_error", format!("{e:#}"), 501).print(),
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(std::path::Path::new(path))?,
        None => Config::default(),
    };

    let data_root = resolve_data_root(cli.datadir.as_deref(), &config);
    let plugin_root = cli
        .plugindir
        .as_deref()
        .map(PathBuf::from)
        .or_else(|| config.plugindir.clone())
        .unwrap_or_else(|| {
            data_root
                .parent()
                .map(|p| p.join("plugins"))
                .unwrap_or_else(|| PathBuf::from("plugins"))
        });
    let temp_root = std::env::temp_dir().join("pline");

    let ctx = ServerContext::new(
        config,
        data_root,
        plugin_root,
        temp_root,
        Box::new(LogMailer),
    )?;
    let server = Server::start(ctx);

    match cli.command {
        Command::Check => {
            Response::new("checkserver", server.checkserver()).print();
        }

        Command::Plugins => {
            Response::new("plugins", server.plugins()?).print();
        }

        Command::Status { ids } => {
            Response::new("status", server.status(&ids)).print();
        }

        Command::Run {
            pipeline,
            files,
            timeout,
        } => {
            let staged = parse_file_specs(&files)?;
            let out = server.run(&pipeline, &staged)?;
            let jobs = match &out.id {
                Some(first) => wait_for_chain(&server, first, timeout)?,
                None => Vec::new(),
            };
            Response::new("run", RunReport { id: out.id, jobs }).print();
        }

        Command::Terminate { id } => {
            Response::new("terminate", server.terminate(&id)?).print();
        }

        Command::Rmdir { id } => {
            Response::new("rmdir", server.rmdir(&id)?).print();
        }

        Command::Restart { id, timeout } => {
            let out = server.restart(&id)?;
            let first = out.id.clone().unwrap_or_default();
            let jobs = wait_for_chain(&server, &first, timeout)?;
            Response::new("restart", RunReport { id: out.id, jobs }).print();
        }

        Command::Sweep => {
            let report: SweepData = server.sweep();
            Response::new("sweep", report).print();
        }
    }

    server.stop();
    Ok(())
}

/// Final report of a `run`/`restart`: the first job id plus the descriptor
/// snapshot of every step reached.
#[derive(Debug, serde::Serialize)]
struct RunReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    jobs: Vec<serde_json::Value>,
}

/// Parse `[STEP:]NAME=PATH` staging specs.
fn parse_file_specs(specs: &[String]) -> Result<Vec<StagedFile>> {
    let mut files = Vec::with_capacity(specs.len());
    for spec in specs {
        let (head, path) = spec
            .split_once('=')
            .with_context(|| format!("bad file spec '{spec}': expected [STEP:]NAME=PATH"))?;
        let (step, name) = match head.split_once(':') {
            Some((idx, name)) => {
                let step: usize = idx
                    .parse()
                    .with_context(|| format!("bad step index in file spec '{spec}'"))?;
                (step, name)
            }
            None => (0, head),
        };
        let data = std::fs::read(path).with_context(|| format!("read input file {path}"))?;
        files.push(StagedFile {
            step,
            name: name.to_string(),
            data,
        });
    }
    Ok(files)
}

/// Poll the descriptor chain starting at `first` until every reached step
/// is terminal, then return the final status snapshots. A failed or
/// terminated step ends the walk (its successors never start).
fn wait_for_chain(
    server: &Server,
    first: &str,
    timeout_secs: u64,
) -> Result<Vec<serde_json::Value>> {
    let deadline =
        (timeout_secs > 0).then(|| std::time::Instant::now() + Duration::from_secs(timeout_secs));
    let poll = Duration::from_millis(200);
    let data_root = server.context().data_root.clone();

    let mut current = first.to_string();
    let mut chain = vec![current.clone()];
    loop {
        let desc = Descriptor::load(&data_root.join(&current))?;
        if desc.status().is_terminal() {
            if desc.status() == pline::descriptor::Status::Success && !desc.nextstep.is_empty() {
                current = desc.nextstep.clone();
                chain.push(current.clone());
                continue;
            }
            break;
        }
        if let Some(dl) = deadline {
            if std::time::Instant::now() >= dl {
                break;
            }
        }
        std::thread::sleep(poll);
    }

    Ok(server.status(&chain.join(",")).jobs)
}
