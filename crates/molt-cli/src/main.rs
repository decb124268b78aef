//! moltd - a reloadable TCP echo daemon.
//!
//! `moltd start` runs the server (optionally detached), `moltd reload`
//! swaps the running binary for a fresh copy without closing its sockets,
//! and `moltd stop` / `moltd status` address it through its PID file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use molt::{Control, Daemon, ExtraFile, FileLogger, Logger, ProcessStage, TracingLogger};
use tracing::{error, info};

mod config;
mod server;
mod telemetry;

use config::Config;

/// moltd - reloadable TCP echo daemon
#[derive(Parser)]
#[command(name = "moltd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file. Reloaded copies start in the work dir, so give an
    /// absolute path.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the PID file location
    #[arg(short, long, global = true)]
    pid_file: Option<PathBuf>,

    /// Append a detached daemon's output to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start serving
    Start {
        /// Detach from the terminal
        #[arg(short, long)]
        daemonize: bool,

        /// Address to listen on (repeatable)
        #[arg(short, long)]
        listen: Vec<String>,
    },
    /// Gracefully stop the running instance
    Stop,
    /// Replace the running instance without dropping its listeners
    Reload,
    /// Show whether an instance is running
    Status,
}

fn main() {
    if let Err(err) = run() {
        error!(error = format!("{err:#}"), "moltd failed");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init().map_err(|e| anyhow::anyhow!(e))?;

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(pid_file) = cli.pid_file {
        config.daemon.pid_file = pid_file;
    }
    if let Some(log_file) = cli.log_file {
        config.log_file = Some(log_file);
    }

    match cli.command {
        Commands::Start { daemonize, listen } => {
            config.daemon.daemonize |= daemonize;
            if !listen.is_empty() {
                config.server.listen = listen;
            }
            start(config)
        }
        Commands::Stop => {
            let pid = Control::new(&config.daemon.pid_file).stop()?;
            println!("Sent stop to pid {pid}");
            Ok(())
        }
        Commands::Reload => {
            let pid = Control::new(&config.daemon.pid_file).reload()?;
            println!("Sent reload to pid {pid}");
            Ok(())
        }
        Commands::Status => {
            let status = Control::new(&config.daemon.pid_file).status()?;
            println!("{status}");
            Ok(())
        }
    }
}

/// Runs in every process of the spawn chain. Only the final one gets past
/// `make_daemon`.
fn start(config: Config) -> Result<()> {
    let logger: Arc<dyn Logger> = match &config.log_file {
        Some(path) => Arc::new(
            FileLogger::open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?,
        ),
        None => Arc::new(TracingLogger),
    };
    let daemon = Daemon::new(config.daemon.clone()).with_logger(logger);

    if daemon.stage() == ProcessStage::Parent && !daemon.is_reload() {
        config.log_config();
        if let Some(path) = &config.server.access_log {
            let file = ExtraFile::open(path)
                .with_context(|| format!("Failed to open access log {}", path.display()))?;
            daemon.add_file(file);
        }
    }

    let stdio = daemon.make_daemon()?;
    info!(
        pid = std::process::id(),
        detached = stdio.is_some(),
        "Lifecycle ready"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(server::run(Arc::new(daemon), config.server))
}
