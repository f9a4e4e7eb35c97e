use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use warden::config::WardenConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about = "Resilient multi-stage assessment pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit process logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline against a target and wait for it to finish
    Run {
        /// Repository the agents work in
        #[arg(long)]
        repo: PathBuf,

        /// URL of the application under assessment
        #[arg(long)]
        target: String,

        /// Use this run id instead of a generated one
        #[arg(long)]
        run_id: Option<String>,

        /// Port for the progress server
        #[arg(short, long, default_value = "4100")]
        port: u16,

        /// Do not serve progress over HTTP/WebSocket
        #[arg(long)]
        no_server: bool,
    },
    /// Serve the run API and progress WebSocket
    Serve {
        #[arg(short, long, default_value = "4100")]
        port: u16,
    },
    /// Bridge progress from a remote warden server to WebSocket observers
    Bridge {
        /// Base URL of the warden server
        #[arg(long, env = "WARDEN_SERVER_URL")]
        server: String,

        #[arg(short, long, default_value = "4101")]
        port: u16,

        /// Audit directory shared with the server, for streaming workflow logs
        #[arg(long)]
        audit_dir: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default warden.toml file
    Init,
}

/// Console logging to stderr, plus a daily file under `log_dir` when given.
fn init_tracing(verbose: bool, json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match log_dir.map(|dir| std::fs::create_dir_all(dir).map(|_| dir)) {
        Some(Ok(dir)) => {
            let appender = tracing_appender::rolling::daily(dir, "warden.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            eprintln!("warning: file logging disabled: {}", e);
            (None, None)
        }
        None => (None, None),
    };

    let (text_layer, json_layer) = if json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr).with_target(false)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let long_running = !matches!(cli.command, Commands::Config { .. });
    let log_dir = project_dir.join(".warden").join("logs");
    let _guard = init_tracing(cli.verbose, cli.log_json, long_running.then_some(log_dir.as_path()));

    match cli.command {
        Commands::Run {
            repo,
            target,
            run_id,
            port,
            no_server,
        } => {
            let config = WardenConfig::with_cli_args(project_dir, cli.verbose)?;
            cmd::cmd_run(
                config,
                cmd::run::RunArgs {
                    repo,
                    target,
                    run_id,
                    port,
                    no_server,
                },
            )
            .await?;
        }
        Commands::Serve { port } => {
            let config = WardenConfig::with_cli_args(project_dir, cli.verbose)?;
            cmd::cmd_serve(config, port).await?;
        }
        Commands::Bridge {
            server,
            port,
            audit_dir,
        } => {
            let config = WardenConfig::with_cli_args(project_dir, cli.verbose)?;
            cmd::cmd_bridge(&config, &server, port, audit_dir).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command)?,
    }

    Ok(())
}
