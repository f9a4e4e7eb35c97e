//! Pipeline execution: `warden run`.

use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use warden::audit::{AuditSession, SessionMutex};
use warden::bridge::server::{self, ServerState};
use warden::config::WardenConfig;
use warden::pipeline::{FinishedRun, RunRegistry, RunRequest, SubPipelineOutcome};
use warden_common::WorkflowStatus;

pub struct RunArgs {
    pub repo: PathBuf,
    pub target: String,
    pub run_id: Option<String>,
    pub port: u16,
    pub no_server: bool,
}

pub async fn cmd_run(config: WardenConfig, args: RunArgs) -> Result<()> {
    for warning in config.validate() {
        println!("  {} {}", style("⚠").yellow(), warning);
    }

    let registry = RunRegistry::new();
    let mutex = SessionMutex::new();
    let handle = warden::pipeline::launch(
        &config,
        &registry,
        mutex.clone(),
        RunRequest {
            run_id: args.run_id,
            repo_path: args.repo,
            target_url: args.target,
        },
    )
    .await
    .context("Failed to start run")?;
    let run_id = handle.run_id().to_string();
    let log_path = AuditSession::workflow_log_path(&config.audit_dir(), &run_id);

    println!();
    println!("{} {}", style("Run").bold().cyan(), style(&run_id).bold());
    println!("  workflow log: {}", log_path.display());

    let server_task = if args.no_server {
        None
    } else {
        println!("  progress:     ws://127.0.0.1:{}/ws", args.port);
        let state = ServerState::local(config.clone(), registry.clone(), mutex);
        let app = server::orchestrator_router(Arc::new(state));
        let port = args.port;
        Some(tokio::spawn(async move {
            if let Err(e) = server::serve(app, port).await {
                tracing::error!(error = %e, "progress server stopped");
            }
        }))
    };
    println!();

    let wait = handle.wait();
    tokio::pin!(wait);
    let finished = tokio::select! {
        finished = &mut wait => finished?,
        _ = tokio::signal::ctrl_c() => {
            println!("{}", style("Interrupted; terminating run...").yellow());
            registry.cancel(&run_id)?;
            wait.await?
        }
    };

    if let Some(task) = server_task {
        task.abort();
    }

    print_summary(&finished);
    if finished.description.status != WorkflowStatus::Completed {
        anyhow::bail!(
            "Run {} ended with status {}",
            finished.description.run_id,
            finished.description.status
        );
    }
    Ok(())
}

fn print_summary(finished: &FinishedRun) {
    let status = finished.description.status;
    let status_text = if status == WorkflowStatus::Completed {
        style(status.to_string()).green().bold()
    } else {
        style(status.to_string()).red().bold()
    };
    println!("{} {}", style("Run finished:").bold(), status_text);

    if let Some(snapshot) = &finished.snapshot {
        println!("  agents completed: {}", snapshot.completed_agents.join(", "));
        if let Some(agent) = &snapshot.failed_agent {
            println!("  failed agent:     {}", style(agent).red());
        }
        if let Some(summary) = &snapshot.summary {
            println!(
                "  cost: ${:.4}  turns: {}  duration: {}s",
                summary.total_cost_usd,
                summary.total_turns,
                summary.total_duration_ms / 1000
            );
        }
    }

    for outcome in &finished.sub_pipelines {
        match outcome {
            SubPipelineOutcome::Exploited {
                class,
                vulnerability_count,
            } => println!(
                "  {} {}: {} queued vulnerabilities exploited",
                style("✓").green(),
                class,
                vulnerability_count
            ),
            SubPipelineOutcome::Skipped { class } => {
                println!("  {} {}: nothing to exploit", style("-").dim(), class)
            }
            SubPipelineOutcome::Failed { class, agent, error } => println!(
                "  {} {}: {} failed: {}",
                style("✗").red(),
                class,
                agent,
                error
            ),
        }
    }

    if let Some(error) = &finished.error {
        println!("  {} {}", style("Error:").red().bold(), error);
    }
    println!();
}
