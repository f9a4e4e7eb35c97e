//! Wire a run request into a supervised run: audit session, agent runner,
//! dispatcher and the standard plan.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::dispatch::LocalDispatcher;
use super::orchestrator::Orchestrator;
use super::phase::PipelinePlan;
use super::registry::{RunHandle, RunRegistry};
use crate::agents::{ClaudeRunner, RunContext};
use crate::audit::{AuditSession, SessionMutex};
use crate::config::WardenConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    pub repo_path: PathBuf,
    pub target_url: String,
}

pub fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{}", &id[..8])
}

/// Start a run for `request` on `registry`.
pub async fn launch(
    config: &WardenConfig,
    registry: &RunRegistry,
    mutex: SessionMutex,
    request: RunRequest,
) -> Result<RunHandle> {
    if request.target_url.trim().is_empty() {
        anyhow::bail!("Target URL must not be empty");
    }
    let run_id = request.run_id.unwrap_or_else(new_run_id);
    if registry.contains(&run_id) {
        anyhow::bail!("Run {} already exists", run_id);
    }
    let repo_path = request
        .repo_path
        .canonicalize()
        .with_context(|| format!("Repository {} not found", request.repo_path.display()))?;

    let ctx = RunContext {
        run_id: run_id.clone(),
        target_url: request.target_url,
        repo_path,
    };

    let audit_dir = config.audit_dir();
    let audit = Arc::new(
        AuditSession::start(&audit_dir, &ctx, mutex)
            .await
            .context("Failed to start audit session")?,
    );
    let agent_log_dir = audit_dir.join(&run_id).join("agents");
    let runner = ClaudeRunner::new(config, &agent_log_dir);
    let dispatcher = LocalDispatcher::new(ctx, runner, config.toml.retry_settings(), audit)?;

    let plan = PipelinePlan::standard(&config.toml.pipeline.vuln_classes);
    let orchestrator = Orchestrator::new(plan, Arc::new(dispatcher));

    tracing::info!(run_id = %run_id, "launching run");
    registry.start(&run_id, orchestrator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_run_ids_are_short_and_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert!(a.starts_with("run-"));
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_run_id_is_optional() {
        let req: RunRequest =
            serde_json::from_str(r#"{"repo_path":"/tmp/app","target_url":"http://localhost:3000"}"#)
                .unwrap();
        assert!(req.run_id.is_none());
        assert_eq!(req.target_url, "http://localhost:3000");
    }

    #[tokio::test]
    async fn test_missing_repository_is_rejected() {
        let project = tempdir().unwrap();
        let config = WardenConfig::new(project.path().to_path_buf()).unwrap();
        let registry = RunRegistry::new();

        let err = launch(
            &config,
            &registry,
            SessionMutex::new(),
            RunRequest {
                run_id: Some("run-x".to_string()),
                repo_path: project.path().join("does-not-exist"),
                target_url: "http://localhost:3000".to_string(),
            },
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("not found"));
        assert!(!registry.contains("run-x"));
    }

    #[tokio::test]
    async fn test_duplicate_run_id_is_rejected() {
        let project = tempdir().unwrap();
        let config = WardenConfig::new(project.path().to_path_buf()).unwrap();
        let registry = RunRegistry::new();
        let mutex = SessionMutex::new();
        let request = RunRequest {
            run_id: Some("run-dup".to_string()),
            repo_path: project.path().to_path_buf(),
            target_url: "http://localhost:3000".to_string(),
        };

        let mut config = config;
        // Agents fail fast: the command does not exist.
        config.toml.agent.claude_cmd = Some("/nonexistent/warden-agent".to_string());
        config.toml.retry.max_attempts = 1;

        let handle = launch(&config, &registry, mutex.clone(), request.clone()).await.unwrap();
        let err = launch(&config, &registry, mutex, request).await.err().unwrap();
        assert!(err.to_string().contains("already exists"));

        let finished = handle.wait().await.unwrap();
        assert!(finished.description.status.is_terminal());
    }
}
