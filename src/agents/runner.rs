use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::prompts::PromptLibrary;
use super::stream::StreamCollector;
use super::{AgentName, AgentOutcome};
use crate::config::WardenConfig;
use crate::errors::AgentError;
use crate::retry::UnitRunner;

/// What every agent of one run shares.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub target_url: String,
    pub repo_path: PathBuf,
}

/// Runs single agent attempts through the Claude CLI.
pub struct ClaudeRunner {
    claude_cmd: String,
    flags: Vec<String>,
    log_dir: PathBuf,
    timeout: Duration,
    prompts: PromptLibrary,
}

impl ClaudeRunner {
    pub fn new(config: &WardenConfig, log_dir: &Path) -> Self {
        Self {
            claude_cmd: config.claude_cmd(),
            flags: config.claude_flags(),
            log_dir: log_dir.to_path_buf(),
            timeout: Duration::from_secs(config.toml.agent.timeout_secs),
            prompts: PromptLibrary::new(&config.prompts_dir()),
        }
    }

    pub fn with_command(
        claude_cmd: &str,
        flags: Vec<String>,
        log_dir: &Path,
        prompts_dir: &Path,
        timeout: Duration,
    ) -> Self {
        Self {
            claude_cmd: claude_cmd.to_string(),
            flags,
            log_dir: log_dir.to_path_buf(),
            timeout,
            prompts: PromptLibrary::new(prompts_dir),
        }
    }

    pub fn prompt_file(&self, agent: AgentName, attempt: u32) -> PathBuf {
        self.log_dir
            .join(format!("{}-attempt-{}-prompt.md", agent, attempt))
    }

    pub fn output_file(&self, agent: AgentName, attempt: u32) -> PathBuf {
        self.log_dir
            .join(format!("{}-attempt-{}-output.log", agent, attempt))
    }

    pub async fn run_attempt(
        &self,
        agent: AgentName,
        attempt: u32,
        ctx: &RunContext,
    ) -> Result<AgentOutcome, AgentError> {
        let prompt = self.prompts.render(agent, attempt, ctx);

        let prompt_file = self.prompt_file(agent, attempt);
        std::fs::create_dir_all(&self.log_dir).map_err(|source| AgentError::PromptWriteFailed {
            path: self.log_dir.clone(),
            source,
        })?;
        std::fs::write(&prompt_file, &prompt).map_err(|source| AgentError::PromptWriteFailed {
            path: prompt_file.clone(),
            source,
        })?;

        let start = Instant::now();
        let mut child = Command::new(&self.claude_cmd)
            .args(&self.flags)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .current_dir(&ctx.repo_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentError::SpawnFailed)?;

        tracing::debug!(
            agent = %agent,
            attempt,
            pid = child.id().unwrap_or(0),
            "agent process spawned"
        );

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| AgentError::Other(e.into()))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| AgentError::Other(e.into()))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("Failed to get stdout")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Other(anyhow::anyhow!("Failed to get stderr")))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            stderr.read_to_string(&mut buf).await.ok();
            buf
        });

        let agent_label = agent.to_string();
        let mut collector = StreamCollector::default();
        let streamed = tokio::time::timeout(self.timeout, async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                collector.ingest(&agent_label, &line);
            }
            child.wait().await
        })
        .await;

        let status = match streamed {
            Ok(status) => status.map_err(|e| AgentError::Other(e.into()))?,
            Err(_) => {
                child.kill().await.ok();
                stderr_task.abort();
                self.write_output(agent, attempt, &collector.output())?;
                return Err(AgentError::TimedOut {
                    secs: self.timeout.as_secs(),
                });
            }
        };
        let stderr_text = stderr_task.await.unwrap_or_default();

        self.write_output(agent, attempt, &collector.output())?;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        collector.finish(status.code().unwrap_or(-1), &stderr_text, elapsed_ms)
    }

    fn write_output(&self, agent: AgentName, attempt: u32, output: &str) -> Result<(), AgentError> {
        let output_file = self.output_file(agent, attempt);
        std::fs::write(&output_file, output).map_err(|source| AgentError::OutputWriteFailed {
            path: output_file,
            source,
        })
    }
}

/// One agent bound to its run, ready to be handed to the retry executor.
pub struct AgentAttempt<'a> {
    runner: &'a ClaudeRunner,
    agent: AgentName,
    ctx: &'a RunContext,
}

impl<'a> AgentAttempt<'a> {
    pub fn new(runner: &'a ClaudeRunner, agent: AgentName, ctx: &'a RunContext) -> Self {
        Self { runner, agent, ctx }
    }
}

#[async_trait]
impl UnitRunner for AgentAttempt<'_> {
    async fn run(&self, attempt: u32) -> Result<AgentOutcome, AgentError> {
        self.runner.run_attempt(self.agent, attempt, self.ctx).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_agent(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-claude.sh");
        std::fs::write(&path, format!("cat > /dev/null\n{}\n", body)).unwrap();
        path
    }

    /// Run the script through `sh` so the freshly written file is never exec'd.
    fn sh_runner(script: &Path, dir: &Path, timeout: Duration) -> ClaudeRunner {
        ClaudeRunner::with_command(
            "sh",
            vec![script.to_str().unwrap().to_string()],
            &dir.join("logs"),
            dir,
            timeout,
        )
    }

    fn ctx(repo: &Path) -> RunContext {
        RunContext {
            run_id: "run-1".to_string(),
            target_url: "https://target.example".to_string(),
            repo_path: repo.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_successful_attempt_writes_prompt_and_output() {
        let dir = tempdir().unwrap();
        let script = fake_agent(
            dir.path(),
            r#"echo '{"type":"result","subtype":"success","is_error":false,"result":"recon done","total_cost_usd":0.1,"num_turns":3}'"#,
        );
        let runner = sh_runner(&script, dir.path(), Duration::from_secs(10));

        let outcome = runner
            .run_attempt(AgentName::Recon, 1, &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(outcome.output, "recon done");
        assert_eq!(outcome.cost_usd, Some(0.1));
        assert_eq!(outcome.num_turns, Some(3));

        let prompt = std::fs::read_to_string(runner.prompt_file(AgentName::Recon, 1)).unwrap();
        assert!(prompt.contains("https://target.example"));
        let output = std::fs::read_to_string(runner.output_file(AgentName::Recon, 1)).unwrap();
        assert_eq!(output, "recon done");
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let dir = tempdir().unwrap();
        let script = fake_agent(dir.path(), "echo 'rate limit exceeded' >&2\nexit 3");
        let runner = sh_runner(&script, dir.path(), Duration::from_secs(10));

        let err = runner
            .run_attempt(AgentName::PreRecon, 1, &ctx(dir.path()))
            .await
            .unwrap_err();
        match err {
            AgentError::NonZeroExit { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "rate limit exceeded");
            }
            other => panic!("Expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempt_times_out() {
        let dir = tempdir().unwrap();
        let script = fake_agent(dir.path(), "sleep 5");
        let runner = sh_runner(&script, dir.path(), Duration::from_millis(200));

        let err = runner
            .run_attempt(AgentName::Report, 1, &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let dir = tempdir().unwrap();
        let runner = ClaudeRunner::with_command(
            "/nonexistent/claude-binary",
            Vec::new(),
            &dir.path().join("logs"),
            dir.path(),
            Duration::from_secs(1),
        );
        let err = runner
            .run_attempt(AgentName::Recon, 1, &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SpawnFailed(_)));
    }
}
