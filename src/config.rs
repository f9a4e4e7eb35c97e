//! Unified configuration for warden.
//!
//! Settings are read from `.warden/warden.toml` and layered file → environment → CLI.
//! Every section is optional; missing keys fall back to defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [agent]
//! claude_cmd = "claude"
//! model = "claude-sonnet-4-5"
//! skip_permissions = true
//! timeout_secs = 7200
//! prompts_dir = "prompts"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 5000
//! max_delay_ms = 300000
//! validation_delay_ms = 1000
//!
//! [bridge]
//! poll_interval_ms = 2000
//! error_poll_interval_ms = 10000
//! error_cooldown_secs = 30
//! log_tail_interval_ms = 500
//!
//! [pipeline]
//! vuln_classes = ["injection", "xss", "auth", "ssrf", "authz"]
//!
//! [audit]
//! dir = "audit-logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::VulnClass;

/// Agent CLI invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent CLI command (default: "claude")
    #[serde(default)]
    pub claude_cmd: Option<String>,
    /// Model passed as `--model` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
    /// Wall-clock limit for a single attempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Prompt templates directory, relative to `.warden/`
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: String,
}

fn default_skip_permissions() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    7200
}

fn default_prompts_dir() -> String {
    "prompts".to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            claude_cmd: None,
            model: None,
            skip_permissions: default_skip_permissions(),
            timeout_secs: default_timeout_secs(),
            prompts_dir: default_prompts_dir(),
        }
    }
}

/// Retry budget and backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fixed delay before retrying after a failed output validation
    #[serde(default = "default_validation_delay_ms")]
    pub validation_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_validation_delay_ms() -> u64 {
    1_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            validation_delay_ms: default_validation_delay_ms(),
        }
    }
}

/// Progress bridge polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Poll interval used after a failed query
    #[serde(default = "default_error_poll_interval_ms")]
    pub error_poll_interval_ms: u64,
    /// Window within which an identical error message is not re-sent
    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: u64,
    #[serde(default = "default_log_tail_interval_ms")]
    pub log_tail_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_error_poll_interval_ms() -> u64 {
    10_000
}

fn default_error_cooldown_secs() -> u64 {
    30
}

fn default_log_tail_interval_ms() -> u64 {
    500
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            error_poll_interval_ms: default_error_poll_interval_ms(),
            error_cooldown_secs: default_error_cooldown_secs(),
            log_tail_interval_ms: default_log_tail_interval_ms(),
        }
    }
}

/// Pipeline shape settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// One parallel sub-pipeline is launched per class.
    #[serde(default = "default_vuln_classes")]
    pub vuln_classes: Vec<VulnClass>,
}

fn default_vuln_classes() -> Vec<VulnClass> {
    VulnClass::ALL.to_vec()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            vuln_classes: default_vuln_classes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSection {
    /// Audit directory, relative to `.warden/`
    #[serde(default = "default_audit_dir")]
    pub dir: String,
}

fn default_audit_dir() -> String {
    "audit-logs".to_string()
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
        }
    }
}

/// The complete warden.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub audit: AuditSection,
}

impl WardenToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse warden.toml")
    }

    /// Load `.warden/warden.toml`, or defaults when the file does not exist.
    pub fn load_or_default(warden_dir: &Path) -> Result<Self> {
        let config_path = warden_dir.join("warden.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize warden.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Agent command: file → `WARDEN_CLAUDE_CMD` → "claude".
    pub fn claude_cmd(&self) -> String {
        self.agent
            .claude_cmd
            .clone()
            .or_else(|| std::env::var("WARDEN_CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// `WARDEN_SKIP_PERMISSIONS` overrides the file setting.
    pub fn skip_permissions(&self) -> bool {
        if let Ok(env_val) = std::env::var("WARDEN_SKIP_PERMISSIONS") {
            return env_val != "false";
        }
        self.agent.skip_permissions
    }

    /// `WARDEN_MAX_ATTEMPTS` overrides the file setting when it parses.
    pub fn max_attempts(&self) -> u32 {
        std::env::var("WARDEN_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.retry.max_attempts)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0: no agent would ever run".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            warnings.push(format!(
                "retry.max_delay_ms ({}) is smaller than retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            ));
        }
        if self.bridge.error_poll_interval_ms < self.bridge.poll_interval_ms {
            warnings.push(format!(
                "bridge.error_poll_interval_ms ({}) is shorter than bridge.poll_interval_ms ({})",
                self.bridge.error_poll_interval_ms, self.bridge.poll_interval_ms
            ));
        }
        if self.pipeline.vuln_classes.is_empty() {
            warnings.push(
                "pipeline.vuln_classes is empty: the exploitation phase will do nothing"
                    .to_string(),
            );
        }
        if self.agent.timeout_secs == 0 {
            warnings.push("agent.timeout_secs is 0: every attempt would time out".to_string());
        }

        warnings
    }
}

/// Retry settings resolved into durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub validation_delay: Duration,
}

/// Bridge settings resolved into durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub poll_interval: Duration,
    pub error_poll_interval: Duration,
    pub error_cooldown: Duration,
    pub log_tail_interval: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        WardenToml::default().bridge_settings()
    }
}

impl WardenToml {
    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            max_attempts: self.max_attempts(),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            validation_delay: Duration::from_millis(self.retry.validation_delay_ms),
        }
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            poll_interval: Duration::from_millis(self.bridge.poll_interval_ms),
            error_poll_interval: Duration::from_millis(self.bridge.error_poll_interval_ms),
            error_cooldown: Duration::from_secs(self.bridge.error_cooldown_secs),
            log_tail_interval: Duration::from_millis(self.bridge.log_tail_interval_ms),
        }
    }
}

/// Configuration combining warden.toml with runtime (CLI) settings.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    pub project_dir: PathBuf,
    pub warden_dir: PathBuf,
    pub toml: WardenToml,
    pub verbose: bool,
}

impl WardenConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let warden_dir = project_dir.join(".warden");
        let toml = WardenToml::load_or_default(&warden_dir)?;

        Ok(Self {
            project_dir,
            warden_dir,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.warden_dir.join("warden.toml")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.warden_dir.join(&self.toml.audit.dir)
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.warden_dir.join(&self.toml.agent.prompts_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.warden_dir.join("logs")
    }

    pub fn claude_cmd(&self) -> String {
        self.toml.claude_cmd()
    }

    pub fn skip_permissions(&self) -> bool {
        self.toml.skip_permissions()
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    /// CLI flags for every agent invocation.
    pub fn claude_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions() {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = &self.toml.agent.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        flags
    }
}
