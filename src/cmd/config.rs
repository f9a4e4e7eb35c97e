//! Configuration view and validation commands: `warden config`.

use anyhow::{Context, Result};
use std::path::Path;

use warden::config::{WardenConfig, WardenToml};

use super::super::ConfigCommands;

fn print_toml(toml: &WardenToml) {
    println!("[agent]");
    if let Some(cmd) = &toml.agent.claude_cmd {
        println!("  claude_cmd = \"{}\"", cmd);
    }
    if let Some(model) = &toml.agent.model {
        println!("  model = \"{}\"", model);
    }
    println!("  skip_permissions = {}", toml.agent.skip_permissions);
    println!("  timeout_secs = {}", toml.agent.timeout_secs);
    println!("  prompts_dir = \"{}\"", toml.agent.prompts_dir);
    println!();

    println!("[retry]");
    println!("  max_attempts = {}", toml.retry.max_attempts);
    println!("  base_delay_ms = {}", toml.retry.base_delay_ms);
    println!("  max_delay_ms = {}", toml.retry.max_delay_ms);
    println!("  validation_delay_ms = {}", toml.retry.validation_delay_ms);
    println!();

    println!("[bridge]");
    println!("  poll_interval_ms = {}", toml.bridge.poll_interval_ms);
    println!("  error_poll_interval_ms = {}", toml.bridge.error_poll_interval_ms);
    println!("  error_cooldown_secs = {}", toml.bridge.error_cooldown_secs);
    println!("  log_tail_interval_ms = {}", toml.bridge.log_tail_interval_ms);
    println!();

    let classes: Vec<String> = toml
        .pipeline
        .vuln_classes
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect();
    println!("[pipeline]");
    println!("  vuln_classes = [{}]", classes.join(", "));
    println!();

    println!("[audit]");
    println!("  dir = \"{}\"", toml.audit.dir);
    println!();
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let warden_dir = project_dir.join(".warden");
    let config_path = warden_dir.join("warden.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Warden Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_toml(&WardenToml::load(&config_path)?);

                println!("Effective values (with env overrides):");
                let config = WardenConfig::new(project_dir.to_path_buf())?;
                println!("  claude_cmd = \"{}\"", config.claude_cmd());
                println!("  skip_permissions = {}", config.skip_permissions());
                println!("  max_attempts = {}", config.toml.max_attempts());
                println!("  audit_dir = \"{}\"", config.audit_dir().display());
                println!();
            } else {
                println!("No warden.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                println!();
                print_toml(&WardenToml::default());
                println!("Run 'warden config init' to create a warden.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No warden.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = WardenToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("warden.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&warden_dir)
                .with_context(|| format!("Failed to create {}", warden_dir.display()))?;
            WardenToml::default().save(&config_path)?;

            println!("Created warden.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [agent] claude_cmd, model, timeout_secs");
            println!("  - [retry] max_attempts and backoff delays");
            println!("  - [bridge] poll intervals and error cooldown");
            println!("  - [pipeline] vuln_classes");
            println!();
        }
    }

    Ok(())
}
