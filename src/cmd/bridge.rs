//! Standalone progress bridge: `warden bridge`.
//!
//! Observes runs owned by a remote `warden serve` process over its HTTP API.
//! Log lines are only streamed when the audit directory is shared with that
//! process (`--audit-dir`).

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use warden::bridge::server;
use warden::bridge::{ProgressBridge, RemoteRunSource};
use warden::config::WardenConfig;

pub async fn cmd_bridge(
    config: &WardenConfig,
    server_url: &str,
    port: u16,
    audit_dir: Option<PathBuf>,
) -> Result<()> {
    let source = RemoteRunSource::new(server_url)
        .with_context(|| format!("Failed to create client for {}", server_url))?;
    tracing::info!(server = %source.base_url(), port, "starting progress bridge");

    let bridge = ProgressBridge::new(
        Arc::new(source.clone()),
        Arc::new(source),
        config.toml.bridge_settings(),
        audit_dir,
    );
    server::serve(server::bridge_router(bridge), port).await
}
