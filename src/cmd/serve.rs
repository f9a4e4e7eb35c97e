//! Orchestrator server: `warden serve`.

use anyhow::Result;
use std::sync::Arc;

use warden::audit::SessionMutex;
use warden::bridge::server::{self, ServerState};
use warden::config::WardenConfig;
use warden::pipeline::RunRegistry;

pub async fn cmd_serve(config: WardenConfig, port: u16) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!(warning = %warning, "configuration warning");
    }

    let state = ServerState::local(config, RunRegistry::new(), SessionMutex::new());
    tracing::info!(port, audit_dir = %state.config.audit_dir().display(), "starting orchestrator server");
    server::serve(server::orchestrator_router(Arc::new(state)), port).await
}
