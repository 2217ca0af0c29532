//! Warden command implementations

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use warden_agent::edit::{EditResolver, HttpRemoteAssist};
use warden_agent::validator;
use warden_config::{self, Config};
use warden_monitor::{Admission, ResourceMonitor, SystemSampler};
use warden_session::{FileMessageStore, MessageStore};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn store() -> FileMessageStore {
    FileMessageStore::new(warden_config::sessions_dir())
}

/// Initialize config and workspace
pub async fn init_command() -> Result<()> {
    println!("◆ Initializing Warden...");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = warden_config::init()
        .await
        .context("writing default config")?;

    println!("Config:    {}", warden_config::config_path().display());
    println!("Workspace: {}", config.workspace_path().display());
    println!("Sessions:  {}", warden_config::sessions_dir().display());
    println!("\n◆ Warden initialized");

    Ok(())
}

/// Show config, a live resource sample and the admission verdict
pub async fn status_command() -> Result<()> {
    let config_path = warden_config::config_path();
    let config = Config::load().await.context("loading config")?;
    let workspace = config.workspace_path();

    println!("◆ Warden System Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_path.exists() { "[OK]" } else { "[Missing]" }
    );
    println!(
        "Workspace: {} {}",
        workspace.display(),
        if workspace.exists() { "[OK]" } else { "[Missing]" }
    );
    println!("Model:     {}", config.runtime.model);
    println!(
        "Remote assist: {}",
        config.remote_endpoint().as_deref().unwrap_or("[Disabled]")
    );

    let disk_root = if workspace.exists() {
        workspace
    } else {
        warden_config::data_dir()
    };
    let monitor = ResourceMonitor::new(&config.monitor, Box::new(SystemSampler::new(&disk_root)));
    let sample = monitor.sample();
    let thresholds = monitor.thresholds();

    println!("\n◆ Resources");
    println!(
        "CPU:       {:.1}% (limit {:.1}%)",
        sample.cpu_pct, thresholds.cpu_pct
    );
    println!(
        "Memory:    {:.1}% (limit {:.1}%)",
        sample.mem_pct, thresholds.mem_pct
    );
    println!(
        "Disk free: {:.2} GB (minimum {:.2} GB)",
        sample.disk_free_bytes as f64 / GIB,
        thresholds.disk_min_free_bytes as f64 / GIB
    );

    match monitor.admission() {
        Admission::Admitted => println!("\n◆ Admitted"),
        Admission::Paused(breaches) => {
            println!("\n◆ Paused");
            for breach in breaches {
                println!("  - {}", breach.message());
            }
        }
    }

    Ok(())
}

/// List stored sessions
pub async fn sessions_command() -> Result<()> {
    let ids = store().list_sessions().await.context("listing sessions")?;
    if ids.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    println!("Sessions:");
    for id in ids {
        println!("  {}", id);
    }
    Ok(())
}

/// Validate a stored history and report open tool calls
pub async fn validate_command(session: &str) -> Result<()> {
    let history = store()
        .list_messages(session)
        .await
        .with_context(|| format!("loading session {}", session))?;
    debug!(session, messages = history.len(), "◆ VALIDATING");

    validator::validate(&history).with_context(|| format!("session {}", session))?;

    let pending = validator::pending_tool_calls(&history);
    println!("◆ Session {}: {} messages, history valid", session, history.len());
    if pending.is_empty() {
        println!("No pending tool calls");
    } else {
        println!("Pending tool calls:");
        for call in pending {
            println!("  {} {}", call.id, call.name);
        }
    }
    Ok(())
}

/// Archive a session
pub async fn archive_command(session: &str) -> Result<()> {
    store()
        .archive(session)
        .await
        .with_context(|| format!("archiving session {}", session))?;
    println!("✓ Session {} archived", session);
    Ok(())
}

/// Run the edit resolver against a file; writes only with `apply`
pub async fn resolve_edit_command(file: &Path, old: &str, new: &str, apply: bool) -> Result<()> {
    let config = Config::load().await.context("loading config")?;
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let mut resolver = EditResolver::new(&config.edit);
    if let Some(endpoint) = config.remote_endpoint() {
        let remote = HttpRemoteAssist::new(
            endpoint,
            Duration::from_millis(config.edit.remote_timeout_ms),
        )?;
        resolver = resolver.with_remote(Arc::new(remote));
    }

    let resolution = match resolver.resolve(&content, old, new).await {
        Ok(resolution) => resolution,
        Err(e) => bail!("{}", e),
    };

    println!("Strategy:   {}", resolution.strategy);
    println!("Confidence: {:.2}", resolution.confidence);
    println!("Line:       {}", resolution.line);
    println!("Matched:\n{}", resolution.matched);

    if apply {
        tokio::fs::write(file, &resolution.new_content)
            .await
            .with_context(|| format!("writing {}", file.display()))?;
        info!(file = %file.display(), "◆ EDIT APPLIED");
        println!("✓ Written to {}", file.display());
    } else {
        println!("(dry run; pass --apply to write)");
    }
    Ok(())
}
