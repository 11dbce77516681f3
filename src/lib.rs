// ABOUTME: Root library module for the luabot chat host
// ABOUTME: Runs a Lua script's main() against a chat backend, plus `init` config generation

pub mod engine;
pub mod logging;
pub mod platform;
pub mod scheduler;
pub mod server;
pub mod services;
pub mod templates;
pub mod worker;

pub use luabot_core::config::BackendKind;

use anyhow::{bail, Context, Result};
use luabot_core::coord::Coordinator;
use luabot_core::log_relay::LogRelay;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use engine::EngineFactory;

/// Build the main engine for `script` and run its `main()` to completion
pub async fn run(script: impl Into<PathBuf>) -> Result<()> {
    let script = script.into();
    if !script.exists() {
        bail!(
            "{} not found (create one with `luabot init <kind>`)",
            script.display()
        );
    }

    let relay = LogRelay::spawn().context("Failed to start log relay")?;
    let factory = EngineFactory::new(script, Arc::new(Coordinator::new()), relay.clone());
    tracing::info!(script = %factory.script().display(), "Starting main engine");

    let main = factory.clone();
    let outcome = tokio::task::spawn_blocking(move || main.run_main())
        .await
        .context("Main engine panicked")?;
    relay.flush().await;
    outcome
}

/// Write the default script for `kind` to `path`. Refuses to replace an
/// existing file unless `force` is set.
pub fn init(path: &Path, kind: BackendKind, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(path, templates::default_config(kind))
        .with_context(|| format!("Failed to write {}", path.display()))
}
