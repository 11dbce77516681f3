// ABOUTME: Builds isolated Lua engines that all run the same script
// ABOUTME: One long-lived main engine per run plus throwaway engines for requests, workers and crons

pub mod bindings;
pub mod bot;
pub mod convert;
pub mod modules;
pub mod userdata;

use anyhow::{anyhow, Context, Result};
use luabot_core::coord::Coordinator;
use luabot_core::log_relay::{LogRelay, Logger, TracingSink};
use mlua::{FromLuaMulti, Function, IntoLuaMulti, Lua, Value as LuaValue};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Why an engine exists. Only `Main` may serve a live backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Main,
    Request,
    Worker,
    Cron,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Main => "main",
            Purpose::Request => "request",
            Purpose::Worker => "worker",
            Purpose::Cron => "cron",
        }
    }

    pub fn is_main(&self) -> bool {
        matches!(self, Purpose::Main)
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared recipe for every engine of a run.
///
/// Engines built here share no Lua state. They meet only through the
/// coordinator lanes and log through the relay.
pub struct EngineFactory {
    script: PathBuf,
    coordinator: Arc<Coordinator>,
    relay: LogRelay,
    root_logger: RwLock<Option<Logger>>,
}

impl EngineFactory {
    pub fn new(script: impl Into<PathBuf>, coordinator: Arc<Coordinator>, relay: LogRelay) -> Arc<Self> {
        Arc::new(Self {
            script: script.into(),
            coordinator,
            relay,
            root_logger: RwLock::new(None),
        })
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn relay(&self) -> &LogRelay {
        &self.relay
    }

    /// Logger derived engines and services write through. Set from the main
    /// backend's `log` option; falls back to tracing.
    pub fn logger(&self) -> Logger {
        self.root_logger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| Logger::new(Arc::new(TracingSink), self.relay.clone()))
    }

    pub fn set_root_logger(&self, logger: Logger) {
        *self.root_logger.write().unwrap_or_else(PoisonError::into_inner) = Some(logger);
    }

    /// Create a fresh engine, install bindings and modules, then execute the script
    pub fn build(self: &Arc<Self>, purpose: Purpose) -> Result<Engine> {
        let lua = Lua::new();
        let id = uuid::Uuid::new_v4().to_string();

        bindings::install(&lua, self, purpose, &id)
            .with_context(|| format!("Failed to install bindings for {} engine", purpose))?;
        modules::preload(&lua).context("Failed to preload modules")?;

        let source = std::fs::read_to_string(&self.script)
            .with_context(|| format!("Failed to read script {}", self.script.display()))?;
        lua.load(source)
            .set_name(format!("@{}", self.script.display()))
            .exec()
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Failed to execute {}", self.script.display()))?;

        tracing::debug!(purpose = %purpose, engine_id = %id, "Engine built");
        Ok(Engine { lua, purpose, id })
    }

    /// Build the main engine and call the script's `main()`. Returns once
    /// `main` does, which for a serving bot is when it quits.
    pub fn run_main(self: &Arc<Self>) -> Result<()> {
        let engine = self.build(Purpose::Main)?;
        engine.call_global::<()>("main", ())
    }
}

impl fmt::Debug for EngineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineFactory")
            .field("script", &self.script)
            .field("relay", &self.relay)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Engine {
    lua: Lua,
    purpose: Purpose,
    id: String,
}

impl Engine {
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_global(&self, name: &str) -> bool {
        matches!(self.lua.globals().get::<LuaValue>(name), Ok(LuaValue::Function(_)))
    }

    /// Call a global function by name
    pub fn call_global<R: FromLuaMulti>(&self, name: &str, args: impl IntoLuaMulti) -> Result<R> {
        let function: Option<Function> = self
            .lua
            .globals()
            .get(name)
            .map_err(|e| anyhow!("'{}' is not a function: {}", name, e))?;
        let function = function.with_context(|| format!("'{}' is not defined", name))?;
        function
            .call(args)
            .map_err(|e| anyhow!("{}() failed: {}", name, e))
    }
}
