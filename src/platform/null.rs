// ABOUTME: Backend with no network behind it
// ABOUTME: Serves only the main lane, HTTP and crons; messages said to it are logged and discarded

use anyhow::Result;
use async_trait::async_trait;
use luabot_core::config::{BackendKind, CommonClientOption};
use luabot_core::coord::Coordinator;
use luabot_core::event::TransportSignal;
use luabot_core::log_relay::Logger;
use mlua::{Function, Lua};
use regex::Regex;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use super::{BackendBase, ChatBackend, Transport};

/// Connects instantly and never produces an event
#[derive(Default)]
pub struct NullTransport {
    // Kept so the event receiver never reports a closed connection
    senders: Mutex<Vec<mpsc::Sender<TransportSignal>>>,
}

#[async_trait]
impl Transport for NullTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportSignal>> {
        let (tx, rx) = mpsc::channel(1);
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(rx)
    }

    async fn send(&self, target: &str, message: &str) -> Result<()> {
        tracing::debug!(target_name = %target, message = %message, "Null backend discarded message");
        Ok(())
    }
}

pub struct NullBackend {
    base: BackendBase,
}

impl NullBackend {
    pub fn new(common: CommonClientOption, logger: Logger, coordinator: Arc<Coordinator>) -> Self {
        Self {
            base: BackendBase::new(
                BackendKind::Null,
                common,
                logger,
                coordinator,
                Arc::new(NullTransport::default()),
            ),
        }
    }
}

impl ChatBackend for NullBackend {
    fn base(&self) -> &BackendBase {
        &self.base
    }

    fn on(&self, _lua: &Lua, _event_type: &str, _function: Function) -> mlua::Result<()> {
        Ok(())
    }

    fn respond(&self, _lua: &Lua, _pattern: Regex, _function: Function) -> mlua::Result<()> {
        Ok(())
    }
}
