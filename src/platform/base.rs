// ABOUTME: State every backend shares and the serve loop that drives it
// ABOUTME: Multiplexes transport events, the main lane, script log lines and quit under the engine lock

use anyhow::{anyhow, bail, Context, Result};
use luabot_core::backoff::{ReconnectPolicy, ReconnectState};
use luabot_core::config::{BackendKind, CommonClientOption};
use luabot_core::coord::{Coordinator, Lane};
use luabot_core::event::{InboundEvent, TransportSignal};
use luabot_core::log_relay::{LogRecord, Logger};
use luabot_core::metrics;
use luabot_core::registry::CallbackRegistry;
use mlua::{Function, Lua};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ChatBackend, EventHandler, Transport};
use crate::engine::convert::message_to_lua;
use crate::logging::ScriptLogQueue;

/// A message waiting for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub target: String,
    pub message: String,
}

pub struct BackendBase {
    kind: BackendKind,
    common: CommonClientOption,
    logger: Logger,
    coordinator: Arc<Coordinator>,
    transport: Arc<dyn Transport>,
    registry: CallbackRegistry<EventHandler>,
    quit: CancellationToken,
    outbox_tx: mpsc::UnboundedSender<Outgoing>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
    script_log: Mutex<Option<ScriptLogQueue>>,
    reconnect: ReconnectPolicy,
}

impl BackendBase {
    pub fn new(
        kind: BackendKind,
        common: CommonClientOption,
        logger: Logger,
        coordinator: Arc<Coordinator>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        Self {
            kind,
            common,
            logger,
            coordinator,
            transport,
            registry: CallbackRegistry::new(),
            quit: CancellationToken::new(),
            outbox_tx,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            script_log: Mutex::new(None),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn common_option(&self) -> &CommonClientOption {
        &self.common
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &CallbackRegistry<EventHandler> {
        &self.registry
    }

    pub fn register(&self, event_type: impl Into<String>, handler: EventHandler) {
        self.registry.register(event_type, handler);
    }

    pub fn queue(&self, target: String, message: &str) {
        let outgoing = Outgoing {
            target,
            message: message.to_string(),
        };
        if self.outbox_tx.send(outgoing).is_err() {
            self.logger.warn("Outbox closed; message dropped");
        }
    }

    /// Route script log lines through the serve loop
    pub fn set_script_log(&self, queue: ScriptLogQueue) {
        *self.script_log.lock().unwrap_or_else(PoisonError::into_inner) = Some(queue);
    }

    pub fn quit(&self) {
        self.quit.cancel();
    }

    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    /// Call every handler registered for the event type, in registration
    /// order. Failures are logged and counted; the rest still run.
    pub fn dispatch(&self, lua: &Lua, event: &InboundEvent) -> usize {
        let handlers = self.registry.handlers_for(&event.event_type);
        if handlers.is_empty() {
            return 0;
        }
        metrics::record_event_dispatched(self.kind.as_str(), &event.event_type);

        let mut failures = 0;
        for handler in handlers {
            if let Err(e) = handler(lua, &event.payload) {
                failures += 1;
                metrics::record_handler_error(self.kind.as_str());
                self.logger
                    .error(format!("Error in '{}' handler: {}", event.event_type, e));
            }
        }
        failures
    }

    fn take_outbox(&self) -> Result<mpsc::UnboundedReceiver<Outgoing>> {
        self.outbox_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("{} backend is already serving", self.kind))
    }

    fn take_script_log(&self) -> Option<ScriptLogQueue> {
        self.script_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Block the calling thread on the backend's event loop.
///
/// Must run on a blocking thread of a tokio runtime (the main engine's
/// `spawn_blocking` thread), never on a runtime worker.
pub fn serve<B: ChatBackend + ?Sized>(backend: &B, lua: &Lua, main_handler: Option<Function>) -> Result<()> {
    let handle = tokio::runtime::Handle::try_current().context("serve needs a tokio runtime")?;
    backend.on_serve_start();
    handle.block_on(run_loop(backend, lua, main_handler))
}

async fn run_loop<B: ChatBackend + ?Sized>(backend: &B, lua: &Lua, main_handler: Option<Function>) -> Result<()> {
    let base = backend.base();
    let kind = base.kind();
    let logger = base.logger().clone();
    let transport = base.transport().clone();
    let coordinator = base.coordinator().clone();
    let quit = base.quit_token();

    let mut events = match transport.connect().await {
        Ok(events) => events,
        Err(e) => {
            logger.error(format!("Failed to connect to {}: {:#}", kind, e));
            logger.relay().flush().await;
            return Err(e.context(format!("{} backend failed to start", kind)));
        }
    };
    tracing::info!(backend = %kind, "Backend connected");

    let outbox = base.take_outbox()?;
    let drain = tokio::spawn(drain_outbox(transport.clone(), outbox, logger.clone(), quit.clone()));

    let (mut script_log_rx, script_log_fn) = match base.take_script_log() {
        Some(ScriptLogQueue { function, rx }) => (Some(rx), Some(function)),
        None => (None, None),
    };
    let mut reconnect = ReconnectState::new(base.reconnect.clone());

    let result = loop {
        tokio::select! {
            _ = quit.cancelled() => {
                tracing::info!(backend = %kind, "Quit requested");
                break Ok(());
            }
            signal = events.recv() => {
                let reason = match signal {
                    Some(TransportSignal::Event(event)) => {
                        coordinator.with_engine(|| backend.handle_event(lua, event));
                        continue;
                    }
                    Some(TransportSignal::Disconnected(reason)) => reason,
                    None => "connection closed".to_string(),
                };
                match reconnect_transport(&*transport, kind, &logger, &quit, &mut reconnect, &reason).await {
                    Ok(Some(fresh)) => events = fresh,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
            message = coordinator.recv(Lane::Main) => {
                let Some(message) = message else { continue };
                let Some(handler) = main_handler.as_ref() else {
                    tracing::debug!(backend = %kind, "No main handler; dropping main lane message");
                    continue;
                };
                let outcome = coordinator.with_engine(|| {
                    let value = message_to_lua(lua, &message)?;
                    handler.call::<()>(value)
                });
                if let Err(e) = outcome {
                    logger.error(format!("Error in main handler: {}", e));
                }
            }
            Some(record) = next_script_record(&mut script_log_rx) => {
                if let Some(key) = script_log_fn.as_ref() {
                    deliver_script_record(&coordinator, lua, key, &record);
                }
            }
        }
    };

    drain.abort();
    result
}

async fn next_script_record(rx: &mut Option<mpsc::UnboundedReceiver<LogRecord>>) -> Option<LogRecord> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn deliver_script_record(coordinator: &Coordinator, lua: &Lua, key: &mlua::RegistryKey, record: &LogRecord) {
    let outcome = coordinator.with_engine(|| {
        let function: Function = lua.registry_value(key)?;
        function.call::<()>(ScriptLogQueue::render(record))
    });
    if let Err(e) = outcome {
        tracing::warn!(error = %e, "Script log function failed");
    }
}

/// Reconnect after a drop. Returns None when quit is requested while waiting.
async fn reconnect_transport(
    transport: &dyn Transport,
    kind: BackendKind,
    logger: &Logger,
    quit: &CancellationToken,
    state: &mut ReconnectState,
    reason: &str,
) -> Result<Option<mpsc::Receiver<TransportSignal>>> {
    logger.error(format!("Error, disconnected: {}", reason));
    metrics::record_reconnect(kind.as_str());

    loop {
        match transport.connect().await {
            Ok(events) => {
                state.reset();
                logger.info(format!("Reconnected to {}", kind));
                return Ok(Some(events));
            }
            Err(e) => {
                logger.error(format!("Error while reconnecting: {:#}", e));
                let Some(delay) = state.next_delay() else {
                    bail!("{} backend gave up after {} reconnect attempts", kind, state.attempts());
                };
                tokio::select! {
                    _ = quit.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn drain_outbox(
    transport: Arc<dyn Transport>,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    logger: Logger,
    quit: CancellationToken,
) {
    loop {
        let outgoing = tokio::select! {
            _ = quit.cancelled() => return,
            outgoing = outbox.recv() => match outgoing {
                Some(outgoing) => outgoing,
                None => return,
            },
        };
        if let Err(e) = transport.send(&outgoing.target, &outgoing.message).await {
            logger.error(format!("Failed to send to {}: {:#}", outgoing.target, e));
        }
    }
}
