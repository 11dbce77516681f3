// ABOUTME: Worker engines that drain the worker lane and call the script's worker(payload)
// ABOUTME: goworker hands each payload to its own throwaway engine; the optional pool serves the lane

use anyhow::{Context, Result};
use luabot_core::coord::{CoordMessage, Lane};
use luabot_core::log_relay::Logger;
use luabot_core::metrics;
use serde_json::Value;
use std::sync::Arc;

use crate::engine::convert::message_to_lua;
use crate::engine::{Engine, EngineFactory, Purpose};

/// Entry point every worker engine calls
pub const WORKER_ENTRY: &str = "worker";

/// `goworker(payload)`: start a fresh worker engine that owns `payload`.
///
/// The payload moves into the spawned task instead of travelling on the
/// worker lane, so pool engines draining that lane can never take it.
pub fn dispatch(factory: &Arc<EngineFactory>, payload: Value) -> Result<()> {
    let runtime = tokio::runtime::Handle::try_current().context("goworker needs a tokio runtime")?;
    let f = factory.clone();
    let message = CoordMessage::notification(payload);
    runtime.spawn_blocking(move || run_once(&f, &message));
    metrics::record_worker_spawned();
    Ok(())
}

fn worker_logger(factory: &EngineFactory) -> Logger {
    factory.logger().with_origin(Purpose::Worker.as_str())
}

fn run_once(factory: &Arc<EngineFactory>, message: &CoordMessage) {
    let logger = worker_logger(factory);
    let engine = match factory.build(Purpose::Worker) {
        Ok(engine) => engine,
        Err(e) => {
            logger.error(format!("Failed to start worker: {:#}", e));
            return;
        }
    };
    if let Err(e) = call_worker(&engine, message) {
        logger.error(format!("{:#}", e));
    }
}

/// Call `worker(message)` in `engine`
pub fn call_worker(engine: &Engine, message: &CoordMessage) -> Result<()> {
    let value = message_to_lua(engine.lua(), message).map_err(|e| anyhow::anyhow!("{}", e))?;
    engine.call_global::<()>(WORKER_ENTRY, value)
}

/// Start `size` long-lived worker engines serving `notifyworker`/`requestworker`
/// on the worker lane until it closes
pub fn spawn_pool(factory: &Arc<EngineFactory>, size: usize) -> Result<()> {
    let runtime = tokio::runtime::Handle::try_current().context("worker pool needs a tokio runtime")?;
    for index in 0..size {
        let f = factory.clone();
        runtime.spawn_blocking(move || {
            let logger = worker_logger(&f);
            let engine = match f.build(Purpose::Worker) {
                Ok(engine) => engine,
                Err(e) => {
                    logger.error(format!("Failed to start pool worker {}: {:#}", index, e));
                    return;
                }
            };
            metrics::record_worker_spawned();
            tracing::info!(index, engine_id = %engine.id(), "Pool worker started");
            while let Some(message) = f.coordinator().blocking_recv(Lane::Worker) {
                if let Err(e) = call_worker(&engine, &message) {
                    logger.error(format!("{:#}", e));
                }
            }
        });
    }
    Ok(())
}
