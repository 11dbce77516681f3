// ABOUTME: Background services started when the main bot serves
// ABOUTME: Metrics exporter, HTTP/HTTPS surface, cron runner and the persistent worker pool

use anyhow::{Context, Result};
use luabot_core::config::CommonClientOption;
use luabot_core::log_relay::Logger;
use std::sync::Arc;

use crate::engine::EngineFactory;
use crate::{scheduler, server, worker};

/// Start every service the options ask for. A bind or parse failure is a
/// startup error; failures after startup are logged by the service.
pub fn start(factory: &Arc<EngineFactory>, common: &CommonClientOption, logger: &Logger) -> Result<()> {
    if let Some(addr) = &common.metrics {
        luabot_core::metrics::install_exporter(addr)?;
    }

    if common.worker > 0 {
        logger.info(format!("spawn {} workers", common.worker));
        worker::spawn_pool(factory, common.worker)?;
    }

    if let Some(addr) = &common.http {
        server::serve_http(factory.clone(), logger.with_origin("http"), addr)?;
    }
    if let Some(https) = &common.https {
        server::serve_https(factory.clone(), logger.with_origin("https"), https)
            .context("Failed to start https server")?;
    }

    let crons = scheduler::start(factory, &common.crons, &common.timezone, logger)?;
    if !crons.is_empty() {
        tracing::info!(count = crons.len(), "Cron entries scheduled");
    }
    Ok(())
}
