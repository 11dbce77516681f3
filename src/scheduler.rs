// ABOUTME: Cron runner: one task per {spec, entry} pair, each firing in a fresh cron engine
// ABOUTME: Specs are parsed up front so a bad entry fails startup instead of a later tick

use anyhow::{Context, Result};
use chrono::Utc;
use luabot_core::config::CronEntry;
use luabot_core::log_relay::Logger;
use luabot_core::metrics;
use luabot_core::schedule::CronSchedule;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::engine::{EngineFactory, Purpose};

/// Build a fresh cron engine and call the global `entry` with no arguments
pub fn run_entry(factory: &Arc<EngineFactory>, entry: &str) -> Result<()> {
    let engine = factory.build(Purpose::Cron)?;
    engine.call_global::<()>(entry, ())
}

/// Start a task per cron entry on the current runtime
pub fn start(
    factory: &Arc<EngineFactory>,
    crons: &[CronEntry],
    timezone: &str,
    logger: &Logger,
) -> Result<Vec<JoinHandle<()>>> {
    let scheduled = crons
        .iter()
        .map(|cron| {
            CronSchedule::parse(&cron.spec, timezone)
                .map(|schedule| (schedule, cron.entry.clone()))
                .with_context(|| format!("Invalid cron entry for '{}'", cron.entry))
        })
        .collect::<Result<Vec<_>>>()?;

    let runtime = tokio::runtime::Handle::try_current().context("crons need a tokio runtime")?;
    let handles = scheduled
        .into_iter()
        .map(|(schedule, entry)| {
            tracing::info!(spec = %schedule.spec(), entry = %entry, timezone, "Cron scheduled");
            let logger = logger.with_origin(format!("cron:{}", entry));
            runtime.spawn(run_schedule(factory.clone(), schedule, entry, logger))
        })
        .collect();
    Ok(handles)
}

async fn run_schedule(factory: Arc<EngineFactory>, schedule: CronSchedule, entry: String, logger: Logger) {
    while let Some(delay) = schedule.until_next(Utc::now()) {
        tokio::time::sleep(delay).await;

        let f = factory.clone();
        let name = entry.clone();
        let outcome = tokio::task::spawn_blocking(move || run_entry(&f, &name)).await;
        match outcome {
            Ok(Ok(())) => {
                metrics::record_cron_run(&entry, "success");
                logger.debug(format!("{} finished", entry));
            }
            Ok(Err(e)) => {
                metrics::record_cron_run(&entry, "failure");
                logger.error(format!("{:#}", e));
            }
            Err(e) => {
                metrics::record_cron_run(&entry, "panic");
                logger.error(format!("{} aborted: {}", entry, e));
            }
        }
    }
    tracing::warn!(entry = %entry, "Cron schedule has no further firings");
}
