//! Recurring jobs every server runs.

use crate::error::{HandlerResult, Result};
use crate::kernel::Context;
use crate::processor::WorkItem;
use crate::scheduler::{JobContext, JobId};
use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const WORLD_PROCESSOR: &str = "world";
pub const LOG_PROCESSOR: &str = "log";

pub const WORLD_TICK: &str = "world-tick";
pub const IDLE_SWEEP: &str = "idle-sweep";
pub const MONITOR_REPORT: &str = "monitor-report";

/// Schedules the world tick, the idle sweep and the monitor report.
/// Fails if a processor they feed is not configured.
pub fn schedule_builtin(ctx: &Context) -> Result<Vec<JobId>> {
    ctx.processor(WORLD_PROCESSOR)?;
    ctx.processor(LOG_PROCESSOR)?;

    let scheduler = ctx.scheduler();
    let ticks = Arc::new(AtomicU64::new(0));

    let world_tick = {
        let ctx = ctx.clone();
        scheduler.schedule(WORLD_TICK, "* * * * * ?", move |job| {
            world_tick(ctx.clone(), Arc::clone(&ticks), job)
        })?
    };

    let idle_sweep = {
        let ctx = ctx.clone();
        scheduler.schedule(IDLE_SWEEP, "*/5 * * * * ?", move |_| idle_sweep(ctx.clone()))?
    };

    let monitor_report = {
        let ctx = ctx.clone();
        scheduler.schedule(MONITOR_REPORT, "*/30 * * * * ?", move |_| {
            monitor_report(ctx.clone())
        })?
    };

    Ok(vec![world_tick, idle_sweep, monitor_report])
}

async fn world_tick(ctx: Context, ticks: Arc<AtomicU64>, job: JobContext) -> HandlerResult {
    let item = WorkItem::task(WORLD_TICK, async move {
        let tick = ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if tick % 60 == 0 {
            debug!("World tick {} (slot {})", tick, job.scheduled_for);
        }
        Ok(())
    });
    ctx.submit(WORLD_PROCESSOR, item).await?;
    Ok(())
}

async fn idle_sweep(ctx: Context) -> HandlerResult {
    let timeout = ctx.config().idle_timeout();
    let timed_out = ctx.clients().write().await.check_timeouts(timeout);
    if !timed_out.is_empty() {
        info!("Idle sweep closed {} connections", timed_out.len());
    }
    Ok(())
}

async fn monitor_report(ctx: Context) -> HandlerResult {
    let snapshot = ctx.monitor().snapshot();
    let stats: Vec<(String, String)> = ctx
        .processors()
        .map(|processor| (processor.name().to_string(), processor.stats().to_string()))
        .collect();
    let jobs = ctx.scheduler().jobs();

    let item = WorkItem::task(MONITOR_REPORT, async move {
        info!("Network: {}", snapshot);
        for (name, stats) in stats {
            info!("Processor '{}': {}", name, stats);
        }
        for job in jobs {
            debug!(
                "Job '{}': fired={} skipped={} next={:?}",
                job.name, job.fired, job.skipped, job.next_fire
            );
        }
        Ok(())
    });
    ctx.submit(LOG_PROCESSOR, item).await?;
    Ok(())
}
