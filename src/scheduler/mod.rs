use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::engine::ledger::DedupLedger;
use crate::engine::EngineStats;

/// Logs engine counters on a cron schedule while the engine runs
pub struct StatusReport {
    scheduler: JobScheduler,
}

impl StatusReport {
    /// Validate `cron_expr`, register the report and start ticking
    pub async fn start(
        cron_expr: &str,
        stats: Arc<EngineStats>,
        ledger: Arc<DedupLedger>,
    ) -> Result<Self> {
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let stats = stats.clone();
            let ledger = ledger.clone();
            Box::pin(async move {
                info!("{}", status_line(&stats, &ledger).await);
            })
        })
        .with_context(|| format!("Invalid status report schedule: {}", cron_expr))?;

        let scheduler = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        scheduler
            .add(job)
            .await
            .context("Failed to add status report job")?;
        scheduler
            .start()
            .await
            .context("Failed to start scheduler")?;

        info!("Status report scheduled with cron: {}", cron_expr);
        Ok(Self { scheduler })
    }

    pub async fn stop(mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Status report stopped");
        Ok(())
    }
}

async fn status_line(stats: &EngineStats, ledger: &DedupLedger) -> String {
    format!(
        "Status: {} ledger_entries={}",
        stats.snapshot(),
        ledger.len().await
    )
}
