use sourcing_agent::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Poll the record store for pending records every `period`. A tick that
/// lands while a run is active is skipped, not queued.
pub fn spawn(orchestrator: Arc<Orchestrator>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;
        info!(every_secs = period.as_secs(), "scheduler started");

        loop {
            ticker.tick().await;
            let slot = match orchestrator.try_claim("scheduled batch") {
                Ok(slot) => slot,
                Err(err) => {
                    info!(reason = %err, "scheduled poll skipped");
                    continue;
                }
            };
            match orchestrator.process_pending_in(&slot).await {
                Ok(summary) if summary.processed == 0 => info!("scheduled poll found nothing pending"),
                Ok(summary) => info!(
                    processed = summary.processed,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "scheduled batch finished"
                ),
                Err(err) => error!(error = %err, "scheduled poll failed"),
            }
        }
    })
}
