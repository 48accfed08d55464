//! Task intake.
//!
//! Turns record-store records into Tasks and Runs. Enforces one active Run at
//! a time across the service, writes every outcome back to the record store, and keeps a small
//! service status for the debug surface.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::audit::AuditStore;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::record_store::{RecordStatus, RecordStore, WriteBack};
use crate::run::{Collaborators, RunMachine};
use crate::session::Session;
use crate::types::{RunEvent, RunOutcome, RunReport, Task};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("record {0} not found")]
    NotFound(String),

    #[error("a run is already active for {0}")]
    Busy(String),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub subject_id: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub status: &'static str,
    pub active: Vec<ActiveRun>,
    pub runs_finished: u64,
    pub last_run: Option<RunReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub reports: Vec<RunReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityReport {
    pub url: String,
    pub title: String,
    pub elements: usize,
}

#[derive(Default)]
struct Ledger {
    active: Option<ActiveRun>,
    runs_finished: u64,
    last_run: Option<RunReport>,
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(|p| p.into_inner())
}

/// The single run slot. At most one exists at a time; dropping it frees the
/// slot. Owned, so a caller can claim it synchronously and move it into a
/// spawned task.
pub struct RunSlot {
    ledger: Arc<Mutex<Ledger>>,
}

impl RunSlot {
    fn working_on(&self, subject_id: &str) {
        lock(&self.ledger).active = Some(ActiveRun {
            subject_id: subject_id.to_string(),
            since: Utc::now(),
        });
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        lock(&self.ledger).active = None;
    }
}

pub struct Orchestrator {
    config: Arc<AgentConfig>,
    machine: RunMachine,
    collaborators: Collaborators,
    records: Arc<dyn RecordStore>,
    events: broadcast::Sender<RunEvent>,
    ledger: Arc<Mutex<Ledger>>,
}

impl Orchestrator {
    pub fn new(config: Arc<AgentConfig>, mut collaborators: Collaborators, records: Arc<dyn RecordStore>) -> Self {
        let events = match &collaborators.events {
            Some(tx) => tx.clone(),
            None => {
                let (tx, _rx) = broadcast::channel(100);
                collaborators.events = Some(tx.clone());
                tx
            }
        };
        let machine = RunMachine::new(config.clone(), collaborators.clone());
        Self {
            config,
            machine,
            collaborators,
            records,
            events,
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn audit(&self) -> Arc<dyn AuditStore> {
        self.collaborators.audit.clone()
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.ledger).active.is_some()
    }

    pub fn status(&self) -> ServiceStatus {
        let ledger = lock(&self.ledger);
        ServiceStatus {
            status: if ledger.active.is_some() { "running" } else { "idle" },
            active: ledger.active.iter().cloned().collect(),
            runs_finished: ledger.runs_finished,
            last_run: ledger.last_run.clone(),
        }
    }

    /// Take the run slot for `label`, or report who holds it. Check and claim
    /// happen under one lock.
    pub fn try_claim(&self, label: &str) -> Result<RunSlot, DispatchError> {
        let mut ledger = lock(&self.ledger);
        if let Some(active) = &ledger.active {
            return Err(DispatchError::Busy(active.subject_id.clone()));
        }
        ledger.active = Some(ActiveRun {
            subject_id: label.to_string(),
            since: Utc::now(),
        });
        Ok(RunSlot {
            ledger: self.ledger.clone(),
        })
    }

    pub async fn fetch_task(&self, record_id: &str) -> Result<Task, DispatchError> {
        let record = self
            .records
            .fetch(record_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(record_id.to_string()))?;
        info!(record_id, name = %record.name, "record fetched");
        Ok(record.into_task())
    }

    /// Fetch one record by id and run it.
    pub async fn run_record(&self, record_id: &str) -> Result<RunReport, DispatchError> {
        let slot = self.try_claim(record_id)?;
        let task = self.fetch_task(record_id).await?;
        Ok(self.execute_in(&slot, task).await)
    }

    pub async fn execute_task(&self, task: Task) -> Result<RunReport, DispatchError> {
        let slot = self.try_claim(&task.subject_id)?;
        Ok(self.execute_in(&slot, task).await)
    }

    /// Run a task in an already claimed slot and write its outcome back. A
    /// failed write-back is logged; the report is returned either way.
    pub async fn execute_in(&self, slot: &RunSlot, task: Task) -> RunReport {
        slot.working_on(&task.subject_id);
        let report = self.machine.execute(task).await;

        let update = write_back_for(&report);
        if let Err(err) = self.records.write_back(&report.subject_id, &update).await {
            error!(record_id = %report.subject_id, error = %err, "write-back failed");
        }

        let mut ledger = lock(&self.ledger);
        ledger.runs_finished += 1;
        ledger.last_run = Some(report.clone());
        report
    }

    pub async fn process_pending(&self) -> Result<BatchSummary, DispatchError> {
        let slot = self.try_claim("batch")?;
        self.process_pending_in(&slot).await
    }

    /// Run every pending record in turn within one slot. One record's failure
    /// never stops the batch.
    pub async fn process_pending_in(&self, slot: &RunSlot) -> Result<BatchSummary, DispatchError> {
        let pending = self.records.pending().await?;
        info!(count = pending.len(), "processing pending records");
        let mut summary = BatchSummary::default();
        for record in pending {
            let report = self.execute_in(slot, record.into_task()).await;
            summary.processed += 1;
            if report.outcome.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            summary.reports.push(report);
        }
        Ok(summary)
    }

    /// Launch a browser, open the workspace and confirm a page renders.
    pub async fn check_connectivity(&self) -> Result<ConnectivityReport, DispatchError> {
        let mut session = Session::new(
            self.collaborators.factory.clone(),
            self.config.session.clone(),
            self.config.retry.clone(),
            self.config.condenser.clone(),
        );
        let result = async {
            session.launch().await?;
            session.open(&self.config.site.target_url).await?;
            session.snapshot().await
        }
        .await;
        session.teardown().await;
        let snap = result?;
        if snap.elements.is_empty() && snap.texts.is_empty() {
            return Err(AgentError::NotReady(format!("{} rendered an empty page", snap.url)).into());
        }
        Ok(ConnectivityReport {
            url: snap.url,
            title: snap.title,
            elements: snap.elements.len(),
        })
    }
}

/// Record-store update for a finished Run. Partial progress always lands in
/// the error notes.
pub fn write_back_for(report: &RunReport) -> WriteBack {
    let progress = report.outcome.progress();
    match &report.outcome {
        RunOutcome::Success { .. } => WriteBack {
            status: RecordStatus::ReadyToLaunch,
            profiles_sent: Some(progress.imported.unwrap_or(0)),
            completed_at: Some(report.finished_at),
            error_notes: None,
        },
        RunOutcome::Failed { reason, detail, .. } => WriteBack {
            status: RecordStatus::Failed,
            profiles_sent: progress.imported,
            completed_at: None,
            error_notes: Some(format!("{reason}: {detail} [run {}]", report.run_id)),
        },
        RunOutcome::TimedOut { last_state, .. } => WriteBack {
            status: RecordStatus::Failed,
            profiles_sent: progress.imported,
            completed_at: None,
            error_notes: Some(format!(
                "Timeout after {last_state}: {} [run {}]",
                progress.describe(),
                report.run_id
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{Progress, RunState};

    fn report(outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: "run-1".into(),
            correlation_id: "c".into(),
            subject_id: "rec1".into(),
            final_state: RunState::Done,
            turns: 0,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome,
        }
    }

    #[test]
    fn success_reports_profiles_sent() {
        let progress = Progress {
            imported: Some(100),
            ..Progress::default()
        };
        let update = write_back_for(&report(RunOutcome::Success {
            summary: "ok".into(),
            progress,
        }));
        assert_eq!(update.status, RecordStatus::ReadyToLaunch);
        assert_eq!(update.profiles_sent, Some(100));
        assert!(update.completed_at.is_some());
    }

    #[test]
    fn failures_carry_reason_and_partial_progress() {
        let progress = Progress {
            last_verified: RunState::FiltersApplied,
            ..Progress::default()
        };
        let update = write_back_for(&report(RunOutcome::Failed {
            reason: ErrorKind::StructuralUi,
            detail: "import button missing".into(),
            progress: progress.clone(),
        }));
        assert_eq!(update.status, RecordStatus::Failed);
        let notes = update.error_notes.unwrap();
        assert!(notes.starts_with("StructuralUI: import button missing"));

        let update = write_back_for(&report(RunOutcome::TimedOut {
            last_state: RunState::ImportTriggered,
            progress,
        }));
        assert!(update.error_notes.unwrap().contains("Timeout after IMPORT_TRIGGERED"));
    }
}
