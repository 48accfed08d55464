//! Run state machine.
//!
//! A [`Run`] executes one [`Task`] through the fixed state sequence. It only
//! moves forward, and only on a [`Verified`] token for the very next state.
//! Every transition and the terminal outcome are appended to the audit store.
//!
//! # Restart policy
//!
//! Partial progress is not checkpointed. A Run always starts at `INIT`. Every
//! routine skips work whose post-condition already holds (pills already on the
//! page, an import already running), so re-running a Task over remote state
//! that survived an earlier attempt converges without duplicating it. Within a
//! Run, a browser relaunch resumes at the last verified state.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::audit::{ArtifactBody, AuditStore, Auditor};
use crate::brain::DecisionMaker;
use crate::config::AgentConfig;
use crate::criteria::{CriteriaInterpreter, SearchProfile};
use crate::decision_loop::{DecisionLoop, LoopGoal, escalates};
use crate::driver::DriverFactory;
use crate::error::{AgentError, ErrorKind, Result};
use crate::loop_detector::{ActionLogEntry, LoopDetector};
use crate::polling::{PollOutcome, poll_until_stable};
use crate::procedures::Procedures;
use crate::session::Session;
use crate::types::{
    AppliedFilter, FilterCategory, Progress, RunEvent, RunOutcome, RunReport, RunState, Task,
};
use crate::verifier::{CompletionVerifier, Evidence, Verified};

pub struct Run {
    pub id: String,
    pub task: Task,
    state: RunState,
    started_at: DateTime<Utc>,
    stage_times: Vec<(RunState, DateTime<Utc>)>,
    turns: u32,
    last_snapshot_hash: Option<String>,
    progress: Progress,
    detector: LoopDetector,
    profile: Option<SearchProfile>,
}

impl Run {
    pub fn new(id: impl Into<String>, task: Task, loop_threshold: u32) -> Self {
        let started_at = Utc::now();
        Self {
            id: id.into(),
            task,
            state: RunState::Init,
            started_at,
            stage_times: vec![(RunState::Init, started_at)],
            turns: 0,
            last_snapshot_hash: None,
            progress: Progress::default(),
            detector: LoopDetector::new(loop_threshold),
            profile: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn stage_times(&self) -> &[(RunState, DateTime<Utc>)] {
        &self.stage_times
    }

    pub fn last_snapshot_hash(&self) -> Option<&str> {
        self.last_snapshot_hash.as_deref()
    }

    pub fn action_log(&self) -> &[ActionLogEntry] {
        self.detector.entries()
    }

    /// Advance to the next state. The proof must be for exactly that state.
    pub fn transition(&mut self, proof: Verified) -> Result<RunState> {
        let Some(next) = self.state.next() else {
            return Err(AgentError::verification(
                self.state,
                "run is already terminal",
            ));
        };
        if proof.stage() != next {
            return Err(AgentError::verification(
                next,
                format!("evidence was gathered for {}", proof.stage()),
            ));
        }
        self.state = next;
        self.stage_times.push((next, Utc::now()));
        self.progress.last_verified = next;
        if let Some(fp) = proof.fingerprint() {
            self.last_snapshot_hash = Some(fp.to_string());
        }
        Ok(next)
    }

    fn terminate(&mut self, terminal: RunState) {
        self.state = terminal;
        self.stage_times.push((terminal, Utc::now()));
    }

    fn note_filter(&mut self, applied: AppliedFilter) {
        let known = self
            .progress
            .applied_filters
            .iter()
            .any(|f| f.category == applied.category && f.value == applied.value);
        if !known {
            self.progress.applied_filters.push(applied);
        }
    }
}

/// External collaborators a Run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub interpreter: Arc<dyn CriteriaInterpreter>,
    pub decision_maker: Arc<dyn DecisionMaker>,
    pub audit: Arc<dyn AuditStore>,
    pub factory: Arc<dyn DriverFactory>,
    pub events: Option<broadcast::Sender<RunEvent>>,
}

pub struct RunMachine {
    config: Arc<AgentConfig>,
    collaborators: Collaborators,
    procedures: Procedures,
    verifier: CompletionVerifier,
}

impl RunMachine {
    pub fn new(config: Arc<AgentConfig>, collaborators: Collaborators) -> Self {
        let procedures = Procedures::new(config.site.clone(), config.timings.clone());
        let verifier = CompletionVerifier::new(config.verify.clone());
        Self {
            config,
            collaborators,
            procedures,
            verifier,
        }
    }

    /// Execute `task` to a terminal state. Always returns a report; failures
    /// are described by its outcome.
    pub async fn execute(&self, task: Task) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut run = Run::new(run_id.clone(), task, self.config.budget.loop_threshold);
        let auditor = Auditor::new(
            self.collaborators.audit.clone(),
            run_id.clone(),
            self.collaborators.events.clone(),
        );
        info!(run_id = %run_id, subject = %run.task.subject_id, correlation_id = %run.task.correlation_id, "run started");
        auditor.emit(RunEvent::Started {
            run_id: run_id.clone(),
            subject_id: run.task.subject_id.clone(),
        });
        auditor
            .status(RunState::Init, format!("run started for {}", run.task.subject_name), None)
            .await;

        let mut session = Session::new(
            self.collaborators.factory.clone(),
            self.config.session.clone(),
            self.config.retry.clone(),
            self.config.condenser.clone(),
        );

        let wall_clock = self.config.budget.wall_clock;
        let driven = tokio::time::timeout(wall_clock, self.drive(&mut run, &mut session, &auditor)).await;

        let outcome = match driven {
            Ok(Ok(summary)) => RunOutcome::Success {
                summary,
                progress: run.progress.clone(),
            },
            Ok(Err(err)) if err.kind() == ErrorKind::Timeout => {
                warn!(run_id = %run_id, state = %run.state, error = %err, "run timed out");
                auditor
                    .status(RunState::TimedOut, format!("{err} ({})", run.progress.describe()), Some(ErrorKind::Timeout))
                    .await;
                RunOutcome::TimedOut {
                    last_state: run.state,
                    progress: run.progress.clone(),
                }
            }
            Ok(Err(err)) => {
                error!(run_id = %run_id, state = %run.state, kind = %err.kind(), error = %err, "run failed");
                auditor.status(RunState::Failed, err.to_string(), Some(err.kind())).await;
                RunOutcome::Failed {
                    reason: err.kind(),
                    detail: format!("{err} ({})", run.progress.describe()),
                    progress: run.progress.clone(),
                }
            }
            Err(_) => {
                let err = AgentError::WallClockExceeded(wall_clock);
                warn!(run_id = %run_id, state = %run.state, "wall-clock budget exceeded");
                auditor
                    .status(RunState::TimedOut, format!("{err} ({})", run.progress.describe()), Some(ErrorKind::Timeout))
                    .await;
                RunOutcome::TimedOut {
                    last_state: run.state,
                    progress: run.progress.clone(),
                }
            }
        };

        match &outcome {
            RunOutcome::Success { .. } => {}
            RunOutcome::Failed { .. } => run.terminate(RunState::Failed),
            RunOutcome::TimedOut { .. } => run.terminate(RunState::TimedOut),
        }
        if !outcome.is_success() {
            if let Some(png) = session.screenshot().await {
                auditor.artifact("failure", ArtifactBody::Png(png)).await;
            }
        }
        session.teardown().await;

        match serde_json::to_value(run.action_log()) {
            Ok(log) => auditor.artifact("action_log", ArtifactBody::Json(log)).await,
            Err(err) => warn!(error = %err, "action log not serialisable"),
        }
        auditor.emit(RunEvent::Finished {
            run_id: run_id.clone(),
            outcome: outcome.clone(),
        });
        info!(run_id = %run_id, state = %run.state, turns = run.turns, "run finished");

        RunReport {
            run_id,
            correlation_id: run.task.correlation_id.clone(),
            subject_id: run.task.subject_id.clone(),
            final_state: run.state,
            turns: run.turns,
            started_at: run.started_at,
            finished_at: Utc::now(),
            outcome,
        }
    }

    async fn drive(&self, run: &mut Run, session: &mut Session, auditor: &Auditor) -> Result<String> {
        session.launch().await?;
        while run.state != RunState::Done {
            let proof = self.advance_with_recovery(run, session, auditor).await?;
            let evidence = proof.evidence().to_string();
            let state = run.transition(proof)?;
            info!(run_id = %run.id, %state, evidence = %evidence, "state advanced");
            auditor.status(state, evidence.clone(), None).await;
            auditor.emit(RunEvent::StateChanged {
                run_id: run.id.clone(),
                state,
                evidence,
            });
        }
        let p = &run.progress;
        Ok(format!(
            "{} filters applied, {} of {} results imported, enrichment started",
            p.applied_filters.len(),
            p.imported.unwrap_or(0),
            p.results_available.unwrap_or(0)
        ))
    }

    /// One stage, relaunching the browser when it degrades mid-stage. The
    /// retry starts the same stage again; verified state is never rolled back.
    async fn advance_with_recovery(
        &self,
        run: &mut Run,
        session: &mut Session,
        auditor: &Auditor,
    ) -> Result<Verified> {
        let attempts = self.config.budget.stage_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.advance(run, session, auditor).await {
                Ok(proof) => {
                    run.last_snapshot_hash = session.last_fingerprint().map(str::to_string);
                    return Ok(proof);
                }
                Err(AgentError::SessionDegraded(detail)) if attempt < attempts => {
                    warn!(run_id = %run.id, state = %run.state, detail = %detail, "session degraded, relaunching");
                    self.procedures
                        .recycle(session, self.config.credentials.as_ref(), &detail)
                        .await?;
                    auditor.emit(RunEvent::SessionRecycled {
                        run_id: run.id.clone(),
                        generation: session.generation(),
                        reason: detail,
                    });
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Perform the work of the current state and return proof for the next.
    pub async fn advance(&self, run: &mut Run, session: &mut Session, auditor: &Auditor) -> Result<Verified> {
        let site = self.procedures.site();
        match run.state {
            RunState::Init => {
                let outcome = self
                    .procedures
                    .authenticate(session, self.config.credentials.as_ref())
                    .await?;
                info!(run_id = %run.id, ?outcome, "authenticate routine finished");
                self.verifier
                    .confirm(session, RunState::Authenticated, &self.procedures.authenticated_evidence())
                    .await
            }
            RunState::Authenticated => {
                let profile = self
                    .collaborators
                    .interpreter
                    .interpret(&run.task.criteria)
                    .await?;
                if let Ok(json) = serde_json::to_value(&profile) {
                    auditor.artifact("criteria_profile", ArtifactBody::Json(json)).await;
                }
                let note = format!(
                    "{} filter values, {:?} confidence",
                    profile.value_count(),
                    profile.confidence
                );
                run.profile = Some(profile);
                Ok(Verified::deterministic(RunState::CriteriaReady, note))
            }
            RunState::CriteriaReady => self.apply_filters(run, session, auditor).await,
            RunState::FiltersApplied => {
                let count = self.procedures.read_result_count(session).await?;
                run.progress.results_available = Some(count);
                let proof = self
                    .verifier
                    .confirm(
                        session,
                        RunState::ResultsVerified,
                        &Evidence::CounterAtLeast {
                            label: site.results_counter.clone(),
                            min: 1,
                        },
                    )
                    .await?;
                run.progress.expected_import = Some(count.min(site.import_limit));
                Ok(proof)
            }
            RunState::ResultsVerified => {
                let started = self.procedures.import_started_evidence();
                if let Err(err) = self.procedures.trigger_import(session).await {
                    self.recover_with_decision_loop(
                        run,
                        session,
                        auditor,
                        err,
                        LoopGoal {
                            stage: RunState::ImportTriggered,
                            goal: format!(
                                "Add the current search results to the table (up to {}) and confirm the import.",
                                site.import_limit
                            ),
                            evidence: started.clone(),
                        },
                    )
                    .await?;
                }
                self.verifier.confirm(session, RunState::ImportTriggered, &started).await
            }
            RunState::ImportTriggered => self.await_import(run, session, auditor).await,
            RunState::ImportComplete => {
                let started = self.procedures.enrichment_evidence();
                if let Err(err) = self.procedures.trigger_enrichment(session).await {
                    self.recover_with_decision_loop(
                        run,
                        session,
                        auditor,
                        err,
                        LoopGoal {
                            stage: RunState::EnrichmentTriggered,
                            goal: "Start enrichment for the imported rows in the table.".to_string(),
                            evidence: started.clone(),
                        },
                    )
                    .await?;
                }
                let proof = self
                    .verifier
                    .confirm(session, RunState::EnrichmentTriggered, &started)
                    .await?;
                run.progress.enrichment_started = true;
                Ok(proof)
            }
            RunState::EnrichmentTriggered => {
                Ok(Verified::deterministic(RunState::Done, "every stage verified"))
            }
            terminal @ (RunState::Done | RunState::Failed | RunState::TimedOut) => {
                Err(AgentError::verification(terminal, "run is already terminal"))
            }
        }
    }

    fn decision_loop<'a>(&'a self, auditor: &'a Auditor) -> DecisionLoop<'a> {
        DecisionLoop {
            maker: self.collaborators.decision_maker.as_ref(),
            verifier: &self.verifier,
            procedures: &self.procedures,
            budget: &self.config.budget,
            settle: self.config.timings.decision_settle,
            credentials: self.config.credentials.as_ref(),
            auditor,
        }
    }

    /// Hand a stage a routine could not finish to the decision loop. Errors the
    /// loop cannot recover from are returned as the routine's failure.
    async fn recover_with_decision_loop(
        &self,
        run: &mut Run,
        session: &mut Session,
        auditor: &Auditor,
        cause: AgentError,
        goal: LoopGoal,
    ) -> Result<Verified> {
        if !escalates(&cause) {
            return Err(cause);
        }
        warn!(run_id = %run.id, state = %run.state, error = %cause, "routine failed, escalating to decision loop");
        auditor
            .status(run.state, format!("routine failed: {cause}"), Some(cause.kind()))
            .await;
        self.decision_loop(auditor)
            .run(session, &mut run.detector, &mut run.turns, &goal)
            .await
    }

    async fn apply_filters(&self, run: &mut Run, session: &mut Session, auditor: &Auditor) -> Result<Verified> {
        let profile = run
            .profile
            .clone()
            .ok_or_else(|| AgentError::verification(RunState::FiltersApplied, "no interpreted criteria"))?;
        let mut shot = 0u32;
        let mut all_pills = Vec::new();

        for category in FilterCategory::ORDER {
            let values = profile.values(category);
            all_pills.extend(values.iter().map(|v| self.procedures.pill_evidence(category, v)));

            for (i, value) in values.iter().enumerate() {
                match self.procedures.apply_filter_value(session, category, value).await {
                    Ok(applied) => {
                        run.note_filter(applied);
                        shot += 1;
                        if let Some(png) = session.screenshot().await {
                            auditor
                                .artifact(&format!("filter_{shot:02}_{category}"), ArtifactBody::Png(png))
                                .await;
                        }
                    }
                    Err(err) if escalates(&err) && !matches!(err, AgentError::SessionDegraded(_)) => {
                        self.recover_filters(run, session, auditor, category, &values[i..], err)
                            .await?;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        self.verifier
            .confirm(session, RunState::FiltersApplied, &Evidence::All(all_pills))
            .await
    }

    /// Decision loop first, then a reload-and-reapply fallback. The fallback's
    /// failure is the Run's failure.
    async fn recover_filters(
        &self,
        run: &mut Run,
        session: &mut Session,
        auditor: &Auditor,
        category: FilterCategory,
        remaining: &[String],
        cause: AgentError,
    ) -> Result<()> {
        let section = self.procedures.site().filters.section(category);
        let goal = LoopGoal {
            stage: RunState::FiltersApplied,
            goal: format!(
                "In the {} filter ({}), add one filter pill for each of: {}. Type a value, then press Enter so it becomes a pill.",
                category,
                section.toggle.name,
                remaining.join(", ")
            ),
            evidence: Evidence::All(
                remaining
                    .iter()
                    .map(|v| self.procedures.pill_evidence(category, v))
                    .collect(),
            ),
        };
        let looped = self
            .recover_with_decision_loop(run, session, auditor, cause, goal)
            .await;
        match looped {
            Ok(_) => {
                for value in remaining {
                    run.note_filter(AppliedFilter {
                        category,
                        value: value.clone(),
                        already_present: false,
                    });
                }
                Ok(())
            }
            Err(err) if escalates(&err) => {
                warn!(run_id = %run.id, %category, error = %err, "decision loop escalated, reloading and reapplying");
                auditor
                    .status(run.state, format!("decision loop escalated: {err}"), Some(err.kind()))
                    .await;
                let applied = self
                    .procedures
                    .reapply_after_reload(session, category, remaining)
                    .await?;
                for a in applied {
                    run.note_filter(a);
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn await_import(&self, run: &mut Run, session: &mut Session, auditor: &Auditor) -> Result<Verified> {
        let site = self.procedures.site();
        let expected = run
            .progress
            .expected_import
            .unwrap_or(site.import_limit);
        let polled = poll_until_stable(session, &site.table_counter, expected, &self.config.polling).await?;
        let settled_at = match polled {
            PollOutcome::Complete { count, samples } => {
                info!(run_id = %run.id, count, samples, "import complete");
                run.progress.imported = Some(count);
                run.progress.import_complete = true;
                expected
            }
            PollOutcome::Incomplete { last_count, samples } => {
                run.progress.imported = Some(last_count);
                let note = format!("ImportIncomplete: {last_count} of {expected} rows after {samples} samples");
                if !(self.config.budget.accept_partial_import && last_count > 0) {
                    return Err(AgentError::PostconditionTimeout {
                        routine: "import_poll".to_string(),
                        detail: note,
                    });
                }
                warn!(run_id = %run.id, last_count, expected, "continuing with a partial import");
                auditor.status(run.state, note, None).await;
                last_count
            }
        };
        self.verifier
            .confirm(
                session,
                RunState::ImportComplete,
                &Evidence::CounterAtLeast {
                    label: site.table_counter.clone(),
                    min: settled_at,
                },
            )
            .await
    }
}
