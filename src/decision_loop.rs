//! Bounded decision loop.
//!
//! Used only when a deterministic routine gave up. Each turn takes a fresh
//! snapshot, asks the decision maker for exactly one move, screens the move
//! through the loop detector, executes it and records whether the page changed.
//! A `Done` claim is handed to the verifier and is never taken at face value.

use std::collections::VecDeque;
use std::time::Duration;
use tracing::{info, warn};

use crate::audit::{ArtifactBody, Auditor};
use crate::brain::{DecisionContext, DecisionMaker, Proposal, TurnRecord};
use crate::config::{Credentials, RunBudget};
use crate::error::{AgentError, Result};
use crate::loop_detector::{ActionOutcome, LoopDetector};
use crate::procedures::Procedures;
use crate::session::Session;
use crate::snapshot::Snapshot;
use crate::types::{Action, Locator, RunEvent, RunState};
use crate::verifier::{ClaimVerdict, CompletionVerifier, Evidence, Verified};

/// What the loop is asked to achieve, and how success is recognised.
#[derive(Debug, Clone)]
pub struct LoopGoal {
    pub stage: RunState,
    pub goal: String,
    pub evidence: Evidence,
}

/// Sliding window of the most recent turns. Older turns are folded into a
/// one-line summary instead of being dropped silently.
#[derive(Debug)]
pub struct HistoryWindow {
    capacity: usize,
    recent: VecDeque<TurnRecord>,
    dropped: u32,
    dropped_advanced: u32,
}

impl HistoryWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: VecDeque::new(),
            dropped: 0,
            dropped_advanced: 0,
        }
    }

    pub fn push(&mut self, record: TurnRecord) {
        if self.recent.len() == self.capacity {
            if let Some(old) = self.recent.pop_front() {
                self.dropped += 1;
                if old.advanced {
                    self.dropped_advanced += 1;
                }
            }
        }
        self.recent.push_back(record);
    }

    pub fn records(&self) -> Vec<TurnRecord> {
        self.recent.iter().cloned().collect()
    }

    pub fn summary(&self) -> Option<String> {
        (self.dropped > 0).then(|| {
            format!(
                "{} earlier turns not shown, {} of them changed the page",
                self.dropped, self.dropped_advanced
            )
        })
    }
}

/// Errors after which the caller should try its deterministic fallback
/// rather than fail the Run outright.
pub fn escalates(err: &AgentError) -> bool {
    matches!(
        err,
        AgentError::LoopDetected { .. }
            | AgentError::DecisionFailed(_)
            | AgentError::VerificationFailed { .. }
    ) || err.is_structural()
}

fn outcome_label(outcome: &ActionOutcome) -> String {
    match outcome {
        ActionOutcome::Advanced => "advanced".to_string(),
        ActionOutcome::NoChange => "no change".to_string(),
        ActionOutcome::Failed(e) => format!("failed: {e}"),
        ActionOutcome::Rejected => "rejected".to_string(),
    }
}

/// Turn a proposal into an action bound to the element it names.
fn bind(snap: &Snapshot, proposal: &Proposal) -> std::result::Result<Action, String> {
    let locate = |reference: &str| {
        snap.element(reference)
            .map(|el| Locator::role(el.role.clone(), el.name.clone()))
            .ok_or_else(|| format!("element {reference} is not on the current page"))
    };
    let action = match proposal {
        Proposal::Click { element } => Action::click(locate(element)?).bound_to(element.clone()),
        Proposal::Fill { element, value } => {
            Action::fill(locate(element)?, value.clone()).bound_to(element.clone())
        }
        Proposal::PressKey { key } => Action::press(key.clone()),
        Proposal::Scroll { element: Some(element) } => {
            Action::scroll(Some(locate(element)?)).bound_to(element.clone())
        }
        Proposal::Scroll { element: None } => Action::scroll(None),
        Proposal::Wait { ms } => Action::wait((*ms).min(10_000)),
        Proposal::Navigate { url } => Action::navigate(url.clone()),
        Proposal::Done { .. } | Proposal::Fail { .. } | Proposal::Invalid { .. } => {
            return Err("not an action".to_string());
        }
    };
    Ok(action)
}

pub struct DecisionLoop<'a> {
    pub maker: &'a dyn DecisionMaker,
    pub verifier: &'a CompletionVerifier,
    pub procedures: &'a Procedures,
    pub budget: &'a RunBudget,
    pub settle: Duration,
    pub credentials: Option<&'a Credentials>,
    pub auditor: &'a Auditor,
}

impl DecisionLoop<'_> {
    /// Drive turns until the goal's evidence is verified. `turns` is the Run's
    /// turn counter and is shared by every invocation in the Run.
    pub async fn run(
        &self,
        session: &mut Session,
        detector: &mut LoopDetector,
        turns: &mut u32,
        goal: &LoopGoal,
    ) -> Result<Verified> {
        let baseline = session.snapshot().await?.fingerprint();
        let mut window = HistoryWindow::new(self.budget.history_window);
        let mut feedback: Option<String> = None;
        let mut rejected_claims = 0u32;
        info!(stage = %goal.stage, goal = %goal.goal, "handing stage to the decision loop");

        loop {
            if *turns >= self.budget.max_turns {
                return Err(AgentError::TurnBudgetExceeded(self.budget.max_turns));
            }
            *turns += 1;
            let turn = *turns;
            session.tick();

            if session.needs_recycle() {
                let generation = session.generation() + 1;
                self.procedures
                    .recycle(session, self.credentials, "decision turn budget for this browser")
                    .await?;
                self.auditor.emit(RunEvent::SessionRecycled {
                    run_id: self.auditor.run_id().to_string(),
                    generation,
                    reason: "turn budget".to_string(),
                });
                feedback = Some("The browser was restarted and the page reloaded. Nothing was done since.".into());
            }

            let snap = session.snapshot().await?;
            if self.procedures.login_wall_evidence().holds(&snap) {
                return Err(AgentError::AuthRequired(format!("login wall at {} during decision turn", snap.url)));
            }
            let page = snap.render(session.render_limit());
            self.auditor
                .artifact(&format!("turn_{turn:02}_snapshot"), ArtifactBody::Text(page.clone()))
                .await;

            let context = DecisionContext {
                stage: goal.stage,
                goal: goal.goal.clone(),
                page,
                history: window.records(),
                dropped_summary: window.summary(),
                feedback: feedback.take(),
                turn,
                turns_remaining: self.budget.max_turns - turn,
            };
            let proposal = self.maker.propose(&context).await?;

            match &proposal {
                Proposal::Done { summary } => {
                    let verdict = self
                        .verifier
                        .check_claim(session, goal.stage, &goal.evidence, Some(&baseline))
                        .await?;
                    match verdict {
                        ClaimVerdict::Confirmed(verified) => {
                            info!(turn, summary, "decision loop claim verified");
                            return Ok(verified);
                        }
                        ClaimVerdict::Unverified { reason } => {
                            rejected_claims += 1;
                            warn!(turn, summary, reason, rejected_claims, "done claim rejected");
                            self.record_turn(&mut window, turn, format!("done: {summary}"), format!("rejected: {reason}"), false);
                            if rejected_claims > self.budget.max_rejected_claims {
                                return Err(AgentError::verification(
                                    goal.stage,
                                    format!("{rejected_claims} completion claims rejected, last: {reason}"),
                                ));
                            }
                            feedback = Some(format!("Your Done claim was rejected: {reason}. The goal is not met yet."));
                        }
                    }
                }
                Proposal::Fail { reason } => {
                    return Err(AgentError::DecisionFailed(reason.clone()));
                }
                Proposal::Invalid { raw, error } => {
                    warn!(turn, raw, error, "unparseable proposal");
                    self.record_turn(&mut window, turn, "invalid reply".into(), error.clone(), false);
                    feedback = Some(format!("Your last reply was not a valid action JSON object: {error}"));
                }
                other => {
                    let action = match bind(&snap, other) {
                        Ok(action) => action,
                        Err(reason) => {
                            self.record_turn(&mut window, turn, format!("{other:?}"), reason.clone(), false);
                            feedback = Some(reason);
                            continue;
                        }
                    };
                    detector.check(&action)?;

                    let before = snap.fingerprint();
                    let outcome = match session.act(&action).await {
                        Ok(()) => {
                            tokio::time::sleep(self.settle).await;
                            let after = session.snapshot().await?;
                            if after.fingerprint() != before {
                                ActionOutcome::Advanced
                            } else {
                                ActionOutcome::NoChange
                            }
                        }
                        Err(err) if err.is_transient() => ActionOutcome::Failed(err.to_string()),
                        Err(err) => return Err(err),
                    };
                    info!(turn, %action, outcome = %outcome_label(&outcome), "decision turn");
                    let advanced = outcome == ActionOutcome::Advanced;
                    self.record_turn(&mut window, turn, action.to_string(), outcome_label(&outcome), advanced);
                    if outcome == ActionOutcome::NoChange {
                        feedback = Some(format!("`{action}` changed nothing on the page."));
                    }
                    detector.record(&action, outcome)?;
                }
            }
        }
    }

    fn record_turn(&self, window: &mut HistoryWindow, number: u32, action: String, outcome: String, advanced: bool) {
        self.auditor.emit(RunEvent::Turn {
            run_id: self.auditor.run_id().to_string(),
            number,
            description: format!("{action} -> {outcome}"),
        });
        window.push(TurnRecord {
            number,
            action,
            outcome,
            advanced,
        });
    }
}
