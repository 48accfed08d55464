//! Completion verifier.
//!
//! Nothing that performs a step may also certify it. Routines and the decision
//! loop hand the verifier an [`Evidence`] predicate; the verifier takes its own
//! fresh snapshots and only then issues a [`Verified`] token, which is the sole
//! currency [`crate::run::Run::transition`] accepts.

use serde::Serialize;
use tracing::{debug, info};

use crate::config::VerifyPolicy;
use crate::error::{AgentError, Result};
use crate::session::Session;
use crate::snapshot::Snapshot;
use crate::types::{Locator, RunState};

/// Structural predicate over a snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Evidence {
    UrlContains(String),
    UrlLacks(String),
    ElementPresent(Locator),
    ElementAbsent(Locator),
    TextPresent(String),
    TextAbsent(String),
    /// Pill for `value`. A non-empty `scopes` only counts pills inside a
    /// section carrying one of those labels.
    Pill {
        value: String,
        roles: Vec<String>,
        scopes: Vec<String>,
    },
    CounterAtLeast { label: String, min: u64 },
    All(Vec<Evidence>),
    Any(Vec<Evidence>),
}

impl Evidence {
    pub fn holds(&self, snap: &Snapshot) -> bool {
        match self {
            Evidence::UrlContains(fragment) => snap.url.contains(fragment.as_str()),
            Evidence::UrlLacks(fragment) => !snap.url.contains(fragment.as_str()),
            Evidence::ElementPresent(locator) => snap.is_present(locator),
            Evidence::ElementAbsent(locator) => !snap.is_present(locator),
            Evidence::TextPresent(text) => snap.contains_text(text),
            Evidence::TextAbsent(text) => !snap.contains_text(text),
            Evidence::Pill { value, roles, scopes } => snap.has_pill(value, roles, scopes),
            Evidence::CounterAtLeast { label, min } => {
                snap.counter(label).is_some_and(|n| n >= *min)
            }
            Evidence::All(all) => all.iter().all(|e| e.holds(snap)),
            Evidence::Any(any) => any.iter().any(|e| e.holds(snap)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Evidence::UrlContains(f) => format!("url contains {f:?}"),
            Evidence::UrlLacks(f) => format!("url lacks {f:?}"),
            Evidence::ElementPresent(l) => format!("{l} present"),
            Evidence::ElementAbsent(l) => format!("{l} absent"),
            Evidence::TextPresent(t) => format!("text {t:?} present"),
            Evidence::TextAbsent(t) => format!("text {t:?} absent"),
            Evidence::Pill { value, scopes, .. } => match scopes.first() {
                Some(scope) => format!("pill {value:?} present in {scope:?}"),
                None => format!("pill {value:?} present"),
            },
            Evidence::CounterAtLeast { label, min } => format!("{label} >= {min}"),
            Evidence::All(all) => join(all, " and "),
            Evidence::Any(any) => format!("({})", join(any, " or ")),
        }
    }
}

fn join(items: &[Evidence], sep: &str) -> String {
    items.iter().map(Evidence::describe).collect::<Vec<_>>().join(sep)
}

/// Proof that a stage's post-condition was observed on a fresh snapshot.
/// Only this module and the explicit non-UI constructor can mint one.
#[derive(Debug, Clone, Serialize)]
pub struct Verified {
    stage: RunState,
    evidence: String,
    fingerprint: Option<String>,
}

impl Verified {
    /// For transitions with nothing on the page to check, such as validating
    /// the interpreted criteria.
    pub(crate) fn deterministic(stage: RunState, note: impl Into<String>) -> Self {
        Self {
            stage,
            evidence: note.into(),
            fingerprint: None,
        }
    }

    pub fn stage(&self) -> RunState {
        self.stage
    }

    pub fn evidence(&self) -> &str {
        &self.evidence
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }
}

#[derive(Debug)]
pub enum ClaimVerdict {
    Confirmed(Verified),
    Unverified { reason: String },
}

pub struct CompletionVerifier {
    policy: VerifyPolicy,
}

impl CompletionVerifier {
    pub fn new(policy: VerifyPolicy) -> Self {
        Self { policy }
    }

    /// Re-snapshot until `evidence` holds or attempts run out.
    pub async fn confirm(
        &self,
        session: &mut Session,
        stage: RunState,
        evidence: &Evidence,
    ) -> Result<Verified> {
        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            let snap = session.snapshot().await?;
            if evidence.holds(&snap) {
                info!(%stage, evidence = %evidence.describe(), "transition verified");
                return Ok(Verified {
                    stage,
                    evidence: evidence.describe(),
                    fingerprint: Some(snap.fingerprint()),
                });
            }
            debug!(%stage, attempt, "evidence not observed yet");
            if attempt < attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }
        Err(AgentError::verification(
            stage,
            format!("{} not observed after {attempts} checks", evidence.describe()),
        ))
    }

    /// Treat a decision maker's "done" as a hint. A claim made from a page whose
    /// fingerprint equals `baseline` is rejected outright.
    pub async fn check_claim(
        &self,
        session: &mut Session,
        stage: RunState,
        evidence: &Evidence,
        baseline: Option<&str>,
    ) -> Result<ClaimVerdict> {
        let snap = session.snapshot().await?;
        if baseline.is_some_and(|b| b == snap.fingerprint()) && !evidence.holds(&snap) {
            return Ok(ClaimVerdict::Unverified {
                reason: "no structural change since the stage began".to_string(),
            });
        }
        match self.confirm(session, stage, evidence).await {
            Ok(verified) => Ok(ClaimVerdict::Confirmed(verified)),
            Err(AgentError::VerificationFailed { detail, .. }) => {
                Ok(ClaimVerdict::Unverified { reason: detail })
            }
            Err(err) => Err(err),
        }
    }
}
