use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

use crate::error::{AgentError, Result};
use crate::types::{Action, ActionSignature};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The page changed after the action.
    Advanced,
    NoChange,
    Failed(String),
    /// Refused before execution.
    Rejected,
}

impl ActionOutcome {
    pub fn advanced(&self) -> bool {
        matches!(self, ActionOutcome::Advanced)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionLogEntry {
    pub signature: ActionSignature,
    pub outcome: ActionOutcome,
    pub at: DateTime<Utc>,
    /// Identical consecutive attempts collapsed into this entry.
    pub repeats: u32,
}

/// Per-Run tally of non-advancing attempts keyed by normalized signature.
#[derive(Debug)]
pub struct LoopDetector {
    threshold: u32,
    stalls: HashMap<ActionSignature, u32>,
    log: Vec<ActionLogEntry>,
}

impl LoopDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            stalls: HashMap::new(),
            log: Vec::new(),
        }
    }

    pub fn stalls(&self, action: &Action) -> u32 {
        self.stalls.get(&action.signature()).copied().unwrap_or(0)
    }

    /// Refuse an action whose signature already stalled `threshold` times.
    pub fn check(&mut self, action: &Action) -> Result<()> {
        let signature = action.signature();
        let attempts = self.stalls.get(&signature).copied().unwrap_or(0);
        if attempts >= self.threshold {
            self.push(signature.clone(), ActionOutcome::Rejected);
            warn!(%signature, attempts, "refusing repeated action");
            return Err(AgentError::LoopDetected {
                signature: signature.to_string(),
                attempts,
            });
        }
        Ok(())
    }

    /// Record what an executed action did. Errors as soon as the signature hits
    /// the threshold, so the caller escalates instead of proposing it again.
    pub fn record(&mut self, action: &Action, outcome: ActionOutcome) -> Result<()> {
        let signature = action.signature();
        if outcome.advanced() {
            self.stalls.remove(&signature);
            self.push(signature, outcome);
            return Ok(());
        }
        let attempts = self.stalls.entry(signature.clone()).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;
        self.push(signature.clone(), outcome);
        if attempts >= self.threshold {
            warn!(%signature, attempts, "action is looping without progress");
            return Err(AgentError::LoopDetected {
                signature: signature.to_string(),
                attempts,
            });
        }
        Ok(())
    }

    fn push(&mut self, signature: ActionSignature, outcome: ActionOutcome) {
        if let Some(last) = self.log.last_mut() {
            if last.signature == signature && last.outcome == outcome {
                last.repeats += 1;
                last.at = Utc::now();
                return;
            }
        }
        self.log.push(ActionLogEntry {
            signature,
            outcome,
            at: Utc::now(),
            repeats: 1,
        });
    }

    pub fn entries(&self) -> &[ActionLogEntry] {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Locator;

    fn fill(value: &str) -> Action {
        Action::fill(Locator::role("textbox", "Job titles"), value)
    }

    #[test]
    fn third_identical_stall_escalates_and_fourth_is_refused() {
        let mut detector = LoopDetector::new(3);
        let action = fill("X");
        for _ in 0..2 {
            detector.check(&action).unwrap();
            detector.record(&action, ActionOutcome::NoChange).unwrap();
        }
        detector.check(&action).unwrap();
        let err = detector.record(&action, ActionOutcome::NoChange).unwrap_err();
        assert!(matches!(err, AgentError::LoopDetected { attempts: 3, .. }));
        assert!(detector.check(&action).is_err());
    }

    #[test]
    fn different_values_are_tracked_separately() {
        let mut detector = LoopDetector::new(2);
        detector.record(&fill("VP Sales"), ActionOutcome::NoChange).unwrap();
        detector.record(&fill("Director BD"), ActionOutcome::NoChange).unwrap();
        assert_eq!(detector.stalls(&fill("VP Sales")), 1);
        assert!(detector.check(&fill("Head of Sales")).is_ok());
    }

    #[test]
    fn progress_clears_the_stall_count() {
        let mut detector = LoopDetector::new(2);
        let action = fill("X");
        detector.record(&action, ActionOutcome::NoChange).unwrap();
        detector.record(&action, ActionOutcome::Advanced).unwrap();
        assert_eq!(detector.stalls(&action), 0);
        detector.record(&action, ActionOutcome::NoChange).unwrap();
    }

    #[test]
    fn identical_consecutive_entries_collapse_in_the_log() {
        let mut detector = LoopDetector::new(5);
        let action = fill("X").bound_to("e3");
        let retry = fill("X").bound_to("e8");
        detector.record(&action, ActionOutcome::NoChange).unwrap();
        detector.record(&retry, ActionOutcome::NoChange).unwrap();
        detector.record(&fill("Y"), ActionOutcome::NoChange).unwrap();
        let entries = detector.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].repeats, 2);
    }
}
