use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// One unit of work: whose list to build and the criteria to build it from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub subject_id: String,
    pub subject_name: String,
    pub correlation_id: String,
    pub criteria: RawCriteria,
}

/// Free-text criteria as entered by a human, one value per list item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCriteria {
    pub titles: Vec<String>,
    pub locations: Vec<String>,
    pub seniority: Vec<String>,
    pub exclusions: Vec<String>,
    pub industries: Vec<String>,
    pub include_keywords: Vec<String>,
    pub notes: String,
}

impl RawCriteria {
    /// Split a multi-line or comma separated field into ordered values.
    pub fn split_field(raw: &str) -> Vec<String> {
        let separator = if raw.contains('\n') { '\n' } else { ',' };
        raw.split(separator)
            .map(|v| v.trim().trim_start_matches(['-', '*', '•']).trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Fill,
    PressKey,
    Scroll,
    Wait,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::PressKey => "press",
            ActionKind::Scroll => "scroll",
            ActionKind::Wait => "wait",
        };
        f.write_str(s)
    }
}

/// Semantic target descriptor: an optional role plus a visible or accessible name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    #[serde(default)]
    pub role: Option<String>,
    pub name: String,
}

impl Locator {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            role: None,
            name: name.into(),
        }
    }

    pub fn role(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            name: name.into(),
        }
    }

    pub fn normalized(&self) -> String {
        let name = normalize_label(&self.name);
        match &self.role {
            Some(role) => format!("{}:{}", role.to_lowercase(), name),
            None => format!("*:{name}"),
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.role {
            Some(role) => write!(f, "{} \"{}\"", role, self.name),
            None => write!(f, "\"{}\"", self.name),
        }
    }
}

/// Lowercase, trimmed, single-spaced form used for label comparisons.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A single primitive intent. Immutable once built; logged, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub target: Option<Locator>,
    pub value: Option<String>,
    /// Element reference for the current page load, filled in when the target
    /// was resolved against a snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl Action {
    fn new(kind: ActionKind, target: Option<Locator>, value: Option<String>) -> Self {
        Self {
            kind,
            target,
            value,
            reference: None,
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self::new(ActionKind::Navigate, None, Some(url.into()))
    }

    pub fn click(target: Locator) -> Self {
        Self::new(ActionKind::Click, Some(target), None)
    }

    pub fn fill(target: Locator, value: impl Into<String>) -> Self {
        Self::new(ActionKind::Fill, Some(target), Some(value.into()))
    }

    pub fn press(key: impl Into<String>) -> Self {
        Self::new(ActionKind::PressKey, None, Some(key.into()))
    }

    pub fn scroll(target: Option<Locator>) -> Self {
        Self::new(ActionKind::Scroll, target, None)
    }

    pub fn wait(ms: u64) -> Self {
        Self::new(ActionKind::Wait, None, Some(ms.to_string()))
    }

    pub fn bound_to(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn signature(&self) -> ActionSignature {
        ActionSignature {
            kind: self.kind,
            target: self.target.as_ref().map(Locator::normalized),
            value: self.value.clone(),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(target) = &self.target {
            write!(f, " {target}")?;
        }
        if let Some(value) = &self.value {
            if self.kind == ActionKind::Fill {
                write!(f, " = \"{value}\"")?;
            } else {
                write!(f, " {value}")?;
            }
        }
        Ok(())
    }
}

/// (action type, semantic target, value). Page-load references are left out so
/// byte-identical retries on a re-rendered page still collapse together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionSignature {
    pub kind: ActionKind,
    pub target: Option<String>,
    pub value: Option<String>,
}

impl std::fmt::Display for ActionSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}, {})",
            self.kind,
            self.target.as_deref().unwrap_or("-"),
            self.value.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCategory {
    Titles,
    Seniority,
    Locations,
    Exclusions,
}

impl FilterCategory {
    pub const ORDER: [FilterCategory; 4] = [
        FilterCategory::Titles,
        FilterCategory::Seniority,
        FilterCategory::Locations,
        FilterCategory::Exclusions,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            FilterCategory::Titles => "titles",
            FilterCategory::Seniority => "seniority",
            FilterCategory::Locations => "locations",
            FilterCategory::Exclusions => "exclusions",
        }
    }
}

impl std::fmt::Display for FilterCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Run states in their only legal order, plus the two failure terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    Authenticated,
    CriteriaReady,
    FiltersApplied,
    ResultsVerified,
    ImportTriggered,
    ImportComplete,
    EnrichmentTriggered,
    Done,
    Failed,
    TimedOut,
}

impl RunState {
    pub const SEQUENCE: [RunState; 9] = [
        RunState::Init,
        RunState::Authenticated,
        RunState::CriteriaReady,
        RunState::FiltersApplied,
        RunState::ResultsVerified,
        RunState::ImportTriggered,
        RunState::ImportComplete,
        RunState::EnrichmentTriggered,
        RunState::Done,
    ];

    /// Position in the forward sequence; `None` for the failure terminals.
    pub fn ordinal(&self) -> Option<usize> {
        Self::SEQUENCE.iter().position(|s| s == self)
    }

    pub fn next(&self) -> Option<RunState> {
        self.ordinal()
            .and_then(|i| Self::SEQUENCE.get(i + 1))
            .copied()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::TimedOut)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Init => "INIT",
            RunState::Authenticated => "AUTHENTICATED",
            RunState::CriteriaReady => "CRITERIA_READY",
            RunState::FiltersApplied => "FILTERS_APPLIED",
            RunState::ResultsVerified => "RESULTS_VERIFIED",
            RunState::ImportTriggered => "IMPORT_TRIGGERED",
            RunState::ImportComplete => "IMPORT_COMPLETE",
            RunState::EnrichmentTriggered => "ENRICHMENT_TRIGGERED",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
            RunState::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedFilter {
    pub category: FilterCategory,
    pub value: String,
    /// The pill was already on the page and the routine skipped it.
    pub already_present: bool,
}

/// What a Run has verifiably achieved so far. Reported on every outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub last_verified: RunState,
    pub applied_filters: Vec<AppliedFilter>,
    pub results_available: Option<u64>,
    pub expected_import: Option<u64>,
    pub imported: Option<u64>,
    pub import_complete: bool,
    pub enrichment_started: bool,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            last_verified: RunState::Init,
            applied_filters: Vec::new(),
            results_available: None,
            expected_import: None,
            imported: None,
            import_complete: false,
            enrichment_started: false,
        }
    }
}

impl Progress {
    pub fn describe(&self) -> String {
        let mut parts = vec![format!("last verified state {}", self.last_verified)];
        if !self.applied_filters.is_empty() {
            parts.push(format!("{} filters applied", self.applied_filters.len()));
        }
        if let Some(n) = self.results_available {
            parts.push(format!("{n} results"));
        }
        if let Some(n) = self.imported {
            let expected = self.expected_import.unwrap_or(n);
            parts.push(format!("{n}/{expected} imported"));
        }
        if self.enrichment_started {
            parts.push("enrichment started".to_string());
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Success {
        summary: String,
        progress: Progress,
    },
    Failed {
        reason: ErrorKind,
        detail: String,
        progress: Progress,
    },
    TimedOut {
        last_state: RunState,
        progress: Progress,
    },
}

impl RunOutcome {
    pub fn progress(&self) -> &Progress {
        match self {
            RunOutcome::Success { progress, .. }
            | RunOutcome::Failed { progress, .. }
            | RunOutcome::TimedOut { progress, .. } => progress,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }
}

/// Terminal result handed back to the caller, with the audit record key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub correlation_id: String,
    pub subject_id: String,
    pub outcome: RunOutcome,
    pub final_state: RunState,
    pub turns: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Events streamed to live observers (SSE, logs).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: String,
        subject_id: String,
    },
    StateChanged {
        run_id: String,
        state: RunState,
        evidence: String,
    },
    Turn {
        run_id: String,
        number: u32,
        description: String,
    },
    SessionRecycled {
        run_id: String,
        generation: u32,
        reason: String,
    },
    Finished {
        run_id: String,
        outcome: RunOutcome,
    },
}
