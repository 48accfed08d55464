//! Criteria interpretation.
//!
//! Free-text criteria go in, a fixed-shape [`SearchProfile`] comes out.
//! Interpreters fail closed: anything that does not fit the shape is a
//! `CollaboratorError`, never a best-effort pass-through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::brain::{ChatClient, ChatMessage, strip_fences};
use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::types::{FilterCategory, RawCriteria, normalize_label};

const COLLABORATOR: &str = "criteria interpreter";

/// Controlled seniority vocabulary. Labels match the target app's options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Seniority {
    Owner,
    Founder,
    CXO,
    Partner,
    VP,
    Head,
    Director,
    Manager,
    Senior,
    Entry,
    Intern,
}

impl Seniority {
    pub const ALL: [Seniority; 11] = [
        Seniority::Owner,
        Seniority::Founder,
        Seniority::CXO,
        Seniority::Partner,
        Seniority::VP,
        Seniority::Head,
        Seniority::Director,
        Seniority::Manager,
        Seniority::Senior,
        Seniority::Entry,
        Seniority::Intern,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Seniority::Owner => "Owner",
            Seniority::Founder => "Founder",
            Seniority::CXO => "CXO",
            Seniority::Partner => "Partner",
            Seniority::VP => "VP",
            Seniority::Head => "Head",
            Seniority::Director => "Director",
            Seniority::Manager => "Manager",
            Seniority::Senior => "Senior",
            Seniority::Entry => "Entry",
            Seniority::Intern => "Intern",
        }
    }

    /// Map a token, including common synonyms, onto the vocabulary.
    pub fn parse(token: &str) -> Option<Seniority> {
        let t = normalize_label(token).replace(['-', '.'], " ");
        let t = t.split_whitespace().collect::<Vec<_>>().join(" ");
        let found = match t.as_str() {
            "owner" => Seniority::Owner,
            "founder" | "co founder" | "cofounder" => Seniority::Founder,
            "cxo" | "c level" | "c suite" | "chief" | "executive" => Seniority::CXO,
            "partner" => Seniority::Partner,
            "vp" | "vice president" | "svp" | "evp" => Seniority::VP,
            "head" | "head of" => Seniority::Head,
            "director" | "senior director" => Seniority::Director,
            "manager" | "management" => Seniority::Manager,
            "senior" | "sr" | "lead" => Seniority::Senior,
            "entry" | "entry level" | "junior" | "associate" => Seniority::Entry,
            "intern" | "internship" => Seniority::Intern,
            _ => return None,
        };
        Some(found)
    }
}

impl std::fmt::Display for Seniority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
    /// Raw lists used as-is, no interpretation.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchProfile {
    pub titles: Vec<String>,
    pub seniority: Vec<Seniority>,
    pub locations: Vec<String>,
    pub exclusions: Vec<String>,
    pub confidence: Confidence,
}

fn dedupe(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && seen.insert(normalize_label(v)))
        .collect()
}

impl SearchProfile {
    /// Reject a profile that could not drive a search.
    pub fn validate(mut self) -> Result<Self> {
        self.titles = dedupe(self.titles);
        self.locations = dedupe(self.locations);
        self.exclusions = dedupe(self.exclusions);
        let mut seen = std::collections::HashSet::new();
        self.seniority.retain(|s| seen.insert(*s));
        if self.titles.is_empty() {
            return Err(AgentError::collaborator(COLLABORATOR, "profile has no job titles"));
        }
        if let Some(t) = self.titles.iter().find(|t| t.chars().count() > 100) {
            return Err(AgentError::collaborator(COLLABORATOR, format!("title is not a title: {t:.40}…")));
        }
        if self.locations.is_empty() {
            return Err(AgentError::collaborator(COLLABORATOR, "profile has no locations"));
        }
        Ok(self)
    }

    /// Values for one filter category, in application order.
    pub fn values(&self, category: FilterCategory) -> Vec<String> {
        match category {
            FilterCategory::Titles => self.titles.clone(),
            FilterCategory::Seniority => self.seniority.iter().map(|s| s.label().to_string()).collect(),
            FilterCategory::Locations => self.locations.clone(),
            FilterCategory::Exclusions => self.exclusions.clone(),
        }
    }

    pub fn value_count(&self) -> usize {
        FilterCategory::ORDER.iter().map(|c| self.values(*c).len()).sum()
    }
}

fn parse_seniority(tokens: &[String]) -> Result<Vec<Seniority>> {
    tokens
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| {
            Seniority::parse(t).ok_or_else(|| {
                AgentError::collaborator(COLLABORATOR, format!("unknown seniority {t:?}"))
            })
        })
        .collect()
}

#[async_trait]
pub trait CriteriaInterpreter: Send + Sync {
    async fn interpret(&self, raw: &RawCriteria) -> Result<SearchProfile>;
}

/// Uses the entered lists verbatim.
#[derive(Debug, Default)]
pub struct ListInterpreter;

#[async_trait]
impl CriteriaInterpreter for ListInterpreter {
    async fn interpret(&self, raw: &RawCriteria) -> Result<SearchProfile> {
        SearchProfile {
            titles: raw.titles.clone(),
            seniority: parse_seniority(&raw.seniority)?,
            locations: raw.locations.clone(),
            exclusions: raw.exclusions.clone(),
            confidence: Confidence::Fallback,
        }
        .validate()
    }
}

const INTERPRET_PROMPT: &str = r#"You turn a job seeker's free-text targeting notes into search filters for a people-search tool.

Return ONLY a JSON object:
{"titles": [...], "seniority": [...], "locations": [...], "exclusions": [...], "confidence": "high" | "medium" | "low"}

Rules:
- titles: concrete job titles to search for, most relevant first, at most 10.
- seniority: only values from this list: Owner, Founder, CXO, Partner, VP, Head, Director, Manager, Senior, Entry, Intern.
- locations: cities, regions or countries as a person would type them.
- exclusions: job title keywords to exclude.
- confidence: how sure you are the filters match the intent."#;

#[derive(Debug, Deserialize)]
struct InterpretedProfile {
    titles: Vec<String>,
    #[serde(default)]
    seniority: Vec<String>,
    #[serde(default)]
    locations: Vec<String>,
    #[serde(default)]
    exclusions: Vec<String>,
    confidence: Confidence,
}

pub struct LlmCriteriaInterpreter {
    chat: ChatClient,
}

impl LlmCriteriaInterpreter {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            chat: ChatClient::new(config, COLLABORATOR)?,
        })
    }

    fn describe(raw: &RawCriteria) -> String {
        let list = |v: &[String]| if v.is_empty() { "(none)".to_string() } else { v.join("; ") };
        format!(
            "Target titles: {}\nTarget locations: {}\nSeniority: {}\nIndustries: {}\nInclude keywords: {}\nExclude keywords: {}\nNotes: {}",
            list(&raw.titles),
            list(&raw.locations),
            list(&raw.seniority),
            list(&raw.industries),
            list(&raw.include_keywords),
            list(&raw.exclusions),
            if raw.notes.is_empty() { "(none)" } else { &raw.notes },
        )
    }

    /// Parse and validate a model reply. Public for reuse in tests and tools.
    pub fn parse_reply(content: &str) -> Result<SearchProfile> {
        let parsed: InterpretedProfile = serde_json::from_str(strip_fences(content))
            .map_err(|e| AgentError::collaborator(COLLABORATOR, format!("reply is not a profile: {e}")))?;
        if parsed.confidence == Confidence::Low {
            warn!("criteria interpreted with low confidence");
        }
        SearchProfile {
            titles: parsed.titles,
            seniority: parse_seniority(&parsed.seniority)?,
            locations: parsed.locations,
            exclusions: parsed.exclusions,
            confidence: parsed.confidence,
        }
        .validate()
    }
}

#[async_trait]
impl CriteriaInterpreter for LlmCriteriaInterpreter {
    async fn interpret(&self, raw: &RawCriteria) -> Result<SearchProfile> {
        let messages = [
            ChatMessage::system(INTERPRET_PROMPT),
            ChatMessage::user(Self::describe(raw)),
        ];
        let content = self.chat.complete(&messages).await?;
        let profile = Self::parse_reply(&content)?;
        info!(
            titles = profile.titles.len(),
            locations = profile.locations.len(),
            confidence = ?profile.confidence,
            "criteria interpreted"
        );
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn raw() -> RawCriteria {
        RawCriteria {
            titles: vec!["VP Sales".into(), "Director BD".into(), "vp  sales".into()],
            seniority: vec!["Vice President".into(), "director".into()],
            locations: vec!["New York".into()],
            exclusions: vec!["Intern".into()],
            ..RawCriteria::default()
        }
    }

    #[tokio::test]
    async fn list_interpreter_maps_vocabulary_and_dedupes() {
        let profile = ListInterpreter.interpret(&raw()).await.unwrap();
        assert_eq!(profile.titles, vec!["VP Sales", "Director BD"]);
        assert_eq!(profile.seniority, vec![Seniority::VP, Seniority::Director]);
        assert_eq!(profile.values(FilterCategory::Seniority), vec!["VP", "Director"]);
        assert_eq!(profile.confidence, Confidence::Fallback);
        assert_eq!(profile.value_count(), 5);
    }

    #[tokio::test]
    async fn unknown_seniority_fails_closed() {
        let mut criteria = raw();
        criteria.seniority.push("Grand Poobah".into());
        let err = ListInterpreter.interpret(&criteria).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CollaboratorError);
    }

    #[tokio::test]
    async fn criteria_without_a_location_fail_closed() {
        for locations in [vec![], vec!["  ".to_string()]] {
            let criteria = RawCriteria {
                locations,
                ..raw()
            };
            let err = ListInterpreter.interpret(&criteria).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CollaboratorError);
            assert!(err.to_string().contains("no locations"), "{err}");
        }
    }

    #[test]
    fn llm_reply_is_validated() {
        let profile = LlmCriteriaInterpreter::parse_reply(
            "```json\n{\"titles\":[\"Chief Revenue Officer\"],\"seniority\":[\"CXO\",\"c-level\"],\"locations\":[\"Austin, TX\"],\"exclusions\":[],\"confidence\":\"high\"}\n```",
        )
        .unwrap();
        assert_eq!(profile.seniority, vec![Seniority::CXO]);
        assert_eq!(profile.confidence, Confidence::High);

        for bad in [
            "not json at all",
            r#"{"titles":[],"confidence":"high"}"#,
            r#"{"titles":["VP"],"seniority":["Wizard"],"confidence":"high"}"#,
            r#"{"titles":["VP"],"confidence":"certain"}"#,
            r#"{"titles":["VP"],"seniority":["VP"],"confidence":"high"}"#,
            r#"{"titles":["VP"],"seniority":["VP"],"locations":[" "],"exclusions":[],"confidence":"high"}"#,
        ] {
            let err = LlmCriteriaInterpreter::parse_reply(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::CollaboratorError, "{bad}");
        }
    }
}
