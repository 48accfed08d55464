//! Configuration for the sourcing agent.
//!
//! Everything is read from environment variables (a `.env` file is loaded by the
//! binary first). Budgets and routine timings have production defaults; the
//! target site's URLs and labels live in [`SiteProfile`], which can be replaced
//! wholesale by a JSON file named in `SITE_PROFILE_PATH`.
//!
//! - `OPENAI_API_KEY` / `LLM_MODEL` - decision maker and criteria interpreter.
//! - `AIRTABLE_API_KEY` / `AIRTABLE_BASE_ID` / `AIRTABLE_TABLE_NAME` - record store.
//! - `SITE_EMAIL` / `SITE_PASSWORD` - login credentials for the target app.
//! - `TARGET_URL` - workspace page the run works on.
//! - `MAX_TURNS`, `RUN_TIMEOUT_SECS`, `LOOP_THRESHOLD`, `HISTORY_WINDOW` - run budget.
//! - `RECYCLE_EVERY_TURNS`, `HEADLESS`, `BROWSER_ATTACH_URL` - session policy.
//! - `IMPORT_POLL_SECS`, `IMPORT_STABLE_SAMPLES`, `IMPORT_TIMEOUT_SECS` - import polling.
//! - `AUDIT_DIR`, `PORT`, `POLL_INTERVAL_MINUTES`, `ENABLE_SCHEDULER` - service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::types::{FilterCategory, Locator};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Could not load site profile {0}: {1}")]
    SiteProfile(PathBuf, String),
}

/// Hard limits on one Run.
#[derive(Debug, Clone)]
pub struct RunBudget {
    /// Decision-loop turns allowed across the whole Run.
    pub max_turns: u32,
    pub wall_clock: Duration,
    /// Non-advancing attempts of one action signature before escalation.
    pub loop_threshold: u32,
    /// Recent turns passed verbatim to the decision maker.
    pub history_window: usize,
    /// Self-reported completions the verifier may reject before the Run fails.
    pub max_rejected_claims: u32,
    /// Attempts per stage when the session degrades mid-stage.
    pub stage_attempts: u32,
    /// Continue to enrichment with a partial import instead of failing.
    pub accept_partial_import: bool,
}

impl Default for RunBudget {
    fn default() -> Self {
        Self {
            max_turns: 40,
            wall_clock: Duration::from_secs(30 * 60),
            loop_threshold: 3,
            history_window: 8,
            max_rejected_claims: 2,
            stage_attempts: 2,
            accept_partial_import: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Relaunch the browser after this many decision turns. Zero disables.
    pub recycle_every_turns: u32,
    /// Consecutive transient driver failures that count as degradation.
    pub degradation_threshold: u32,
    pub headless: bool,
    /// Attach to an already running browser instead of launching one.
    pub attach_url: Option<String>,
    pub profile_dir: Option<PathBuf>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            recycle_every_turns: 15,
            degradation_threshold: 4,
            headless: true,
            attach_url: None,
            profile_dir: dirs::data_local_dir().map(|d| d.join("sourcing-agent").join("profile")),
        }
    }
}

/// Bounded exponential backoff for transient UI errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

/// Wait tuning for one routine: settle after acting, then poll the
/// post-condition until `timeout`, re-acting up to `retries` times.
#[derive(Debug, Clone)]
pub struct RoutineTiming {
    pub settle: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

impl RoutineTiming {
    pub const fn new(settle_ms: u64, poll_ms: u64, timeout_ms: u64, retries: u32) -> Self {
        Self {
            settle: Duration::from_millis(settle_ms),
            poll_interval: Duration::from_millis(poll_ms),
            timeout: Duration::from_millis(timeout_ms),
            retries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutineTimings {
    pub navigation: RoutineTiming,
    pub login: RoutineTiming,
    pub filter: RoutineTiming,
    pub import: RoutineTiming,
    pub enrichment: RoutineTiming,
    /// How long to wait for a human to click an email verification link.
    pub email_verification: Duration,
    /// Pause after a decision-loop action before re-snapshotting.
    pub decision_settle: Duration,
}

impl Default for RoutineTimings {
    fn default() -> Self {
        Self {
            navigation: RoutineTiming::new(3_000, 1_000, 30_000, 1),
            login: RoutineTiming::new(2_000, 1_000, 25_000, 1),
            filter: RoutineTiming::new(1_000, 500, 8_000, 2),
            import: RoutineTiming::new(2_000, 1_000, 20_000, 1),
            enrichment: RoutineTiming::new(2_000, 1_000, 20_000, 1),
            email_verification: Duration::from_secs(60),
            decision_settle: Duration::from_millis(1_500),
        }
    }
}

/// Stability polling after a bulk import is triggered.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub stable_samples: u32,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            stable_samples: 3,
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Independent re-check of a claimed transition.
#[derive(Debug, Clone)]
pub struct VerifyPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(1),
        }
    }
}

/// Bounds applied by the snapshot condenser.
#[derive(Debug, Clone)]
pub struct CondenserLimits {
    pub max_elements: usize,
    pub max_texts: usize,
    pub max_label_chars: usize,
    pub max_render_chars: usize,
}

impl Default for CondenserLimits {
    fn default() -> Self {
        Self {
            max_elements: 150,
            max_texts: 60,
            max_label_chars: 80,
            max_render_chars: 6_000,
        }
    }
}

/// Where a filter category lives on the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSection {
    /// Header that expands the section when its input is hidden.
    pub toggle: Locator,
    pub input: Locator,
}

impl FilterSection {
    fn new(label: &str, input: &str) -> Self {
        Self {
            toggle: Locator::role("button", label),
            input: Locator::role("textbox", input),
        }
    }

    /// Section labels a pill of this category may be reported under.
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes = vec![self.toggle.name.clone()];
        if !self.input.name.eq_ignore_ascii_case(&self.toggle.name) {
            scopes.push(self.input.name.clone());
        }
        scopes
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterLabels {
    pub titles: FilterSection,
    pub seniority: FilterSection,
    pub locations: FilterSection,
    pub exclusions: FilterSection,
}

impl FilterLabels {
    pub fn section(&self, category: FilterCategory) -> &FilterSection {
        match category {
            FilterCategory::Titles => &self.titles,
            FilterCategory::Seniority => &self.seniority,
            FilterCategory::Locations => &self.locations,
            FilterCategory::Exclusions => &self.exclusions,
        }
    }
}

impl Default for FilterLabels {
    fn default() -> Self {
        Self {
            titles: FilterSection::new("Job title", "Job titles"),
            seniority: FilterSection::new("Seniority", "Seniority"),
            locations: FilterSection::new("Location", "Locations"),
            exclusions: FilterSection::new("Exclude job titles", "Job titles to exclude"),
        }
    }
}

/// URLs and semantic labels of the target web app.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    pub target_url: String,
    pub login_url: String,
    /// Page text that only shows on the login wall.
    pub login_markers: Vec<String>,
    /// URL fragments that mean the session is not authenticated.
    pub login_url_markers: Vec<String>,
    /// Page text that only shows once signed in.
    pub authenticated_markers: Vec<String>,
    pub email_field: Locator,
    pub password_field: Locator,
    pub continue_button: Locator,
    pub verify_email_markers: Vec<String>,
    pub resend_verification: Locator,
    pub filters: FilterLabels,
    /// Element roles the snapshot uses for applied filter pills.
    pub pill_roles: Vec<String>,
    /// Label next to the search result count.
    pub results_counter: String,
    pub import_button: Locator,
    pub import_confirm: Locator,
    /// Upper bound on how many results one import pulls in.
    pub import_limit: u64,
    pub import_started_markers: Vec<String>,
    /// Label next to the destination table's row count.
    pub table_counter: String,
    pub enrich_button: Locator,
    pub enrich_confirm: Locator,
    pub enrichment_markers: Vec<String>,
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            target_url: String::new(),
            login_url: "https://app.clay.com/login".to_string(),
            login_markers: vec!["Welcome back".to_string()],
            login_url_markers: vec!["/login".to_string(), "expired=true".to_string()],
            authenticated_markers: vec!["Search".to_string(), "Find".to_string()],
            email_field: Locator::role("textbox", "email address"),
            password_field: Locator::role("textbox", "password"),
            continue_button: Locator::role("button", "Continue"),
            verify_email_markers: vec!["Verify your email".to_string()],
            resend_verification: Locator::named("Resend verification link"),
            filters: FilterLabels::default(),
            pill_roles: vec!["pill".to_string(), "tag".to_string(), "chip".to_string()],
            results_counter: "results".to_string(),
            import_button: Locator::role("button", "Add to table"),
            import_confirm: Locator::role("button", "Confirm"),
            import_limit: 100,
            import_started_markers: vec!["Importing".to_string()],
            table_counter: "rows".to_string(),
            enrich_button: Locator::role("button", "Enrich"),
            enrich_confirm: Locator::role("button", "Run enrichment"),
            enrichment_markers: vec!["Enrichment running".to_string()],
        }
    }
}

/// Login credentials for the target app. Never printed.
#[derive(Clone, Default)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-5.2".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordStoreConfig {
    pub api_key: Option<String>,
    pub base_id: Option<String>,
    pub table_name: String,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_id: None,
            table_name: "JobSeekers".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub audit_dir: PathBuf,
    pub enable_scheduler: bool,
    pub poll_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            audit_dir: std::env::temp_dir().join("sourcing-agent").join("audit"),
            enable_scheduler: true,
            poll_interval: Duration::from_secs(180 * 60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub budget: RunBudget,
    pub session: SessionPolicy,
    pub retry: RetryPolicy,
    pub timings: RoutineTimings,
    pub polling: PollPolicy,
    pub verify: VerifyPolicy,
    pub condenser: CondenserLimits,
    pub site: SiteProfile,
    pub credentials: Option<Credentials>,
    pub llm: LlmConfig,
    pub records: RecordStoreConfig,
    pub service: ServiceConfig,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `TARGET_URL` is not set either in
    /// the environment or in the site profile file, and `InvalidValue` for any
    /// unparseable number or flag.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = AgentConfig::default();

        if let Ok(path) = std::env::var("SITE_PROFILE_PATH") {
            let path = PathBuf::from(path);
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::SiteProfile(path.clone(), e.to_string()))?;
            config.site = serde_json::from_str(&text)
                .map_err(|e| ConfigError::SiteProfile(path.clone(), e.to_string()))?;
        }
        if let Ok(url) = std::env::var("TARGET_URL") {
            config.site.target_url = url;
        }
        if config.site.target_url.is_empty() {
            return Err(ConfigError::MissingEnvVar("TARGET_URL".to_string()));
        }
        config.site.import_limit = env_parse("IMPORT_LIMIT", config.site.import_limit)?;

        let budget = &mut config.budget;
        budget.max_turns = env_parse("MAX_TURNS", budget.max_turns)?;
        budget.wall_clock = env_secs("RUN_TIMEOUT_SECS", budget.wall_clock)?;
        budget.loop_threshold = env_parse("LOOP_THRESHOLD", budget.loop_threshold)?;
        budget.history_window = env_parse("HISTORY_WINDOW", budget.history_window)?;
        budget.accept_partial_import =
            env_parse("ACCEPT_PARTIAL_IMPORT", budget.accept_partial_import)?;

        let session = &mut config.session;
        session.recycle_every_turns = env_parse("RECYCLE_EVERY_TURNS", session.recycle_every_turns)?;
        session.headless = env_parse("HEADLESS", session.headless)?;
        session.attach_url = std::env::var("BROWSER_ATTACH_URL").ok();
        if let Ok(dir) = std::env::var("BROWSER_PROFILE_DIR") {
            session.profile_dir = Some(PathBuf::from(dir));
        }

        let polling = &mut config.polling;
        polling.interval = env_secs("IMPORT_POLL_SECS", polling.interval)?;
        polling.stable_samples = env_parse("IMPORT_STABLE_SAMPLES", polling.stable_samples)?;
        polling.timeout = env_secs("IMPORT_TIMEOUT_SECS", polling.timeout)?;

        config.credentials = match (std::env::var("SITE_EMAIL"), std::env::var("SITE_PASSWORD")) {
            (Ok(email), Ok(password)) => Some(Credentials { email, password }),
            _ => None,
        };

        config.llm.api_key = std::env::var("OPENAI_API_KEY").ok();
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm.model = model;
        }

        config.records.api_key = std::env::var("AIRTABLE_API_KEY").ok();
        config.records.base_id = std::env::var("AIRTABLE_BASE_ID").ok();
        if let Ok(table) = std::env::var("AIRTABLE_TABLE_NAME") {
            config.records.table_name = table;
        }

        let service = &mut config.service;
        service.port = env_parse("PORT", service.port)?;
        if let Ok(dir) = std::env::var("AUDIT_DIR") {
            service.audit_dir = PathBuf::from(dir);
        }
        service.enable_scheduler = env_parse("ENABLE_SCHEDULER", service.enable_scheduler)?;
        let minutes: u64 = env_parse("POLL_INTERVAL_MINUTES", service.poll_interval.as_secs() / 60)?;
        service.poll_interval = Duration::from_secs(minutes * 60);

        Ok(config)
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .to_lowercase()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_profile_json_overrides_only_named_fields() {
        let profile: SiteProfile = serde_json::from_str(
            r#"{"target_url": "https://app.example.com/w/find", "results_counter": "people"}"#,
        )
        .unwrap();
        assert_eq!(profile.target_url, "https://app.example.com/w/find");
        assert_eq!(profile.results_counter, "people");
        assert_eq!(profile.continue_button, Locator::role("button", "Continue"));
        assert_eq!(profile.import_limit, 100);
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            email: "ops@example.com".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{creds:?}");
        assert!(printed.contains("ops@example.com"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn defaults_bound_every_loop() {
        let config = AgentConfig::default();
        assert!(config.budget.max_turns > 0);
        assert!(config.budget.loop_threshold >= 2);
        assert!(config.polling.stable_samples >= 2);
        assert!(config.retry.max_attempts > 0);
    }
}
