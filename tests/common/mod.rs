//! Simulated target app, driver and decision maker shared by the integration
//! tests. Remote state (sign-in, pills, import, enrichment) survives a browser
//! relaunch; page-local state (open sections, typed text, dialogs) does not.

#![allow(dead_code)]

use async_trait::async_trait;
use sourcing_agent::audit::InMemoryAuditStore;
use sourcing_agent::brain::{DecisionContext, DecisionMaker, Proposal};
use sourcing_agent::config::{
    AgentConfig, Credentials, FilterLabels, PollPolicy, RetryPolicy, RoutineTiming, RoutineTimings,
    VerifyPolicy,
};
use sourcing_agent::criteria::ListInterpreter;
use sourcing_agent::driver::{DriverFactory, LaunchParams, UiDriver};
use sourcing_agent::snapshot::{RawElement, RawSnapshot};
use sourcing_agent::types::{FilterCategory, RawCriteria};
use sourcing_agent::{Action, ActionKind, AgentError, Collaborators, Result, RunMachine, Task};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TARGET_URL: &str = "https://app.test/workspace/find";
pub const LOGIN_URL: &str = "https://app.test/login";
pub const VERIFY_URL: &str = "https://app.test/verify-email";
pub const EMAIL: &str = "ops@example.com";
pub const PASSWORD: &str = "correct horse";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Page {
    Blank,
    LoginEmail,
    LoginPassword,
    VerifyEmail,
    Workspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialog {
    Import,
    Enrich,
}

pub struct FakeApp {
    // Remote state.
    pub signed_in: bool,
    pub pills: Vec<(String, String)>,
    pub results: u64,
    pub import_started: bool,
    pub import_clicks: u32,
    /// Table row counts revealed one per workspace snapshot once the import
    /// runs. The last value sticks.
    pub row_schedule: VecDeque<u64>,
    pub rows: u64,
    /// Caption the table as import progress, "imported N of TOTAL rows".
    pub import_total: Option<u64>,
    pub enrichment_started: bool,
    pub enrichment_clicks: u32,

    // Behaviour knobs.
    pub verify_email: bool,
    /// Filter inputs where Enter never turns the text into a pill.
    pub broken_inputs: HashSet<String>,
    /// "Add to table" only shows after opening the "More actions" menu.
    pub import_behind_menu: bool,
    /// Session expires once this many pills exist.
    pub sign_out_after_pills: Option<usize>,
    pub sign_out_on_relaunch: bool,
    /// Once this many pills exist, the next `outage_snapshots` snapshots fail
    /// as not ready. Fires once.
    pub outage_after_pills: Option<usize>,
    pub outage_snapshots: u32,
    pub(crate) outage_left: u32,
    pub failed_snapshots: u32,

    // Page-local state.
    pub(crate) page: Page,
    pub(crate) open_sections: HashSet<String>,
    pub(crate) inputs: HashMap<String, String>,
    pub(crate) focused: Option<String>,
    pub(crate) menu_open: bool,
    pub(crate) dialog: Option<Dialog>,
    pub(crate) login_error: bool,

    pub launches: u32,
    pub log: Vec<String>,
}

impl Default for FakeApp {
    fn default() -> Self {
        Self {
            signed_in: false,
            pills: Vec::new(),
            results: 250,
            import_started: false,
            import_clicks: 0,
            row_schedule: VecDeque::from([40, 85, 100]),
            rows: 0,
            import_total: None,
            enrichment_started: false,
            enrichment_clicks: 0,
            verify_email: false,
            broken_inputs: HashSet::new(),
            import_behind_menu: false,
            sign_out_after_pills: None,
            sign_out_on_relaunch: false,
            outage_after_pills: None,
            outage_snapshots: 0,
            outage_left: 0,
            failed_snapshots: 0,
            page: Page::Blank,
            open_sections: HashSet::new(),
            inputs: HashMap::new(),
            focused: None,
            menu_open: false,
            dialog: None,
            login_error: false,
            launches: 0,
            log: Vec::new(),
        }
    }
}

/// (toggle button, input textbox) per filter section, taken from the default
/// site profile.
fn sections() -> Vec<(String, String)> {
    let labels = FilterLabels::default();
    FilterCategory::ORDER
        .iter()
        .map(|c| {
            let s = labels.section(*c);
            (s.toggle.name.clone(), s.input.name.clone())
        })
        .collect()
}

impl FakeApp {
    pub fn shared(self) -> Arc<Mutex<FakeApp>> {
        Arc::new(Mutex::new(self))
    }

    pub fn pill_values(&self) -> Vec<String> {
        self.pills.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Pill values under one filter input.
    pub fn pills_in(&self, input: &str) -> Vec<String> {
        self.pills
            .iter()
            .filter(|(i, _)| i == input)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn reset_page_state(&mut self) {
        self.open_sections.clear();
        self.inputs.clear();
        self.focused = None;
        self.menu_open = false;
        self.dialog = None;
        self.login_error = false;
    }

    fn relaunched(&mut self) {
        self.launches += 1;
        self.reset_page_state();
        self.page = Page::Blank;
        if self.sign_out_on_relaunch && self.launches > 1 {
            self.signed_in = false;
        }
    }

    fn open(&mut self, url: &str) {
        self.reset_page_state();
        self.page = if url.starts_with(LOGIN_URL) && !self.signed_in {
            Page::LoginEmail
        } else {
            Page::Workspace
        };
    }

    fn submit_login(&mut self) {
        match self.page {
            Page::LoginEmail => {
                if self.inputs.get("email address").is_some_and(|v| !v.is_empty()) {
                    self.page = Page::LoginPassword;
                }
            }
            Page::LoginPassword => {
                if self.inputs.get("password").map(String::as_str) == Some(PASSWORD) {
                    if self.verify_email {
                        self.page = Page::VerifyEmail;
                    } else {
                        self.signed_in = true;
                        self.page = Page::Workspace;
                    }
                } else {
                    self.login_error = true;
                }
            }
            _ => {}
        }
    }

    fn click(&mut self, name: &str) {
        if let Some((_, input)) = sections().into_iter().find(|(toggle, _)| toggle == name) {
            self.open_sections.insert(input);
            return;
        }
        match name {
            "Continue" => self.submit_login(),
            "Resend verification link" => {
                // The human follows the fresh link.
                self.signed_in = true;
                self.page = Page::Workspace;
            }
            "More actions" => self.menu_open = true,
            "Add to table" => self.dialog = Some(Dialog::Import),
            "Confirm" if self.dialog == Some(Dialog::Import) => {
                self.dialog = None;
                self.import_started = true;
                self.import_clicks += 1;
            }
            "Enrich" => self.dialog = Some(Dialog::Enrich),
            "Run enrichment" if self.dialog == Some(Dialog::Enrich) => {
                self.dialog = None;
                self.enrichment_started = true;
                self.enrichment_clicks += 1;
            }
            _ => {}
        }
    }

    fn press(&mut self, key: &str) {
        if key != "Enter" {
            return;
        }
        if matches!(self.page, Page::LoginEmail | Page::LoginPassword) {
            self.submit_login();
            return;
        }
        let Some(input) = self.focused.clone() else {
            return;
        };
        if self.broken_inputs.contains(&input) {
            return;
        }
        let value = self.inputs.get(&input).cloned().unwrap_or_default();
        if value.is_empty() {
            return;
        }
        if !self.pills.iter().any(|(i, v)| i == &input && v == &value) {
            self.pills.push((input.clone(), value));
        }
        self.inputs.remove(&input);
    }

    fn snapshot_fails(&mut self) -> bool {
        if self.outage_after_pills.is_some_and(|n| self.pills.len() >= n) {
            self.outage_after_pills = None;
            self.outage_left = self.outage_snapshots;
        }
        if self.outage_left == 0 {
            return false;
        }
        self.outage_left -= 1;
        self.failed_snapshots += 1;
        true
    }

    fn render(&mut self) -> RawSnapshot {
        if let Some(n) = self.sign_out_after_pills {
            if self.pills.len() >= n {
                self.signed_in = false;
            }
        }
        if self.page == Page::Workspace && !self.signed_in {
            self.page = Page::LoginEmail;
            self.reset_page_state();
        }

        let mut elements: Vec<(String, String, Option<String>, Option<String>)> = Vec::new();
        let mut texts: Vec<String> = Vec::new();
        let value = |inputs: &HashMap<String, String>, name: &str| inputs.get(name).cloned();

        let (url, title) = match self.page {
            Page::Blank => ("about:blank".to_string(), String::new()),
            Page::LoginEmail => {
                texts.push("Welcome back".into());
                elements.push(("textbox".into(), "email address".into(), value(&self.inputs, "email address"), None));
                elements.push(("button".into(), "Continue".into(), None, None));
                (format!("{LOGIN_URL}?expired=true"), "Sign in".to_string())
            }
            Page::LoginPassword => {
                texts.push("Welcome back".into());
                if self.login_error {
                    texts.push("Incorrect password".into());
                }
                elements.push(("textbox".into(), "password".into(), value(&self.inputs, "password"), None));
                elements.push(("button".into(), "Continue".into(), None, None));
                (LOGIN_URL.to_string(), "Sign in".to_string())
            }
            Page::VerifyEmail => {
                texts.push("Verify your email".into());
                elements.push(("link".into(), "Resend verification link".into(), None, None));
                (VERIFY_URL.to_string(), "Verify".to_string())
            }
            Page::Workspace => {
                if self.import_started {
                    if let Some(n) = self.row_schedule.pop_front() {
                        self.rows = n;
                    }
                    if self.row_schedule.is_empty() {
                        self.row_schedule.push_back(self.rows);
                    }
                }
                let results = if self.pills.is_empty() { 0 } else { self.results };
                texts.push("Find people".into());
                texts.push(format!("{results} results"));
                match self.import_total {
                    Some(total) if self.import_started => {
                        texts.push(format!("Table: imported {} of {total} rows", self.rows))
                    }
                    _ => texts.push(format!("Table: {} rows", self.rows)),
                }
                if self.import_started {
                    texts.push("Importing".into());
                }
                if self.enrichment_started {
                    texts.push("Enrichment running".into());
                }
                for (toggle, input) in sections() {
                    elements.push(("button".into(), toggle, None, None));
                    if self.open_sections.contains(&input) {
                        let v = value(&self.inputs, &input);
                        elements.push(("textbox".into(), input, v, None));
                    }
                }
                for (input, pill) in &self.pills {
                    elements.push(("pill".into(), pill.clone(), None, Some(input.clone())));
                }
                if self.import_behind_menu && !self.menu_open {
                    elements.push(("button".into(), "More actions".into(), None, None));
                } else {
                    elements.push(("button".into(), "Add to table".into(), None, None));
                }
                elements.push(("button".into(), "Enrich".into(), None, None));
                match self.dialog {
                    Some(Dialog::Import) => elements.push(("button".into(), "Confirm".into(), None, None)),
                    Some(Dialog::Enrich) => elements.push(("button".into(), "Run enrichment".into(), None, None)),
                    None => {}
                }
                (TARGET_URL.to_string(), "Find people".to_string())
            }
        };

        RawSnapshot {
            url,
            title,
            elements: elements
                .into_iter()
                .enumerate()
                .map(|(i, (role, name, value, section))| RawElement {
                    reference: format!("e{i}"),
                    role,
                    name,
                    value,
                    section,
                })
                .collect(),
            texts,
        }
    }
}

pub struct FakeDriver {
    app: Arc<Mutex<FakeApp>>,
    /// Reference -> (role, name) from the latest snapshot.
    refs: HashMap<String, (String, String)>,
}

#[async_trait]
impl UiDriver for FakeDriver {
    async fn open(&mut self, url: &str) -> Result<()> {
        self.refs.clear();
        let mut app = self.app.lock().unwrap();
        app.log.push(format!("open {url}"));
        app.open(url);
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<RawSnapshot> {
        let raw = {
            let mut app = self.app.lock().unwrap();
            if app.snapshot_fails() {
                return Err(AgentError::NotReady("page still loading".into()));
            }
            app.render()
        };
        self.refs = raw
            .elements
            .iter()
            .map(|e| (e.reference.clone(), (e.role.clone(), e.name.clone())))
            .collect();
        Ok(raw)
    }

    async fn act(&mut self, action: &Action) -> Result<()> {
        let target = match (&action.reference, &action.target) {
            (Some(reference), _) => Some(
                self.refs
                    .get(reference)
                    .cloned()
                    .ok_or_else(|| AgentError::StaleReference(reference.clone()))?,
            ),
            (None, Some(locator)) => Some((locator.role.clone().unwrap_or_default(), locator.name.clone())),
            (None, None) => None,
        };
        let mut app = self.app.lock().unwrap();
        app.log.push(action.to_string());
        match (action.kind, target) {
            (ActionKind::Click, Some((_, name))) => app.click(&name),
            (ActionKind::Fill, Some((_, name))) => {
                app.inputs.insert(name.clone(), action.value.clone().unwrap_or_default());
                app.focused = Some(name);
            }
            (ActionKind::PressKey, _) => app.press(action.value.as_deref().unwrap_or("")),
            (ActionKind::Navigate, _) => {
                let url = action.value.clone().unwrap_or_default();
                app.open(&url);
            }
            _ => {}
        }
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        Ok(b"\x89PNG fake".to_vec())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct FakeFactory {
    pub app: Arc<Mutex<FakeApp>>,
}

#[async_trait]
impl DriverFactory for FakeFactory {
    async fn launch(&self, _params: &LaunchParams) -> Result<Box<dyn UiDriver>> {
        self.app.lock().unwrap().relaunched();
        Ok(Box::new(FakeDriver {
            app: self.app.clone(),
            refs: HashMap::new(),
        }))
    }
}

type Script = Box<dyn Fn(&DecisionContext) -> Proposal + Send + Sync>;

/// Decision maker driven by a closure. Every context it was shown is kept.
pub struct ScriptedDecisionMaker {
    script: Script,
    seen: Mutex<Vec<DecisionContext>>,
}

impl ScriptedDecisionMaker {
    pub fn new(script: impl Fn(&DecisionContext) -> Proposal + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Fails every turn. For runs that should never need the loop.
    pub fn unused() -> Arc<Self> {
        Self::new(|_| Proposal::Fail {
            reason: "not scripted".into(),
        })
    }

    pub fn contexts(&self) -> Vec<DecisionContext> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionMaker for ScriptedDecisionMaker {
    async fn propose(&self, context: &DecisionContext) -> Result<Proposal> {
        self.seen.lock().unwrap().push(context.clone());
        Ok((self.script)(context))
    }
}

/// Reference of the element rendered as `[eN] role "name"` on `page`.
pub fn element_ref(page: &str, role: &str, name: &str) -> Option<String> {
    let wanted = format!("{role} \"{name}\"");
    page.lines().find_map(|line| {
        let rest = line.strip_prefix('[')?;
        let (reference, tail) = rest.split_once(']')?;
        tail.trim_start().starts_with(&wanted).then(|| reference.to_string())
    })
}

/// Production shape, millisecond timings.
pub fn fast_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.site.target_url = TARGET_URL.to_string();
    config.site.login_url = LOGIN_URL.to_string();
    config.credentials = Some(Credentials {
        email: EMAIL.to_string(),
        password: PASSWORD.to_string(),
    });
    config.session.profile_dir = None;
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    config.timings = RoutineTimings {
        navigation: RoutineTiming::new(1, 5, 300, 1),
        login: RoutineTiming::new(1, 5, 200, 1),
        filter: RoutineTiming::new(1, 5, 100, 1),
        import: RoutineTiming::new(1, 5, 150, 1),
        enrichment: RoutineTiming::new(1, 5, 150, 1),
        email_verification: Duration::from_millis(500),
        decision_settle: Duration::from_millis(1),
    };
    config.polling = PollPolicy {
        interval: Duration::from_millis(2),
        stable_samples: 3,
        timeout: Duration::from_secs(2),
    };
    config.verify = VerifyPolicy {
        attempts: 3,
        interval: Duration::from_millis(2),
    };
    config.budget.wall_clock = Duration::from_secs(20);
    config
}

pub fn sample_criteria() -> RawCriteria {
    RawCriteria {
        titles: vec!["VP Sales".into(), "Director BD".into()],
        seniority: vec!["VP".into(), "Director".into()],
        locations: vec!["New York".into()],
        ..RawCriteria::default()
    }
}

pub fn task(criteria: RawCriteria) -> Task {
    Task {
        subject_id: "rec1".into(),
        subject_name: "Dana Example".into(),
        correlation_id: "corr-1".into(),
        criteria,
    }
}

pub struct Harness {
    pub app: Arc<Mutex<FakeApp>>,
    pub audit: Arc<InMemoryAuditStore>,
    pub maker: Arc<ScriptedDecisionMaker>,
}

impl Harness {
    pub fn new(app: FakeApp, maker: Arc<ScriptedDecisionMaker>) -> Self {
        Self {
            app: app.shared(),
            audit: Arc::new(InMemoryAuditStore::new()),
            maker,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            interpreter: Arc::new(ListInterpreter),
            decision_maker: self.maker.clone(),
            audit: self.audit.clone(),
            factory: Arc::new(FakeFactory { app: self.app.clone() }),
            events: None,
        }
    }

    pub fn machine(&self, config: AgentConfig) -> RunMachine {
        RunMachine::new(Arc::new(config), self.collaborators())
    }

    pub fn app(&self) -> std::sync::MutexGuard<'_, FakeApp> {
        self.app.lock().unwrap()
    }
}
