//! Deterministic routines.
//!
//! Each routine resolves its targets by role and accessible name against a
//! fresh snapshot, acts, waits its own settle interval, then polls a concrete
//! post-condition. A routine whose post-condition already holds does nothing.

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::{Credentials, RoutineTiming, RoutineTimings, SiteProfile};
use crate::error::{AgentError, Result};
use crate::session::Session;
use crate::snapshot::Snapshot;
use crate::types::{Action, AppliedFilter, FilterCategory, Locator};
use crate::verifier::Evidence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    AlreadyAuthenticated,
    LoggedIn,
}

/// What happens right after the main action of a step.
#[derive(Debug, Clone)]
enum FollowUp {
    Press(&'static str),
    /// Click a button, pressing Enter when it cannot be found.
    Submit(Locator),
}

struct Step<'a> {
    routine: &'static str,
    action: Action,
    follow_up: Option<FollowUp>,
    expect: Evidence,
    timing: &'a RoutineTiming,
}

pub struct Procedures {
    site: SiteProfile,
    timings: RoutineTimings,
}

impl Procedures {
    pub fn new(site: SiteProfile, timings: RoutineTimings) -> Self {
        Self { site, timings }
    }

    pub fn site(&self) -> &SiteProfile {
        &self.site
    }

    pub fn login_wall_evidence(&self) -> Evidence {
        let mut any: Vec<Evidence> = self
            .site
            .login_url_markers
            .iter()
            .map(|m| Evidence::UrlContains(m.clone()))
            .collect();
        any.extend(self.site.login_markers.iter().map(|m| Evidence::TextPresent(m.clone())));
        Evidence::Any(any)
    }

    pub fn authenticated_evidence(&self) -> Evidence {
        let mut all: Vec<Evidence> = self
            .site
            .login_url_markers
            .iter()
            .map(|m| Evidence::UrlLacks(m.clone()))
            .collect();
        all.extend(self.site.login_markers.iter().map(|m| Evidence::TextAbsent(m.clone())));
        all.push(Evidence::Any(
            self.site
                .authenticated_markers
                .iter()
                .map(|m| Evidence::TextPresent(m.clone()))
                .collect(),
        ));
        Evidence::All(all)
    }

    fn verify_wall_evidence(&self) -> Evidence {
        Evidence::Any(
            self.site
                .verify_email_markers
                .iter()
                .map(|m| Evidence::TextPresent(m.clone()))
                .collect(),
        )
    }

    /// A pill for `value` inside the `category` section.
    pub fn pill_evidence(&self, category: FilterCategory, value: &str) -> Evidence {
        Evidence::Pill {
            value: value.to_string(),
            roles: self.site.pill_roles.clone(),
            scopes: self.site.filters.section(category).scopes(),
        }
    }

    pub fn import_started_evidence(&self) -> Evidence {
        let mut any: Vec<Evidence> = self
            .site
            .import_started_markers
            .iter()
            .map(|m| Evidence::TextPresent(m.clone()))
            .collect();
        any.push(Evidence::CounterAtLeast {
            label: self.site.table_counter.clone(),
            min: 1,
        });
        Evidence::Any(any)
    }

    pub fn enrichment_evidence(&self) -> Evidence {
        Evidence::Any(
            self.site
                .enrichment_markers
                .iter()
                .map(|m| Evidence::TextPresent(m.clone()))
                .collect(),
        )
    }

    fn on_login_wall(&self, snap: &Snapshot) -> bool {
        self.login_wall_evidence().holds(snap)
    }

    /// A login wall outside the authenticate routine is fatal to the Run.
    fn guard_login(&self, snap: &Snapshot, routine: &str) -> Result<()> {
        if self.on_login_wall(snap) {
            return Err(AgentError::AuthRequired(format!(
                "login wall appeared during {routine} at {}",
                snap.url
            )));
        }
        Ok(())
    }

    /// Poll fresh snapshots until `evidence` holds or `timeout` passes.
    async fn wait_for(
        &self,
        session: &mut Session,
        evidence: &Evidence,
        timing: &RoutineTiming,
    ) -> Result<Option<Snapshot>> {
        let deadline = Instant::now() + timing.timeout;
        loop {
            let snap = session.snapshot().await?;
            if evidence.holds(&snap) {
                return Ok(Some(snap));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(timing.poll_interval).await;
        }
    }

    /// Wait for `locator` to resolve to exactly one element. Ambiguity is
    /// reported at once; absence only after the routine's timeout.
    async fn resolve(
        &self,
        session: &mut Session,
        routine: &'static str,
        locator: &Locator,
        timing: &RoutineTiming,
    ) -> Result<(Snapshot, String)> {
        let deadline = Instant::now() + timing.timeout;
        loop {
            let snap = session.snapshot().await?;
            if routine != "authenticate" {
                self.guard_login(&snap, routine)?;
            }
            match snap.resolve(locator) {
                Ok(el) => {
                    let reference = el.reference.clone();
                    return Ok((snap, reference));
                }
                Err(AgentError::TargetNotFound(_)) if Instant::now() < deadline => {
                    sleep(timing.poll_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn follow_up(&self, session: &mut Session, follow_up: &FollowUp) -> Result<()> {
        match follow_up {
            FollowUp::Press(key) => session.act(&Action::press(*key)).await,
            FollowUp::Submit(button) => {
                let snap = session.snapshot().await?;
                match snap.resolve(button) {
                    Ok(el) => {
                        let action = Action::click(button.clone()).bound_to(el.reference.clone());
                        session.act(&action).await
                    }
                    Err(_) => {
                        debug!(%button, "submit button not found, pressing Enter");
                        session.act(&Action::press("Enter")).await
                    }
                }
            }
        }
    }

    async fn perform(&self, session: &mut Session, step: Step<'_>) -> Result<()> {
        let Some(target) = step.action.target.clone() else {
            return Err(AgentError::TargetNotFound(format!("{} has no target", step.action)));
        };
        for attempt in 0..=step.timing.retries {
            let (snap, reference) = self.resolve(session, step.routine, &target, step.timing).await?;
            if attempt > 0 && step.expect.holds(&snap) {
                return Ok(());
            }
            let bound = step.action.clone().bound_to(reference);
            debug!(routine = step.routine, attempt, action = %bound, "routine act");
            match session.act(&bound).await {
                Ok(()) => {}
                Err(AgentError::StaleReference(r)) => {
                    debug!(routine = step.routine, reference = %r, "stale reference, re-resolving");
                    continue;
                }
                Err(err) => return Err(err),
            }
            if let Some(follow_up) = &step.follow_up {
                self.follow_up(session, follow_up).await?;
            }
            sleep(step.timing.settle).await;
            if self.wait_for(session, &step.expect, step.timing).await?.is_some() {
                return Ok(());
            }
            warn!(routine = step.routine, attempt, expect = %step.expect.describe(), "post-condition not met");
        }
        Err(AgentError::PostconditionTimeout {
            routine: step.routine.to_string(),
            detail: format!("{} after {}", step.expect.describe(), step.action),
        })
    }

    /// Open the workspace and sign in if the login wall shows.
    pub async fn authenticate(
        &self,
        session: &mut Session,
        credentials: Option<&Credentials>,
    ) -> Result<AuthOutcome> {
        let site = &self.site;
        let timing = &self.timings.login;
        session.set_resume_url(site.target_url.clone());
        session.open(&site.target_url).await?;
        sleep(self.timings.navigation.settle).await;

        let landed = Evidence::Any(vec![self.authenticated_evidence(), self.login_wall_evidence()]);
        let Some(snap) = self.wait_for(session, &landed, &self.timings.navigation).await? else {
            return Err(AgentError::PostconditionTimeout {
                routine: "authenticate".into(),
                detail: format!("{} never rendered a known page", site.target_url),
            });
        };
        if !self.on_login_wall(&snap) {
            info!("session already authenticated");
            return Ok(AuthOutcome::AlreadyAuthenticated);
        }

        let Some(creds) = credentials else {
            return Err(AgentError::AuthRequired("login wall shown and no credentials configured".into()));
        };
        info!(email = %creds.email, "logging in");
        if !snap.is_present(&site.email_field) && !snap.is_present(&site.password_field) {
            session.open(&site.login_url).await?;
        }

        self.perform(
            session,
            Step {
                routine: "authenticate",
                action: Action::fill(site.email_field.clone(), creds.email.clone()),
                follow_up: Some(FollowUp::Submit(site.continue_button.clone())),
                expect: Evidence::ElementPresent(site.password_field.clone()),
                timing,
            },
        )
        .await?;

        let signed_in_or_wall = Evidence::Any(vec![self.authenticated_evidence(), self.verify_wall_evidence()]);
        self.perform(
            session,
            Step {
                routine: "authenticate",
                action: Action::fill(site.password_field.clone(), creds.password.clone()),
                follow_up: Some(FollowUp::Submit(site.continue_button.clone())),
                expect: signed_in_or_wall,
                timing,
            },
        )
        .await
        .map_err(|err| match err {
            AgentError::PostconditionTimeout { detail, .. } => {
                AgentError::AuthRequired(format!("credentials were not accepted: {detail}"))
            }
            other => other,
        })?;

        let snap = session.snapshot().await?;
        if self.verify_wall_evidence().holds(&snap) {
            self.await_email_verification(session, &snap).await?;
        }

        session.open(&site.target_url).await?;
        let verified = self.wait_for(session, &self.authenticated_evidence(), &self.timings.navigation).await?;
        if verified.is_none() {
            return Err(AgentError::AuthRequired("still on the login wall after signing in".into()));
        }
        info!("logged in");
        Ok(AuthOutcome::LoggedIn)
    }

    async fn await_email_verification(&self, session: &mut Session, snap: &Snapshot) -> Result<()> {
        warn!("email verification requested, sending a fresh link");
        if let Ok(el) = snap.resolve(&self.site.resend_verification) {
            let action = Action::click(self.site.resend_verification.clone()).bound_to(el.reference.clone());
            if let Err(err) = session.act(&action).await {
                warn!(error = %err, "could not click resend verification link");
            }
        }
        let wait = RoutineTiming {
            timeout: self.timings.email_verification,
            ..self.timings.login.clone()
        };
        match self.wait_for(session, &self.authenticated_evidence(), &wait).await? {
            Some(_) => Ok(()),
            None => Err(AgentError::AuthRequired(format!(
                "email verification not completed within {:?}",
                self.timings.email_verification
            ))),
        }
    }

    /// Add one filter value as a pill. Expands the section first if its input
    /// is hidden. Skips values whose pill is already on the page.
    pub async fn apply_filter_value(
        &self,
        session: &mut Session,
        category: FilterCategory,
        value: &str,
    ) -> Result<AppliedFilter> {
        let section = self.site.filters.section(category);
        let timing = &self.timings.filter;
        let expect = self.pill_evidence(category, value);

        let snap = session.snapshot().await?;
        self.guard_login(&snap, "apply_filter")?;
        if expect.holds(&snap) {
            debug!(%category, value, "filter already applied");
            return Ok(AppliedFilter {
                category,
                value: value.to_string(),
                already_present: true,
            });
        }

        if !snap.is_present(&section.input) {
            self.perform(
                session,
                Step {
                    routine: "open_filter_section",
                    action: Action::click(section.toggle.clone()),
                    follow_up: None,
                    expect: Evidence::ElementPresent(section.input.clone()),
                    timing,
                },
            )
            .await?;
        }

        self.perform(
            session,
            Step {
                routine: "apply_filter",
                action: Action::fill(section.input.clone(), value),
                follow_up: Some(FollowUp::Press("Enter")),
                expect,
                timing,
            },
        )
        .await?;
        info!(%category, value, "filter applied");
        Ok(AppliedFilter {
            category,
            value: value.to_string(),
            already_present: false,
        })
    }

    /// Fallback when filter application went structurally wrong: reload the
    /// workspace and apply each value again. Values that persisted remotely
    /// are skipped.
    pub async fn reapply_after_reload(
        &self,
        session: &mut Session,
        category: FilterCategory,
        values: &[String],
    ) -> Result<Vec<AppliedFilter>> {
        info!(%category, count = values.len(), "reloading workspace to reapply filters");
        session.open(&self.site.target_url).await?;
        sleep(self.timings.navigation.settle).await;
        let mut applied = Vec::with_capacity(values.len());
        for value in values {
            applied.push(self.apply_filter_value(session, category, value).await?);
        }
        Ok(applied)
    }

    /// Current number of search results.
    pub async fn read_result_count(&self, session: &mut Session) -> Result<u64> {
        let label = self.site.results_counter.clone();
        let evidence = Evidence::CounterAtLeast {
            label: label.clone(),
            min: 0,
        };
        let snap = self
            .wait_for(session, &evidence, &self.timings.filter)
            .await?
            .ok_or_else(|| AgentError::PostconditionTimeout {
                routine: "read_result_count".into(),
                detail: format!("no \"{label}\" counter on the page"),
            })?;
        self.guard_login(&snap, "read_result_count")?;
        Ok(snap.counter(&label).unwrap_or(0))
    }

    /// Click a trigger and its optional confirmation dialog until `started`
    /// holds. Nothing is clicked when it already holds.
    async fn trigger(
        &self,
        session: &mut Session,
        routine: &'static str,
        button: &Locator,
        confirm: &Locator,
        started: Evidence,
        timing: &RoutineTiming,
    ) -> Result<()> {
        let snap = session.snapshot().await?;
        self.guard_login(&snap, routine)?;
        if started.holds(&snap) {
            info!(routine, "already running");
            return Ok(());
        }
        self.perform(
            session,
            Step {
                routine,
                action: Action::click(button.clone()),
                follow_up: None,
                expect: Evidence::Any(vec![Evidence::ElementPresent(confirm.clone()), started.clone()]),
                timing,
            },
        )
        .await?;

        let snap = session.snapshot().await?;
        if started.holds(&snap) {
            return Ok(());
        }
        self.perform(
            session,
            Step {
                routine,
                action: Action::click(confirm.clone()),
                follow_up: None,
                expect: started,
                timing,
            },
        )
        .await
    }

    pub async fn trigger_import(&self, session: &mut Session) -> Result<()> {
        self.trigger(
            session,
            "trigger_import",
            &self.site.import_button,
            &self.site.import_confirm,
            self.import_started_evidence(),
            &self.timings.import,
        )
        .await
    }

    pub async fn trigger_enrichment(&self, session: &mut Session) -> Result<()> {
        self.trigger(
            session,
            "trigger_enrichment",
            &self.site.enrich_button,
            &self.site.enrich_confirm,
            self.enrichment_evidence(),
            &self.timings.enrichment,
        )
        .await
    }

    /// Relaunch the browser and get back to the resume page. Remote state is
    /// left alone; a login wall after relaunch is answered by signing in again.
    pub async fn recycle(
        &self,
        session: &mut Session,
        credentials: Option<&Credentials>,
        reason: &str,
    ) -> Result<()> {
        session.recycle(reason).await?;
        let snap = session.snapshot().await?;
        if self.on_login_wall(&snap) {
            info!("relaunched session is signed out, authenticating again");
            self.authenticate(session, credentials).await?;
        }
        Ok(())
    }
}
