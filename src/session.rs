//! Browser resource manager.
//!
//! A [`Session`] exclusively owns one live [`UiDriver`]. Every driver call goes
//! through it so transient failures are retried in place with backoff, repeated
//! failures are counted as degradation, and the process can be recycled on a
//! turn budget without the Run losing track of where it was.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{CondenserLimits, RetryPolicy, SessionPolicy};
use crate::driver::{DriverFactory, LaunchParams, UiDriver};
use crate::error::{AgentError, Result};
use crate::retry::Backoff;
use crate::snapshot::{Condenser, Snapshot};
use crate::types::Action;

pub struct Session {
    factory: Arc<dyn DriverFactory>,
    driver: Option<Box<dyn UiDriver>>,
    policy: SessionPolicy,
    retry: RetryPolicy,
    condenser: Condenser,
    generation: u32,
    turns_since_launch: u32,
    consecutive_transient: u32,
    resume_url: Option<String>,
    last_fingerprint: Option<String>,
}

impl Session {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        policy: SessionPolicy,
        retry: RetryPolicy,
        limits: CondenserLimits,
    ) -> Self {
        Self {
            factory,
            driver: None,
            policy,
            retry,
            condenser: Condenser::new(limits),
            generation: 0,
            turns_since_launch: 0,
            consecutive_transient: 0,
            resume_url: None,
            last_fingerprint: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.driver.is_some()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn render_limit(&self) -> usize {
        self.condenser.limits().max_render_chars
    }

    /// Fingerprint of the most recent snapshot taken through this session.
    pub fn last_fingerprint(&self) -> Option<&str> {
        self.last_fingerprint.as_deref()
    }

    /// Page to return to after a relaunch.
    pub fn set_resume_url(&mut self, url: impl Into<String>) {
        self.resume_url = Some(url.into());
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    fn launch_params(&self) -> LaunchParams {
        LaunchParams {
            headless: self.policy.headless,
            attach_url: self.policy.attach_url.clone(),
            profile_dir: self.policy.profile_dir.clone(),
            reuse_existing: false,
            generation: self.generation,
        }
    }

    /// Start the browser. A process that is already running is not an error:
    /// the next attempt attaches to it instead.
    pub async fn launch(&mut self) -> Result<()> {
        if self.driver.is_some() {
            return Ok(());
        }
        let mut params = self.launch_params();
        let mut backoff = Backoff::new(&self.retry);
        loop {
            let launched = self.factory.launch(&params).await;
            match launched {
                Ok(driver) => {
                    info!(generation = self.generation, "browser session ready");
                    self.driver = Some(driver);
                    self.turns_since_launch = 0;
                    self.consecutive_transient = 0;
                    return Ok(());
                }
                Err(err) if err.is_transient() => {
                    if matches!(err, AgentError::AlreadyRunning(_)) {
                        warn!(error = %err, "browser already running, attaching on retry");
                        params.reuse_existing = true;
                    }
                    match backoff.next() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => return Err(AgentError::SessionDegraded(format!("launch failed: {err}"))),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn driver_mut(&mut self) -> Result<&mut Box<dyn UiDriver>> {
        self.driver
            .as_mut()
            .ok_or_else(|| AgentError::SessionDegraded("browser session is not running".into()))
    }

    /// Decide whether a failed call is retried. Returns the delay before the
    /// next attempt, or the error to surface.
    fn absorb(&mut self, err: AgentError, backoff: &mut Backoff, op: &str) -> Result<Duration> {
        if !err.is_transient() {
            return Err(err);
        }
        self.consecutive_transient += 1;
        match backoff.next() {
            Some(delay) => {
                debug!(op, error = %err, attempt = backoff.attempts_made(), "transient UI error, retrying");
                Ok(delay)
            }
            None => Err(AgentError::SessionDegraded(format!(
                "{op} kept failing after {} attempts: {err}",
                backoff.attempts_made()
            ))),
        }
    }

    pub async fn open(&mut self, url: &str) -> Result<()> {
        let mut backoff = Backoff::new(&self.retry);
        loop {
            let result = self.driver_mut()?.open(url).await;
            match result {
                Ok(()) => {
                    self.consecutive_transient = 0;
                    return Ok(());
                }
                Err(err) => {
                    let delay = self.absorb(err, &mut backoff, "open")?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fresh, condensed snapshot. Never served from cache.
    pub async fn snapshot(&mut self) -> Result<Snapshot> {
        let mut backoff = Backoff::new(&self.retry);
        loop {
            let result = self.driver_mut()?.snapshot().await;
            match result {
                Ok(raw) => {
                    self.consecutive_transient = 0;
                    let snap = self.condenser.condense(raw);
                    self.last_fingerprint = Some(snap.fingerprint());
                    return Ok(snap);
                }
                Err(err) => {
                    let delay = self.absorb(err, &mut backoff, "snapshot")?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Execute one action. A stale reference is not retried here: the caller
    /// has to re-resolve its target against a new snapshot.
    pub async fn act(&mut self, action: &Action) -> Result<()> {
        let mut backoff = Backoff::new(&self.retry);
        loop {
            let result = self.driver_mut()?.act(action).await;
            match result {
                Ok(()) => {
                    self.consecutive_transient = 0;
                    return Ok(());
                }
                Err(AgentError::StaleReference(reference)) => {
                    self.consecutive_transient += 1;
                    return Err(AgentError::StaleReference(reference));
                }
                Err(err) => {
                    let delay = self.absorb(err, &mut backoff, "act")?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Best effort; a failed capture is logged and skipped.
    pub async fn screenshot(&mut self) -> Option<Vec<u8>> {
        let driver = self.driver.as_mut()?;
        match driver.screenshot().await {
            Ok(png) => Some(png),
            Err(err) => {
                warn!(error = %err, "screenshot failed");
                None
            }
        }
    }

    /// Count one decision turn against the recycle budget.
    pub fn tick(&mut self) {
        self.turns_since_launch += 1;
    }

    pub fn turns_since_launch(&self) -> u32 {
        self.turns_since_launch
    }

    pub fn needs_recycle(&self) -> bool {
        let every = self.policy.recycle_every_turns;
        (every > 0 && self.turns_since_launch >= every)
            || self.consecutive_transient >= self.policy.degradation_threshold
    }

    /// Tear down and relaunch, then return to the resume page. Remote state the
    /// web app persisted is untouched; callers keep their verified Run state.
    pub async fn recycle(&mut self, reason: &str) -> Result<()> {
        info!(generation = self.generation, reason, "recycling browser session");
        self.teardown().await;
        self.generation += 1;
        self.launch().await?;
        if let Some(url) = self.resume_url.clone() {
            self.open(&url).await?;
        }
        Ok(())
    }

    /// Close the driver. Always leaves the session not live.
    pub async fn teardown(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            if let Err(err) = driver.close().await {
                warn!(error = %err, "browser close failed, dropping session anyway");
            }
        }
        self.last_fingerprint = None;
    }
}
