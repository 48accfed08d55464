//! UI driver adapter contract.
//!
//! The control loop only sees these two traits. [`crate::hands`] implements them
//! over headless Chrome; tests implement them over a simulated page.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;
use crate::snapshot::RawSnapshot;
use crate::types::Action;

/// One live browser page. Page state is eventually consistent after `act`.
#[async_trait]
pub trait UiDriver: Send {
    async fn open(&mut self, url: &str) -> Result<()>;

    async fn snapshot(&mut self) -> Result<RawSnapshot>;

    /// Execute one primitive action. Targeted actions carry the element
    /// reference they were resolved to.
    async fn act(&mut self, action: &Action) -> Result<()>;

    async fn screenshot(&mut self) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct LaunchParams {
    pub headless: bool,
    pub attach_url: Option<String>,
    pub profile_dir: Option<PathBuf>,
    /// Attach to a browser left over from an earlier launch instead of
    /// starting a new process.
    pub reuse_existing: bool,
    /// Incremented on every relaunch within a Run.
    pub generation: u32,
}

/// Starts browser sessions. Returns `AgentError::AlreadyRunning` when a
/// previous process still holds the profile.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn launch(&self, params: &LaunchParams) -> Result<Box<dyn UiDriver>>;
}
