//! Supervised browser agent that sources prospect lists in a third-party web app.
//!
//! A [`run::RunMachine`] drives one [`types::Task`] through a forward-only state
//! sequence. Scripted routines in [`procedures`] do most of the work; the bounded
//! LLM loop in [`decision_loop`] covers the steps they cannot express, and every
//! transition is confirmed by [`verifier`] from a fresh page snapshot.

pub mod audit;
pub mod brain;
pub mod config;
pub mod criteria;
pub mod decision_loop;
pub mod driver;
pub mod error;
pub mod hands;
pub mod loop_detector;
pub mod orchestrator;
pub mod polling;
pub mod procedures;
pub mod record_store;
pub mod retry;
pub mod run;
pub mod session;
pub mod snapshot;
pub mod types;
pub mod verifier;

pub use config::AgentConfig;
pub use error::{AgentError, ErrorKind, Result};
pub use orchestrator::Orchestrator;
pub use run::{Collaborators, RunMachine};
pub use types::{Action, ActionKind, Locator, RunOutcome, RunReport, RunState, Task};
