mod face;
mod scheduler;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use sourcing_agent::audit::FileAuditStore;
use sourcing_agent::brain::{DecisionMaker, LlmDecisionMaker, OfflineDecisionMaker};
use sourcing_agent::criteria::{CriteriaInterpreter, ListInterpreter, LlmCriteriaInterpreter};
use sourcing_agent::hands::ChromeFactory;
use sourcing_agent::record_store::{AirtableStore, InMemoryRecordStore, RecordStore};
use sourcing_agent::{AgentConfig, Collaborators, Orchestrator};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LOG_FILTER: &str = "sourcing_agent=info,agent=info";

#[derive(Parser)]
#[command(name = "agent", version, about = "Supervised browser agent for prospect list sourcing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP trigger and debug surface, with the scheduler if enabled.
    Serve,
    /// Run one record to completion and print its report.
    Run {
        #[arg(long)]
        record_id: String,
    },
    /// Process every pending record once.
    Batch,
    /// Open the workspace in a browser and report what renders.
    Check,
}

/// `RUST_LOG` overrides the default filter; `LOG_FORMAT=json` switches to
/// structured output. Logs go to stderr so stdout stays machine readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn interpreter(config: &AgentConfig) -> Result<Arc<dyn CriteriaInterpreter>> {
    if config.llm.api_key.is_none() {
        warn!("OPENAI_API_KEY not set, criteria lists are used verbatim");
        return Ok(Arc::new(ListInterpreter));
    }
    Ok(Arc::new(LlmCriteriaInterpreter::new(&config.llm)?))
}

fn decision_maker(config: &AgentConfig) -> Result<Arc<dyn DecisionMaker>> {
    if config.llm.api_key.is_none() {
        warn!("OPENAI_API_KEY not set, stages without a scripted routine will fail");
        return Ok(Arc::new(OfflineDecisionMaker));
    }
    Ok(Arc::new(LlmDecisionMaker::new(&config.llm)?))
}

fn build(config: Arc<AgentConfig>, records: Arc<dyn RecordStore>) -> Result<Arc<Orchestrator>> {
    let collaborators = Collaborators {
        interpreter: interpreter(&config)?,
        decision_maker: decision_maker(&config)?,
        audit: Arc::new(FileAuditStore::new(config.service.audit_dir.clone())),
        factory: Arc::new(ChromeFactory),
        events: None,
    };
    Ok(Arc::new(Orchestrator::new(config, collaborators, records)))
}

fn airtable(config: &AgentConfig) -> Result<Arc<dyn RecordStore>> {
    let store = AirtableStore::new(&config.records).context("record store is not configured")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = Arc::new(AgentConfig::from_env()?);
    info!(target_url = %config.site.target_url, audit_dir = %config.service.audit_dir.display(), "configuration loaded");

    match cli.command {
        Command::Serve => {
            let orchestrator = build(config.clone(), airtable(&config)?)?;
            if config.service.enable_scheduler {
                scheduler::spawn(orchestrator.clone(), config.service.poll_interval);
            }
            face::serve(orchestrator, config.service.port).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { record_id } => {
            let orchestrator = build(config.clone(), airtable(&config)?)?;
            let report = orchestrator.run_record(&record_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.outcome.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Batch => {
            let orchestrator = build(config.clone(), airtable(&config)?)?;
            let summary = orchestrator.process_pending().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(if summary.failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Check => {
            let orchestrator = build(config.clone(), Arc::new(InMemoryRecordStore::new(Vec::new())))?;
            let report = orchestrator.check_connectivity().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
