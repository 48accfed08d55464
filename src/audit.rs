//! Append-only audit store.
//!
//! Every Run writes named artifacts (snapshots, screenshots, action logs) and a
//! status history under its run id. Writers never touch another run's record,
//! so concurrent Runs can share one store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{AgentError, ErrorKind, Result};
use crate::types::{RunEvent, RunState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub at: DateTime<Utc>,
    pub state: RunState,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

#[derive(Debug, Clone)]
pub enum ArtifactBody {
    Text(String),
    Json(serde_json::Value),
    Png(Vec<u8>),
}

impl ArtifactBody {
    fn extension(&self) -> &'static str {
        match self {
            ArtifactBody::Text(_) => "txt",
            ArtifactBody::Json(_) => "json",
            ArtifactBody::Png(_) => "png",
        }
    }

    fn bytes(&self) -> Vec<u8> {
        match self {
            ArtifactBody::Text(t) => t.as_bytes().to_vec(),
            ArtifactBody::Json(v) => serde_json::to_vec_pretty(v).unwrap_or_default(),
            ArtifactBody::Png(b) => b.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub seq: u32,
    pub name: String,
    pub file: String,
    pub bytes: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugRecord {
    pub run_id: String,
    pub artifacts: Vec<ArtifactRef>,
    pub status_history: Vec<StatusEvent>,
}

/// Keep artifact names filesystem safe: `[A-Za-z0-9_-]` only.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "artifact".to_string() } else { cleaned }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_artifact(&self, run_id: &str, name: &str, body: ArtifactBody) -> Result<ArtifactRef>;

    async fn append_status(&self, run_id: &str, event: StatusEvent) -> Result<()>;

    async fn record(&self, run_id: &str) -> Result<Option<DebugRecord>>;

    async fn list_runs(&self) -> Result<Vec<String>>;
}

fn audit_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::collaborator("audit store", e.to_string())
}

/// One directory per run: `status.jsonl`, `artifacts.jsonl` and the artifact
/// files themselves, numbered in write order.
pub struct FileAuditStore {
    root: PathBuf,
    seq: Mutex<HashMap<String, u32>>,
}

impl FileAuditStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seq: Mutex::new(HashMap::new()),
        }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(sanitize_name(run_id))
    }

    fn next_seq(&self, run_id: &str) -> u32 {
        let mut seq = self.seq.lock().unwrap_or_else(|p| p.into_inner());
        let n = seq.entry(run_id.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    async fn append_line(path: &Path, line: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(audit_err)?;
        file.write_all(format!("{line}\n").as_bytes()).await.map_err(audit_err)?;
        Ok(())
    }

    async fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => text
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| serde_json::from_str(l).map_err(audit_err))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(audit_err(e)),
        }
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    async fn append_artifact(&self, run_id: &str, name: &str, body: ArtifactBody) -> Result<ArtifactRef> {
        let dir = self.run_dir(run_id);
        tokio::fs::create_dir_all(&dir).await.map_err(audit_err)?;
        let seq = self.next_seq(run_id);
        let name = sanitize_name(name);
        let file = format!("{seq:03}_{name}.{}", body.extension());
        let bytes = body.bytes();
        tokio::fs::write(dir.join(&file), &bytes).await.map_err(audit_err)?;
        let artifact = ArtifactRef {
            seq,
            name,
            file,
            bytes: bytes.len(),
            at: Utc::now(),
        };
        let line = serde_json::to_string(&artifact).map_err(audit_err)?;
        Self::append_line(&dir.join("artifacts.jsonl"), &line).await?;
        Ok(artifact)
    }

    async fn append_status(&self, run_id: &str, event: StatusEvent) -> Result<()> {
        let dir = self.run_dir(run_id);
        tokio::fs::create_dir_all(&dir).await.map_err(audit_err)?;
        let line = serde_json::to_string(&event).map_err(audit_err)?;
        Self::append_line(&dir.join("status.jsonl"), &line).await
    }

    async fn record(&self, run_id: &str) -> Result<Option<DebugRecord>> {
        let dir = self.run_dir(run_id);
        if !tokio::fs::try_exists(&dir).await.map_err(audit_err)? {
            return Ok(None);
        }
        Ok(Some(DebugRecord {
            run_id: run_id.to_string(),
            artifacts: Self::read_lines(&dir.join("artifacts.jsonl")).await?,
            status_history: Self::read_lines(&dir.join("status.jsonl")).await?,
        }))
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        let mut runs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(audit_err(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(audit_err)? {
            if entry.file_type().await.map_err(audit_err)?.is_dir() {
                runs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        runs.sort();
        Ok(runs)
    }
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    records: Mutex<HashMap<String, DebugRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append_artifact(&self, run_id: &str, name: &str, body: ArtifactBody) -> Result<ArtifactRef> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let record = records.entry(run_id.to_string()).or_insert_with(|| DebugRecord {
            run_id: run_id.to_string(),
            ..DebugRecord::default()
        });
        let seq = record.artifacts.len() as u32 + 1;
        let name = sanitize_name(name);
        let artifact = ArtifactRef {
            seq,
            file: format!("{seq:03}_{name}.{}", body.extension()),
            name,
            bytes: body.bytes().len(),
            at: Utc::now(),
        };
        record.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    async fn append_status(&self, run_id: &str, event: StatusEvent) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records
            .entry(run_id.to_string())
            .or_insert_with(|| DebugRecord {
                run_id: run_id.to_string(),
                ..DebugRecord::default()
            })
            .status_history
            .push(event);
        Ok(())
    }

    async fn record(&self, run_id: &str) -> Result<Option<DebugRecord>> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.get(run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let mut runs: Vec<String> = records.keys().cloned().collect();
        runs.sort();
        Ok(runs)
    }
}

/// Per-run front for the audit store and the live event stream. Audit writes
/// that fail are logged and otherwise ignored; they never fail the Run.
pub struct Auditor {
    store: Arc<dyn AuditStore>,
    run_id: String,
    events: Option<broadcast::Sender<RunEvent>>,
}

impl Auditor {
    pub fn new(store: Arc<dyn AuditStore>, run_id: impl Into<String>, events: Option<broadcast::Sender<RunEvent>>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
            events,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn artifact(&self, name: &str, body: ArtifactBody) {
        if let Err(err) = self.store.append_artifact(&self.run_id, name, body).await {
            warn!(run_id = %self.run_id, name, error = %err, "audit artifact not written");
        }
    }

    pub async fn status(&self, state: RunState, note: impl Into<String>, kind: Option<ErrorKind>) {
        let event = StatusEvent {
            at: Utc::now(),
            state,
            note: note.into(),
            kind,
        };
        if let Err(err) = self.store.append_status(&self.run_id, event).await {
            warn!(run_id = %self.run_id, %state, error = %err, "audit status not written");
        }
    }

    /// Broadcast to live observers. No subscribers is fine.
    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
