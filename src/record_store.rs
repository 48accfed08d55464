//! Record-store collaborator.
//!
//! Reads task input records and writes back final status, counts, timestamps
//! and error notes. [`AirtableStore`] talks to the Airtable REST API;
//! [`InMemoryRecordStore`] backs tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::config::RecordStoreConfig;
use crate::error::{AgentError, Result};
use crate::types::{RawCriteria, Task};

const COLLABORATOR: &str = "record store";
const API_ROOT: &str = "https://api.airtable.com";

pub const STATUS_PENDING: &str = "✨ Sourcing Profiles";
pub const STATUS_READY: &str = "✅ Ready to Launch";
pub const STATUS_FAILED: &str = "Error - Automation Failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    ReadyToLaunch,
    Failed,
}

impl RecordStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RecordStatus::ReadyToLaunch => STATUS_READY,
            RecordStatus::Failed => STATUS_FAILED,
        }
    }
}

/// One input record, as far as the agent cares about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub criteria: RawCriteria,
}

impl TaskRecord {
    pub fn into_task(self) -> Task {
        Task {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            subject_id: self.id,
            subject_name: self.name,
            criteria: self.criteria,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteBack {
    pub status: RecordStatus,
    pub profiles_sent: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_notes: Option<String>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// `None` when no record has this id.
    async fn fetch(&self, id: &str) -> Result<Option<TaskRecord>>;

    async fn pending(&self) -> Result<Vec<TaskRecord>>;

    async fn write_back(&self, id: &str, update: &WriteBack) -> Result<()>;
}

/// Text of a field that may be a string, a multi-select array, or a number.
fn field_text(fields: &Map<String, Value>, key: &str) -> String {
    match fields.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn record_from_json(record: &Value) -> Result<TaskRecord> {
    let id = record["id"]
        .as_str()
        .ok_or_else(|| AgentError::collaborator(COLLABORATOR, "record without id"))?
        .to_string();
    let empty = Map::new();
    let fields = record["fields"].as_object().unwrap_or(&empty);
    let list = |key: &str| RawCriteria::split_field(&field_text(fields, key));
    let name = match field_text(fields, "Name") {
        n if n.is_empty() => "Unknown".to_string(),
        n => n,
    };
    Ok(TaskRecord {
        id,
        name,
        criteria: RawCriteria {
            titles: list("TargetTitles"),
            locations: list("TargetGeos"),
            seniority: list("Seniority"),
            exclusions: list("ExcludeKeywords"),
            industries: list("TargetIndustries"),
            include_keywords: list("IncludeKeywords"),
            notes: field_text(fields, "NotesForCoach"),
        },
    })
}

/// Body fields for a write-back. `with_status` and `with_notes` let a retry
/// drop fields the base rejected.
fn write_back_fields(update: &WriteBack, with_status: bool, with_notes: bool) -> Map<String, Value> {
    let mut fields = Map::new();
    if with_status {
        fields.insert("Status".into(), json!(update.status.label()));
    }
    if let Some(n) = update.profiles_sent {
        fields.insert("ProfilesSent".into(), json!(n));
    }
    if let Some(at) = update.completed_at {
        fields.insert("CompletedAt".into(), json!(at.to_rfc3339()));
    }
    if with_notes {
        if let Some(notes) = &update.error_notes {
            fields.insert("ErrorNotes".into(), json!(notes));
        }
    }
    fields
}

pub struct AirtableStore {
    client: Client,
    api_key: String,
    base_id: String,
    table_name: String,
    api_root: String,
}

impl AirtableStore {
    pub fn new(config: &RecordStoreConfig) -> Result<Self> {
        let (Some(api_key), Some(base_id)) = (config.api_key.clone(), config.base_id.clone()) else {
            return Err(AgentError::collaborator(
                COLLABORATOR,
                "AIRTABLE_API_KEY and AIRTABLE_BASE_ID must be set",
            ));
        };
        Ok(Self {
            client: Client::new(),
            api_key,
            base_id,
            table_name: config.table_name.clone(),
            api_root: API_ROOT.to_string(),
        })
    }

    fn table_url(&self, record_id: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&self.api_root).map_err(|e| AgentError::collaborator(COLLABORATOR, e.to_string()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AgentError::collaborator(COLLABORATOR, "API root cannot hold a path"))?;
            segments.pop_if_empty().extend(["v0", self.base_id.as_str(), self.table_name.as_str()]);
            if let Some(id) = record_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(StatusCode, Value)> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| AgentError::collaborator(COLLABORATOR, e.to_string()))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    fn api_error(status: StatusCode, body: &Value) -> AgentError {
        let kind = body["error"]["type"].as_str().unwrap_or("");
        let message = body["error"]["message"].as_str().unwrap_or("Unknown API error");
        AgentError::collaborator(COLLABORATOR, format!("Airtable error ({status}) {kind}: {message}"))
    }

    async fn patch(&self, id: &str, fields: Map<String, Value>) -> Result<(StatusCode, Value)> {
        let url = self.table_url(Some(id))?;
        self.send(self.client.patch(url).json(&json!({ "fields": fields }))).await
    }
}

fn error_type(body: &Value) -> &str {
    body["error"]["type"].as_str().unwrap_or("")
}

#[async_trait]
impl RecordStore for AirtableStore {
    async fn fetch(&self, id: &str) -> Result<Option<TaskRecord>> {
        let url = self.table_url(Some(id))?;
        let (status, body) = self.send(self.client.get(url)).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::api_error(status, &body));
        }
        record_from_json(&body).map(Some)
    }

    async fn pending(&self) -> Result<Vec<TaskRecord>> {
        let formula = format!("{{Status}} = '{STATUS_PENDING}'");
        let mut offset: Option<String> = None;
        let mut records = Vec::new();
        loop {
            let mut url = self.table_url(None)?;
            url.query_pairs_mut().append_pair("filterByFormula", &formula);
            if let Some(o) = &offset {
                url.query_pairs_mut().append_pair("offset", o);
            }
            let (status, body) = self.send(self.client.get(url)).await?;
            if !status.is_success() {
                return Err(Self::api_error(status, &body));
            }
            for record in body["records"].as_array().into_iter().flatten() {
                records.push(record_from_json(record)?);
            }
            match body["offset"].as_str() {
                Some(next) => offset = Some(next.to_string()),
                None => break,
            }
        }
        info!(count = records.len(), "pending records fetched");
        Ok(records)
    }

    async fn write_back(&self, id: &str, update: &WriteBack) -> Result<()> {
        let mut with_status = true;
        let mut with_notes = true;
        loop {
            let fields = write_back_fields(update, with_status, with_notes);
            if fields.is_empty() {
                return Ok(());
            }
            let (status, body) = self.patch(id, fields).await?;
            if status.is_success() {
                info!(record_id = id, status = update.status.label(), with_status, "record updated");
                return Ok(());
            }
            match error_type(&body) {
                "INVALID_MULTIPLE_CHOICE_OPTIONS" if with_status => {
                    warn!(record_id = id, status = update.status.label(), "status is not a valid option here, skipping it");
                    with_status = false;
                }
                "UNKNOWN_FIELD_NAME" if with_notes && update.error_notes.is_some() => {
                    warn!(record_id = id, "base has no ErrorNotes field, writing without it");
                    with_notes = false;
                }
                _ => return Err(Self::api_error(status, &body)),
            }
        }
    }
}

/// Records kept in memory, with every write-back retained for inspection.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Mutex<Vec<TaskRecord>>,
    writes: Mutex<HashMap<String, Vec<WriteBack>>>,
}

impl InMemoryRecordStore {
    pub fn new(records: Vec<TaskRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn writes(&self, id: &str) -> Vec<WriteBack> {
        self.writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn fetch(&self, id: &str) -> Result<Option<TaskRecord>> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn pending(&self) -> Result<Vec<TaskRecord>> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let writes = self.writes.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records
            .iter()
            .filter(|r| !writes.contains_key(&r.id))
            .cloned()
            .collect())
    }

    async fn write_back(&self, id: &str, update: &WriteBack) -> Result<()> {
        self.writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(id.to_string())
            .or_default()
            .push(update.clone());
        Ok(())
    }
}
