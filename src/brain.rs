use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::types::RunState;

const SYSTEM_PROMPT: &str = r#"You are the recovery step of a browser automation run. A scripted routine could not finish the current stage, so you choose ONE next action at a time.

Available actions:
- {"action":"Click","element":"e4"}
- {"action":"Fill","element":"e7","value":"VP Sales"}
- {"action":"PressKey","key":"Enter"}
- {"action":"Scroll"} or {"action":"Scroll","element":"e12"}
- {"action":"Wait","ms":1500}
- {"action":"Navigate","url":"https://..."}
- {"action":"Done","summary":"what is now visible on the page that proves the goal is met"}
- {"action":"Fail","reason":"why the goal cannot be reached"}

Rules:
1. Return ONLY a single JSON object per response. No markdown, no explanation.
2. Use the [eN] element references from the CURRENT page only. References change between pages.
3. Filling a field does not submit it. Follow a Fill with PressKey "Enter" or a Click.
4. Do not repeat an action that already produced no change. Try something different.
5. Claim Done only when the page itself shows the goal is met. Your claim is checked against the page.
6. Never log in or out. If you see a login page, use Fail."#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Minimal chat-completions client shared by the decision maker and the
/// criteria interpreter.
pub struct ChatClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
    temperature: f32,
    collaborator: &'static str,
}

impl ChatClient {
    pub fn new(config: &LlmConfig, collaborator: &'static str) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AgentError::collaborator(collaborator, "OPENAI_API_KEY not set in environment"))?;
        Ok(Self {
            client: Client::new(),
            api_key,
            model: config.model.clone(),
            endpoint: config.endpoint.clone(),
            temperature: config.temperature,
            collaborator,
        })
    }

    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": self.temperature,
            }))
            .send()
            .await
            .map_err(|e| AgentError::collaborator(self.collaborator, e.to_string()))?;

        let status = response.status();
        let json_resp: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::collaborator(self.collaborator, e.to_string()))?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            warn!(%status, err_msg, "LLM API error");
            return Err(AgentError::collaborator(
                self.collaborator,
                format!("API error ({status}): {err_msg}"),
            ));
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                AgentError::collaborator(self.collaborator, format!("no content in LLM response: {json_resp}"))
            })?;
        debug!(content, "LLM says");
        Ok(content.to_string())
    }
}

/// Strip markdown fences the model might wrap JSON in.
pub fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// One proposed move. Element references are only meaningful against the
/// snapshot the proposal was made from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Proposal {
    Click { element: String },
    Fill { element: String, value: String },
    PressKey { key: String },
    Scroll {
        #[serde(default)]
        element: Option<String>,
    },
    Wait { ms: u64 },
    Navigate { url: String },
    Done { summary: String },
    Fail { reason: String },
    /// Output that did not parse. Never produced by deserialization.
    #[serde(skip)]
    Invalid { raw: String, error: String },
}

impl Proposal {
    pub fn parse(content: &str) -> Self {
        let cleaned = strip_fences(content);
        match serde_json::from_str(cleaned) {
            Ok(p) => p,
            Err(e) => Proposal::Invalid {
                raw: cleaned.chars().take(200).collect(),
                error: e.to_string(),
            },
        }
    }
}

/// A past turn as shown to the decision maker.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub number: u32,
    pub action: String,
    pub outcome: String,
    /// The action changed the page.
    #[serde(skip)]
    pub advanced: bool,
}

#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub stage: RunState,
    pub goal: String,
    pub page: String,
    pub history: Vec<TurnRecord>,
    /// Condensed account of turns that fell out of the window.
    pub dropped_summary: Option<String>,
    /// Why the previous proposal was refused, if it was.
    pub feedback: Option<String>,
    pub turn: u32,
    pub turns_remaining: u32,
}

impl DecisionContext {
    pub fn render(&self) -> String {
        let mut out = format!(
            "Goal ({} stage): {}\nTurn {} ({} remaining)\n",
            self.stage, self.goal, self.turn, self.turns_remaining
        );
        if let Some(summary) = &self.dropped_summary {
            out.push_str(&format!("\nEarlier: {summary}\n"));
        }
        if !self.history.is_empty() {
            out.push_str("\nRecent turns:\n");
            for t in &self.history {
                out.push_str(&format!("  {}. {} -> {}\n", t.number, t.action, t.outcome));
            }
        }
        if let Some(feedback) = &self.feedback {
            out.push_str(&format!("\nNOTE: {feedback}\n"));
        }
        out.push_str(&format!("\nCurrent page:\n{}\n\nWhat is your next step?", self.page));
        out
    }
}

/// The external decision maker. Called once per turn; never trusted to verify.
#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn propose(&self, context: &DecisionContext) -> Result<Proposal>;
}

/// Chat-completions decision maker. Every turn is a fresh two-message request
/// built from the bounded context, so nothing accumulates between turns.
pub struct LlmDecisionMaker {
    chat: ChatClient,
}

impl LlmDecisionMaker {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            chat: ChatClient::new(config, "decision maker")?,
        })
    }
}

#[async_trait]
impl DecisionMaker for LlmDecisionMaker {
    async fn propose(&self, context: &DecisionContext) -> Result<Proposal> {
        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(context.render())];
        let content = self.chat.complete(&messages).await?;
        Ok(Proposal::parse(&content))
    }
}

/// Stand-in when no model is configured: every stage that needs a decision
/// fails immediately, so the deterministic fallbacks still get their turn.
#[derive(Debug, Default)]
pub struct OfflineDecisionMaker;

#[async_trait]
impl DecisionMaker for OfflineDecisionMaker {
    async fn propose(&self, _context: &DecisionContext) -> Result<Proposal> {
        Ok(Proposal::Fail {
            reason: "no decision maker configured".to_string(),
        })
    }
}
