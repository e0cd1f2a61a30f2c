//! LLM SQL agent collaborator.
//!
//! The pipeline treats the agent as a black box behind [`SqlAgent`]: it
//! receives the enriched question and returns free text. The error contract
//! has two paths: an [`AgentError::OutputParse`] carries the agent's raw
//! reply inside its message, so downstream extraction can still salvage a
//! well-formed answer embedded in a malformed response. Only
//! transport-level failures are opaque errors.
//!
//! [`ChatCompletionsAgent`] drives any OpenAI-compatible chat-completions
//! endpoint (Groq by default) through a two-step exchange: ask for a SQL
//! statement, execute it read-only, feed the rows back, and collect the
//! final answer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use tracing::debug;

use crate::config::AgentConfig;
use crate::parser;
use crate::schema::{self, ResultRow};

/// Rows beyond this are elided from the observation fed back to the model.
const MAX_OBSERVATION_ROWS: usize = 20;

const SYSTEM_PROMPT: &str = "You are a SQL assistant for a SQLite database. \
Given a question and relevant schema information, write a single SQL statement that answers it.\n\
Respond in exactly this format, with the statement on one line:\n\
SQLQuery: <sql>\n\
If you can answer without running SQL, or once you have query results, respond with:\n\
Final Answer: <concise answer>";

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("agent unavailable: {0}")]
    Unavailable(String),

    /// The reply violated the expected output format. The message embeds
    /// the raw reply text and is itself valid parser input.
    #[error("{0}")]
    OutputParse(String),
}

/// External agent contract: enriched question in, raw text out.
#[async_trait]
pub trait SqlAgent: Send + Sync {
    async fn invoke(&self, enriched_query: &str) -> Result<String, AgentError>;
}

// ============ Chat-completions implementation ============

#[derive(Serialize, Clone)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// SQL agent over an OpenAI-compatible `POST {base_url}/chat/completions`
/// API, with one observation round against the database.
pub struct ChatCompletionsAgent {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    api_key: String,
    pool: SqlitePool,
}

impl ChatCompletionsAgent {
    /// The API key is read from the configured environment variable at
    /// construction time.
    pub fn new(config: &AgentConfig, pool: SqlitePool) -> Result<Self, AgentError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            AgentError::Unavailable(format!(
                "{} environment variable not set",
                config.api_key_env
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key,
            pool,
        })
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, AgentError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(AgentError::Unavailable(format!(
                "chat completions API error {status}: {body_text}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AgentError::Unavailable("agent returned no content".to_string()))
    }
}

#[async_trait]
impl SqlAgent for ChatCompletionsAgent {
    async fn invoke(&self, enriched_query: &str) -> Result<String, AgentError> {
        let mut messages = vec![
            ChatMessage {
                role: "system",
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: enriched_query.to_string(),
            },
        ];

        let first = self.chat(&messages).await?;
        debug!(reply = %first, "agent first reply");

        // Direct answer without SQL: done.
        if has_answer_marker(&first) {
            return Ok(first);
        }

        let sql = parser::extract_sql(&first);
        if sql.is_empty() {
            // Neither a statement nor an answer: the raw reply travels
            // inside the error message for downstream extraction.
            return Err(AgentError::OutputParse(format!(
                "Could not parse agent output: `{first}`"
            )));
        }

        // Observation round: run the statement and hand the rows (or the
        // failure text) back to the model.
        let observation = match schema::execute(&self.pool, &sql).await {
            Ok(rows) => format_observation(&rows),
            Err(e) => format!("Error: {e}"),
        };
        debug!(%sql, observation = %observation, "agent observation");

        messages.push(ChatMessage {
            role: "assistant",
            content: first.clone(),
        });
        messages.push(ChatMessage {
            role: "user",
            content: format!(
                "Query results:\n{observation}\n\nAnswer the original question in the format 'Final Answer: <answer>'."
            ),
        });

        let second = self.chat(&messages).await?;
        debug!(reply = %second, "agent final reply");

        let transcript = format!("{first}\n{second}");
        if has_answer_marker(&second) {
            Ok(transcript)
        } else {
            Err(AgentError::OutputParse(format!(
                "Could not parse agent output: `{transcript}`"
            )))
        }
    }
}

/// `"Final Answer:"` contains `"Answer:"`, so one check covers both markers.
fn has_answer_marker(text: &str) -> bool {
    text.contains("Answer:")
}

/// Render rows for the observation message, eliding past the cap so a huge
/// result set cannot blow out the context window.
fn format_observation(rows: &[ResultRow]) -> String {
    if rows.is_empty() {
        return "(no rows)".to_string();
    }

    let shown: Vec<String> = rows
        .iter()
        .take(MAX_OBSERVATION_ROWS)
        .map(|row| serde_json::to_string(row).unwrap_or_else(|_| "{}".to_string()))
        .collect();

    let mut out = shown.join("\n");
    if rows.len() > MAX_OBSERVATION_ROWS {
        out.push_str(&format!(
            "\n... ({} more rows)",
            rows.len() - MAX_OBSERVATION_ROWS
        ));
    }
    out
}
