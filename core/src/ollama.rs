//! Ollama backend over the native `/api/chat` endpoint.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::ChatRequest;
use crate::client::IssueReport;
use crate::client::ModelClient;
use crate::client::ModelResponse;
use crate::client::ToolCall;
use crate::client::classify_response;
use crate::client::json_fix_messages;
use crate::client::parse_issue_reports;
use crate::client::strip_markdown_fences;
use crate::client::tool_call_from_function;
use crate::config::LlmConfig;
use crate::error::LlmError;

const BACKEND_NAME: &str = "Ollama";

#[derive(Debug, Default)]
struct Connection {
    model_id: Option<String>,
    context_limit: Option<usize>,
}

/// Client for a local Ollama server.
pub struct OllamaClient {
    config: LlmConfig,
    http: reqwest::Client,
    connection: Mutex<Connection>,
}

impl OllamaClient {
    pub fn new(config: LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            http,
            connection: Mutex::new(Connection::default()),
        }
    }

    fn base_url(&self) -> String {
        self.config.base_url()
    }

    fn connection_lost(&self, detail: impl std::fmt::Display) -> LlmError {
        LlmError::Connection {
            backend: BACKEND_NAME,
            detail: detail.to_string(),
        }
    }

    fn backend_error(&self, detail: impl Into<String>) -> LlmError {
        LlmError::Backend {
            backend: BACKEND_NAME,
            detail: detail.into(),
        }
    }

    /// Verify the server is reachable, the model exists, and discover
    /// the context window.
    pub async fn connect(&self) -> Result<(), LlmError> {
        info!(url = %self.base_url(), "connecting to Ollama");
        let model = self
            .config
            .model
            .clone()
            .ok_or_else(|| self.backend_error("no model configured"))?;

        let tags: Value = self
            .http
            .get(format!("{}/api/tags", self.base_url()))
            .send()
            .await
            .map_err(|e| self.connection_lost(e))?
            .error_for_status()
            .map_err(|e| self.connection_lost(e))?
            .json()
            .await
            .map_err(|e| self.backend_error(format!("invalid /api/tags response: {e}")))?;

        let available: Vec<String> = tags
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if available.is_empty() {
            return Err(self.backend_error("no models available; pull one with `ollama pull`"));
        }
        // Tags may carry a size suffix, e.g. `qwen3:4b` for `qwen3`.
        let found = available.iter().any(|name| {
            name == &model
                || name.starts_with(&format!("{model}:"))
                || model.starts_with(&format!("{name}:"))
        });
        if !found {
            return Err(self.backend_error(format!(
                "model '{model}' not found; available: {available:?}. Pull it with: ollama pull {model}"
            )));
        }
        info!(model = %model, "using model");

        let model_limit = self.fetch_model_context_limit(&model).await;
        let context_limit = match (self.config.context_limit, model_limit) {
            (Some(configured), Some(supported)) if configured > supported => {
                return Err(self.backend_error(format!(
                    "configured context_limit {configured} exceeds what model '{model}' supports ({supported})"
                )));
            }
            (Some(configured), _) => {
                info!(context_limit = configured, "using configured context limit");
                Some(configured)
            }
            (None, Some(supported)) => {
                info!(context_limit = supported, "context window reported by model");
                Some(supported)
            }
            (None, None) => {
                warn!("could not determine context limit from Ollama; set `context_limit` in config");
                None
            }
        };

        let mut connection = self.lock_connection();
        connection.model_id = Some(model);
        connection.context_limit = context_limit;
        Ok(())
    }

    /// Read the model's context window from `/api/show`.
    async fn fetch_model_context_limit(&self, model: &str) -> Option<usize> {
        let response = self
            .http
            .post(format!("{}/api/show", self.base_url()))
            .json(&json!({ "name": model }))
            .send()
            .await
            .ok()?;
        let value: Value = response.json().await.ok()?;

        for section in ["modelinfo", "details"] {
            if let Some(object) = value.get(section).and_then(Value::as_object) {
                for (key, entry) in object {
                    if key.ends_with("num_ctx")
                        || key.ends_with("context_length")
                        || key.ends_with("n_ctx")
                    {
                        if let Some(limit) = entry.as_u64() {
                            return Some(limit as usize);
                        }
                    }
                }
            }
        }
        // Older servers expose it inside the parameters text blob:
        // "num_ctx 4096\nnum_gpu ...".
        let parameters = value.get("parameters").and_then(Value::as_str)?;
        for line in parameters.lines() {
            if let Some(rest) = line.trim().strip_prefix("num_ctx")
                && let Ok(limit) = rest.trim().parse::<usize>()
            {
                return Some(limit);
            }
        }
        None
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn model_id(&self) -> Result<String, LlmError> {
        self.lock_connection()
            .model_id
            .clone()
            .ok_or_else(|| self.backend_error("not connected"))
    }

    async fn post_chat(&self, body: &Value) -> Result<Value, LlmError> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url()))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    self.backend_error(format!(
                        "request timed out after {:?}; increase `timeout_secs` or use a smaller model",
                        self.config.timeout
                    ))
                } else {
                    self.connection_lost(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_context_overflow(&body) {
                return Err(LlmError::ContextOverflow {
                    detail: format!(
                        "Ollama rejected the request (configured limit {:?}): {body}",
                        self.lock_connection().context_limit
                    ),
                });
            }
            return Err(self.backend_error(format!("HTTP {status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| self.backend_error(format!("invalid /api/chat response: {e}")))
    }

    /// One self-fix round trip for a non-JSON reply.
    async fn try_fix_json(&self, malformed: &str) -> Option<Vec<IssueReport>> {
        let model = self.model_id().ok()?;
        let body = json!({
            "model": model,
            "messages": json_fix_messages(malformed),
            "stream": false,
            "options": { "temperature": 0.0 },
        });
        let value = self.post_chat(&body).await.ok()?;
        let content = value.get("message")?.get("content")?.as_str()?;
        let fixed: Value = serde_json::from_str(strip_markdown_fences(content)).ok()?;
        Some(parse_issue_reports(&fixed))
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn context_limit(&self) -> Result<usize, LlmError> {
        self.lock_connection()
            .context_limit
            .ok_or(LlmError::ContextLimitUnavailable)
    }

    async fn query(&self, request: ChatRequest<'_>) -> Result<ModelResponse, LlmError> {
        let model = self.model_id()?;
        let attempts = request.max_retries.max(1);

        for attempt in 0..attempts {
            debug!(attempt, "sending query to Ollama");
            let mut body = json!({
                "model": model,
                "messages": request.messages,
                "stream": false,
                "options": { "temperature": 0.1 },
            });
            if let Ok(limit) = self.context_limit() {
                body["options"]["num_ctx"] = json!(limit);
            }
            if let Some(tools) = request.tools {
                body["tools"] = json!(tools);
            }

            let value = match self.post_chat(&body).await {
                Ok(value) => value,
                Err(e @ (LlmError::Connection { .. } | LlmError::ContextOverflow { .. })) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Ollama request failed");
                    continue;
                }
            };

            let message = value.get("message").cloned().unwrap_or(Value::Null);
            let tool_calls: Vec<ToolCall> = message
                .get("tool_calls")
                .and_then(Value::as_array)
                .map(|calls| {
                    calls
                        .iter()
                        .filter_map(|c| c.get("function").and_then(tool_call_from_function))
                        .collect()
                })
                .unwrap_or_default();
            let content = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();

            if tool_calls.is_empty() && content.is_empty() {
                warn!(attempt, "empty response from Ollama, retrying");
                continue;
            }
            if let Some(response) = classify_response(tool_calls, content) {
                return Ok(response);
            }

            info!(attempt, "non-JSON response, attempting self-fix round trip");
            if let Some(reports) = self.try_fix_json(content).await {
                info!("model reformatted its response into valid JSON");
                return Ok(ModelResponse::Final(reports));
            }
        }

        Err(LlmError::MalformedResponse { attempts })
    }

    async fn wait_for_connection(&self, retry_interval: Duration) {
        info!("waiting for Ollama connection...");
        loop {
            match self.connect().await {
                Ok(()) => {
                    info!("Ollama connection restored");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "connection failed, retrying in {retry_interval:?}");
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }
}

/// Overflow wording varies across server versions; match broadly.
fn is_context_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context")
        && (lower.contains("overflow")
            || lower.contains("too long")
            || lower.contains("exceed")
            || lower.contains("context length"))
}
