//! LM Studio backend over the OpenAI-compatible `/v1` API.

use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
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

const BACKEND_NAME: &str = "LM Studio";

#[derive(Debug, Default)]
struct Connection {
    model_id: Option<String>,
    context_limit: Option<usize>,
}

/// Client for a local LM Studio server.
pub struct LmStudioClient {
    config: LlmConfig,
    http: reqwest::Client,
    connection: Mutex<Connection>,
    /// Whether `response_format = json_object` is accepted; assumed
    /// until the backend rejects it.
    supports_json_format: AtomicBool,
}

impl LmStudioClient {
    pub fn new(config: LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            http,
            connection: Mutex::new(Connection::default()),
            supports_json_format: AtomicBool::new(true),
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

    /// Discover loaded models and the context window; pick the
    /// configured model or the first one loaded.
    pub async fn connect(&self) -> Result<(), LlmError> {
        info!(url = %self.base_url(), "connecting to LM Studio");
        let models: Value = self
            .http
            .get(format!("{}/models", self.base_url()))
            .send()
            .await
            .map_err(|e| {
                self.connection_lost(format!(
                    "{e}. Ensure LM Studio is running, a model is loaded, and the local server is started"
                ))
            })?
            .error_for_status()
            .map_err(|e| self.connection_lost(e))?
            .json()
            .await
            .map_err(|e| self.backend_error(format!("invalid /models response: {e}")))?;

        let entries = models
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if entries.is_empty() {
            return Err(self.backend_error("no models available in LM Studio"));
        }

        let model_id = match &self.config.model {
            Some(wanted) => {
                let ids: Vec<&str> = entries
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .collect();
                if !ids.contains(&wanted.as_str()) {
                    return Err(self.backend_error(format!(
                        "model '{wanted}' not found; available: {ids:?}"
                    )));
                }
                wanted.clone()
            }
            None => entries[0]
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        info!(model = %model_id, "using model");

        let model_limit = entries
            .iter()
            .find(|m| m.get("id").and_then(Value::as_str) == Some(model_id.as_str()))
            .and_then(model_context_limit);
        let context_limit = match (self.config.context_limit, model_limit) {
            (Some(configured), _) => {
                info!(context_limit = configured, "using configured context limit");
                Some(configured)
            }
            (None, Some(reported)) => {
                info!(context_limit = reported, "context window reported by model");
                Some(reported)
            }
            (None, None) => {
                warn!(
                    "could not determine context limit from LM Studio; set `context_limit` in config"
                );
                None
            }
        };

        let mut connection = self.lock_connection();
        connection.model_id = Some(model_id);
        connection.context_limit = context_limit;
        Ok(())
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

    async fn post_completion(&self, body: &Value) -> Result<Value, LlmError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url()))
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
            let lower = body.to_lowercase();
            if lower.contains("context")
                && (lower.contains("overflow") || lower.contains("context length"))
            {
                return Err(LlmError::ContextOverflow {
                    detail: format!(
                        "model context is smaller than the configured {:?} tokens: {body}",
                        self.lock_connection().context_limit
                    ),
                });
            }
            if lower.contains("response_format") || lower.contains("json_object") {
                info!(
                    "model does not support response_format=json_object; falling back to prompt-based formatting"
                );
                self.supports_json_format.store(false, Ordering::SeqCst);
                return Err(self.backend_error("response_format unsupported"));
            }
            return Err(self.backend_error(format!("HTTP {status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| self.backend_error(format!("invalid completion response: {e}")))
    }

    fn build_body(&self, model: &str, messages: &Value, temperature: f64) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
        });
        if self.supports_json_format.load(Ordering::SeqCst) {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    /// One self-fix round trip for a non-JSON reply.
    async fn try_fix_json(&self, malformed: &str) -> Option<Vec<IssueReport>> {
        let model = self.model_id().ok()?;
        let body = self.build_body(&model, &json!(json_fix_messages(malformed)), 0.0);
        let value = self.post_completion(&body).await.ok()?;
        let content = first_choice_message(&value)?
            .get("content")?
            .as_str()?
            .to_string();
        let fixed: Value = serde_json::from_str(strip_markdown_fences(&content)).ok()?;
        Some(parse_issue_reports(&fixed))
    }
}

#[async_trait]
impl ModelClient for LmStudioClient {
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
            debug!(attempt, "sending query to LM Studio");
            let mut body = self.build_body(&model, &json!(request.messages), 0.1);
            if let Some(tools) = request.tools {
                body["tools"] = json!(tools);
            }

            let value = match self.post_completion(&body).await {
                Ok(value) => value,
                Err(e @ (LlmError::Connection { .. } | LlmError::ContextOverflow { .. })) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "LM Studio request failed");
                    continue;
                }
            };

            let Some(message) = first_choice_message(&value) else {
                warn!(attempt, "response carried no choices, retrying");
                continue;
            };
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
                .unwrap_or_default()
                .to_string();

            if tool_calls.is_empty() && content.is_empty() {
                warn!(attempt, "empty response from LM Studio, retrying");
                continue;
            }
            if let Some(response) = classify_response(tool_calls, &content) {
                return Ok(response);
            }

            info!(attempt, "non-JSON response, attempting self-fix round trip");
            if let Some(reports) = self.try_fix_json(&content).await {
                info!("model reformatted its response into valid JSON");
                return Ok(ModelResponse::Final(reports));
            }
        }

        Err(LlmError::MalformedResponse { attempts })
    }

    async fn wait_for_connection(&self, retry_interval: Duration) {
        info!("waiting for LM Studio connection...");
        loop {
            match self.connect().await {
                Ok(()) => {
                    info!("LM Studio connection restored");
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

fn first_choice_message(value: &Value) -> Option<&Value> {
    value.get("choices")?.get(0)?.get("message")
}

/// LM Studio surfaces the context window under several names depending
/// on version.
fn model_context_limit(model: &Value) -> Option<usize> {
    for field in ["context_length", "max_context_length", "n_ctx", "max_tokens"] {
        if let Some(limit) = model.get(field).and_then(Value::as_u64) {
            return Some(limit as usize);
        }
    }
    None
}
