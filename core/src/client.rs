//! The model client seam and the wire shapes shared by both backends.
//!
//! Backends differ in transport and discovery; everything downstream of
//! the HTTP response is shared: fence stripping, lenient per-issue
//! parsing, and the `issues`-vs-`tool_calls` decision, made exactly once
//! here and represented as a tagged union.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::LlmError;

/// Message roles on the chat wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// An issue as the model reports it. Key aliases cover the spellings
/// small local models actually produce.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IssueReport {
    #[serde(alias = "file_path")]
    pub file: String,
    #[serde(default, alias = "line")]
    pub line_number: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "fix")]
    pub suggested_fix: String,
    #[serde(default)]
    pub code_snippet: String,
}

/// The two things a model turn can be, decided once at the parsing
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    /// Terminal answer: the issues found (possibly none).
    Final(Vec<IssueReport>),
    /// The model wants repository context before answering.
    ToolCalls(Vec<ToolCall>),
}

/// One query against the backend.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub messages: &'a [ChatMessage],
    /// Tool schema to attach; `None` forbids tool calls entirely.
    pub tools: Option<&'a [Value]>,
    /// Retry budget for malformed responses.
    pub max_retries: u32,
}

/// The query contract every backend implements.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable backend name for logs and errors.
    fn backend_name(&self) -> &'static str;

    /// The model's context window in tokens. Known once connected (or
    /// configured); everything downstream budgets against it.
    fn context_limit(&self) -> Result<usize, LlmError>;

    /// Send one conversation turn and classify the reply.
    async fn query(&self, request: ChatRequest<'_>) -> Result<ModelResponse, LlmError>;

    /// Block until the backend is reachable again, probing every
    /// `retry_interval`.
    async fn wait_for_connection(&self, retry_interval: Duration);
}

static FENCE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^```(?:json)?\s*\n?(.*?)\n?```\s*$").unwrap());

/// Strip a surrounding markdown code fence. Models wrap JSON in fenced
/// blocks despite instructions not to.
pub fn strip_markdown_fences(content: &str) -> &str {
    let content = content.trim();
    match FENCE_PATTERN.captures(content) {
        Some(captures) => captures
            .get(1)
            .map(|m| m.as_str().trim())
            .unwrap_or(content),
        None => content,
    }
}

/// Messages for the self-fix round trip: ask the model to re-emit its
/// malformed reply as bare JSON.
pub fn json_fix_messages(malformed: &str) -> Vec<ChatMessage> {
    const FIX_SYSTEM: &str = "You are a JSON extractor. Extract and return ONLY valid JSON. \
Do NOT include markdown code fences (```), explanations, or any other text. \
Output ONLY the raw JSON object, nothing else. \
Expected format: {\"issues\": [{\"file\": \"...\", \"line_number\": N, \
\"description\": \"...\", \"suggested_fix\": \"...\", \"code_snippet\": \"...\"}]} \
If the input has no valid issues, return: {\"issues\": []}";
    let truncated: String = malformed.chars().take(4000).collect();
    vec![
        ChatMessage::system(FIX_SYSTEM),
        ChatMessage::user(format!("Extract the JSON from this response:\n\n{truncated}")),
    ]
}

/// Map a function-call payload to a [`ToolCall`]. OpenAI-compatible
/// backends encode `arguments` as a JSON string; Ollama sends an object.
pub fn tool_call_from_function(function: &Value) -> Option<ToolCall> {
    let name = function.get("name").and_then(Value::as_str)?.to_string();
    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::Null),
        Some(value) => value.clone(),
        None => Value::Null,
    };
    Some(ToolCall { name, arguments })
}

/// Parse a JSON response body into issues. Individually malformed
/// entries are dropped with a warning rather than failing the batch.
pub fn parse_issue_reports(value: &Value) -> Vec<IssueReport> {
    let Some(entries) = value.get("issues").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut reports = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<IssueReport>(entry.clone()) {
            Ok(report) if !report.file.is_empty() => reports.push(report),
            Ok(_) => warn!("dropping issue with empty file path"),
            Err(e) => warn!(error = %e, raw = %entry, "failed to parse issue"),
        }
    }
    reports
}

/// Classify a decoded response body: tool calls win over content.
///
/// `tool_calls` is the structured field from the assistant message;
/// `content` is its text, parsed as an issues object when no tools were
/// requested. Returns `None` when the content is not valid JSON — the
/// caller drives the self-fix/retry policy.
pub fn classify_response(tool_calls: Vec<ToolCall>, content: &str) -> Option<ModelResponse> {
    if !tool_calls.is_empty() {
        return Some(ModelResponse::ToolCalls(tool_calls));
    }
    let stripped = strip_markdown_fences(content);
    let value: Value = serde_json::from_str(stripped).ok()?;
    // Some models emit tool requests as plain JSON content instead of
    // the structured field.
    if let Some(calls) = value.get("tool_calls").and_then(Value::as_array) {
        let calls: Vec<ToolCall> = calls
            .iter()
            .filter_map(|c| serde_json::from_value(c.clone()).ok())
            .collect();
        if !calls.is_empty() {
            return Some(ModelResponse::ToolCalls(calls));
        }
    }
    Some(ModelResponse::Final(parse_issue_reports(&value)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn strips_json_fences() {
        assert_eq!(
            strip_markdown_fences("```json\n{\"issues\": []}\n```"),
            "{\"issues\": []}"
        );
        assert_eq!(
            strip_markdown_fences("```\n{\"issues\": []}\n```"),
            "{\"issues\": []}"
        );
        assert_eq!(strip_markdown_fences("{\"issues\": []}"), "{\"issues\": []}");
    }

    #[test]
    fn parses_issues_with_key_aliases() {
        let value = json!({"issues": [
            {"file": "a.py", "line_number": 3, "description": "X", "code_snippet": "y=1"},
            {"file_path": "b.py", "line": 7, "description": "Y", "fix": "do Z"},
        ]});
        let reports = parse_issue_reports(&value);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].file, "a.py");
        assert_eq!(reports[0].line_number, 3);
        assert_eq!(reports[1].file, "b.py");
        assert_eq!(reports[1].line_number, 7);
        assert_eq!(reports[1].suggested_fix, "do Z");
    }

    #[test]
    fn malformed_entries_are_dropped_not_fatal() {
        let value = json!({"issues": [
            {"file": "a.py", "line_number": 3, "description": "X"},
            {"line_number": "not a number"},
            {"file": "", "description": "anonymous"},
        ]});
        let reports = parse_issue_reports(&value);
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn structured_tool_calls_take_precedence() {
        let calls = vec![ToolCall {
            name: "read_file".to_string(),
            arguments: json!({"file_path": "src/lib.rs"}),
        }];
        let response = classify_response(calls.clone(), "{\"issues\": []}");
        assert_eq!(response, Some(ModelResponse::ToolCalls(calls)));
    }

    #[test]
    fn content_embedded_tool_calls_are_recognized() {
        let content = r#"{"tool_calls": [{"name": "search_text", "arguments": {"patterns": "foo"}}]}"#;
        match classify_response(Vec::new(), content) {
            Some(ModelResponse::ToolCalls(calls)) => assert_eq!(calls[0].name, "search_text"),
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn non_json_content_is_unclassifiable() {
        assert_eq!(classify_response(Vec::new(), "sure, here are the issues"), None);
    }

    #[test]
    fn fenced_final_answer_parses() {
        let content = "```json\n{\"issues\": [{\"file\": \"a.py\", \"line_number\": 1, \"description\": \"d\"}]}\n```";
        match classify_response(Vec::new(), content) {
            Some(ModelResponse::Final(reports)) => assert_eq!(reports.len(), 1),
            other => panic!("expected final answer, got {other:?}"),
        }
    }
}
