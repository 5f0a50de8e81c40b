//! Bounded multi-turn tool-calling conversations.
//!
//! One conversation per (check, batch). The driver tracks an estimated
//! token total as tool results accumulate and forces a final answer
//! before the conversation could exceed the model's context window, so
//! overflow is prevented by construction and the loop always terminates.

use chrono::Utc;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::batch::Batch;
use crate::client::ChatMessage;
use crate::client::ChatRequest;
use crate::client::IssueReport;
use crate::client::ModelClient;
use crate::client::ModelResponse;
use crate::client::ToolCall;
use crate::error::LlmError;
use crate::models::Issue;
use crate::models::IssueStatus;
use crate::prompt::ANSWER_NOW_INSTRUCTION;
use crate::prompt::CONTINUE_INSTRUCTION;
use crate::prompt::SYSTEM_PROMPT;
use crate::prompt::build_user_prompt;
use crate::tokens::estimate_tokens;
use crate::tools::ToolExecutor;
use crate::tools::tool_schema;

/// Share of the context window a conversation may grow into; the rest
/// is headroom for the model's own output.
const CONVERSATION_BUDGET_PERCENT: usize = 85;
/// Hard cap on tool-calling iterations per conversation.
const MAX_TOOL_ITERATIONS: usize = 50;
/// Conservative token cost assumed for one tool result when sizing the
/// iteration cap up front.
const TOOL_RESULT_TOKEN_COST: usize = 500;

/// Runs one check against one batch as a bounded conversation.
pub struct ConversationDriver<'a> {
    client: &'a dyn ModelClient,
    tools: &'a dyn ToolExecutor,
    max_retries: u32,
}

impl<'a> ConversationDriver<'a> {
    pub fn new(
        client: &'a dyn ModelClient,
        tools: &'a dyn ToolExecutor,
        max_retries: u32,
    ) -> Self {
        Self {
            client,
            tools,
            max_retries,
        }
    }

    /// Run the conversation to a terminal answer.
    ///
    /// Returns the issues the model reported, or an empty list when the
    /// iteration budget ran out without an answer (degraded, not fatal).
    pub async fn run(&self, check_query: &str, batch: &Batch) -> Result<Vec<Issue>, LlmError> {
        let context_limit = self.client.context_limit()?;
        let max_context_tokens = context_limit * CONVERSATION_BUDGET_PERCENT / 100;

        let mut messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_user_prompt(check_query, batch)),
        ];
        let mut accumulated_tokens: usize =
            messages.iter().map(|m| estimate_tokens(&m.content)).sum();

        // Bound the loop even if the model asks for tools forever: each
        // iteration costs at least one tool result.
        let headroom = max_context_tokens.saturating_sub(accumulated_tokens);
        let max_iterations = (headroom / TOOL_RESULT_TOKEN_COST)
            .clamp(1, MAX_TOOL_ITERATIONS);
        debug!(
            max_iterations,
            accumulated_tokens, max_context_tokens, "starting conversation"
        );

        for iteration in 0..max_iterations {
            let response = self
                .client
                .query(ChatRequest {
                    messages: &messages,
                    tools: Some(tool_schema()),
                    max_retries: self.max_retries,
                })
                .await?;

            let calls = match response {
                ModelResponse::Final(reports) => {
                    return Ok(into_issues(reports, check_query));
                }
                ModelResponse::ToolCalls(calls) => calls,
            };

            info!(
                iteration,
                requested = calls.len(),
                "model requested repository context"
            );
            messages.push(ChatMessage::assistant(serialize_calls(&calls)));
            let results_text = self.execute_calls(&calls).await;
            accumulated_tokens += estimate_tokens(&results_text);

            if accumulated_tokens > max_context_tokens {
                // Over budget: one final request with no tool schema
                // attached, terminal regardless of remaining iterations.
                debug!(accumulated_tokens, "token budget exhausted, forcing final answer");
                messages.push(ChatMessage::user(format!(
                    "{results_text}\n\n{ANSWER_NOW_INSTRUCTION}"
                )));
                let response = self
                    .client
                    .query(ChatRequest {
                        messages: &messages,
                        tools: None,
                        max_retries: self.max_retries,
                    })
                    .await?;
                return match response {
                    ModelResponse::Final(reports) => Ok(into_issues(reports, check_query)),
                    ModelResponse::ToolCalls(_) => {
                        warn!("model kept requesting tools after the final-answer instruction");
                        Ok(Vec::new())
                    }
                };
            }

            messages.push(ChatMessage::user(format!(
                "{results_text}\n\n{CONTINUE_INSTRUCTION}"
            )));
        }

        warn!(max_iterations, "conversation hit the iteration cap without an answer");
        Ok(Vec::new())
    }

    /// Execute every requested call and serialize all results into one
    /// message. Failures come back as envelope errors for the model to
    /// adapt to; they never abort the check.
    async fn execute_calls(&self, calls: &[ToolCall]) -> String {
        let mut blocks = Vec::with_capacity(calls.len());
        for call in calls {
            let result = self.tools.execute(&call.name, &call.arguments).await;
            if !result.success {
                debug!(tool = %call.name, error = ?result.error, "tool execution failed");
            }
            blocks.push(format!(
                "Tool: {}\nResult: {}",
                call.name,
                result.to_message_json()
            ));
        }
        blocks.join("\n\n")
    }
}

fn serialize_calls(calls: &[ToolCall]) -> String {
    json!({ "tool_calls": calls }).to_string()
}

/// Validate wire reports into tracked issues. Reports without a file
/// path were already dropped at the parsing boundary.
fn into_issues(reports: Vec<IssueReport>, check_query: &str) -> Vec<Issue> {
    let timestamp = Utc::now();
    reports
        .into_iter()
        .map(|report| Issue {
            file_path: report.file,
            line_number: report.line_number,
            description: report.description,
            suggested_fix: report.suggested_fix,
            code_snippet: report.code_snippet,
            check_query: check_query.to_string(),
            timestamp,
            status: IssueStatus::Open,
        })
        .collect()
}
