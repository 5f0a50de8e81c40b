//! Prompt construction for analysis conversations.

use crate::batch::Batch;

/// System instructions shared by both backends. The response contract is
/// spelled out twice because small local models drift from it otherwise.
pub const SYSTEM_PROMPT: &str = r#"You are a code analysis assistant. Your task is to analyze source code and identify issues based on specific checks.

You may call the provided tools (read_file, search_text, list_directory) to gather additional repository context before answering.

When you answer, your response must be ONLY a valid JSON object. Do NOT include:
- Markdown code fences (```)
- Explanations or comments before/after the JSON
- Any text outside the JSON object

REQUIRED OUTPUT FORMAT (copy this structure exactly):
{"issues": [{"file": "path/to/file.ext", "line_number": 42, "description": "Issue description", "suggested_fix": "How to fix it", "code_snippet": "problematic code"}]}

Each issue in the array must have these exact keys:
- "file": string - the file path where the issue was found
- "line_number": integer - the line number (1-based)
- "description": string - clear description of the issue
- "suggested_fix": string - the suggested fix
- "code_snippet": string - the problematic code snippet

If no issues are found, return exactly: {"issues": []}

Be precise with line numbers. Only report actual issues, not potential or hypothetical ones."#;

/// Instruction appended after tool results when the conversation may
/// continue requesting tools.
pub const CONTINUE_INSTRUCTION: &str =
    "Tool results above. Continue the analysis; request more tools if needed, otherwise answer with the issues JSON now.";

/// Instruction appended when the token budget is exhausted: the next
/// request carries no tool schema, so the model must answer.
pub const ANSWER_NOW_INSTRUCTION: &str =
    "Tool budget exhausted. Do not request any more tools. Answer now with the issues JSON based on what you have seen.";

/// Build the user message embedding every file of a batch.
pub fn build_user_prompt(check_query: &str, batch: &Batch) -> String {
    let mut parts = vec![
        format!("## Check to perform:\n{check_query}\n"),
        "## Files to analyze:\n".to_string(),
    ];
    for (path, content) in batch {
        parts.push(format!("### File: {path}\n```\n{content}\n```\n"));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_embeds_every_file() {
        let mut batch = Batch::new();
        batch.insert("a.py".to_string(), "x = 1".to_string());
        batch.insert("lib/b.py".to_string(), "y = 2".to_string());
        let prompt = build_user_prompt("Check for bugs", &batch);
        assert!(prompt.contains("Check for bugs"));
        assert!(prompt.contains("### File: a.py"));
        assert!(prompt.contains("x = 1"));
        assert!(prompt.contains("### File: lib/b.py"));
    }
}
