//! Repository-introspection tools the model can call mid-conversation.
//!
//! Every outcome — including invalid arguments and missing files — is
//! reported through the [`ToolResult`] envelope and serialized back into
//! the conversation, so a bad tool call can never abort a check.

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use globset::Glob;
use ignore::WalkBuilder;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

use crate::content::is_binary_file;
use crate::content::read_file_content;
use crate::matching::similarity_ratio;
use crate::tokens::estimate_tokens;

/// Ceiling on tokens returned by one `read_file` chunk.
const DEFAULT_CHUNK_TOKENS: usize = 4000;
/// Truncation guard for any single tool result.
const MAX_OUTPUT_LINES: usize = 2000;
const MAX_OUTPUT_BYTES: usize = 50 * 1024;
/// Page sizes for paginated results.
const SEARCH_PAGE_SIZE: usize = 50;
const LIST_PAGE_SIZE: usize = 100;
/// Bound on the files visited while computing name suggestions.
const SUGGESTION_SCAN_LIMIT: usize = 10_000;

/// Envelope returned by every tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub warning: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            warning: None,
        }
    }

    pub fn ok_with_warning(data: Value, warning: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            warning: Some(warning.into()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(message.into()),
            warning: None,
        }
    }

    /// Serialize the envelope for the conversation transcript.
    pub fn to_message_json(&self) -> Value {
        let mut value = json!({ "success": self.success, "data": self.data });
        if let Some(error) = &self.error {
            value["error"] = json!(error);
        }
        if let Some(warning) = &self.warning {
            value["warning"] = json!(warning);
        }
        value
    }
}

/// The tool-execution contract consumed by the conversation driver. The
/// catalogue behind it is opaque to the driver; only the envelope shape
/// matters.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, arguments: &Value) -> ToolResult;
}

static TOOL_SCHEMA: LazyLock<Vec<Value>> = LazyLock::new(|| {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "read_file",
                "description": "Read the content of a file in the repository. Large files are returned in chunks; when has_more is true, call again with start_line set to next_start_line.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "file_path": {
                            "type": "string",
                            "description": "Path relative to the repository root, e.g. 'src/module/file.ext'."
                        },
                        "start_line": {
                            "type": "integer",
                            "minimum": 1,
                            "description": "Optional 1-based line to start reading from."
                        },
                        "end_line": {
                            "type": "integer",
                            "minimum": 1,
                            "description": "Optional 1-based line to stop at (inclusive)."
                        }
                    },
                    "required": ["file_path"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "search_text",
                "description": "Search the repository for text patterns. Returns file paths, line numbers, and matching lines. Paginated: pass offset = next_offset when has_more is true.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "patterns": {
                            "description": "Pattern or array of patterns to search for.",
                            "oneOf": [
                                { "type": "string" },
                                { "type": "array", "items": { "type": "string" } }
                            ]
                        },
                        "match_whole_word": {
                            "type": "boolean",
                            "description": "Match whole words only (default true)."
                        },
                        "case_sensitive": {
                            "type": "boolean",
                            "description": "Case-sensitive search (default false)."
                        },
                        "file_pattern": {
                            "type": "string",
                            "description": "Optional glob filter, e.g. '*.rs'."
                        },
                        "offset": {
                            "type": "integer",
                            "minimum": 0,
                            "description": "Skip this many matches (pagination)."
                        }
                    },
                    "required": ["patterns"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "list_directory",
                "description": "List files and subdirectories. Returns paths with line counts for text files. Paginated: pass offset = next_offset when has_more is true.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "directory_path": {
                            "type": "string",
                            "description": "Path relative to the repository root, or '.' for the root."
                        },
                        "recursive": {
                            "type": "boolean",
                            "description": "List recursively (default false)."
                        },
                        "offset": {
                            "type": "integer",
                            "minimum": 0,
                            "description": "Skip this many entries (pagination)."
                        }
                    },
                    "required": ["directory_path"]
                }
            }
        }),
    ]
});

/// Schema of the shipped tool catalogue, in the function-calling shape
/// both backends accept.
pub fn tool_schema() -> &'static [Value] {
    &TOOL_SCHEMA
}

/// Tool executor sandboxed to one repository root.
#[derive(Debug, Clone)]
pub struct RepoTools {
    root: PathBuf,
    chunk_tokens: usize,
}

impl RepoTools {
    pub fn new(root: PathBuf, context_limit: usize) -> Self {
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            chunk_tokens: DEFAULT_CHUNK_TOKENS.min(context_limit / 4),
        }
    }

    /// Resolve a repo-relative path, refusing escapes from the root.
    fn resolve(&self, relative: &str) -> Result<PathBuf, String> {
        if relative.is_empty() {
            return Err("invalid 'file_path': received an empty string; provide a path relative to the repository root".to_string());
        }
        let candidate = self.root.join(relative);
        match candidate.canonicalize() {
            Ok(resolved) if resolved.starts_with(&self.root) => Ok(resolved),
            Ok(_) => Err(format!(
                "access denied: path '{relative}' is outside the repository"
            )),
            Err(_) => {
                let mut message = format!("file not found: {relative}");
                let suggestions = self.suggest_similar(relative);
                if !suggestions.is_empty() {
                    message.push_str(&format!(". Did you mean: {}?", suggestions.join(", ")));
                }
                Err(message)
            }
        }
    }

    /// Rank repository files by name similarity to a path that was not
    /// found.
    fn suggest_similar(&self, target: &str) -> Vec<String> {
        let target_name = file_name_of(target);
        let target_parent = parent_of(target);

        let mut scored: Vec<(String, f64)> = Vec::new();
        let mut visited = 0usize;
        for entry in WalkBuilder::new(&self.root).hidden(true).build().flatten() {
            if visited >= SUGGESTION_SCAN_LIMIT {
                break;
            }
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            visited += 1;
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            let name_score = similarity_ratio(target_name, file_name_of(&relative));
            let parent_score = similarity_ratio(target_parent, parent_of(&relative));
            let score = name_score * 0.7 + parent_score * 0.3;
            if score > 0.3 {
                scored.push((relative, score));
            }
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().take(5).map(|(path, _)| path).collect()
    }

    fn read_file(&self, arguments: &Value) -> ToolResult {
        let Some(file_path) = arguments.get("file_path").and_then(Value::as_str) else {
            return ToolResult::err("invalid 'file_path': expected a string");
        };
        let resolved = match self.resolve(file_path) {
            Ok(path) => path,
            Err(message) => return ToolResult::err(message),
        };
        if !resolved.is_file() {
            return ToolResult::err(format!("not a file: {file_path}"));
        }
        if is_binary_file(&resolved) {
            return ToolResult::err(format!("cannot read binary file: {file_path}"));
        }
        let Some(content) = read_file_content(&resolved) else {
            return ToolResult::err(format!("could not read file: {file_path}"));
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start_line = arguments
            .get("start_line")
            .and_then(Value::as_u64)
            .map_or(1, |v| v.max(1) as usize);
        if start_line > total_lines.max(1) {
            return ToolResult::err(format!(
                "invalid 'start_line': {start_line}; the file only has {total_lines} lines"
            ));
        }
        let end_line = arguments
            .get("end_line")
            .and_then(Value::as_u64)
            .map_or(total_lines, |v| (v as usize).min(total_lines));

        let mut chunk = String::new();
        let mut last_line = start_line.saturating_sub(1);
        for (index, line) in lines
            .iter()
            .enumerate()
            .take(end_line)
            .skip(start_line - 1)
        {
            if estimate_tokens(&chunk) + estimate_tokens(line) > self.chunk_tokens
                && !chunk.is_empty()
            {
                break;
            }
            chunk.push_str(line);
            chunk.push('\n');
            last_line = index + 1;
        }

        let (chunk, truncation_hint) = truncate_output(chunk);
        let has_more = last_line < end_line;
        let mut data = json!({
            "file_path": file_path,
            "content": chunk,
            "start_line": start_line,
            "end_line": last_line,
            "total_lines": total_lines,
            "has_more": has_more,
        });
        if has_more {
            data["next_start_line"] = json!(last_line + 1);
        }
        match truncation_hint {
            Some(hint) => ToolResult::ok_with_warning(data, hint),
            None if has_more => ToolResult::ok_with_warning(
                data,
                format!(
                    "partial content: lines {start_line}-{last_line} of {total_lines}; request start_line {} for the next chunk",
                    last_line + 1
                ),
            ),
            None => ToolResult::ok(data),
        }
    }

    fn search_text(&self, arguments: &Value) -> ToolResult {
        let patterns: Vec<String> = match arguments.get("patterns") {
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            Some(Value::Array(items)) => {
                let patterns: Vec<String> = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                if patterns.is_empty() {
                    return ToolResult::err("invalid 'patterns': expected at least one string");
                }
                patterns
            }
            _ => return ToolResult::err("invalid 'patterns': expected a string or array of strings"),
        };
        let whole_word = arguments
            .get("match_whole_word")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let case_sensitive = arguments
            .get("case_sensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let offset = arguments.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;

        let file_glob = match arguments.get("file_pattern").and_then(Value::as_str) {
            Some(pattern) => match Glob::new(pattern) {
                Ok(glob) => Some(glob.compile_matcher()),
                Err(e) => {
                    return ToolResult::err(format!("invalid 'file_pattern' glob: {e}"));
                }
            },
            None => None,
        };

        let needles: Vec<String> = if case_sensitive {
            patterns.clone()
        } else {
            patterns.iter().map(|p| p.to_lowercase()).collect()
        };

        // Collect one past the page to learn whether more matches exist
        // without walking the whole repository.
        let wanted = offset + SEARCH_PAGE_SIZE + 1;
        let mut matches = Vec::new();
        let mut walker = WalkBuilder::new(&self.root);
        walker.hidden(true).sort_by_file_path(|a, b| a.cmp(b));
        'files: for entry in walker.build().flatten() {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if let Some(glob) = &file_glob
                && !glob.is_match(&relative)
                && !glob.is_match(file_name_of(&relative))
            {
                continue;
            }
            if is_binary_file(path) {
                continue;
            }
            let Some(content) = read_file_content(path) else {
                continue;
            };
            for (line_index, line) in content.lines().enumerate() {
                let haystack = if case_sensitive {
                    line.to_string()
                } else {
                    line.to_lowercase()
                };
                for (pattern, needle) in patterns.iter().zip(&needles) {
                    if line_matches(&haystack, needle, whole_word) {
                        matches.push(json!({
                            "file": relative,
                            "line_number": line_index + 1,
                            "line": line.trim_end(),
                            "pattern": pattern,
                        }));
                        break;
                    }
                }
                if matches.len() >= wanted {
                    break 'files;
                }
            }
        }

        let has_more = matches.len() > offset + SEARCH_PAGE_SIZE;
        let page: Vec<Value> = matches
            .into_iter()
            .skip(offset)
            .take(SEARCH_PAGE_SIZE)
            .collect();
        let mut data = json!({
            "matches": page,
            "offset": offset,
            "has_more": has_more,
        });
        if has_more {
            data["next_offset"] = json!(offset + SEARCH_PAGE_SIZE);
        }
        ToolResult::ok(data)
    }

    fn list_directory(&self, arguments: &Value) -> ToolResult {
        let Some(directory_path) = arguments.get("directory_path").and_then(Value::as_str) else {
            return ToolResult::err("invalid 'directory_path': expected a string");
        };
        let resolved = if directory_path == "." || directory_path.is_empty() {
            self.root.clone()
        } else {
            match self.resolve(directory_path) {
                Ok(path) => path,
                Err(message) => return ToolResult::err(message),
            }
        };
        if !resolved.is_dir() {
            return ToolResult::err(format!("not a directory: {directory_path}"));
        }
        let recursive = arguments
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let offset = arguments.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;

        let mut walker = WalkBuilder::new(&resolved);
        walker.hidden(true).sort_by_file_path(|a, b| a.cmp(b));
        if !recursive {
            walker.max_depth(Some(1));
        }
        let mut entries = Vec::new();
        for entry in walker.build().flatten() {
            let path = entry.path();
            if path == resolved {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if entry.file_type().is_some_and(|t| t.is_dir()) {
                entries.push(json!({ "path": relative, "type": "directory" }));
            } else {
                let lines = if is_binary_file(path) {
                    Value::Null
                } else {
                    read_file_content(path)
                        .map(|c| json!(c.lines().count()))
                        .unwrap_or(Value::Null)
                };
                entries.push(json!({ "path": relative, "type": "file", "lines": lines }));
            }
        }

        let has_more = entries.len() > offset + LIST_PAGE_SIZE;
        let page: Vec<Value> = entries
            .into_iter()
            .skip(offset)
            .take(LIST_PAGE_SIZE)
            .collect();
        let mut data = json!({
            "entries": page,
            "offset": offset,
            "has_more": has_more,
        });
        if has_more {
            data["next_offset"] = json!(offset + LIST_PAGE_SIZE);
        }
        ToolResult::ok(data)
    }
}

#[async_trait]
impl ToolExecutor for RepoTools {
    async fn execute(&self, tool_name: &str, arguments: &Value) -> ToolResult {
        debug!(tool = tool_name, "executing tool");
        match tool_name {
            "read_file" => self.read_file(arguments),
            "search_text" => self.search_text(arguments),
            "list_directory" => self.list_directory(arguments),
            other => ToolResult::err(format!(
                "unknown tool '{other}'; available tools: read_file, search_text, list_directory"
            )),
        }
    }
}

fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[..index],
        None => "",
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn line_matches(haystack: &str, needle: &str, whole_word: bool) -> bool {
    if !whole_word {
        return haystack.contains(needle);
    }
    let mut search_from = 0;
    while let Some(found) = haystack[search_from..].find(needle) {
        let start = search_from + found;
        let end = start + needle.len();
        let before_ok = haystack[..start].chars().next_back().is_none_or(|c| !is_word_char(c));
        let after_ok = haystack[end..].chars().next().is_none_or(|c| !is_word_char(c));
        if before_ok && after_ok {
            return true;
        }
        search_from = end;
    }
    false
}

/// Cap a tool result at 2000 lines / 50 KiB, with a hint pointing the
/// model at the paginated alternatives.
fn truncate_output(content: String) -> (String, Option<String>) {
    let mut content = content;
    let mut hint = None;

    if content.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
        hint = Some(format!(
            "output truncated: content exceeded {} KiB; use search_text or read_file with a line range",
            MAX_OUTPUT_BYTES / 1024
        ));
    }

    let line_count = content.lines().count();
    if line_count > MAX_OUTPUT_LINES {
        content = content
            .lines()
            .take(MAX_OUTPUT_LINES)
            .collect::<Vec<_>>()
            .join("\n");
        hint = Some(format!(
            "output truncated: content exceeded {MAX_OUTPUT_LINES} lines; use search_text or read_file with start_line"
        ));
    }

    (content, hint)
}
