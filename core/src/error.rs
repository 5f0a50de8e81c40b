//! Error taxonomy for the scanner.
//!
//! Each subsystem exposes a closed enum; the orchestrator's retry policy
//! pattern-matches on [`LlmError`] variants rather than inspecting error
//! strings.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from an LLM backend.
///
/// The scanner's per-check policy is driven entirely by the variant:
/// `Connection` blocks and retries the same check, `MalformedResponse`
/// and `Backend` skip the check for this pass, `ContextOverflow` aborts
/// the offending check only.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Backend unreachable, reset, or timed out. Recoverable by waiting
    /// for the backend to come back.
    #[error("lost connection to {backend}: {detail}")]
    Connection { backend: &'static str, detail: String },

    /// The model never produced a parseable response, even after the
    /// self-fix round trips.
    #[error("no valid JSON response after {attempts} attempt(s)")]
    MalformedResponse { attempts: u32 },

    /// The backend rejected the request because the context window was
    /// exceeded. Treated as a budgeting bug: aborts the check, never the
    /// scan.
    #[error("context window exceeded: {detail}")]
    ContextOverflow { detail: String },

    /// Backend/setup errors that are neither transport nor overflow:
    /// missing model, empty model list, unusable response envelope.
    #[error("{backend} backend error: {detail}")]
    Backend { backend: &'static str, detail: String },

    /// The backend never reported a context window and none was
    /// configured.
    #[error("context limit unavailable; set `context_limit` in the [llm] config section")]
    ContextLimitUnavailable,
}

/// Errors from the git change detector.
#[derive(Debug, Error)]
pub enum GitError {
    #[error(
        "not a git repository: {}\nrun `git init` or pick a directory inside a work tree",
        path.display()
    )]
    NotARepository { path: PathBuf },

    #[error("invalid base commit: {commit}")]
    InvalidCommit { commit: String },

    #[error("`git {command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("target directory does not exist: {}", path.display())]
    MissingTargetDirectory { path: PathBuf },

    #[error("target path is not a directory: {}", path.display())]
    TargetNotADirectory { path: PathBuf },

    #[error(
        "configuration file not found: {}\nprovide one with --config or create vigil.toml in the target directory",
        path.display()
    )]
    MissingFile { path: PathBuf },

    #[error("invalid TOML in {}: {detail}", path.display())]
    InvalidToml { path: PathBuf, detail: String },

    #[error(
        "no check groups defined\nadd at least one [[checks]] table with a pattern and a non-empty check list"
    )]
    NoChecks,

    #[error("check {index} in group `{pattern}` must be a non-empty string")]
    EmptyCheck { pattern: String, index: usize },

    #[error("invalid glob pattern `{pattern}`: {detail}")]
    InvalidPattern { pattern: String, detail: String },

    #[error("invalid backend `{backend}`; must be one of: lm-studio, ollama")]
    UnknownBackend { backend: String },

    #[error("ollama backend requires `model` to be set\nexample: model = \"qwen3:4b\"")]
    OllamaModelRequired,
}

/// Report writing/parsing errors.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to write report {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read report {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Scan-level failures that abort one scan cycle (never the process).
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Output(#[from] OutputError),
}
