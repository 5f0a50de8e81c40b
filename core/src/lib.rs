//! Core library for vigil, an incremental scanner that reviews the
//! uncommitted changes of a git work tree with a local LLM backend.
//!
//! The scanning pipeline is: the [`git_watcher`] enumerates changed files,
//! the [`batch`] planner splits their contents into token-bounded batches,
//! the [`driver`] runs one check query per batch as a bounded tool-calling
//! conversation, and the [`tracker`] deduplicates and resolves the issues
//! the model reports. [`scanner`] ties these together with a watermark
//! rescan loop that re-runs only the checks invalidated by mid-scan edits.

pub mod batch;
pub mod client;
pub mod config;
pub mod content;
pub mod driver;
pub mod error;
pub mod git_watcher;
pub mod lmstudio;
pub mod matching;
pub mod models;
pub mod ollama;
pub mod output;
pub mod prompt;
pub mod scanner;
pub mod signal;
pub mod snapshot;
pub mod tokens;
pub mod tools;
pub mod tracker;

pub use batch::Batch;
pub use batch::BatchPlan;
pub use client::ModelClient;
pub use client::ModelResponse;
pub use config::Config;
pub use error::LlmError;
pub use models::ChangedFile;
pub use models::CheckGroup;
pub use models::FileStatus;
pub use models::GitState;
pub use models::Issue;
pub use models::IssueStatus;
pub use scanner::Scanner;
pub use tracker::IssueTracker;
