//! Domain types shared across the scanner.

use chrono::DateTime;
use chrono::Utc;
use globset::Glob;
use globset::GlobSet;
use globset::GlobSetBuilder;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::matching::normalize_whitespace;
use crate::matching::texts_match;

/// Git status of a file with uncommitted changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Staged,
    Unstaged,
    Untracked,
    Deleted,
}

/// A file with uncommitted changes, as reported by the change detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    /// Path relative to the repository root.
    pub path: String,
    pub status: FileStatus,
}

impl ChangedFile {
    pub fn new(path: impl Into<String>, status: FileStatus) -> Self {
        Self {
            path: path.into(),
            status,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == FileStatus::Deleted
    }
}

/// Snapshot of the repository's uncommitted state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitState {
    pub changed_files: Vec<ChangedFile>,
    pub is_merging: bool,
    pub is_rebasing: bool,
    pub current_commit: String,
}

impl GitState {
    /// Merge or rebase conflict resolution is in progress; scanning
    /// waits until it completes.
    pub fn conflict_in_progress(&self) -> bool {
        self.is_merging || self.is_rebasing
    }

    pub fn has_changes(&self) -> bool {
        !self.changed_files.is_empty()
    }

    /// Whether the changed-file set (paths and statuses) differs from a
    /// previous snapshot. This is the watcher task's cheap comparison;
    /// the orchestrator confirms real changes by content hash.
    pub fn differs_from(&self, other: &GitState) -> bool {
        self.changed_files != other.changed_files
    }
}

/// A glob pattern paired with an ordered list of checks to run against
/// matching files. An empty check list marks matching files as ignored.
#[derive(Debug, Clone)]
pub struct CheckGroup {
    /// Comma-separated glob list, e.g. `"*.cpp, *.h"`.
    pub pattern: String,
    pub checks: Vec<String>,
    matcher: GlobSet,
}

impl CheckGroup {
    pub fn new(pattern: impl Into<String>, checks: Vec<String>) -> Result<Self, ConfigError> {
        let pattern = pattern.into();
        let mut builder = GlobSetBuilder::new();
        for part in pattern.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let glob = Glob::new(part).map_err(|e| ConfigError::InvalidPattern {
                pattern: part.to_string(),
                detail: e.to_string(),
            })?;
            builder.add(glob);
        }
        let matcher = builder.build().map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.clone(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            pattern,
            checks,
            matcher,
        })
    }

    /// An ignore rule: files matching the pattern are excluded from
    /// scanning and change detection entirely.
    pub fn is_ignore_rule(&self) -> bool {
        self.checks.is_empty()
    }

    /// Whether a repository-relative path matches any glob in the list.
    /// Globs are applied to both the full path and the bare file name,
    /// so `*.rs` and `src/*.rs` both behave as expected.
    pub fn matches_file(&self, path: &str) -> bool {
        if self.matcher.is_match(path) {
            return true;
        }
        match path.rsplit('/').next() {
            Some(name) if name != path => self.matcher.is_match(name),
            _ => false,
        }
    }
}

/// Bookkeeping for one scan cycle, surfaced in the report header.
#[derive(Debug, Clone, Default)]
pub struct ScanInfo {
    pub files_scanned: Vec<String>,
    pub skipped_files: Vec<String>,
    pub checks_run: usize,
}

/// Lifecycle state of a tracked issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IssueStatus {
    Open,
    Resolved,
}

/// A single issue reported by the model.
///
/// Owned exclusively by the issue tracker once added; mutated only
/// through its API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub file_path: String,
    pub line_number: u32,
    pub description: String,
    pub suggested_fix: String,
    pub code_snippet: String,
    pub check_query: String,
    pub timestamp: DateTime<Utc>,
    pub status: IssueStatus,
}

impl Issue {
    /// Whether this issue and `other` are the same finding.
    ///
    /// Same file plus equal-or-similar snippet or description, after
    /// whitespace normalization. Line numbers are never compared: code
    /// moves.
    pub fn matches(&self, other: &Issue) -> bool {
        if self.file_path != other.file_path {
            return false;
        }
        let self_snippet = normalize_whitespace(&self.code_snippet);
        let other_snippet = normalize_whitespace(&other.code_snippet);
        if texts_match(&self_snippet, &other_snippet) {
            return true;
        }
        let self_desc = normalize_whitespace(&self.description);
        let other_desc = normalize_whitespace(&other.description);
        texts_match(&self_desc, &other_desc)
    }
}
