//! Issue lifecycle tracking: deduplication, resolution, reopening.

use std::collections::BTreeMap;
use std::collections::HashSet;

use tracing::debug;
use tracing::info;

use crate::models::Issue;
use crate::models::IssueStatus;

/// Open/resolved counts exposed to the report and the exit summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueStats {
    pub open: usize,
    pub resolved: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct FileIssues {
    open: Vec<Issue>,
    resolved: Vec<Issue>,
}

/// In-memory store of every issue the scanner has seen, indexed per file
/// so deduplication is O(issues-in-file) rather than O(total issues).
///
/// Only the scanner task mutates the tracker, so it needs no locking.
#[derive(Debug, Default)]
pub struct IssueTracker {
    files: BTreeMap<String, FileIssues>,
}

impl IssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tracker from a previously persisted issue set (process
    /// restart support).
    pub fn from_issues(issues: Vec<Issue>) -> Self {
        let mut tracker = Self::new();
        for issue in issues {
            let entry = tracker.files.entry(issue.file_path.clone()).or_default();
            match issue.status {
                IssueStatus::Open => entry.open.push(issue),
                IssueStatus::Resolved => entry.resolved.push(issue),
            }
        }
        tracker
    }

    /// Add one issue, deduplicating against the file's existing issues.
    ///
    /// A match against an OPEN issue updates its line number and
    /// timestamp in place; a match against a RESOLVED issue reopens it.
    /// Returns true only when a genuinely new issue was created.
    pub fn add_issue(&mut self, issue: Issue) -> bool {
        let entry = self.files.entry(issue.file_path.clone()).or_default();

        if let Some(existing) = entry.open.iter_mut().find(|e| e.matches(&issue)) {
            if existing.line_number != issue.line_number {
                debug!(
                    file = %existing.file_path,
                    from = existing.line_number,
                    to = issue.line_number,
                    "issue moved"
                );
            }
            existing.line_number = issue.line_number;
            existing.timestamp = issue.timestamp;
            return false;
        }

        if let Some(idx) = entry.resolved.iter().position(|e| e.matches(&issue)) {
            let mut reopened = entry.resolved.remove(idx);
            info!(file = %reopened.file_path, "reopening resolved issue");
            reopened.status = IssueStatus::Open;
            reopened.line_number = issue.line_number;
            reopened.timestamp = issue.timestamp;
            entry.open.push(reopened);
            return false;
        }

        info!(file = %issue.file_path, line = issue.line_number, "new issue");
        entry.open.push(issue);
        true
    }

    /// Add several issues; returns how many were genuinely new.
    pub fn add_issues(&mut self, issues: Vec<Issue>) -> usize {
        issues.into_iter().filter(|i| self.add_issue(i.clone())).count()
    }

    /// Move every OPEN issue for `file_path` to RESOLVED. Used for
    /// deleted files and for files a check found clean.
    pub fn resolve_issues_for_file(&mut self, file_path: &str) -> usize {
        let Some(entry) = self.files.get_mut(file_path) else {
            return 0;
        };
        let mut resolved_count = 0;
        for mut issue in entry.open.drain(..) {
            info!(file = %issue.file_path, line = issue.line_number, "resolved issue");
            issue.status = IssueStatus::Resolved;
            // Keep only the most recent resolved instance per class.
            entry.resolved.retain(|r| !r.matches(&issue));
            entry.resolved.push(issue);
            resolved_count += 1;
        }
        resolved_count
    }

    /// Fold a completed scan into the tracker.
    ///
    /// `files_considered` is the set of files whose content actually
    /// changed this cycle: a considered file with no new issues has all
    /// its OPEN issues resolved, and a considered file with new issues
    /// has its non-reproduced OPEN issues resolved. Files not in
    /// `files_considered` are left untouched no matter what `new_issues`
    /// says — unchanged input is not evidence of resolution.
    ///
    /// Returns `(new_count, resolved_count)`.
    pub fn reconcile(
        &mut self,
        new_issues: Vec<Issue>,
        files_considered: &[String],
    ) -> (usize, usize) {
        let mut by_file: BTreeMap<&str, Vec<&Issue>> = BTreeMap::new();
        for issue in &new_issues {
            by_file.entry(issue.file_path.as_str()).or_default().push(issue);
        }

        let considered: HashSet<&str> = files_considered.iter().map(String::as_str).collect();

        let mut resolved_count = 0;
        for &file_path in &considered {
            match by_file.get(file_path) {
                None => {
                    resolved_count += self.resolve_issues_for_file(file_path);
                }
                Some(current) => {
                    resolved_count += self.resolve_non_matching(file_path, current);
                }
            }
        }

        let new_count = self.add_issues(new_issues);
        (new_count, resolved_count)
    }

    /// Resolve OPEN issues in a file that match none of the issues the
    /// latest scan reported for it.
    fn resolve_non_matching(&mut self, file_path: &str, current: &[&Issue]) -> usize {
        let Some(entry) = self.files.get_mut(file_path) else {
            return 0;
        };
        let mut resolved_count = 0;
        let mut still_open = Vec::with_capacity(entry.open.len());
        for mut issue in entry.open.drain(..) {
            if current.iter().any(|c| issue.matches(c)) {
                still_open.push(issue);
            } else {
                info!(file = %issue.file_path, line = issue.line_number, "resolved (fixed)");
                issue.status = IssueStatus::Resolved;
                entry.resolved.retain(|r| !r.matches(&issue));
                entry.resolved.push(issue);
                resolved_count += 1;
            }
        }
        entry.open = still_open;
        resolved_count
    }

    /// All issues grouped by file, line-sorted within each file, files
    /// in path order.
    pub fn issues_by_file(&self) -> Vec<(&str, Vec<&Issue>)> {
        self.files
            .iter()
            .map(|(path, entry)| {
                let mut issues: Vec<&Issue> =
                    entry.open.iter().chain(entry.resolved.iter()).collect();
                issues.sort_by_key(|i| i.line_number);
                (path.as_str(), issues)
            })
            .filter(|(_, issues)| !issues.is_empty())
            .collect()
    }

    pub fn open_issues(&self) -> Vec<&Issue> {
        self.files.values().flat_map(|e| e.open.iter()).collect()
    }

    pub fn resolved_issues(&self) -> Vec<&Issue> {
        self.files.values().flat_map(|e| e.resolved.iter()).collect()
    }

    pub fn stats(&self) -> IssueStats {
        let open = self.files.values().map(|e| e.open.len()).sum();
        let resolved = self.files.values().map(|e| e.resolved.len()).sum();
        IssueStats {
            open,
            resolved,
            total: open + resolved,
        }
    }
}
