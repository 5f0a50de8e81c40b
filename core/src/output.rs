//! Durable markdown report.
//!
//! The report is the scanner's only persistent state: it is rewritten
//! atomically after every check and batch, and parsed back on startup so
//! a restarted process resumes with the same tracked issues.

use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use tracing::debug;
use tracing::warn;

use crate::error::OutputError;
use crate::models::Issue;
use crate::models::IssueStatus;
use crate::models::ScanInfo;
use crate::tracker::IssueTracker;

/// Writes the report file. Safe to call repeatedly with growing state;
/// each write replaces the file atomically.
#[derive(Debug, Clone)]
pub struct OutputGenerator {
    path: PathBuf,
}

impl OutputGenerator {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, tracker: &IssueTracker, info: &ScanInfo) -> Result<(), OutputError> {
        let report = render_report(tracker, info, Utc::now());
        let parent = self.path.parent().unwrap_or(Path::new("."));
        let temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| OutputError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        std::fs::write(temp.path(), report).map_err(|e| OutputError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        temp.persist(&self.path).map_err(|e| OutputError::Write {
            path: self.path.clone(),
            source: e.error,
        })?;
        debug!(path = %self.path.display(), "report updated");
        Ok(())
    }

    /// Read a previously written report back into an issue set.
    /// Returns an empty set when the file does not exist.
    pub fn parse(&self) -> Result<Vec<Issue>, OutputError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| OutputError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(parse_report(&raw))
    }
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn render_report(tracker: &IssueTracker, info: &ScanInfo, generated: DateTime<Utc>) -> String {
    let stats = tracker.stats();
    let mut out = String::new();
    out.push_str("# Vigil Scan Report\n\n");
    out.push_str(&format!("- **Generated:** {}\n", generated.to_rfc3339()));
    out.push_str(&format!(
        "- **Open:** {} | **Resolved:** {} | **Total:** {}\n",
        stats.open, stats.resolved, stats.total
    ));
    out.push_str(&format!(
        "- **Files scanned:** {}\n",
        info.files_scanned.len()
    ));
    out.push_str(&format!("- **Checks run:** {}\n", info.checks_run));
    if !info.skipped_files.is_empty() {
        out.push_str(&format!(
            "- **Skipped (oversized):** {}\n",
            info.skipped_files.join(", ")
        ));
    }
    out.push('\n');

    for (title, status) in [
        ("## Open Issues", IssueStatus::Open),
        ("## Resolved Issues", IssueStatus::Resolved),
    ] {
        out.push_str(title);
        out.push('\n');
        let mut any = false;
        for (file, issues) in tracker.issues_by_file() {
            let issues: Vec<&&Issue> = issues.iter().filter(|i| i.status == status).collect();
            if issues.is_empty() {
                continue;
            }
            any = true;
            out.push_str(&format!("\n### `{file}`\n\n"));
            for issue in issues {
                render_issue(&mut out, issue);
            }
        }
        if !any {
            out.push_str("\nNone.\n");
        }
        out.push('\n');
    }
    out
}

fn render_issue(out: &mut String, issue: &Issue) {
    out.push_str(&format!("- **Line:** {}\n", issue.line_number));
    out.push_str(&format!("  **Check:** {}\n", single_line(&issue.check_query)));
    out.push_str(&format!(
        "  **Detected:** {}\n",
        issue.timestamp.to_rfc3339()
    ));
    out.push_str(&format!(
        "  **Description:** {}\n",
        single_line(&issue.description)
    ));
    if !issue.suggested_fix.is_empty() {
        out.push_str(&format!(
            "  **Suggested fix:** {}\n",
            single_line(&issue.suggested_fix)
        ));
    }
    if !issue.code_snippet.is_empty() {
        out.push_str("\n```\n");
        out.push_str(issue.code_snippet.trim_end_matches('\n'));
        out.push_str("\n```\n");
    }
    out.push('\n');
}

fn parse_report(raw: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    let mut section: Option<IssueStatus> = None;
    let mut file: Option<String> = None;
    let mut current: Option<Issue> = None;
    let mut snippet: Option<Vec<String>> = None;

    for line in raw.lines() {
        if let Some(lines) = snippet.as_mut() {
            if line == "```" {
                if let Some(issue) = current.as_mut() {
                    issue.code_snippet = lines.join("\n");
                }
                snippet = None;
            } else {
                lines.push(line.to_string());
            }
            continue;
        }

        if line == "## Open Issues" {
            flush(&mut current, &mut issues);
            section = Some(IssueStatus::Open);
            continue;
        }
        if line == "## Resolved Issues" {
            flush(&mut current, &mut issues);
            section = Some(IssueStatus::Resolved);
            continue;
        }
        if let Some(name) = line
            .strip_prefix("### `")
            .and_then(|rest| rest.strip_suffix('`'))
        {
            flush(&mut current, &mut issues);
            file = Some(name.to_string());
            continue;
        }

        let (Some(status), Some(file_path)) = (section, file.as_ref()) else {
            continue;
        };

        if let Some(value) = line.strip_prefix("- **Line:** ") {
            flush(&mut current, &mut issues);
            let line_number = value.trim().parse().unwrap_or_else(|_| {
                warn!(value, "unparseable line number in report");
                0
            });
            current = Some(Issue {
                file_path: file_path.clone(),
                line_number,
                description: String::new(),
                suggested_fix: String::new(),
                code_snippet: String::new(),
                check_query: String::new(),
                timestamp: Utc::now(),
                status,
            });
            continue;
        }

        let Some(issue) = current.as_mut() else {
            continue;
        };
        if let Some(value) = line.strip_prefix("  **Check:** ") {
            issue.check_query = value.to_string();
        } else if let Some(value) = line.strip_prefix("  **Detected:** ") {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(value.trim()) {
                issue.timestamp = parsed.with_timezone(&Utc);
            }
        } else if let Some(value) = line.strip_prefix("  **Description:** ") {
            issue.description = value.to_string();
        } else if let Some(value) = line.strip_prefix("  **Suggested fix:** ") {
            issue.suggested_fix = value.to_string();
        } else if line == "```" {
            snippet = Some(Vec::new());
        }
    }
    flush(&mut current, &mut issues);
    issues
}

fn flush(current: &mut Option<Issue>, issues: &mut Vec<Issue>) {
    if let Some(issue) = current.take() {
        issues.push(issue);
    }
}

#[cfg(test)]
mod tests {
    use chrono::SubsecRound;
    use pretty_assertions::assert_eq;

    use super::*;

    fn issue(file: &str, line: u32, desc: &str, snippet: &str) -> Issue {
        Issue {
            file_path: file.to_string(),
            line_number: line,
            description: desc.to_string(),
            suggested_fix: "apply the fix".to_string(),
            code_snippet: snippet.to_string(),
            check_query: "Check error handling".to_string(),
            timestamp: Utc::now().trunc_subsecs(0),
            status: IssueStatus::Open,
        }
    }

    #[test]
    fn report_round_trips_issue_state() {
        let dir = tempfile::tempdir().unwrap();
        let generator = OutputGenerator::new(dir.path().join("report.md"));

        let mut tracker = IssueTracker::new();
        tracker.add_issue(issue("src/a.rs", 3, "bad unwrap", "x.unwrap()"));
        tracker.add_issue(issue("src/a.rs", 9, "leaked handle", "open(f)\nread(f)"));
        tracker.add_issue(issue("b.rs", 1, "off by one", "i <= len"));
        tracker.resolve_issues_for_file("b.rs");

        let info = ScanInfo {
            files_scanned: vec!["src/a.rs".to_string(), "b.rs".to_string()],
            skipped_files: Vec::new(),
            checks_run: 2,
        };
        generator.write(&tracker, &info).unwrap();

        let restored = IssueTracker::from_issues(generator.parse().unwrap());
        let original_stats = tracker.stats();
        assert_eq!(restored.stats(), original_stats);

        let restored_open = restored.open_issues();
        let mut descriptions: Vec<&str> =
            restored_open.iter().map(|i| i.description.as_str()).collect();
        descriptions.sort_unstable();
        assert_eq!(descriptions, vec!["bad unwrap", "leaked handle"]);

        let multiline = restored_open
            .iter()
            .find(|i| i.description == "leaked handle")
            .unwrap();
        assert_eq!(multiline.code_snippet, "open(f)\nread(f)");
        assert_eq!(multiline.line_number, 9);
        assert_eq!(multiline.check_query, "Check error handling");

        let resolved = restored.resolved_issues();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].file_path, "b.rs");
    }

    #[test]
    fn parse_missing_report_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let generator = OutputGenerator::new(dir.path().join("absent.md"));
        assert!(generator.parse().unwrap().is_empty());
    }

    #[test]
    fn timestamps_survive_the_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let generator = OutputGenerator::new(dir.path().join("report.md"));
        let mut tracker = IssueTracker::new();
        let original = issue("a.rs", 1, "d", "s");
        tracker.add_issue(original.clone());
        generator.write(&tracker, &ScanInfo::default()).unwrap();

        let restored = generator.parse().unwrap();
        assert_eq!(restored[0].timestamp, original.timestamp);
    }

    #[test]
    fn repeated_writes_are_idempotent_safe() {
        let dir = tempfile::tempdir().unwrap();
        let generator = OutputGenerator::new(dir.path().join("report.md"));
        let mut tracker = IssueTracker::new();
        tracker.add_issue(issue("a.rs", 1, "d", "s"));
        let info = ScanInfo::default();
        generator.write(&tracker, &info).unwrap();
        generator.write(&tracker, &info).unwrap();
        assert_eq!(generator.parse().unwrap().len(), 1);
    }
}
