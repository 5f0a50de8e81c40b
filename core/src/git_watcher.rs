//! Git change detection.
//!
//! Enumerates uncommitted changes by shelling out to `git -C <repo>`,
//! the same way the rest of the toolchain would see them. No libgit
//! binding: `status --porcelain=v2` is a stable machine interface.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;
use tracing::warn;

use crate::content::FileFilter;
use crate::error::GitError;
use crate::models::ChangedFile;
use crate::models::FileStatus;
use crate::models::GitState;

/// The change-detection contract the orchestrator consumes.
#[async_trait]
pub trait ChangeDetector: Send + Sync {
    async fn get_state(&self) -> Result<GitState, GitError>;
}

/// Watches a git work tree for uncommitted changes.
#[derive(Debug, Clone)]
pub struct GitWatcher {
    repo_root: PathBuf,
    base_commit: Option<String>,
    filter: FileFilter,
}

impl GitWatcher {
    pub fn new(repo_root: PathBuf, base_commit: Option<String>, filter: FileFilter) -> Self {
        Self {
            repo_root,
            base_commit,
            filter,
        }
    }

    /// Verify the directory is a git work tree and the base commit (if
    /// any) resolves.
    pub async fn connect(&self) -> Result<(), GitError> {
        let inside = self.run_git(&["rev-parse", "--is-inside-work-tree"]).await;
        match inside {
            Ok(out) if out.trim() == "true" => {}
            _ => {
                return Err(GitError::NotARepository {
                    path: self.repo_root.clone(),
                });
            }
        }
        if let Some(commit) = &self.base_commit {
            let spec = format!("{commit}^{{commit}}");
            if self.run_git(&["cat-file", "-e", &spec]).await.is_err() {
                return Err(GitError::InvalidCommit {
                    commit: commit.clone(),
                });
            }
        }
        Ok(())
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, GitError> {
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(&self.repo_root)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(GitError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn git_dir(&self) -> Result<PathBuf, GitError> {
        let out = self.run_git(&["rev-parse", "--git-dir"]).await?;
        let dir = PathBuf::from(out.trim());
        Ok(if dir.is_absolute() {
            dir
        } else {
            self.repo_root.join(dir)
        })
    }

    async fn changed_files(&self) -> Result<Vec<ChangedFile>, GitError> {
        let status = self
            .run_git(&["status", "--porcelain=v2", "--untracked-files=all"])
            .await?;
        let mut files = parse_porcelain_v2(&status);

        // When comparing against a base commit, files committed since
        // that commit also count as changed.
        if let Some(commit) = &self.base_commit {
            match self.run_git(&["diff", "--name-status", commit, "--"]).await {
                Ok(diff) => files.extend(parse_name_status(&diff)),
                Err(e) => warn!(error = %e, "git diff against base commit failed"),
            }
        }

        files.retain(|f| {
            if self.filter.is_excluded(&f.path) {
                return false;
            }
            // Submodules show up as directories; skip them.
            !self.repo_root.join(&f.path).is_dir()
        });
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);
        Ok(files)
    }
}

#[async_trait]
impl ChangeDetector for GitWatcher {
    async fn get_state(&self) -> Result<GitState, GitError> {
        let git_dir = self.git_dir().await?;
        let is_merging = git_dir.join("MERGE_HEAD").exists();
        let is_rebasing = git_dir.join("REBASE_HEAD").exists()
            || git_dir.join("rebase-merge").exists()
            || git_dir.join("rebase-apply").exists();

        let mut state = GitState {
            is_merging,
            is_rebasing,
            ..GitState::default()
        };
        if state.conflict_in_progress() {
            debug!("merge/rebase in progress, skipping change detection");
            return Ok(state);
        }

        state.current_commit = self
            .run_git(&["rev-parse", "HEAD"])
            .await
            .map(|out| out.trim().to_string())
            .unwrap_or_default();
        state.changed_files = self.changed_files().await?;
        Ok(state)
    }
}

/// Strip git's quoting of paths with special characters.
fn unquote(path: &str) -> &str {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
}

fn status_from_xy(xy: &str) -> FileStatus {
    let mut chars = xy.chars();
    let index = chars.next().unwrap_or('.');
    let work_tree = chars.next().unwrap_or('.');
    if index == 'D' || work_tree == 'D' {
        FileStatus::Deleted
    } else if xy == "??" {
        FileStatus::Untracked
    } else if index != '.' && index != '?' {
        FileStatus::Staged
    } else {
        FileStatus::Unstaged
    }
}

/// Parse `git status --porcelain=v2` output.
///
/// Entry formats handled: `1` ordinary changes, `2` renames (the
/// destination path, before the tab separator), `?` untracked, `u`
/// unmerged.
fn parse_porcelain_v2(output: &str) -> Vec<ChangedFile> {
    let mut files = Vec::new();
    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(' ').collect();
        let (xy, path) = match parts.first().copied() {
            Some("1") if parts.len() > 8 => (parts[1], parts[8..].join(" ")),
            Some("2") if parts.len() > 9 => {
                // Rename entries carry `<newPath><TAB><origPath>`; keep
                // the destination.
                let path_portion = parts[9..].join(" ");
                let new_path = match path_portion.split_once('\t') {
                    Some((new, _)) => new.to_string(),
                    None => path_portion,
                };
                (parts[1], new_path)
            }
            Some("?") if parts.len() > 1 => ("??", parts[1..].join(" ")),
            Some("u") if parts.len() > 10 => (parts[1], parts[10..].join(" ")),
            _ => continue,
        };
        let path = unquote(&path).to_string();
        if path.is_empty() {
            continue;
        }
        files.push(ChangedFile {
            status: status_from_xy(xy),
            path,
        });
    }
    files
}

/// Parse `git diff --name-status <commit>` output: committed-since-base
/// files count as staged, deletions as deleted.
fn parse_name_status(output: &str) -> Vec<ChangedFile> {
    let mut files = Vec::new();
    for line in output.lines() {
        let Some((status_char, rest)) = line.split_once('\t') else {
            continue;
        };
        // Renames list old and new paths; keep the new one.
        let path = rest.rsplit('\t').next().unwrap_or(rest);
        let path = unquote(path).to_string();
        if path.is_empty() {
            continue;
        }
        let status = if status_char.starts_with('D') {
            FileStatus::Deleted
        } else {
            FileStatus::Staged
        };
        files.push(ChangedFile { path, status });
    }
    files
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_ordinary_entries() {
        let output = "1 .M N... 100644 100644 100644 abc def src/main.rs\n\
                      1 M. N... 100644 100644 100644 abc def src/lib.rs\n\
                      1 .D N... 100644 100644 000000 abc def gone.rs\n";
        let files = parse_porcelain_v2(output);
        assert_eq!(
            files,
            vec![
                ChangedFile::new("src/main.rs", FileStatus::Unstaged),
                ChangedFile::new("src/lib.rs", FileStatus::Staged),
                ChangedFile::new("gone.rs", FileStatus::Deleted),
            ]
        );
    }

    #[test]
    fn parses_untracked_and_unmerged_entries() {
        let output = "? notes with space.txt\n\
                      u UU N... 100644 100644 100644 100644 a b c conflicted.rs\n";
        let files = parse_porcelain_v2(output);
        assert_eq!(files[0], ChangedFile::new("notes with space.txt", FileStatus::Untracked));
        assert_eq!(files[1].path, "conflicted.rs");
        assert_eq!(files[1].status, FileStatus::Staged);
    }

    #[test]
    fn rename_takes_the_new_path() {
        let output = "2 R. N... 100644 100644 100644 abc def R100 new_name.rs\told_name.rs\n";
        let files = parse_porcelain_v2(output);
        assert_eq!(files, vec![ChangedFile::new("new_name.rs", FileStatus::Staged)]);
    }

    #[test]
    fn quoted_paths_are_unquoted() {
        let output = "? \"weird name.txt\"\n";
        let files = parse_porcelain_v2(output);
        assert_eq!(files[0].path, "weird name.txt");
    }

    #[test]
    fn name_status_maps_deletions() {
        let output = "M\tsrc/lib.rs\nD\tgone.rs\nR100\told.rs\tnew.rs\n";
        let files = parse_name_status(output);
        assert_eq!(
            files,
            vec![
                ChangedFile::new("src/lib.rs", FileStatus::Staged),
                ChangedFile::new("gone.rs", FileStatus::Deleted),
                ChangedFile::new("new.rs", FileStatus::Staged),
            ]
        );
    }
}
