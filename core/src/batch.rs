//! Token budget planner.
//!
//! Splits the changed-file contents into batches that each fit the share
//! of the model's context window reserved for file content. Directory
//! groups are packed deepest-first so the most specific context stays
//! together.

use std::path::Path;

use indexmap::IndexMap;
use tracing::warn;

use crate::tokens::estimate_tokens;

/// Share of the context window available for file content. The rest is
/// reserved for the system prompt, tool schema, and response headroom.
const CONTENT_BUDGET_PERCENT: usize = 55;

/// A token-bounded set of files sent to the model together, in pack
/// order.
pub type Batch = IndexMap<String, String>;

/// Result of planning: the batches plus any files too large to place in
/// any batch. Skipped files are reported, never silently dropped.
#[derive(Debug, Default)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
    pub skipped: Vec<String>,
}

/// Tokens available for file content given a model context limit.
pub fn content_budget(context_limit: usize) -> usize {
    context_limit * CONTENT_BUDGET_PERCENT / 100
}

/// Split `files` into batches whose estimated token totals fit the
/// content budget derived from `context_limit`.
pub fn plan_batches(files: &IndexMap<String, String>, context_limit: usize) -> BatchPlan {
    let available = content_budget(context_limit);
    let mut plan = BatchPlan::default();

    let total: usize = files.values().map(|c| estimate_tokens(c)).sum();
    if total <= available {
        if !files.is_empty() {
            plan.batches.push(files.clone());
        }
        return plan;
    }

    let mut current = Batch::new();
    let mut current_tokens = 0usize;

    for (_, group_paths) in group_by_directory(files.keys()) {
        let mut dir_content = Batch::new();
        let mut dir_tokens = 0usize;

        for path in group_paths {
            let content = &files[path];
            let tokens = estimate_tokens(content);
            if tokens > available {
                warn!(
                    path = %path,
                    tokens, available, "skipping file larger than the content budget"
                );
                plan.skipped.push(path.to_string());
                continue;
            }
            dir_content.insert(path.to_string(), content.clone());
            dir_tokens += tokens;
        }

        if dir_content.is_empty() {
            continue;
        }

        if current_tokens + dir_tokens <= available {
            current.extend(dir_content);
            current_tokens += dir_tokens;
        } else if dir_tokens <= available {
            // The whole group fits on its own: start a fresh batch with it.
            if !current.is_empty() {
                plan.batches.push(std::mem::take(&mut current));
            }
            current = dir_content;
            current_tokens = dir_tokens;
        } else {
            // Group exceeds the budget by itself: fall back to packing
            // its files individually.
            if !current.is_empty() {
                plan.batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            for (path, content) in dir_content {
                let tokens = estimate_tokens(&content);
                if current_tokens + tokens <= available {
                    current.insert(path, content);
                    current_tokens += tokens;
                } else {
                    if !current.is_empty() {
                        plan.batches.push(std::mem::take(&mut current));
                    }
                    current_tokens = tokens;
                    current.insert(path, content);
                }
            }
        }
    }

    if !current.is_empty() {
        plan.batches.push(current);
    }

    plan
}

/// Group paths by parent directory, deepest directories first. Files
/// keep their input order within each group.
fn group_by_directory<'a>(
    paths: impl IntoIterator<Item = &'a String>,
) -> Vec<(String, Vec<&'a String>)> {
    let mut groups: IndexMap<String, Vec<&'a String>> = IndexMap::new();
    for path in paths {
        let parent = Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        groups.entry(parent).or_default().push(path);
    }
    let mut ordered: Vec<(String, Vec<&'a String>)> = groups.into_iter().collect();
    ordered.sort_by_key(|(dir, _)| std::cmp::Reverse(dir.matches('/').count() + 1));
    ordered
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn files(entries: &[(&str, usize)]) -> IndexMap<String, String> {
        entries
            .iter()
            .map(|(path, tokens)| (path.to_string(), "x".repeat(tokens * 4)))
            .collect()
    }

    #[test]
    fn everything_fits_in_one_batch() {
        let files = files(&[("a.py", 50), ("b.py", 50)]);
        let plan = plan_batches(&files, 16_000);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].len(), 2);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn batches_respect_the_content_budget() {
        let files = files(&[
            ("src/a.rs", 200),
            ("src/b.rs", 200),
            ("src/deep/c.rs", 200),
            ("d.rs", 200),
        ]);
        let context_limit = 1_000; // budget = 550
        let plan = plan_batches(&files, context_limit);
        assert!(plan.batches.len() > 1);
        for batch in &plan.batches {
            let total: usize = batch.values().map(|c| estimate_tokens(c)).sum();
            assert!(total <= content_budget(context_limit));
        }
        let placed: usize = plan.batches.iter().map(Batch::len).sum();
        assert_eq!(placed, 4);
    }

    #[test]
    fn oversized_file_is_skipped_and_reported() {
        let files = files(&[("big.rs", 600), ("small.rs", 100), ("other.rs", 100)]);
        let plan = plan_batches(&files, 1_000);
        assert_eq!(plan.skipped, vec!["big.rs".to_string()]);
        let placed: Vec<&String> = plan.batches.iter().flat_map(Batch::keys).collect();
        assert!(placed.contains(&&"small.rs".to_string()));
        assert!(placed.contains(&&"other.rs".to_string()));
    }

    #[test]
    fn deepest_directories_are_packed_first() {
        let files = files(&[("top.rs", 100), ("a/b/c/deep.rs", 100), ("a/mid.rs", 100)]);
        // Force the grouped path: total exceeds the budget.
        let plan = plan_batches(&files, 500); // budget = 275
        let first = &plan.batches[0];
        assert!(first.contains_key("a/b/c/deep.rs"));
    }

    #[test]
    fn oversized_directory_splits_into_files() {
        let files = files(&[("pkg/a.rs", 200), ("pkg/b.rs", 200), ("pkg/c.rs", 200)]);
        let plan = plan_batches(&files, 1_000); // budget = 550, dir = 600
        assert!(plan.skipped.is_empty());
        let placed: usize = plan.batches.iter().map(Batch::len).sum();
        assert_eq!(placed, 3);
        for batch in &plan.batches {
            let total: usize = batch.values().map(|c| estimate_tokens(c)).sum();
            assert!(total <= 550);
        }
    }

    #[test]
    fn empty_input_yields_no_batches() {
        let plan = plan_batches(&IndexMap::new(), 16_000);
        assert!(plan.batches.is_empty());
        assert!(plan.skipped.is_empty());
    }
}
