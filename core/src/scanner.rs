//! Incremental scan orchestrator.
//!
//! Runs the configured checks over token-bounded batches of changed
//! files and converges via a watermark: when content changes mid-scan,
//! only the prefix of checks up to and including the change point is
//! stale and re-run — checks after it already saw the fresh content.
//! Change signals are confirmed by content hash before they invalidate
//! anything; timestamp churn never triggers work.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::batch::Batch;
use crate::batch::plan_batches;
use crate::client::ModelClient;
use crate::config::Config;
use crate::content::is_binary_file;
use crate::content::read_file_content;
use crate::driver::ConversationDriver;
use crate::error::LlmError;
use crate::error::ScanError;
use crate::git_watcher::ChangeDetector;
use crate::models::GitState;
use crate::models::Issue;
use crate::models::ScanInfo;
use crate::output::OutputGenerator;
use crate::signal::RefreshSignal;
use crate::snapshot::ScanSnapshot;
use crate::tools::ToolExecutor;
use crate::tracker::IssueTracker;

/// Counts reported by one completed scan cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub new_count: usize,
    pub resolved_count: usize,
}

/// One executable unit: a check query and the batches it applies to.
#[derive(Debug, Clone)]
struct CheckTask {
    group_index: usize,
    check_index: usize,
    query: String,
    batches: Vec<Batch>,
}

impl CheckTask {
    fn key(&self) -> (usize, usize) {
        (self.group_index, self.check_index)
    }
}

/// The scanner: owns the tracker and drives the whole pipeline.
pub struct Scanner {
    config: Arc<Config>,
    detector: Arc<dyn ChangeDetector>,
    client: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    tracker: IssueTracker,
    output: OutputGenerator,
    refresh: Arc<RefreshSignal>,
    cancel: CancellationToken,
    /// Content hashes at the last completed scan; the baseline against
    /// which "did anything really change" is judged.
    last_scan_hashes: Option<ScanSnapshot>,
    scan_info: ScanInfo,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        detector: Arc<dyn ChangeDetector>,
        client: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolExecutor>,
        tracker: IssueTracker,
        output: OutputGenerator,
        refresh: Arc<RefreshSignal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            detector,
            client,
            tools,
            tracker,
            output,
            refresh,
            cancel,
            last_scan_hashes: None,
            scan_info: ScanInfo::default(),
        }
    }

    pub fn tracker(&self) -> &IssueTracker {
        &self.tracker
    }

    /// Main loop: poll the repository, scan when something really
    /// changed, otherwise park on the refresh signal.
    pub async fn run(&mut self) {
        info!("scanner loop started");
        while !self.cancel.is_cancelled() {
            let state = match self.detector.get_state().await {
                Ok(state) => state,
                Err(e) => {
                    error!(error = %e, "change detection failed");
                    self.idle_wait().await;
                    continue;
                }
            };

            if state.conflict_in_progress() {
                info!("merge/rebase in progress, waiting for it to complete");
                self.idle_wait().await;
                continue;
            }
            if !state.has_changes() {
                debug!("no changes detected, waiting");
                self.idle_wait().await;
                self.refresh.clear();
                continue;
            }
            if !self.needs_scan(&state) {
                debug!("change signal carried no content change, waiting");
                self.idle_wait().await;
                self.refresh.clear();
                continue;
            }

            match self.scan(state).await {
                Ok(outcome) => {
                    info!(
                        new = outcome.new_count,
                        resolved = outcome.resolved_count,
                        total = self.tracker.stats().total,
                        "scan complete"
                    );
                }
                Err(e) => {
                    error!(error = %e, "scan failed");
                    self.idle_wait().await;
                }
            }
        }
        info!("scanner loop ended");
    }

    async fn idle_wait(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.refresh.wait(self.config.git_poll_interval) => {}
        }
    }

    /// Downgrade a change signal unless some non-ignored file's content
    /// actually differs from the last completed scan.
    fn needs_scan(&self, state: &GitState) -> bool {
        let Some(previous) = &self.last_scan_hashes else {
            return true;
        };
        self.capture_snapshot(state).differs_from(previous)
    }

    /// Execute one scan cycle: loop passes until every check ran on
    /// stable content (or the pass bound is hit), then reconcile.
    pub async fn scan(&mut self, initial_state: GitState) -> Result<ScanOutcome, ScanError> {
        info!(
            changed_files = initial_state.changed_files.len(),
            "starting scan"
        );
        let context_limit = self.client.context_limit()?;
        self.scan_info = ScanInfo::default();

        let mut state = initial_state;
        let mut run_until = usize::MAX;
        let mut results: BTreeMap<(usize, usize), Vec<Issue>> = BTreeMap::new();
        let mut snapshot = ScanSnapshot::default();
        let mut scanned_files: Vec<String> = Vec::new();
        let mut new_total = 0usize;
        let mut pass: u32 = 0;
        let mut aborted = false;

        loop {
            pass += 1;
            if pass > 1 {
                // Stale prefix rescan: rebuild everything from fresh
                // content.
                state = self.detector.get_state().await?;
            }
            let files = self.collect_files(&state);
            scanned_files = files.keys().cloned().collect();
            self.scan_info.files_scanned = scanned_files.clone();
            snapshot = self.capture_snapshot(&state);

            if files.is_empty() {
                info!("no scannable files found");
                break;
            }
            let plan = plan_batches(&files, context_limit);
            for skipped in plan.skipped {
                if !self.scan_info.skipped_files.contains(&skipped) {
                    self.scan_info.skipped_files.push(skipped);
                }
            }
            let check_list = self.build_check_list(&plan.batches);
            if check_list.is_empty() {
                info!("no checks apply to the changed files");
                break;
            }
            run_until = run_until.min(check_list.len());
            let mut last_change_at: Option<usize> = None;

            let mut index = 0;
            while index < run_until {
                if self.cancel.is_cancelled() {
                    aborted = true;
                    break;
                }
                let task = &check_list[index];
                info!(
                    check = index + 1,
                    of = run_until,
                    pass,
                    query = %preview(&task.query),
                    "running check"
                );
                match self.run_check(task).await {
                    Ok((issues, newly_added)) => {
                        results.insert(task.key(), issues);
                        new_total += newly_added;
                        self.scan_info.checks_run += 1;
                    }
                    Err(LlmError::Connection { .. }) => {
                        warn!("lost LLM connection, waiting for reconnection");
                        self.client
                            .wait_for_connection(self.config.llm_retry_interval)
                            .await;
                        // Retry the same check; the watermark does not
                        // advance past work that never ran.
                        continue;
                    }
                    Err(e @ LlmError::ContextOverflow { .. }) => {
                        error!(error = %e, "context overflow despite budget tracking; skipping check");
                        results.remove(&task.key());
                    }
                    Err(e) => {
                        warn!(error = %e, "check failed, skipping it for this pass");
                    }
                }
                if let Err(e) = self.output.write(&self.tracker, &self.scan_info) {
                    warn!(error = %e, "failed to update report");
                }

                if self.refresh.is_set() {
                    self.refresh.clear();
                    if self.confirm_real_change(&snapshot).await {
                        info!(
                            check = index,
                            "content changed mid-scan; the prefix up to here is stale"
                        );
                        last_change_at = Some(index);
                    }
                }
                index += 1;
            }

            if aborted {
                break;
            }
            match last_change_at {
                // Converged: every check ran on content that stayed
                // stable underneath it.
                None => break,
                Some(at) => run_until = at + 1,
            }
            if pass >= self.config.max_rescan_passes {
                warn!(
                    pass,
                    "max rescan passes reached without convergence; accepting current results"
                );
                break;
            }
        }

        let mut resolved_count = 0;
        if aborted {
            info!("scan stopped; partial results already committed are kept");
            if let Err(e) = self.output.write(&self.tracker, &self.scan_info) {
                warn!(error = %e, "failed to update report");
            }
            return Ok(ScanOutcome::default());
        }

        for file in state.changed_files.iter().filter(|f| f.is_deleted()) {
            resolved_count += self.tracker.resolve_issues_for_file(&file.path);
        }

        // Only files whose content was actually re-read this cycle are
        // valid resolution evidence; unchanged files keep their issues
        // even if the model's output for them flapped. A cycle in which
        // no check ran proves nothing about any file.
        let files_considered: Vec<String> = if self.scan_info.checks_run == 0 {
            Vec::new()
        } else {
            match &self.last_scan_hashes {
                None => scanned_files,
                Some(previous) => snapshot.changed_paths(previous),
            }
        };
        let all_issues: Vec<Issue> = results.into_values().flatten().collect();
        let (reconcile_new, reconciled) = self.tracker.reconcile(all_issues, &files_considered);
        resolved_count += reconciled;
        self.last_scan_hashes = Some(snapshot);

        self.output.write(&self.tracker, &self.scan_info)?;
        Ok(ScanOutcome {
            new_count: new_total + reconcile_new,
            resolved_count,
        })
    }

    /// Run one check across its batches, feeding the tracker and report
    /// after every batch. Returns the issues found and how many were
    /// genuinely new to the tracker.
    async fn run_check(&mut self, task: &CheckTask) -> Result<(Vec<Issue>, usize), LlmError> {
        let driver = ConversationDriver::new(
            self.client.as_ref(),
            self.tools.as_ref(),
            self.config.max_llm_retries,
        );
        let mut all_issues = Vec::new();
        let mut newly_added = 0;
        let batch_count = task.batches.len();
        for (batch_index, batch) in task.batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            debug!(batch = batch_index + 1, of = batch_count, "processing batch");
            let issues = driver.run(&task.query, batch).await?;
            if !issues.is_empty() {
                let new_count = self.tracker.add_issues(issues.clone());
                if new_count > 0 {
                    info!(new_count, batch = batch_index + 1, "added new issue(s)");
                }
                newly_added += new_count;
                all_issues.extend(issues);
            }
            if let Err(e) = self.output.write(&self.tracker, &self.scan_info) {
                warn!(error = %e, "failed to update report");
            }
        }
        Ok((all_issues, newly_added))
    }

    /// Read the content of every non-deleted changed file; binary and
    /// unreadable files are skipped.
    fn collect_files(&self, state: &GitState) -> IndexMap<String, String> {
        let mut files = IndexMap::new();
        for file in &state.changed_files {
            if file.is_deleted() {
                continue;
            }
            let full_path = self.config.target_directory.join(&file.path);
            if is_binary_file(&full_path) {
                debug!(path = %file.path, "skipping binary file");
                continue;
            }
            match read_file_content(&full_path) {
                Some(content) => {
                    files.insert(file.path.clone(), content);
                }
                None => warn!(path = %file.path, "could not read file"),
            }
        }
        files
    }

    /// Hash every non-deleted changed file in the working set.
    fn capture_snapshot(&self, state: &GitState) -> ScanSnapshot {
        ScanSnapshot::capture(
            &self.config.target_directory,
            state
                .changed_files
                .iter()
                .filter(|f| !f.is_deleted())
                .map(|f| f.path.as_str()),
        )
    }

    /// A refresh signal arrived; decide whether it reflects a real
    /// content change relative to this pass's snapshot.
    async fn confirm_real_change(&self, snapshot: &ScanSnapshot) -> bool {
        match self.detector.get_state().await {
            Ok(state) => self.capture_snapshot(&state).differs_from(snapshot),
            Err(e) => {
                warn!(error = %e, "could not confirm change; treating signal as real");
                true
            }
        }
    }

    /// The ordered check list: for every non-ignore group with matching
    /// files, one task per check, batches filtered to the group's
    /// pattern.
    fn build_check_list(&self, batches: &[Batch]) -> Vec<CheckTask> {
        let mut tasks = Vec::new();
        for (group_index, group) in self.config.check_groups.iter().enumerate() {
            if group.is_ignore_rule() {
                continue;
            }
            let filtered: Vec<Batch> = batches
                .iter()
                .filter_map(|batch| {
                    let batch: Batch = batch
                        .iter()
                        .filter(|(path, _)| group.matches_file(path))
                        .map(|(path, content)| (path.clone(), content.clone()))
                        .collect();
                    (!batch.is_empty()).then_some(batch)
                })
                .collect();
            if filtered.is_empty() {
                debug!(pattern = %group.pattern, "no files match pattern, skipping group");
                continue;
            }
            for (check_index, check) in group.checks.iter().enumerate() {
                tasks.push(CheckTask {
                    group_index,
                    check_index,
                    query: check.clone(),
                    batches: filtered.clone(),
                });
            }
        }
        tasks
    }
}

/// Watcher task: poll the change detector on a fixed interval and raise
/// the refresh signal when the changed-file set moves. The scanner
/// downgrades signals that carry no real content change.
pub async fn watch_loop(
    detector: Arc<dyn ChangeDetector>,
    refresh: Arc<RefreshSignal>,
    cancel: CancellationToken,
    poll_interval: std::time::Duration,
) {
    info!("watcher loop started");
    let mut last: Option<GitState> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
        match detector.get_state().await {
            Ok(state) => {
                let moved = match &last {
                    None => state.has_changes(),
                    Some(previous) => state.differs_from(previous),
                };
                if moved {
                    debug!("repository changed, signaling scanner");
                    refresh.set();
                }
                last = Some(state);
            }
            Err(e) => warn!(error = %e, "change detection failed in watcher"),
        }
    }
    info!("watcher loop ended");
}

fn preview(query: &str) -> &str {
    let end = query
        .char_indices()
        .nth(50)
        .map_or(query.len(), |(index, _)| index);
    &query[..end]
}
