//! `vigil` — continuously review the uncommitted changes of a git work
//! tree with a local LLM backend.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::bail;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use vigil_core::client::ModelClient;
use vigil_core::config::Config;
use vigil_core::config::LlmBackend;
use vigil_core::config::load_config;
use vigil_core::content::FileFilter;
use vigil_core::git_watcher::ChangeDetector;
use vigil_core::git_watcher::GitWatcher;
use vigil_core::lmstudio::LmStudioClient;
use vigil_core::ollama::OllamaClient;
use vigil_core::output::OutputGenerator;
use vigil_core::scanner::Scanner;
use vigil_core::scanner::watch_loop;
use vigil_core::signal::RefreshSignal;
use vigil_core::tools::RepoTools;
use vigil_core::tracker::IssueTracker;

/// Scan uncommitted changes for issues, continuously.
#[derive(Debug, Parser)]
#[clap(name = "vigil", version, about)]
struct Cli {
    /// Directory to scan. Must be inside a git work tree.
    #[clap(default_value = ".")]
    directory: PathBuf,

    /// Path to the configuration file (defaults to vigil.toml in the
    /// target directory).
    #[clap(long, short = 'c')]
    config: Option<PathBuf>,

    /// Compare against this commit instead of HEAD.
    #[clap(long)]
    commit: Option<String>,

    /// Override the model's context window, in tokens.
    #[clap(long)]
    context_limit: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(&cli.directory, cli.config.as_deref(), cli.commit.clone())?;
    if let Some(limit) = cli.context_limit {
        if limit == 0 {
            bail!("--context-limit must be a positive number of tokens");
        }
        config.llm.context_limit = Some(limit);
    }
    let config = Arc::new(config);

    // One scanner per repository: a PID lock prevents two instances
    // from fighting over the report.
    let _lock = LockFile::acquire(&config.lock_path())?;

    let filter = FileFilter::from_config(&config)?;
    let git = GitWatcher::new(
        config.target_directory.clone(),
        config.base_commit.clone(),
        filter,
    );
    git.connect().await?;

    let client = connect_client(&config).await?;
    let context_limit = client
        .context_limit()
        .context("the backend did not report a context window")?;
    info!(
        backend = client.backend_name(),
        context_limit, "backend ready"
    );

    let output = OutputGenerator::new(config.output_path());
    let tracker = match output.parse() {
        Ok(issues) if !issues.is_empty() => {
            let tracker = IssueTracker::from_issues(issues);
            let stats = tracker.stats();
            info!(
                open = stats.open,
                resolved = stats.resolved,
                "restored tracked issues from existing report"
            );
            tracker
        }
        Ok(_) => IssueTracker::new(),
        Err(e) => {
            warn!(error = %e, "could not parse existing report; starting fresh");
            IssueTracker::new()
        }
    };

    let tools = Arc::new(RepoTools::new(
        config.target_directory.clone(),
        context_limit,
    ));
    let refresh = Arc::new(RefreshSignal::new());
    let cancel = CancellationToken::new();

    let detector: Arc<dyn ChangeDetector> = Arc::new(git);
    let watcher = tokio::spawn(watch_loop(
        Arc::clone(&detector),
        Arc::clone(&refresh),
        cancel.clone(),
        config.git_poll_interval,
    ));

    {
        let cancel = cancel.clone();
        let refresh = Arc::clone(&refresh);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping after the current unit of work");
                cancel.cancel();
                refresh.set();
            }
        });
    }

    let mut scanner = Scanner::new(
        Arc::clone(&config),
        detector,
        client,
        tools,
        tracker,
        output,
        refresh,
        cancel.clone(),
    );
    scanner.run().await;

    cancel.cancel();
    let _ = watcher.await;

    let stats = scanner.tracker().stats();
    info!(
        open = stats.open,
        resolved = stats.resolved,
        total = stats.total,
        report = %config.output_path().display(),
        "scanner stopped"
    );
    Ok(())
}

async fn connect_client(config: &Config) -> anyhow::Result<Arc<dyn ModelClient>> {
    match config.llm.backend {
        LlmBackend::Ollama => {
            let client = OllamaClient::new(config.llm.clone());
            client.connect().await?;
            Ok(Arc::new(client))
        }
        LlmBackend::LmStudio => {
            let client = LmStudioClient::new(config.llm.clone());
            client.connect().await?;
            Ok(Arc::new(client))
        }
    }
}

/// PID lock file. A lock whose recorded process is no longer running is
/// treated as stale and replaced.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let recorded = std::fs::read_to_string(path)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok());
            match recorded {
                Some(pid) if process_is_running(pid) => {
                    bail!(
                        "another vigil instance (pid {pid}) is already scanning this directory\nlock file: {}",
                        path.display()
                    );
                }
                Some(pid) => {
                    info!(pid, "removing stale lock file");
                    std::fs::remove_file(path)
                        .with_context(|| format!("could not remove stale lock {}", path.display()))?;
                }
                None => {
                    warn!(path = %path.display(), "removing unreadable lock file");
                    std::fs::remove_file(path)
                        .with_context(|| format!("could not remove invalid lock {}", path.display()))?;
                }
            }
        }
        std::fs::write(path, std::process::id().to_string())
            .with_context(|| format!("could not create lock file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!(error = %e, path = %self.path.display(), "failed to remove lock file");
        }
    }
}

#[cfg(unix)]
fn process_is_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 probes for existence without delivering anything; EPERM
    // still means the process exists.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_is_running(_pid: u32) -> bool {
    // No cheap liveness probe; assume the lock holder is alive.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".vigil.lock");
        {
            let _lock = LockFile::acquire(&path).unwrap();
            assert!(path.exists());
            // Held by this very process: a second acquire must fail.
            assert!(LockFile::acquire(&path).is_err());
        }
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".vigil.lock");
        // A pid that cannot exist.
        std::fs::write(&path, "4294967294").unwrap();
        let _lock = LockFile::acquire(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }
}
