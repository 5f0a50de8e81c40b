//! Configuration loading and validation.
//!
//! Everything the scanner needs is carried in an explicit [`Config`]
//! passed into component constructors; there are no process-wide
//! singletons.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;
use crate::models::CheckGroup;

pub const DEFAULT_CONFIG_FILE: &str = "vigil.toml";
pub const DEFAULT_OUTPUT_FILE: &str = "vigil_report.md";
pub const DEFAULT_LOCK_FILE: &str = ".vigil.lock";

/// LLM backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    LmStudio,
    Ollama,
}

impl LlmBackend {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "lm-studio" => Ok(Self::LmStudio),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::UnknownBackend {
                backend: other.to_string(),
            }),
        }
    }
}

/// Connection settings for the LLM backend.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub host: String,
    pub port: u16,
    /// Required for Ollama; optional for LM Studio (first loaded model).
    pub model: Option<String>,
    pub timeout: Duration,
    /// Manual override for the model's context window.
    pub context_limit: Option<usize>,
}

impl LlmConfig {
    pub fn base_url(&self) -> String {
        match self.backend {
            LlmBackend::LmStudio => format!("http://{}:{}/v1", self.host, self.port),
            LlmBackend::Ollama => format!("http://{}:{}", self.host, self.port),
        }
    }
}

/// Resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_directory: PathBuf,
    pub check_groups: Vec<CheckGroup>,
    pub llm: LlmConfig,
    /// Compare against this commit instead of HEAD when set.
    pub base_commit: Option<String>,

    /// Report file name, relative to the target directory. Always
    /// excluded from scanning so report churn never triggers a rescan.
    pub output_file: String,
    pub lock_file: String,

    pub git_poll_interval: Duration,
    pub llm_retry_interval: Duration,
    pub max_llm_retries: u32,
    /// Upper bound on watermark rescan passes within one scan cycle.
    pub max_rescan_passes: u32,
}

impl Config {
    pub fn output_path(&self) -> PathBuf {
        self.target_directory.join(&self.output_file)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.target_directory.join(&self.lock_file)
    }

    /// File names the scanner itself produces; never scanned, never
    /// watched.
    pub fn own_files(&self) -> Vec<String> {
        vec![self.output_file.clone(), self.lock_file.clone()]
    }

    /// Total number of checks across all groups.
    pub fn total_checks(&self) -> usize {
        self.check_groups.iter().map(|g| g.checks.len()).sum()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    output_file: Option<String>,
    lock_file: Option<String>,
    git_poll_interval_secs: Option<u64>,
    llm_retry_interval_secs: Option<u64>,
    max_llm_retries: Option<u32>,
    max_rescan_passes: Option<u32>,
    llm: LlmToml,
    #[serde(default)]
    checks: Vec<CheckGroupToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LlmToml {
    backend: String,
    host: Option<String>,
    port: Option<u16>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    context_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CheckGroupToml {
    pattern: String,
    #[serde(default)]
    checks: Vec<String>,
}

/// Load and validate the configuration for a target directory.
///
/// `config_file` defaults to `vigil.toml` inside the target directory.
pub fn load_config(
    target_directory: &Path,
    config_file: Option<&Path>,
    base_commit: Option<String>,
) -> Result<Config, ConfigError> {
    let target_directory = target_directory
        .canonicalize()
        .map_err(|_| ConfigError::MissingTargetDirectory {
            path: target_directory.to_path_buf(),
        })?;
    if !target_directory.is_dir() {
        return Err(ConfigError::TargetNotADirectory {
            path: target_directory,
        });
    }

    let config_path = match config_file {
        Some(path) => path.to_path_buf(),
        None => target_directory.join(DEFAULT_CONFIG_FILE),
    };
    if !config_path.is_file() {
        return Err(ConfigError::MissingFile { path: config_path });
    }

    info!(path = %config_path.display(), "loading configuration");
    let raw = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::InvalidToml {
        path: config_path.clone(),
        detail: e.to_string(),
    })?;
    let parsed: ConfigToml = toml::from_str(&raw).map_err(|e| ConfigError::InvalidToml {
        path: config_path.clone(),
        detail: e.to_string(),
    })?;

    let mut check_groups = Vec::with_capacity(parsed.checks.len());
    for group in parsed.checks {
        for (index, check) in group.checks.iter().enumerate() {
            if check.trim().is_empty() {
                return Err(ConfigError::EmptyCheck {
                    pattern: group.pattern.clone(),
                    index,
                });
            }
        }
        let checks = group.checks.iter().map(|c| c.trim().to_string()).collect();
        check_groups.push(CheckGroup::new(group.pattern, checks)?);
    }
    if !check_groups.iter().any(|g| !g.is_ignore_rule()) {
        return Err(ConfigError::NoChecks);
    }

    let backend = LlmBackend::parse(&parsed.llm.backend)?;
    if backend == LlmBackend::Ollama && parsed.llm.model.is_none() {
        return Err(ConfigError::OllamaModelRequired);
    }
    let default_port = match backend {
        LlmBackend::LmStudio => 1234,
        LlmBackend::Ollama => 11434,
    };
    let llm = LlmConfig {
        backend,
        host: parsed.llm.host.unwrap_or_else(|| "localhost".to_string()),
        port: parsed.llm.port.unwrap_or(default_port),
        model: parsed.llm.model,
        timeout: Duration::from_secs(parsed.llm.timeout_secs.unwrap_or(120)),
        context_limit: parsed.llm.context_limit,
    };

    let config = Config {
        target_directory,
        check_groups,
        llm,
        base_commit,
        output_file: parsed
            .output_file
            .unwrap_or_else(|| DEFAULT_OUTPUT_FILE.to_string()),
        lock_file: parsed
            .lock_file
            .unwrap_or_else(|| DEFAULT_LOCK_FILE.to_string()),
        git_poll_interval: Duration::from_secs(parsed.git_poll_interval_secs.unwrap_or(30)),
        llm_retry_interval: Duration::from_secs(parsed.llm_retry_interval_secs.unwrap_or(10)),
        max_llm_retries: parsed.max_llm_retries.unwrap_or(3),
        max_rescan_passes: parsed.max_rescan_passes.unwrap_or(8),
    };

    info!(
        checks = config.total_checks(),
        groups = config.check_groups.len(),
        "configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, body).unwrap();
        path
    }

    const VALID: &str = r#"
[llm]
backend = "ollama"
model = "qwen3:4b"

[[checks]]
pattern = "*.rs"
checks = ["Check error handling"]

[[checks]]
pattern = "*.lock"
checks = []
"#;

    #[test]
    fn loads_a_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), VALID);
        let config = load_config(dir.path(), None, None).unwrap();
        assert_eq!(config.llm.backend, LlmBackend::Ollama);
        assert_eq!(config.llm.port, 11434);
        assert_eq!(config.check_groups.len(), 2);
        assert!(config.check_groups[1].is_ignore_rule());
        assert_eq!(config.total_checks(), 1);
        assert_eq!(config.output_file, DEFAULT_OUTPUT_FILE);
    }

    #[test]
    fn rejects_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(dir.path(), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile { .. }));
    }

    #[test]
    fn rejects_config_with_only_ignore_rules() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[llm]
backend = "lm-studio"

[[checks]]
pattern = "*.lock"
checks = []
"#,
        );
        let err = load_config(dir.path(), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::NoChecks));
    }

    #[test]
    fn rejects_unknown_backend() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[llm]
backend = "llamafile"

[[checks]]
pattern = "*"
checks = ["c"]
"#,
        );
        let err = load_config(dir.path(), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend { .. }));
    }

    #[test]
    fn rejects_ollama_without_model() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[llm]
backend = "ollama"

[[checks]]
pattern = "*"
checks = ["c"]
"#,
        );
        let err = load_config(dir.path(), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::OllamaModelRequired));
    }

    #[test]
    fn rejects_blank_check_strings() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[llm]
backend = "lm-studio"

[[checks]]
pattern = "*"
checks = ["ok", "   "]
"#,
        );
        let err = load_config(dir.path(), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCheck { index: 1, .. }));
    }

    #[test]
    fn lm_studio_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[llm]
backend = "lm-studio"

[[checks]]
pattern = "*"
checks = ["c"]
"#,
        );
        let config = load_config(dir.path(), None, None).unwrap();
        assert_eq!(config.llm.port, 1234);
        assert_eq!(config.llm.base_url(), "http://localhost:1234/v1");
        assert!(config.llm.model.is_none());
    }
}
