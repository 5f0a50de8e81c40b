//! File content access and exclusion rules.
//!
//! The planner and orchestrator never touch the filesystem directly;
//! they go through these helpers, which apply the binary and exclusion
//! filters first.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use globset::Glob;
use globset::GlobSet;
use globset::GlobSetBuilder;
use tracing::debug;
use tracing::warn;

use crate::config::Config;
use crate::error::ConfigError;

/// Extensions that are always binary; cheaper than probing content.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "svg", "webp", "tiff", "mp3", "mp4", "avi", "mov",
    "wav", "flac", "ogg", "webm", "zip", "tar", "gz", "bz2", "xz", "7z", "rar", "exe", "dll",
    "so", "dylib", "o", "obj", "a", "lib", "pyc", "pyo", "class", "jar", "war", "pdf", "doc",
    "docx", "xls", "xlsx", "ppt", "pptx", "db", "sqlite", "sqlite3", "ttf", "otf", "woff",
    "woff2", "eot", "bin", "dat", "iso", "img",
];

const BINARY_PROBE_BYTES: usize = 8192;

/// Whether a file looks binary: known extension, or a NUL byte in the
/// first 8 KiB.
pub fn is_binary_file(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str())
        && BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
    {
        return true;
    }

    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut probe = [0u8; BINARY_PROBE_BYTES];
    match file.read(&mut probe) {
        Ok(read) => probe[..read].contains(&0),
        Err(_) => false,
    }
}

/// Read a file as text. Returns `None` for binary or unreadable files;
/// non-UTF-8 content is read lossily rather than rejected.
pub fn read_file_content(path: &Path) -> Option<String> {
    if is_binary_file(path) {
        return None;
    }
    match std::fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read file");
            None
        }
    }
}

/// Scanner-level exclusion rules: the scanner's own output files plus
/// every ignore-rule check group. Excluded paths never reach the
/// planner and never count as changes.
#[derive(Debug, Clone)]
pub struct FileFilter {
    own_files: HashSet<String>,
    ignore_globs: GlobSet,
}

impl FileFilter {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for group in config.check_groups.iter().filter(|g| g.is_ignore_rule()) {
            for part in group.pattern.split(',') {
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
        }
        let ignore_globs = builder.build().map_err(|e| ConfigError::InvalidPattern {
            pattern: "<ignore rules>".to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            own_files: config.own_files().into_iter().collect(),
            ignore_globs,
        })
    }

    /// Whether a repository-relative path is excluded from scanning and
    /// change detection.
    pub fn is_excluded(&self, path: &str) -> bool {
        if self.own_files.contains(path) {
            debug!(path, "excluding scanner-owned file");
            return true;
        }
        if self.ignore_globs.is_match(path) {
            return true;
        }
        match path.rsplit('/').next() {
            Some(name) if name != path => self.ignore_globs.is_match(name),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::load_config;

    #[test]
    fn detects_binary_by_extension() {
        assert!(is_binary_file(&PathBuf::from("logo.PNG")));
        assert!(is_binary_file(&PathBuf::from("lib/archive.tar")));
    }

    #[test]
    fn detects_binary_by_nul_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.weird");
        std::fs::write(&path, b"abc\x00def").unwrap();
        assert!(is_binary_file(&path));
    }

    #[test]
    fn reads_text_and_rejects_binary() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("a.rs");
        std::fs::write(&text, "fn main() {}\n").unwrap();
        assert_eq!(read_file_content(&text).unwrap(), "fn main() {}\n");

        let blob = dir.path().join("a.bin");
        std::fs::write(&blob, b"\x00\x01").unwrap();
        assert!(read_file_content(&blob).is_none());
    }

    #[test]
    fn filter_excludes_own_files_and_ignore_rules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("vigil.toml"),
            r#"
[llm]
backend = "lm-studio"

[[checks]]
pattern = "*.rs"
checks = ["c"]

[[checks]]
pattern = "*.min.js, vendor/*"
checks = []
"#,
        )
        .unwrap();
        let config = load_config(dir.path(), None, None).unwrap();
        let filter = FileFilter::from_config(&config).unwrap();

        assert!(filter.is_excluded("vigil_report.md"));
        assert!(filter.is_excluded(".vigil.lock"));
        assert!(filter.is_excluded("dist/app.min.js"));
        assert!(filter.is_excluded("vendor/lib.rs"));
        assert!(!filter.is_excluded("src/main.rs"));
    }
}
