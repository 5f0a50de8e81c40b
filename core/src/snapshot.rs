//! Content-hash snapshots of the watched file set.
//!
//! A refresh signal is only trusted if at least one non-ignored file's
//! content hash differs from the snapshot taken when batches were built,
//! or the path set itself changed. Modification times are never
//! consulted.

use std::collections::BTreeMap;
use std::path::Path;

use sha2::Digest;
use sha2::Sha256;

/// Sha-256 per file plus the implied path set, captured at batch-build
/// time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSnapshot {
    hashes: BTreeMap<String, [u8; 32]>,
}

impl ScanSnapshot {
    /// Hash the current on-disk content of `paths` (relative to `root`).
    /// Unreadable or vanished files are simply absent, which a later
    /// comparison reports as a change.
    pub fn capture<'a>(root: &Path, paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hashes = BTreeMap::new();
        for path in paths {
            if let Ok(bytes) = std::fs::read(root.join(path)) {
                let digest: [u8; 32] = Sha256::digest(&bytes).into();
                hashes.insert(path.to_string(), digest);
            }
        }
        Self { hashes }
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// True when the two snapshots disagree: a file was added, removed,
    /// or its content hash changed.
    pub fn differs_from(&self, other: &ScanSnapshot) -> bool {
        self.hashes != other.hashes
    }

    /// Paths that are new or whose content changed relative to
    /// `previous`. Removed paths are not listed; deletions are handled
    /// through the change detector's deleted-file statuses.
    pub fn changed_paths(&self, previous: &ScanSnapshot) -> Vec<String> {
        self.hashes
            .iter()
            .filter(|(path, digest)| previous.hashes.get(*path) != Some(digest))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// All paths in the snapshot.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.hashes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn identical_content_does_not_differ() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();

        let before = ScanSnapshot::capture(dir.path(), ["a.rs"]);
        // Rewrite with identical bytes: mtime changes, content does not.
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        let after = ScanSnapshot::capture(dir.path(), ["a.rs"]);

        assert!(!after.differs_from(&before));
        assert!(after.changed_paths(&before).is_empty());
    }

    #[test]
    fn edits_and_new_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        let before = ScanSnapshot::capture(dir.path(), ["a.rs"]);

        std::fs::write(dir.path().join("a.rs"), "fn a() { todo!() }").unwrap();
        std::fs::write(dir.path().join("b.rs"), "fn b() {}").unwrap();
        let after = ScanSnapshot::capture(dir.path(), ["a.rs", "b.rs"]);

        assert!(after.differs_from(&before));
        assert_eq!(
            after.changed_paths(&before),
            vec!["a.rs".to_string(), "b.rs".to_string()]
        );
    }

    #[test]
    fn removed_files_make_snapshots_differ() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        let before = ScanSnapshot::capture(dir.path(), ["a.rs"]);
        let after = ScanSnapshot::capture(dir.path(), []);
        assert!(after.differs_from(&before));
    }
}
