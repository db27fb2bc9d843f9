//! Change Detector
//!
//! Watches the backing store of loaded modules and classifies genuine
//! content changes. Two layers:
//!
//! - [`FileWatcher`]: polling mtime watcher over configured roots with
//!   extension filters, producing raw [`FileChange`] events;
//! - [`ChangeDetector`]: compares content fingerprints so editor touches and
//!   metadata-only writes are discarded as spurious, and coalesces rapid
//!   event bursts for one path into a single logical change per debounce
//!   window.
//!
//! The detector runs on the host's virtual clock; only the watcher touches
//! the real filesystem.

use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::Result;

/// Content fingerprint of a module's backing source.
///
/// Equal fingerprints mean "no genuine change". Filesystem sources hash the
/// file contents; in-memory sources use a version counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Fingerprint of raw source bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }

    /// Fingerprint from a monotonically bumped version counter.
    pub fn version(v: u64) -> Self {
        Fingerprint(v)
    }
}

/// Configuration surface of the change detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Watched root directories.
    pub roots: Vec<PathBuf>,
    /// File extensions of interest (no leading dot). Empty matches all.
    pub extensions: Vec<String>,
    /// Quiet period before a burst of events collapses into one change.
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extensions: Vec::new(),
            debounce_ms: 100,
        }
    }
}

impl WatchConfig {
    /// Whether a path falls under a watched root and matches the extension
    /// filter.
    pub fn matches(&self, path: &Path) -> bool {
        let under_root =
            self.roots.is_empty() || self.roots.iter().any(|r| path.starts_with(r));
        if !under_root {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x == e))
            .unwrap_or(false)
    }
}

/// Type of raw file change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Raw filesystem notification.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: FileChangeKind,
    pub timestamp: SystemTime,
}

/// Polling file watcher over a set of explicitly watched paths.
#[derive(Debug, Default)]
pub struct FileWatcher {
    config: WatchConfig,
    timestamps: HashMap<PathBuf, SystemTime>,
}

impl FileWatcher {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            timestamps: HashMap::default(),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Watch one file, recording its current mtime as the baseline.
    pub fn watch(&mut self, path: &Path) {
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.timestamps.insert(path.to_path_buf(), modified);
    }

    pub fn unwatch(&mut self, path: &Path) {
        self.timestamps.remove(path);
    }

    /// Register every file under the configured roots that matches the
    /// extension filter.
    pub fn watch_roots(&mut self) -> Result<()> {
        let roots = self.config.roots.clone();
        for root in roots {
            self.watch_dir(&root)?;
        }
        Ok(())
    }

    fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.watch_dir(&path)?;
            } else if self.config.matches(&path) {
                self.watch(&path);
            }
        }
        Ok(())
    }

    /// Poll all watched paths and report raw changes since the last poll.
    pub fn poll(&mut self) -> Vec<FileChange> {
        let mut changes = Vec::new();
        let paths: Vec<PathBuf> = self.timestamps.keys().cloned().collect();

        for path in paths {
            let current = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            let previous = self.timestamps.get(&path).copied();

            match (previous, current) {
                (Some(old), Some(new)) if old == SystemTime::UNIX_EPOCH => {
                    self.timestamps.insert(path.clone(), new);
                    changes.push(FileChange {
                        path,
                        kind: FileChangeKind::Created,
                        timestamp: new,
                    });
                }
                (Some(old), Some(new)) if new > old => {
                    self.timestamps.insert(path.clone(), new);
                    changes.push(FileChange {
                        path,
                        kind: FileChangeKind::Modified,
                        timestamp: new,
                    });
                }
                (Some(old), None) if old != SystemTime::UNIX_EPOCH => {
                    self.timestamps.insert(path.clone(), SystemTime::UNIX_EPOCH);
                    changes.push(FileChange {
                        path,
                        kind: FileChangeKind::Deleted,
                        timestamp: SystemTime::now(),
                    });
                }
                _ => {}
            }
        }

        changes
    }
}

/// Fingerprint comparison plus debounce coalescing.
///
/// `note` feeds a raw event in; `drain_ready` yields paths whose quiet
/// period elapsed. Both run on the caller's (virtual) millisecond clock.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    debounce_ms: u64,
    fingerprints: HashMap<PathBuf, Fingerprint>,
    /// Path -> virtual time of the most recent genuine event.
    pending: HashMap<PathBuf, u64>,
}

impl ChangeDetector {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            debounce_ms,
            fingerprints: HashMap::default(),
            pending: HashMap::default(),
        }
    }

    /// Record the fingerprint observed at load time, so the first genuine
    /// change is measured against it.
    pub fn prime(&mut self, path: &Path, fingerprint: Fingerprint) {
        self.fingerprints.insert(path.to_path_buf(), fingerprint);
    }

    /// Feed one raw event. Returns `false` when the event is spurious (the
    /// fingerprint is unchanged); otherwise the path enters (or refreshes)
    /// its debounce window.
    pub fn note(&mut self, path: &Path, fingerprint: Fingerprint, now_ms: u64) -> bool {
        if self.fingerprints.get(path) == Some(&fingerprint) {
            tracing::debug!(path = %path.display(), "spurious change event discarded");
            return false;
        }
        self.fingerprints.insert(path.to_path_buf(), fingerprint);
        self.pending.insert(path.to_path_buf(), now_ms);
        true
    }

    /// Paths whose debounce window elapsed; each is reported once per
    /// burst.
    pub fn drain_ready(&mut self, now_ms: u64) -> Vec<PathBuf> {
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, &at)| now_ms.saturating_sub(at) >= self.debounce_ms)
            .map(|(p, _)| p.clone())
            .collect();
        for p in &ready {
            self.pending.remove(p);
        }
        ready
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
