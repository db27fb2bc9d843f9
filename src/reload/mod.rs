//! Reload Coordinator
//!
//! Turns a confirmed content change into a live graph swap: the resident
//! node and its exclusively-owned descendants are disposed bottom-up, then
//! the path is re-imported so a fresh node (new `NodeId`, new hooks) takes
//! its place. Shared descendants survive with one edge fewer and are
//! re-linked to the replacement on activation.
//!
//! Reloads are serialized per path: a change notification arriving while
//! that path is mid-reload queues exactly one extra pass, which re-checks
//! the fingerprint once the current pass settles and no-ops when nothing
//! actually changed. Independent paths reload independently.

use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::graph::NodeId;
use crate::host::Host;
use crate::loader;
use crate::Result;

/// What a reload pass did for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The subtree was swapped; details in the report.
    Reloaded(ReloadReport),
    /// The stored fingerprint matched the source: nothing to do.
    NoChange,
    /// The path is mid-reload; one extra pass was queued instead.
    Queued,
}

/// Details of one completed swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub path: PathBuf,
    /// Canonical paths disposed with the old node (exclusively-owned
    /// descendants, old node included).
    pub disposed: Vec<PathBuf>,
    /// Replacement node. If every snapshotted parent was disposed while the
    /// re-import was in flight, this instance has already been torn down
    /// again.
    pub node: NodeId,
}

#[derive(Default)]
struct PathState {
    in_flight: bool,
    /// One extra pass requested while in flight. Never more than one.
    queued: bool,
    /// Last pass for this path failed; the node is gone until a later pass
    /// succeeds.
    errored: bool,
}

struct CoordinatorInner {
    host: Host,
    paths: RefCell<HashMap<PathBuf, PathState>>,
}

/// Serializes reload passes per canonical path. Cheap to clone; clones
/// share the per-path bookkeeping.
#[derive(Clone)]
pub struct ReloadCoordinator {
    inner: Rc<CoordinatorInner>,
}

impl ReloadCoordinator {
    pub fn new(host: Host) -> Self {
        Self {
            inner: Rc::new(CoordinatorInner {
                host,
                paths: RefCell::new(HashMap::default()),
            }),
        }
    }

    /// Whether the last pass for `path` failed without a later success.
    pub fn is_errored(&self, path: &Path) -> bool {
        self.inner
            .paths
            .borrow()
            .get(path)
            .map(|s| s.errored)
            .unwrap_or(false)
    }

    /// React to a confirmed change for a canonical path.
    ///
    /// Runs one reload pass, plus at most one queued pass when further
    /// notifications arrived mid-flight. Returns the outcome of the final
    /// pass that ran.
    pub fn handle_change(&self, path: &Path) -> LocalBoxFuture<'static, Result<ReloadOutcome>> {
        let this = self.clone();
        let path = path.to_path_buf();
        Box::pin(async move {
            {
                let mut paths = this.inner.paths.borrow_mut();
                let state = paths.entry(path.clone()).or_default();
                if state.in_flight {
                    state.queued = true;
                    return Ok(ReloadOutcome::Queued);
                }
                state.in_flight = true;
            }

            let result = loop {
                let outcome = this.reload_once(&path).await;
                let run_again = {
                    let mut paths = this.inner.paths.borrow_mut();
                    let state = paths.entry(path.clone()).or_default();
                    std::mem::take(&mut state.queued)
                };
                if !run_again {
                    break outcome;
                }
            };

            {
                let mut paths = this.inner.paths.borrow_mut();
                if let Some(state) = paths.get_mut(&path) {
                    state.in_flight = false;
                    state.errored = result.is_err();
                }
            }
            result
        })
    }

    /// One reload pass: fingerprint check, dispose, re-import, re-link.
    async fn reload_once(&self, path: &Path) -> Result<ReloadOutcome> {
        let host = &self.inner.host;
        let specifier = path.display().to_string();

        let Some(old) = host.resident(path) else {
            // Nothing resident: either the path errored out earlier or it
            // was never loaded. Import fresh as a root.
            let node = loader::import(host, &specifier, true).await?;
            host.note_reload();
            tracing::info!(path = %path.display(), node = %node, "dependency restored");
            return Ok(ReloadOutcome::Reloaded(ReloadReport {
                path: path.to_path_buf(),
                disposed: Vec::new(),
                node,
            }));
        };

        let current = host.source().fingerprint(path)?;
        if host.fingerprint_of(old) == Some(current) {
            return Ok(ReloadOutcome::NoChange);
        }

        // Snapshot before the graph mutates under us.
        let parents = host.parents_of(old);
        let pinned = host.is_pinned(old);
        let disposed = host.exclusive_closure_paths(old);
        tracing::info!(path = %path.display(), node = %old, "reloading dependency");

        // Sever every reference to the old instance; the refcount cascade
        // tears the exclusive subtree down bottom-up, hooks and all.
        for &parent in &parents {
            host.release_edge(parent, old);
        }
        if pinned {
            host.unpin_root(old);
        }

        let node = loader::import(host, &specifier, pinned).await?;
        for parent in parents {
            // A parent may itself have been disposed meanwhile.
            if host.state_of(parent).is_some() {
                host.link(parent, node);
            }
        }
        // Every snapshotted parent can vanish while the re-import is
        // suspended; an unpinned replacement with no surviving parent would
        // sit resident forever, so it goes straight back down.
        if !host.is_pinned(node) && host.parents_of(node).is_empty() {
            tracing::debug!(path = %path.display(), node = %node, "reloaded node lost every parent, disposing");
            host.dispose_orphan(node);
        }
        host.note_reload();

        Ok(ReloadOutcome::Reloaded(ReloadReport {
            path: path.to_path_buf(),
            disposed,
            node,
        }))
    }
}

impl std::fmt::Debug for ReloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let paths = self.inner.paths.borrow();
        f.debug_struct("ReloadCoordinator")
            .field("tracked_paths", &paths.len())
            .field(
                "in_flight",
                &paths.values().filter(|s| s.in_flight).count(),
            )
            .finish()
    }
}
