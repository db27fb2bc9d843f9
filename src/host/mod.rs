//! Plugin Host
//!
//! `Host` is the facade module authors and embedders see: a cheap-`Clone`
//! handle over the dependency graph, the ambient context stack, the timer
//! queue and the module source. Module bodies receive a `Host` and use it to
//! import children, register lifecycle hooks and create effect-tracked
//! timers; embedders additionally drive the virtual clock and trigger root
//! imports.
//!
//! All shared state is `Rc<RefCell<...>>`: the runtime is single-threaded
//! and cooperatively scheduled, and no `Host` method holds a borrow while
//! running user callbacks — hooks may safely call back into the host.
//!
//! # Example
//! ```no_run
//! use std::rc::Rc;
//! use cinnabar::{Host, MemorySource};
//!
//! let source = MemorySource::new();
//! source.register("/app/greeter", |host: Host| {
//!     Box::pin(async move {
//!         host.on_mount(|| {
//!             println!("greeter mounted");
//!             Ok(())
//!         })?;
//!         host.on_dispose(|| {
//!             println!("greeter gone");
//!             Ok(())
//!         })?;
//!         Ok(())
//!     })
//! });
//!
//! let host = Host::new(Rc::new(source));
//! let node = futures::executor::block_on(host.import("/app/greeter")).unwrap();
//! host.unload(node).unwrap();
//! ```

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::context::AmbientStack;
use crate::graph::{DependencyGraph, Hook, NodeId, NodeState};
use crate::loader::{self, ModuleSource};
use crate::timers::{TimerId, TimerQueue};
use crate::watch::Fingerprint;
use crate::{Error, Result};

/// Snapshot of runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Nodes currently in the graph arena.
    pub resident: usize,
    /// Imports that started a fresh load (dedup hits excluded).
    pub loads_started: u64,
    /// Module bodies actually executed.
    pub bodies_executed: u64,
    /// Reload passes performed.
    pub reloads: u64,
    /// Lifecycle hooks that returned an error.
    pub hook_failures: u64,
}

#[derive(Default)]
struct Counters {
    loads_started: u64,
    bodies_executed: u64,
    reloads: u64,
    hook_failures: u64,
}

struct HostInner {
    graph: RefCell<DependencyGraph>,
    ambient: AmbientStack,
    timers: RefCell<TimerQueue>,
    source: Rc<dyn ModuleSource>,
    /// True while dispose hooks are running; imports are rejected.
    disposing: Cell<bool>,
    counters: RefCell<Counters>,
}

/// Handle on the plugin runtime. Clones share all state.
#[derive(Clone)]
pub struct Host {
    inner: Rc<HostInner>,
}

impl Host {
    pub fn new(source: Rc<dyn ModuleSource>) -> Self {
        Self {
            inner: Rc::new(HostInner {
                graph: RefCell::new(DependencyGraph::new()),
                ambient: AmbientStack::new(),
                timers: RefCell::new(TimerQueue::new()),
                source,
                disposing: Cell::new(false),
                counters: RefCell::new(Counters::default()),
            }),
        }
    }

    // -----------------------------------------------------------------
    // Public surface for module authors
    // -----------------------------------------------------------------

    /// Import a module as a root: the host itself pins the node alive until
    /// [`unload`](Self::unload).
    pub fn import(&self, specifier: &str) -> LocalBoxFuture<'static, Result<NodeId>> {
        loader::import(self, specifier, true)
    }

    /// Import a child of whichever dependency is currently loading. Outside
    /// any module evaluation context this behaves as a root import.
    pub fn import_child(&self, specifier: &str) -> LocalBoxFuture<'static, Result<NodeId>> {
        loader::import(self, specifier, true)
    }

    /// Register a mount hook on the currently loading dependency. Mount
    /// hooks fire in registration order once the module body finishes.
    pub fn on_mount(&self, hook: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
        let id = self
            .current_dependency()
            .ok_or(Error::NoActiveDependency)?;
        self.with_graph(|g| g.add_mount_hook(id, Box::new(hook)));
        Ok(())
    }

    /// Register a dispose hook on the currently loading dependency. Dispose
    /// hooks fire in reverse registration order during teardown.
    pub fn on_dispose(&self, hook: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
        let id = self
            .current_dependency()
            .ok_or(Error::NoActiveDependency)?;
        self.with_graph(|g| g.add_dispose_hook(id, Box::new(hook)));
        Ok(())
    }

    /// The dependency currently loading on this chain, if any.
    pub fn current_dependency(&self) -> Option<NodeId> {
        self.inner.ambient.current()
    }

    // -----------------------------------------------------------------
    // Wrapped timer primitives
    // -----------------------------------------------------------------

    /// One-shot timer. Created inside a module body, the handle lands in
    /// that dependency's effect set and is voided at disposal.
    pub fn set_timeout(&self, delay_ms: u64, callback: impl FnMut() + 'static) -> TimerId {
        self.schedule(delay_ms, false, callback)
    }

    /// Repeating timer, effect-tracked like [`set_timeout`](Self::set_timeout).
    pub fn set_interval(&self, delay_ms: u64, callback: impl FnMut() + 'static) -> TimerId {
        self.schedule(delay_ms, true, callback)
    }

    /// Zero-delay timer: fires on the next clock advance, even `advance(0)`.
    pub fn set_immediate(&self, callback: impl FnMut() + 'static) -> TimerId {
        self.schedule(0, false, callback)
    }

    pub fn clear_timer(&self, id: TimerId) {
        self.inner.timers.borrow_mut().cancel(id);
    }

    fn schedule(&self, delay: u64, repeating: bool, callback: impl FnMut() + 'static) -> TimerId {
        let owner = self.current_dependency();
        let id = self
            .inner
            .timers
            .borrow_mut()
            .schedule(delay, repeating, owner, callback);
        if let Some(owner) = owner {
            self.with_graph(|g| g.add_effect(owner, id));
        }
        id
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.inner.timers.borrow().now()
    }

    /// Advance the virtual clock, firing due timers in chronological order.
    /// Callbacks run outside any internal borrow.
    pub fn advance(&self, ms: u64) {
        let due = self.inner.timers.borrow_mut().advance(ms);
        for timer in due {
            // A callback earlier in this batch may have cancelled it.
            if self.inner.timers.borrow().is_cancelled(timer.id) {
                continue;
            }
            match timer.callback.try_borrow_mut() {
                Ok(mut callback) => (&mut *callback)(),
                // The callback re-entered `advance` and made itself due
                // again while still executing; skip this firing.
                Err(_) => {
                    tracing::warn!(timer = timer.id, "timer callback still executing, firing skipped");
                    continue;
                }
            }
            if !timer.repeating {
                if let Some(owner) = timer.owner {
                    self.with_graph(|g| g.remove_effect(owner, timer.id));
                }
            }
        }
    }

    /// Whether any live timer remains scheduled.
    pub fn has_pending_timers(&self) -> bool {
        self.inner.timers.borrow().has_pending()
    }

    // -----------------------------------------------------------------
    // Embedder surface
    // -----------------------------------------------------------------

    /// Release a root pin, cascading disposal through exclusively-owned
    /// descendants.
    pub fn unload(&self, id: NodeId) -> Result<()> {
        let pinned = self.with_graph(|g| g.node(id).map(|n| n.is_pinned()));
        match pinned {
            Some(true) => {
                let order = self.with_graph(|g| g.unpin(id));
                self.run_teardown(order);
                Ok(())
            }
            Some(false) => Err(Error::NotPinned(id.to_string())),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    /// A reload coordinator bound to this host. Per-path serialization
    /// state lives in the coordinator, so keep one instance per watch
    /// pipeline.
    pub fn reloader(&self) -> crate::reload::ReloadCoordinator {
        crate::reload::ReloadCoordinator::new(self.clone())
    }

    pub fn stats(&self) -> HostStats {
        let counters = self.inner.counters.borrow();
        HostStats {
            resident: self.inner.graph.borrow().len(),
            loads_started: counters.loads_started,
            bodies_executed: counters.bodies_executed,
            reloads: counters.reloads,
            hook_failures: counters.hook_failures,
        }
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    pub fn resident(&self, path: &Path) -> Option<NodeId> {
        self.with_graph(|g| g.resident(path))
    }

    pub fn state_of(&self, id: NodeId) -> Option<NodeState> {
        self.with_graph(|g| g.node(id).map(|n| n.state))
    }

    pub fn path_of(&self, id: NodeId) -> Option<PathBuf> {
        self.with_graph(|g| g.node(id).map(|n| n.canonical_path.clone()))
    }

    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.with_graph(|g| {
            g.node(id)
                .map(|n| n.children().to_vec())
                .unwrap_or_default()
        })
    }

    pub fn parents_of(&self, id: NodeId) -> Vec<NodeId> {
        self.with_graph(|g| g.node(id).map(|n| n.parents().to_vec()).unwrap_or_default())
    }

    pub fn is_pinned(&self, id: NodeId) -> bool {
        self.with_graph(|g| g.node(id).map(|n| n.is_pinned()).unwrap_or(false))
    }

    pub fn fingerprint_of(&self, id: NodeId) -> Option<Fingerprint> {
        self.with_graph(|g| g.node(id).map(|n| n.fingerprint))
    }

    /// Canonical paths of the exclusively-owned subtree a reload of `id`
    /// would dispose.
    pub fn exclusive_closure_paths(&self, id: NodeId) -> Vec<PathBuf> {
        self.with_graph(|g| {
            g.exclusive_closure(id)
                .into_iter()
                .filter_map(|n| g.node(n).map(|n| n.canonical_path.clone()))
                .collect()
        })
    }

    // -----------------------------------------------------------------
    // Crate internals
    // -----------------------------------------------------------------

    pub(crate) fn with_graph<R>(&self, f: impl FnOnce(&mut DependencyGraph) -> R) -> R {
        f(&mut self.inner.graph.borrow_mut())
    }

    pub(crate) fn source(&self) -> Rc<dyn ModuleSource> {
        Rc::clone(&self.inner.source)
    }

    pub(crate) fn ambient_stack(&self) -> AmbientStack {
        self.inner.ambient.clone()
    }

    /// Canonical paths of the active load chain, outermost first.
    pub(crate) fn chain_paths(&self) -> Vec<PathBuf> {
        let chain = self.inner.ambient.chain();
        self.with_graph(|g| {
            chain
                .iter()
                .filter_map(|&id| g.node(id).map(|n| n.canonical_path.clone()))
                .collect()
        })
    }

    pub(crate) fn is_disposing(&self) -> bool {
        self.inner.disposing.get()
    }

    pub(crate) fn link(&self, parent: NodeId, child: NodeId) {
        self.with_graph(|g| g.add_edge(parent, child));
    }

    pub(crate) fn pin_root(&self, id: NodeId) {
        self.with_graph(|g| g.pin(id));
    }

    /// Remove one parent edge, tearing down whatever became unreachable.
    pub(crate) fn release_edge(&self, parent: NodeId, child: NodeId) {
        let order = self.with_graph(|g| g.release_edge(parent, child));
        self.run_teardown(order);
    }

    /// Release a root pin without the public existence checks.
    pub(crate) fn unpin_root(&self, id: NodeId) {
        let order = self.with_graph(|g| g.unpin(id));
        self.run_teardown(order);
    }

    /// Tear down a node nothing references anymore (no parents, no pin).
    pub(crate) fn dispose_orphan(&self, id: NodeId) {
        let order = self.with_graph(|g| g.force_dispose(id));
        self.run_teardown(order);
    }

    /// Mark a node active and fire its mount hooks in registration order.
    pub(crate) fn activate(&self, id: NodeId) {
        let hooks = self.with_graph(|g| {
            g.mark_active(id);
            g.take_mount_hooks(id)
        });
        self.run_hooks(hooks, false);
    }

    /// Evict a node whose body failed: sever remaining edges, run whatever
    /// dispose hooks the partial body registered, cancel its effects.
    pub(crate) fn evict_failed(&self, id: NodeId) {
        let order = self.with_graph(|g| {
            g.mark_failed(id);
            g.force_dispose(id)
        });
        self.run_teardown(order);
    }

    /// Tear down dead nodes bottom-up: dispose hooks in reverse
    /// registration order, effects cancelled, then finalized out of the
    /// graph. Imports are rejected for the duration.
    pub(crate) fn run_teardown(&self, order: Vec<NodeId>) {
        if order.is_empty() {
            return;
        }
        let prev = self.inner.disposing.replace(true);
        for id in order {
            let (path, hooks, effects) = self.with_graph(|g| {
                (
                    g.node(id).map(|n| n.canonical_path.clone()),
                    g.take_dispose_hooks(id),
                    g.take_effects(id),
                )
            });
            self.run_hooks(hooks, true);
            {
                let mut timers = self.inner.timers.borrow_mut();
                for t in effects {
                    timers.cancel(t);
                }
            }
            self.with_graph(|g| g.finalize(id));
            if let Some(path) = path {
                tracing::debug!(path = %path.display(), node = %id, "dependency disposed");
            }
        }
        self.inner.disposing.set(prev);
    }

    /// Run hooks with per-callback failure isolation.
    fn run_hooks(&self, hooks: Vec<Hook>, reverse: bool) {
        let hooks: Box<dyn Iterator<Item = Hook>> = if reverse {
            Box::new(hooks.into_iter().rev())
        } else {
            Box::new(hooks.into_iter())
        };
        for hook in hooks {
            if let Err(e) = hook() {
                tracing::warn!(error = %e, "lifecycle hook failed");
                self.inner.counters.borrow_mut().hook_failures += 1;
            }
        }
    }

    pub(crate) fn note_load_started(&self) {
        self.inner.counters.borrow_mut().loads_started += 1;
    }

    pub(crate) fn note_body_executed(&self) {
        self.inner.counters.borrow_mut().bodies_executed += 1;
    }

    pub(crate) fn note_reload(&self) {
        self.inner.counters.borrow_mut().reloads += 1;
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("graph", &*self.inner.graph.borrow())
            .field("ambient", &self.inner.ambient)
            .field("timers", &*self.inner.timers.borrow())
            .field("disposing", &self.inner.disposing.get())
            .finish()
    }
}
