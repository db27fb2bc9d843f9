//! Dependency Node / Graph
//!
//! The core data structure of the runtime: an arena of dependency nodes
//! keyed by canonical path, with refcounted parent/child edges. Modules may
//! import the same child through multiple independent parents (diamond
//! dependencies), so this is a graph and never a strict ownership tree —
//! every disposal decision consults `ref_count`, never shape.
//!
//! Disposal is two-phase on purpose. Mutating methods
//! ([`release_edge`](DependencyGraph::release_edge),
//! [`unpin`](DependencyGraph::unpin),
//! [`force_dispose`](DependencyGraph::force_dispose)) update edges and
//! refcounts and return the ordered list of nodes that became dead, marked
//! `Disposing`. The host then drains each node's dispose hooks and effects
//! and calls [`finalize`](DependencyGraph::finalize) — hook callbacks run
//! outside any graph borrow and may safely re-enter the runtime.
//!
//! Ordering guarantees:
//! - `children` keeps import order; teardown releases children in reverse
//!   insertion order (last-imported first);
//! - a returned teardown list is bottom-up: an exclusively-owned descendant
//!   always precedes the parent that owned it.

use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::path::{Path, PathBuf};

use crate::loader::LoadToken;
use crate::timers::TimerId;
use crate::watch::Fingerprint;
use crate::Result;

/// Identifier of one dependency node *instance*.
///
/// A reload allocates a fresh `NodeId` for the same canonical path; hook
/// identity never transfers between instances.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dep#{}", self.0)
    }
}

/// Lifecycle state of a dependency node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Resolved, body not yet finished.
    Pending,
    /// Body finished and all children active.
    Active,
    /// Body failed during evaluation; the node is being evicted.
    Failed,
    /// Last parent edge removed; hooks and effects are being torn down.
    Disposing,
    /// Fully torn down and removed from the index.
    Disposed,
}

/// A zero-argument lifecycle callback. Failures are isolated per callback
/// by the host: one `Err` never prevents later hooks from running.
pub type Hook = Box<dyn FnOnce() -> Result<()>>;

/// One loaded module instance tracked by the graph.
pub struct DependencyNode {
    pub id: NodeId,
    /// Resolved absolute path; unique key in the graph while resident.
    pub canonical_path: PathBuf,
    pub state: NodeState,
    /// Content fingerprint of the backing source at load time.
    pub fingerprint: Fingerprint,
    /// Back-references only; never ownership.
    parents: Vec<NodeId>,
    /// Owned children in import order.
    children: Vec<NodeId>,
    /// Live parents plus one if pinned as a root.
    ref_count: usize,
    /// Pinned by the host as a root import.
    pinned: bool,
    mount_hooks: Vec<Hook>,
    dispose_hooks: Vec<Hook>,
    /// Live timer handles created during this node's active window.
    effects: Vec<TimerId>,
    /// In-flight load shared by concurrent importers; present only while
    /// `Pending`.
    load_token: Option<LoadToken>,
}

impl DependencyNode {
    fn new(id: NodeId, canonical_path: PathBuf, fingerprint: Fingerprint) -> Self {
        Self {
            id,
            canonical_path,
            state: NodeState::Pending,
            fingerprint,
            parents: Vec::new(),
            children: Vec::new(),
            ref_count: 0,
            pinned: false,
            mount_hooks: Vec::new(),
            dispose_hooks: Vec::new(),
            effects: Vec::new(),
            load_token: None,
        }
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn effects(&self) -> &[TimerId] {
        &self.effects
    }
}

impl std::fmt::Debug for DependencyNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyNode")
            .field("id", &self.id)
            .field("path", &self.canonical_path)
            .field("state", &self.state)
            .field("ref_count", &self.ref_count)
            .field("pinned", &self.pinned)
            .field("parents", &self.parents)
            .field("children", &self.children)
            .field("mount_hooks", &self.mount_hooks.len())
            .field("dispose_hooks", &self.dispose_hooks.len())
            .field("effects", &self.effects)
            .finish()
    }
}

/// Arena of dependency nodes plus the canonical-path residency index.
#[derive(Default)]
pub struct DependencyGraph {
    nodes: HashMap<NodeId, DependencyNode>,
    /// Canonical path -> resident node. Only `Pending`/`Active` nodes stay
    /// resident; eviction happens in [`finalize`](Self::finalize).
    resident: HashMap<PathBuf, NodeId>,
    next_id: u64,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh `Pending` node for `path` and register it in the
    /// index. The caller is responsible for checking residency first via
    /// [`resident`](Self::resident); callers must never observe two distinct
    /// resident nodes for one canonical path.
    pub fn create(&mut self, path: &Path, fingerprint: Fingerprint) -> NodeId {
        self.next_id += 1;
        let id = NodeId(self.next_id);
        self.nodes
            .insert(id, DependencyNode::new(id, path.to_path_buf(), fingerprint));
        self.resident.insert(path.to_path_buf(), id);
        id
    }

    /// Resident node for a canonical path, if any.
    pub fn resident(&self, path: &Path) -> Option<NodeId> {
        self.resident.get(path).copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&DependencyNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes in the arena (including ones mid-teardown).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // -----------------------------------------------------------------
    // Edges
    // -----------------------------------------------------------------

    /// Add an ownership edge. Increments the child's refcount, appends the
    /// child to the parent's ordered children, records the back-reference.
    ///
    /// Cycle checking happens in the loader against the active load stack,
    /// before the child ever reaches this point.
    pub fn add_edge(&mut self, parent: NodeId, child: NodeId) {
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(child);
        }
        if let Some(c) = self.nodes.get_mut(&child) {
            c.parents.push(parent);
            c.ref_count += 1;
        }
    }

    /// Pin a node as a root import: the host itself holds one reference.
    pub fn pin(&mut self, id: NodeId) {
        if let Some(n) = self.nodes.get_mut(&id) {
            if !n.pinned {
                n.pinned = true;
                n.ref_count += 1;
            }
        }
    }

    /// Release a root pin. Returns the bottom-up teardown list of nodes
    /// that became dead (possibly empty if other parents remain).
    pub fn unpin(&mut self, id: NodeId) -> Vec<NodeId> {
        let dead = match self.nodes.get_mut(&id) {
            Some(n) if n.pinned => {
                n.pinned = false;
                n.ref_count -= 1;
                n.ref_count == 0
            }
            _ => false,
        };
        if dead {
            self.collect_dead(id)
        } else {
            Vec::new()
        }
    }

    /// Remove the edge `parent -> child`, decrementing the child's
    /// refcount. If it reaches zero the child (and its exclusively-owned
    /// descendants) become dead; the bottom-up teardown list is returned.
    /// A child kept alive by another parent only loses the edge.
    pub fn release_edge(&mut self, parent: NodeId, child: NodeId) -> Vec<NodeId> {
        if let Some(p) = self.nodes.get_mut(&parent) {
            if let Some(pos) = p.children.iter().rposition(|&c| c == child) {
                p.children.remove(pos);
            }
        }
        let dead = match self.nodes.get_mut(&child) {
            Some(c) => {
                if let Some(pos) = c.parents.iter().position(|&p| p == parent) {
                    c.parents.remove(pos);
                }
                c.ref_count = c.ref_count.saturating_sub(1);
                c.ref_count == 0 && c.state != NodeState::Disposing
            }
            None => false,
        };
        if dead {
            self.collect_dead(child)
        } else {
            Vec::new()
        }
    }

    /// Force a node dead regardless of refcount (load-failure eviction).
    /// Remaining parent edges are severed first.
    pub fn force_dispose(&mut self, id: NodeId) -> Vec<NodeId> {
        let parents = match self.nodes.get(&id) {
            Some(n) => n.parents.clone(),
            None => return Vec::new(),
        };
        for p in parents {
            if let Some(parent) = self.nodes.get_mut(&p) {
                parent.children.retain(|&c| c != id);
            }
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            if n.state == NodeState::Disposing {
                return Vec::new();
            }
            n.parents.clear();
            n.pinned = false;
            n.ref_count = 0;
        }
        self.collect_dead(id)
    }

    /// Mark `id` dead and cascade through exclusively-owned children in
    /// reverse insertion order. Returns the bottom-up teardown list
    /// (descendants before ancestors, `id` last).
    fn collect_dead(&mut self, id: NodeId) -> Vec<NodeId> {
        let children = match self.nodes.get_mut(&id) {
            Some(n) => {
                n.state = NodeState::Disposing;
                std::mem::take(&mut n.children)
            }
            None => return Vec::new(),
        };

        let mut order = Vec::new();
        for &child in children.iter().rev() {
            let dead = match self.nodes.get_mut(&child) {
                Some(c) => {
                    if let Some(pos) = c.parents.iter().position(|&p| p == id) {
                        c.parents.remove(pos);
                    }
                    c.ref_count = c.ref_count.saturating_sub(1);
                    c.ref_count == 0 && c.state != NodeState::Disposing
                }
                None => false,
            };
            if dead {
                order.extend(self.collect_dead(child));
            }
        }
        order.push(id);
        order
    }

    // -----------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------

    pub fn mark_active(&mut self, id: NodeId) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.state = NodeState::Active;
            n.load_token = None;
        }
    }

    pub fn set_load_token(&mut self, id: NodeId, token: LoadToken) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.load_token = Some(token);
        }
    }

    pub fn load_token(&self, id: NodeId) -> Option<LoadToken> {
        self.nodes.get(&id).and_then(|n| n.load_token.clone())
    }

    pub fn mark_failed(&mut self, id: NodeId) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.state = NodeState::Failed;
        }
    }

    /// Final step of disposal: after hooks ran and effects were cancelled
    /// the node leaves the arena and frees its canonical path for a later
    /// re-import.
    pub fn finalize(&mut self, id: NodeId) {
        if let Some(mut n) = self.nodes.remove(&id) {
            n.state = NodeState::Disposed;
            if self.resident.get(&n.canonical_path) == Some(&id) {
                self.resident.remove(&n.canonical_path);
            }
        }
    }

    // -----------------------------------------------------------------
    // Hooks and effects
    // -----------------------------------------------------------------

    pub fn add_mount_hook(&mut self, id: NodeId, hook: Hook) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.mount_hooks.push(hook);
        }
    }

    pub fn add_dispose_hook(&mut self, id: NodeId, hook: Hook) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.dispose_hooks.push(hook);
        }
    }

    /// Drain mount hooks in registration order.
    pub fn take_mount_hooks(&mut self, id: NodeId) -> Vec<Hook> {
        self.nodes
            .get_mut(&id)
            .map(|n| std::mem::take(&mut n.mount_hooks))
            .unwrap_or_default()
    }

    /// Drain dispose hooks in registration order; the host fires them
    /// reversed.
    pub fn take_dispose_hooks(&mut self, id: NodeId) -> Vec<Hook> {
        self.nodes
            .get_mut(&id)
            .map(|n| std::mem::take(&mut n.dispose_hooks))
            .unwrap_or_default()
    }

    pub fn add_effect(&mut self, id: NodeId, timer: TimerId) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.effects.push(timer);
        }
    }

    pub fn remove_effect(&mut self, id: NodeId, timer: TimerId) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.effects.retain(|&t| t != timer);
        }
    }

    pub fn take_effects(&mut self, id: NodeId) -> Vec<TimerId> {
        self.nodes
            .get_mut(&id)
            .map(|n| std::mem::take(&mut n.effects))
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------

    /// The set a reload would dispose: `root` plus every transitive
    /// descendant reachable only through the set itself. A descendant with
    /// a parent (or pin) outside the set is shared and excluded.
    ///
    /// Returned in depth-first preorder from `root`; purely informational —
    /// actual disposal order comes from the refcount cascade.
    pub fn exclusive_closure(&self, root: NodeId) -> Vec<NodeId> {
        let mut set: HashSet<NodeId> = HashSet::default();
        set.insert(root);
        loop {
            let mut grew = false;
            let members: Vec<NodeId> = set.iter().copied().collect();
            for m in members {
                let Some(n) = self.nodes.get(&m) else { continue };
                for &c in &n.children {
                    if set.contains(&c) {
                        continue;
                    }
                    let Some(child) = self.nodes.get(&c) else {
                        continue;
                    };
                    if !child.pinned && child.parents.iter().all(|p| set.contains(p)) {
                        set.insert(c);
                        grew = true;
                    }
                }
            }
            if !grew {
                break;
            }
        }

        let mut out = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::default();
        self.preorder(root, &set, &mut seen, &mut out);
        out
    }

    fn preorder(
        &self,
        id: NodeId,
        set: &HashSet<NodeId>,
        seen: &mut HashSet<NodeId>,
        out: &mut Vec<NodeId>,
    ) {
        if !set.contains(&id) || !seen.insert(id) {
            return;
        }
        out.push(id);
        if let Some(n) = self.nodes.get(&id) {
            for &c in &n.children {
                self.preorder(c, set, seen, out);
            }
        }
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.nodes.len())
            .field("resident", &self.resident)
            .finish()
    }
}
