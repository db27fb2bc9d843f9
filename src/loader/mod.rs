//! Loader/Resolver
//!
//! Turns a specifier into a canonical path, deduplicates concurrent loads,
//! and hands a graph-resident node back to the caller.
//!
//! Module content is an opaque loadable unit: a [`ModuleBody`] closure that
//! receives the [`Host`] handle and may suspend at asynchronous points.
//! Where the content comes from is behind [`ModuleSource`] — the runtime
//! only cares about three things: `resolve` (specifier -> canonical
//! identity), `body` (identity -> loadable unit), and `fingerprint`
//! (identity -> change-detection token).
//!
//! Concurrency contract: two sibling imports of the same unresolved path
//! issued concurrently both observe the single in-flight [`LoadToken`];
//! the body executes exactly once and neither importer sees a
//! half-initialized node.

use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future::LocalBoxFuture;

use crate::context::Scoped;
use crate::graph::{NodeId, NodeState};
use crate::host::Host;
use crate::watch::Fingerprint;
use crate::{Error, Result};

/// One module's loadable unit: runs once with the host in ambient context.
pub type ModuleBody = Box<dyn FnOnce(Host) -> LocalBoxFuture<'static, Result<()>>>;

/// Provider of module content, keyed by canonical path.
pub trait ModuleSource {
    /// Resolve a specifier against the importing module's canonical path to
    /// a canonical absolute path.
    fn resolve(&self, specifier: &str, referrer: Option<&Path>) -> Result<PathBuf>;

    /// Produce the loadable unit for a canonical path.
    fn body(&self, path: &Path) -> Result<ModuleBody>;

    /// Current content fingerprint of the backing source.
    fn fingerprint(&self, path: &Path) -> Result<Fingerprint>;
}

// ---------------------------------------------------------------------------
// Resolution helpers
// ---------------------------------------------------------------------------

/// Lexically normalize a path: strips `.`, folds `..` into its parent.
/// No filesystem access.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve a specifier purely lexically: `./` and `../` against the
/// referrer's directory, absolute paths as themselves. Bare specifiers are
/// rejected — the runtime has no package registry.
pub fn resolve_lexical(specifier: &str, referrer: Option<&Path>) -> Result<PathBuf> {
    let path = Path::new(specifier);
    if path.is_absolute() {
        return Ok(normalize(path));
    }
    if specifier.starts_with("./") || specifier.starts_with("../") {
        let base = referrer.and_then(|r| r.parent()).ok_or_else(|| {
            Error::Resolution(format!(
                "relative specifier '{specifier}' used without a referrer"
            ))
        })?;
        return Ok(normalize(&base.join(specifier)));
    }
    Err(Error::Resolution(format!(
        "bare specifiers are not supported: {specifier}"
    )))
}

/// Filesystem-backed resolution: relative/absolute specifiers with
/// extension probing, canonicalized through the real filesystem. Pairs with
/// [`crate::watch::FileWatcher`] for hosts whose modules live on disk.
#[derive(Debug, Clone)]
pub struct FsResolver {
    base_dir: PathBuf,
    /// Extensions probed when the specifier has none (no leading dot).
    extensions: Vec<String>,
}

impl FsResolver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            extensions: Vec::new(),
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Resolve against the referrer's directory (or the base directory),
    /// probing configured extensions when the path as given does not exist.
    pub fn resolve(&self, specifier: &str, referrer: Option<&Path>) -> Result<PathBuf> {
        let base = referrer
            .and_then(|p| p.parent())
            .unwrap_or(&self.base_dir);

        let candidate = if Path::new(specifier).is_absolute() {
            PathBuf::from(specifier)
        } else if specifier.starts_with("./") || specifier.starts_with("../") {
            base.join(specifier)
        } else {
            return Err(Error::Resolution(format!(
                "bare specifiers are not supported: {specifier}"
            )));
        };

        if candidate.exists() {
            return candidate.canonicalize().map_err(|e| Error::Io(e.to_string()));
        }
        if candidate.extension().is_none() {
            for ext in &self.extensions {
                let probed = candidate.with_extension(ext);
                if probed.exists() {
                    return probed.canonicalize().map_err(|e| Error::Io(e.to_string()));
                }
            }
        }
        Err(Error::NotFound(specifier.to_string()))
    }

    /// Content fingerprint of a file on disk.
    pub fn fingerprint(&self, path: &Path) -> Result<Fingerprint> {
        let bytes = std::fs::read(path).map_err(|e| Error::Io(e.to_string()))?;
        Ok(Fingerprint::of_bytes(&bytes))
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

type BodyFactory = Rc<dyn Fn(Host) -> LocalBoxFuture<'static, Result<()>>>;

struct MemoryModule {
    factory: BodyFactory,
    version: u64,
}

/// Module source backed by registered closures, with a version counter per
/// path standing in for file edits. The backbone of tests and embedders
/// whose plugins are native code rather than files.
#[derive(Clone, Default)]
pub struct MemorySource {
    modules: Rc<RefCell<HashMap<PathBuf, MemoryModule>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module body under a canonical path.
    pub fn register<F>(&self, path: impl Into<PathBuf>, factory: F)
    where
        F: Fn(Host) -> LocalBoxFuture<'static, Result<()>> + 'static,
    {
        let path = normalize(&path.into());
        self.modules.borrow_mut().insert(
            path,
            MemoryModule {
                factory: Rc::new(factory),
                version: 1,
            },
        );
    }

    /// Replace a module body and bump its fingerprint, as an edit would.
    pub fn update<F>(&self, path: impl Into<PathBuf>, factory: F)
    where
        F: Fn(Host) -> LocalBoxFuture<'static, Result<()>> + 'static,
    {
        let path = normalize(&path.into());
        let mut modules = self.modules.borrow_mut();
        let version = modules.get(&path).map(|m| m.version + 1).unwrap_or(1);
        modules.insert(
            path,
            MemoryModule {
                factory: Rc::new(factory),
                version,
            },
        );
    }

    /// Bump the fingerprint without changing the body (content edit with
    /// identical behavior).
    pub fn touch(&self, path: impl AsRef<Path>) {
        let path = normalize(path.as_ref());
        if let Some(m) = self.modules.borrow_mut().get_mut(&path) {
            m.version += 1;
        }
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.modules.borrow().contains_key(&normalize(path.as_ref()))
    }
}

impl ModuleSource for MemorySource {
    fn resolve(&self, specifier: &str, referrer: Option<&Path>) -> Result<PathBuf> {
        let path = resolve_lexical(specifier, referrer)?;
        if self.modules.borrow().contains_key(&path) {
            Ok(path)
        } else {
            Err(Error::NotFound(specifier.to_string()))
        }
    }

    fn body(&self, path: &Path) -> Result<ModuleBody> {
        let factory = self
            .modules
            .borrow()
            .get(path)
            .map(|m| Rc::clone(&m.factory))
            .ok_or_else(|| Error::NotFound(path.display().to_string()))?;
        Ok(Box::new(move |host| factory(host)))
    }

    fn fingerprint(&self, path: &Path) -> Result<Fingerprint> {
        self.modules
            .borrow()
            .get(path)
            .map(|m| Fingerprint::version(m.version))
            .ok_or_else(|| Error::NotFound(path.display().to_string()))
    }
}

// ---------------------------------------------------------------------------
// Load token
// ---------------------------------------------------------------------------

enum TokenState {
    Pending { wakers: Vec<Waker> },
    Settled(Result<NodeId>),
}

/// Shared handle on an in-flight load. Every concurrent importer of the
/// same canonical path awaits the same token; it settles exactly once with
/// the node id or the load error.
#[derive(Clone)]
pub struct LoadToken {
    state: Rc<RefCell<TokenState>>,
}

impl LoadToken {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(TokenState::Pending { wakers: Vec::new() })),
        }
    }

    /// Settle the token, waking every waiter. Later calls are ignored.
    pub fn settle(&self, result: Result<NodeId>) {
        let mut state = self.state.borrow_mut();
        if let TokenState::Pending { wakers } = &mut *state {
            let wakers = std::mem::take(wakers);
            *state = TokenState::Settled(result);
            drop(state);
            for waker in wakers {
                waker.wake();
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.state.borrow(), TokenState::Settled(_))
    }

    /// Await settlement.
    pub fn wait(&self) -> TokenWait {
        TokenWait {
            token: self.clone(),
        }
    }
}

impl Default for LoadToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoadToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.borrow() {
            TokenState::Pending { wakers } => format!("pending ({} waiters)", wakers.len()),
            TokenState::Settled(r) => format!("settled ({r:?})"),
        };
        write!(f, "LoadToken({state})")
    }
}

/// Future returned by [`LoadToken::wait`].
pub struct TokenWait {
    token: LoadToken,
}

impl Future for TokenWait {
    type Output = Result<NodeId>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.token.state.borrow_mut();
        match &mut *state {
            TokenState::Settled(result) => Poll::Ready(result.clone()),
            TokenState::Pending { wakers } => {
                wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

enum Plan {
    /// Path already resident and active: just link.
    Link(NodeId),
    /// Load in flight elsewhere: await the shared token.
    Await(LoadToken),
    /// Fresh load: this importer executes the body.
    Run(NodeId, LoadToken),
}

/// Import a module: resolve, dedup against the graph, evaluate the body if
/// this importer is first, then attach the node to whoever is currently
/// loading (or pin it as a root when nothing is).
pub(crate) fn import(
    host: &Host,
    specifier: &str,
    pin_root: bool,
) -> LocalBoxFuture<'static, Result<NodeId>> {
    let host = host.clone();
    let specifier = specifier.to_string();
    Box::pin(async move {
        if host.is_disposing() {
            return Err(Error::DisposeReentrancy(specifier));
        }

        let importer = host.current_dependency();
        let referrer = importer.and_then(|id| host.path_of(id));
        let source = host.source();
        let path = source.resolve(&specifier, referrer.as_deref())?;

        // A path already on this chain's active load stack means the import
        // would re-enter itself. Unrelated chains loading the same path are
        // fine — they share the token instead.
        let chain = host.chain_paths();
        if chain.contains(&path) {
            return Err(Error::Cycle { path, chain });
        }

        let plan = host.with_graph(|graph| match graph.resident(&path) {
            Some(id) => match graph.node(id).map(|n| n.state) {
                Some(NodeState::Active) => Some(Plan::Link(id)),
                Some(NodeState::Pending) => graph.load_token(id).map(Plan::Await),
                _ => None,
            },
            None => None,
        });
        let plan = match plan {
            Some(plan) => plan,
            None => {
                let fingerprint = source.fingerprint(&path).unwrap_or_default();
                let token = LoadToken::new();
                let id = host.with_graph(|graph| {
                    let id = graph.create(&path, fingerprint);
                    graph.set_load_token(id, token.clone());
                    id
                });
                Plan::Run(id, token)
            }
        };

        let child = match plan {
            Plan::Link(id) => id,
            Plan::Await(token) => token.wait().await?,
            Plan::Run(id, token) => {
                host.note_load_started();
                tracing::debug!(path = %path.display(), node = %id, "loading dependency");

                let body_result = match source.body(&path) {
                    Ok(body) => {
                        let scoped = Scoped::new(host.ambient_stack(), id, body(host.clone()));
                        host.note_body_executed();
                        scoped.await
                    }
                    Err(e) => Err(e),
                };

                match body_result {
                    Ok(()) => {
                        host.activate(id);
                        token.settle(Ok(id));
                        id
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "dependency load failed");
                        token.settle(Err(e.clone()));
                        host.evict_failed(id);
                        return Err(e);
                    }
                }
            }
        };

        match importer {
            Some(parent) => host.link(parent, child),
            None if pin_root => host.pin_root(child),
            None => {}
        }
        Ok(child)
    })
}
