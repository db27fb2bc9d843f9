//! Cinnabar: a hot-reload plugin runtime for chat-bot hosts
//!
//! Cinnabar is the dependency-graph core of a plugin framework: independently
//! loaded modules form a live, observable graph with deduplicated shared
//! nodes, mount/dispose lifecycle hooks, and cascading reload on change.
//! Module content is an opaque loadable unit identified by a canonical path —
//! the runtime never cares whether a plugin is a script file or a registered
//! native closure.
//!
//! # Features
//!
//! - **Deduplicated graph**: diamond dependencies initialize the shared child
//!   exactly once; concurrent importers await one in-flight load
//! - **Refcounted disposal**: teardown cascades bottom-up through exclusively
//!   owned descendants and never double-disposes a shared node
//! - **Ambient context**: "which module is currently loading" survives async
//!   suspension points, so hooks always attribute to the right owner
//! - **Effect-tracked timers**: a disposed module's timers are voided with it
//! - **Hot reload**: fingerprint-checked, debounced, serialized per path
//!
//! # Quick Start
//!
//! ```no_run
//! use std::rc::Rc;
//! use cinnabar::{Host, MemorySource};
//!
//! fn main() -> cinnabar::Result<()> {
//!     let source = MemorySource::new();
//!     source.register("/plugins/echo", |host: Host| {
//!         Box::pin(async move {
//!             host.on_mount(|| {
//!                 println!("echo plugin ready");
//!                 Ok(())
//!             })?;
//!             Ok(())
//!         })
//!     });
//!
//!     let host = Host::new(Rc::new(source));
//!     let node = futures::executor::block_on(host.import("/plugins/echo"))?;
//!     println!("loaded {node}");
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! An import flows: specifier → [`loader`] → [`graph`] (+ [`context`] while
//! the body runs) → resident node. A change flows: [`watch`] → [`reload`] →
//! back through [`loader`].
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`graph`], [`loader`], [`context`], [`error`](Error) |
//! | **Runtime** | [`host`], [`timers`] |
//! | **Hot reload** | [`watch`], [`reload`] |

pub mod context;
pub mod graph;
pub mod host;
pub mod loader;
pub mod reload;
pub mod timers;
pub mod watch;

mod error;

pub use error::{Error, Result};
pub use graph::{DependencyGraph, DependencyNode, NodeId, NodeState};
pub use host::{Host, HostStats};
pub use loader::{FsResolver, MemorySource, ModuleBody, ModuleSource};
pub use reload::{ReloadCoordinator, ReloadOutcome, ReloadReport};
pub use timers::TimerId;
pub use watch::{ChangeDetector, FileWatcher, Fingerprint, WatchConfig};

/// Cinnabar version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
