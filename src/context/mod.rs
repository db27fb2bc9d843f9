//! Ambient Dependency Context
//!
//! Tracks which dependency node is "currently loading" so that hook
//! registration calls issued from inside a module body attribute to the
//! right owner. The stack is not a plain call-stack local: module bodies are
//! futures and may suspend mid-evaluation, so the owner is re-entered on
//! every poll via [`Scoped`] and exited when the poll returns. Two unrelated
//! import chains interleaving on the same thread therefore never observe
//! each other's context.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;

use crate::graph::NodeId;

/// Shared stack of currently-loading node identifiers.
///
/// Cheap to clone; all clones view the same stack. Single-threaded by
/// design (`Rc`, never `Send`).
#[derive(Clone, Default)]
pub struct AmbientStack {
    stack: Rc<RefCell<Vec<NodeId>>>,
}

impl AmbientStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node currently at the top of the stack, if any.
    pub fn current(&self) -> Option<NodeId> {
        self.stack.borrow().last().copied()
    }

    /// Whether `id` appears anywhere on the active load chain.
    pub fn contains(&self, id: NodeId) -> bool {
        self.stack.borrow().contains(&id)
    }

    /// Snapshot of the active load chain, outermost first.
    pub fn chain(&self) -> Vec<NodeId> {
        self.stack.borrow().clone()
    }

    /// Push `id` and return a guard that pops it when dropped.
    pub fn enter(&self, id: NodeId) -> ScopeGuard {
        self.stack.borrow_mut().push(id);
        ScopeGuard {
            stack: Rc::clone(&self.stack),
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }
}

impl std::fmt::Debug for AmbientStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientStack")
            .field("stack", &*self.stack.borrow())
            .finish()
    }
}

/// Pops one entry from the owning stack on drop.
pub struct ScopeGuard {
    stack: Rc<RefCell<Vec<NodeId>>>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.stack.borrow_mut().pop();
    }
}

/// A future that evaluates its inner future with `owner` as the current
/// dependency.
///
/// The owner is pushed before every poll and popped after it, which is what
/// restores the ambient context across suspension points: however the
/// executor interleaves tasks, the inner body only ever observes itself (and
/// its ancestors) on the stack while it is actually running.
pub struct Scoped<T> {
    stack: AmbientStack,
    owner: NodeId,
    inner: LocalBoxFuture<'static, T>,
}

impl<T> Scoped<T> {
    pub fn new(stack: AmbientStack, owner: NodeId, inner: LocalBoxFuture<'static, T>) -> Self {
        Self {
            stack,
            owner,
            inner,
        }
    }
}

impl<T> Future for Scoped<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        let _guard = this.stack.enter(this.owner);
        this.inner.as_mut().poll(cx)
    }
}
