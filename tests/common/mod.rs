//! Shared test helpers for integration tests

use std::cell::RefCell;
use std::rc::Rc;
use std::task::Poll;

use cinnabar::{Host, MemorySource};

/// Append-only log shared between test and module bodies, so lifecycle
/// ordering can be asserted after the fact.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Rc<RefCell<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.borrow_mut().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    #[allow(dead_code)]
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    #[allow(dead_code)]
    pub fn count_of(&self, prefix: &str) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

/// Install the fmt subscriber so `RUST_LOG=cinnabar=debug cargo test`
/// shows runtime traces. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fresh host over an in-memory source, plus a log to write events into.
pub fn fixture() -> (Host, MemorySource, EventLog) {
    init_tracing();
    let source = MemorySource::new();
    let host = Host::new(Rc::new(source.clone()));
    (host, source, EventLog::new())
}

/// Register a module that logs `body`/`mount`/`dispose` events under its
/// own path and imports the given children in order.
pub fn register_logged(source: &MemorySource, log: &EventLog, path: &str, children: &[&str]) {
    let log = log.clone();
    let name = path.to_string();
    let children: Vec<String> = children.iter().map(|s| s.to_string()).collect();
    source.register(path, move |host: Host| {
        let log = log.clone();
        let name = name.clone();
        let children = children.clone();
        Box::pin(async move {
            log.push(format!("body {name}"));
            for child in &children {
                host.import_child(child).await?;
            }
            let (l, n) = (log.clone(), name.clone());
            host.on_mount(move || {
                l.push(format!("mount {n}"));
                Ok(())
            })?;
            let (l, n) = (log.clone(), name.clone());
            host.on_dispose(move || {
                l.push(format!("dispose {n}"));
                Ok(())
            })?;
            Ok(())
        })
    });
}

/// Suspend once, resuming on the next poll. Used to force interleaving on
/// the single-threaded executor.
#[allow(dead_code)]
pub async fn yield_now() {
    let mut yielded = false;
    futures::future::poll_fn(move |cx| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await
}
