//! Integration tests for hot reload
//!
//! Fingerprint checks, node swapping, shared-node preservation and the
//! per-path serialization rule, driven through `ReloadCoordinator`.

mod common;

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use cinnabar::{
    ChangeDetector, Host, ModuleSource, ReloadCoordinator, ReloadOutcome, Result,
};
use common::*;
use futures::executor::{block_on, LocalPool};
use futures::task::LocalSpawnExt;
use futures::FutureExt;
use pretty_assertions::assert_eq;

mod swapping {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reload_swaps_node_and_relinks_parent() {
        let (host, source, log) = fixture();
        register_logged(&source, &log, "/p/child", &[]);
        register_logged(&source, &log, "/p/root", &["/p/child"]);

        let root = block_on(host.import("/p/root")).unwrap();
        let old_child = host.resident("/p/child".as_ref()).unwrap();
        log.take();

        source.touch("/p/child");
        let coordinator = host.reloader();
        let outcome = block_on(coordinator.handle_change(Path::new("/p/child"))).unwrap();

        let ReloadOutcome::Reloaded(report) = outcome else {
            panic!("expected a reload");
        };
        assert_ne!(report.node, old_child);
        assert_eq!(host.children_of(root), vec![report.node]);
        assert_eq!(
            log.snapshot(),
            vec!["dispose /p/child", "body /p/child", "mount /p/child"]
        );
    }

    #[test]
    fn test_reload_preserves_shared_children() {
        let (host, source, log) = fixture();
        register_logged(&source, &log, "/p/shared", &[]);
        register_logged(&source, &log, "/p/root", &["/p/shared"]);
        register_logged(&source, &log, "/p/other", &["/p/shared"]);

        block_on(host.import("/p/root")).unwrap();
        block_on(host.import("/p/other")).unwrap();
        let shared = host.resident("/p/shared".as_ref()).unwrap();
        assert_eq!(log.count_of("body /p/shared"), 1);

        source.touch("/p/root");
        let coordinator = host.reloader();
        let outcome =
            block_on(coordinator.handle_change(Path::new("/p/root"))).unwrap();

        let ReloadOutcome::Reloaded(report) = outcome else {
            panic!("expected a reload");
        };
        // The shared child keeps its identity and never re-runs its body:
        // the reloaded root just links against the resident node.
        assert_eq!(host.resident("/p/shared".as_ref()), Some(shared));
        assert_eq!(log.count_of("body /p/shared"), 1);
        assert_eq!(log.count_of("dispose /p/shared"), 0);
        assert_eq!(report.disposed, vec![std::path::PathBuf::from("/p/root")]);
    }

    /// Every snapshotted parent can be unloaded while the replacement body
    /// is still evaluating; the unreferenced replacement must not stay
    /// resident.
    #[test]
    fn test_replacement_without_surviving_parent_is_disposed() {
        let (host, source, log) = fixture();
        let l = log.clone();
        source.register("/p/child", move |host: Host| {
            let l = l.clone();
            Box::pin(async move {
                yield_now().await;
                let l2 = l.clone();
                host.on_dispose(move || {
                    l2.push("dispose /p/child");
                    Ok(())
                })?;
                Ok(())
            })
        });
        register_logged(&source, &log, "/p/root", &["/p/child"]);

        let root = block_on(host.import("/p/root")).unwrap();
        source.touch("/p/child");

        let coordinator = host.reloader();
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let outcome: Rc<RefCell<Option<Result<ReloadOutcome>>>> =
            Rc::new(RefCell::new(None));
        let (c, out) = (coordinator.clone(), Rc::clone(&outcome));
        spawner
            .spawn_local(async move {
                *out.borrow_mut() = Some(c.handle_change(Path::new("/p/child")).await);
            })
            .unwrap();
        let h = host.clone();
        spawner
            .spawn_local(async move {
                h.unload(root).unwrap();
            })
            .unwrap();
        pool.run_until_stalled();

        assert!(matches!(
            *outcome.borrow(),
            Some(Ok(ReloadOutcome::Reloaded(_)))
        ));
        assert!(host.resident("/p/child".as_ref()).is_none());
        assert_eq!(host.stats().resident, 0);
        // Once on the old instance, once on the orphaned replacement.
        assert_eq!(log.count_of("dispose /p/child"), 2);
    }

    #[test]
    fn test_reloaded_root_keeps_its_pin() {
        let (host, source, log) = fixture();
        register_logged(&source, &log, "/p/root", &[]);
        block_on(host.import("/p/root")).unwrap();

        source.touch("/p/root");
        let coordinator = host.reloader();
        let outcome = block_on(coordinator.handle_change(Path::new("/p/root"))).unwrap();
        let ReloadOutcome::Reloaded(report) = outcome else {
            panic!("expected a reload");
        };
        assert!(host.is_pinned(report.node));
    }
}

mod serialization {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Two notifications arriving while a path is mid-reload collapse into
    /// a single queued pass, which re-checks the fingerprint and no-ops.
    #[test]
    fn test_midflight_notifications_queue_one_pass() {
        let (host, source, log) = fixture();
        let l = log.clone();
        source.register("/p/hot", move |host: Host| {
            let l = l.clone();
            Box::pin(async move {
                l.push("body /p/hot");
                yield_now().await;
                let l2 = l.clone();
                host.on_dispose(move || {
                    l2.push("dispose /p/hot");
                    Ok(())
                })?;
                Ok(())
            })
        });

        block_on(host.import("/p/hot")).unwrap();
        source.touch("/p/hot");

        let coordinator = host.reloader();
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let outcomes: Rc<RefCell<Vec<(usize, Result<ReloadOutcome>)>>> =
            Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let (c, out) = (coordinator.clone(), Rc::clone(&outcomes));
            spawner
                .spawn_local(async move {
                    let r = c.handle_change(Path::new("/p/hot")).await;
                    out.borrow_mut().push((i, r));
                })
                .unwrap();
        }
        pool.run_until_stalled();

        let outcomes = outcomes.borrow();
        assert_eq!(outcomes.len(), 3);
        let queued = outcomes
            .iter()
            .filter(|(_, r)| matches!(r, Ok(ReloadOutcome::Queued)))
            .count();
        assert_eq!(queued, 2);

        // One real reload plus one queued fingerprint re-check; the body
        // ran once at load and once for the swap, never a third time.
        assert_eq!(log.count_of("body /p/hot"), 2);
        assert_eq!(host.stats().reloads, 1);
    }

    /// A change landing mid-reload is picked up by the queued pass instead
    /// of being lost.
    #[test]
    fn test_queued_pass_sees_newer_content() {
        let (host, source, log) = fixture();
        let coordinator_slot: Rc<RefCell<Option<ReloadCoordinator>>> =
            Rc::new(RefCell::new(None));
        let runs = Rc::new(Cell::new(0u32));

        let (l, slot, counter, src) = (
            log.clone(),
            Rc::clone(&coordinator_slot),
            Rc::clone(&runs),
            source.clone(),
        );
        source.register("/p/hot", move |_host: Host| {
            let (l, slot, counter, src) = (l.clone(), slot.clone(), counter.clone(), src.clone());
            Box::pin(async move {
                counter.set(counter.get() + 1);
                l.push(format!("body run {}", counter.get()));
                // On the first reload only, simulate an edit landing while
                // this very pass is still evaluating.
                if counter.get() == 2 {
                    src.touch("/p/hot");
                    let queued = slot
                        .borrow()
                        .as_ref()
                        .map(|c| c.handle_change(Path::new("/p/hot")).now_or_never());
                    assert_eq!(
                        queued.flatten(),
                        Some(Ok(ReloadOutcome::Queued)),
                        "mid-flight notification should queue"
                    );
                }
                Ok(())
            })
        });

        block_on(host.import("/p/hot")).unwrap();
        let coordinator = host.reloader();
        *coordinator_slot.borrow_mut() = Some(coordinator.clone());

        source.touch("/p/hot");
        let outcome = block_on(coordinator.handle_change(Path::new("/p/hot"))).unwrap();

        // Final pass saw the newer fingerprint and swapped again.
        assert!(matches!(outcome, ReloadOutcome::Reloaded(_)));
        assert_eq!(runs.get(), 3);
        assert_eq!(host.stats().reloads, 2);
    }
}

mod detection {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Watcher events flow through the detector's fingerprint + debounce
    /// filters before the coordinator ever sees them.
    #[test]
    fn test_detector_feeds_coordinator() {
        let (host, source, log) = fixture();
        register_logged(&source, &log, "/p/a", &[]);
        block_on(host.import("/p/a")).unwrap();

        let path = Path::new("/p/a");
        let mut detector = ChangeDetector::new(50);
        detector.prime(path, source.fingerprint(path).unwrap());

        // Editor touch with identical content: filtered out.
        assert!(!detector.note(path, source.fingerprint(path).unwrap(), host.now()));

        // Genuine edit: passes the fingerprint check, waits out debounce.
        source.touch("/p/a");
        assert!(detector.note(path, source.fingerprint(path).unwrap(), host.now()));
        host.advance(50);
        let ready = detector.drain_ready(host.now());
        assert_eq!(ready, vec![path.to_path_buf()]);

        let coordinator = host.reloader();
        let outcome = block_on(coordinator.handle_change(path)).unwrap();
        assert!(matches!(outcome, ReloadOutcome::Reloaded(_)));
        assert_eq!(host.stats().reloads, 1);
    }
}
