//! Integration tests for interleaved imports, ambient context and effects
//!
//! Everything here runs on `futures::executor::LocalPool` so suspension
//! points interleave deterministically on one thread.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use cinnabar::{Error, Host, NodeId, Result};
use common::*;
use futures::executor::{block_on, LocalPool};
use futures::task::LocalSpawnExt;
use futures::FutureExt;
use pretty_assertions::assert_eq;

mod dedup {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_concurrent_importers_share_one_load() {
        let (host, source, log) = fixture();
        let l = log.clone();
        source.register("/p/slow", move |host: Host| {
            let l = l.clone();
            Box::pin(async move {
                l.push("body /p/slow");
                yield_now().await;
                let l2 = l.clone();
                host.on_mount(move || {
                    l2.push("mount /p/slow");
                    Ok(())
                })?;
                Ok(())
            })
        });

        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let first: Rc<RefCell<Option<Result<NodeId>>>> = Rc::new(RefCell::new(None));
        let second: Rc<RefCell<Option<Result<NodeId>>>> = Rc::new(RefCell::new(None));

        let (h, slot) = (host.clone(), Rc::clone(&first));
        spawner
            .spawn_local(async move {
                *slot.borrow_mut() = Some(h.import("/p/slow").await);
            })
            .unwrap();
        let (h, slot) = (host.clone(), Rc::clone(&second));
        spawner
            .spawn_local(async move {
                *slot.borrow_mut() = Some(h.import("/p/slow").await);
            })
            .unwrap();
        pool.run_until_stalled();

        let a = first.borrow().clone().unwrap().unwrap();
        let b = second.borrow().clone().unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(log.count_of("body /p/slow"), 1);
        assert_eq!(log.count_of("mount /p/slow"), 1);
        assert_eq!(host.stats().loads_started, 1);
    }

    #[test]
    fn test_failed_load_replays_to_every_waiter() {
        let (host, source, _log) = fixture();
        source.register("/p/doomed", move |_host: Host| {
            Box::pin(async move {
                yield_now().await;
                Err(Error::module("nope"))
            })
        });

        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let results: Rc<RefCell<Vec<Result<NodeId>>>> = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let (h, out) = (host.clone(), Rc::clone(&results));
            spawner
                .spawn_local(async move {
                    let r = h.import("/p/doomed").await;
                    out.borrow_mut().push(r);
                })
                .unwrap();
        }
        pool.run_until_stalled();

        let results = results.borrow();
        assert_eq!(results.len(), 2);
        for r in results.iter() {
            assert_eq!(r.clone().unwrap_err(), Error::module("nope"));
        }
        assert_eq!(host.stats().resident, 0);
    }
}

mod ambient {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Two unrelated chains interleave across suspension points; each body
    /// must still observe itself as the current dependency on both sides of
    /// the yield.
    #[test]
    fn test_context_survives_interleaved_suspension() {
        let (host, source, log) = fixture();
        for name in ["/p/left", "/p/right"] {
            let l = log.clone();
            let name_owned = name.to_string();
            source.register(name, move |host: Host| {
                let l = l.clone();
                let name = name_owned.clone();
                Box::pin(async move {
                    let before = host.current_dependency();
                    yield_now().await;
                    let after = host.current_dependency();
                    if before.is_none() || before != after {
                        return Err(Error::module(format!("{name}: context lost")));
                    }
                    let (l2, n) = (l.clone(), name.clone());
                    host.on_dispose(move || {
                        l2.push(format!("dispose {n}"));
                        Ok(())
                    })?;
                    Ok(())
                })
            });
        }

        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let ids: Rc<RefCell<Vec<NodeId>>> = Rc::new(RefCell::new(Vec::new()));
        for name in ["/p/left", "/p/right"] {
            let (h, out) = (host.clone(), Rc::clone(&ids));
            spawner
                .spawn_local(async move {
                    let id = h.import(name).await.unwrap();
                    out.borrow_mut().push(id);
                })
                .unwrap();
        }
        pool.run_until_stalled();

        // Hooks attribute to the right owner: unloading left fires only
        // left's dispose hook.
        let left = host.resident("/p/left".as_ref()).unwrap();
        host.unload(left).unwrap();
        assert_eq!(log.snapshot(), vec!["dispose /p/left"]);
    }

    #[test]
    fn test_no_context_outside_module_evaluation() {
        let (host, _source, _log) = fixture();
        assert_eq!(host.current_dependency(), None);
        assert_eq!(host.on_mount(|| Ok(())), Err(Error::NoActiveDependency));
        assert_eq!(host.on_dispose(|| Ok(())), Err(Error::NoActiveDependency));
    }
}

mod effects {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_timers_die_with_their_owner() {
        let (host, source, log) = fixture();
        let l = log.clone();
        source.register("/p/ticker", move |host: Host| {
            let l = l.clone();
            Box::pin(async move {
                let l2 = l.clone();
                host.set_interval(10, move || l2.push("tick"));
                Ok(())
            })
        });

        let id = block_on(host.import("/p/ticker")).unwrap();
        host.advance(25);
        assert_eq!(log.count_of("tick"), 2);

        host.unload(id).unwrap();
        host.advance(100);
        assert_eq!(log.count_of("tick"), 2);
        assert!(!host.has_pending_timers());
    }

    #[test]
    fn test_fired_one_shot_leaves_no_effect_behind() {
        let (host, source, log) = fixture();
        let l = log.clone();
        source.register("/p/once", move |host: Host| {
            let l = l.clone();
            Box::pin(async move {
                let l2 = l.clone();
                host.set_timeout(5, move || l2.push("fired"));
                Ok(())
            })
        });

        let id = block_on(host.import("/p/once")).unwrap();
        host.advance(10);
        assert_eq!(log.count_of("fired"), 1);

        // Disposal after the timer fired must not trip on the stale handle.
        host.unload(id).unwrap();
        assert_eq!(host.stats().resident, 0);
    }

    #[test]
    fn test_import_during_dispose_is_rejected() {
        let (host, source, log) = fixture();
        register_logged(&source, &log, "/p/other", &[]);
        let l = log.clone();
        source.register("/p/a", move |host: Host| {
            let l = l.clone();
            Box::pin(async move {
                let (h, l2) = (host.clone(), l.clone());
                host.on_dispose(move || {
                    match h.import("/p/other").now_or_never() {
                        Some(Err(Error::DisposeReentrancy(_))) => l2.push("rejected"),
                        other => l2.push(format!("unexpected: {other:?}")),
                    }
                    Ok(())
                })?;
                Ok(())
            })
        });

        let id = block_on(host.import("/p/a")).unwrap();
        log.take();
        host.unload(id).unwrap();
        assert_eq!(log.snapshot(), vec!["rejected"]);
    }
}
