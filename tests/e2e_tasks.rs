//! End-to-end task lifecycle scenarios.
//!
//! Exercises the full engine through the public API on the virtual clock:
//!
//! - fork/join with slot ordering independent of completion order
//! - failure propagation order (sibling cleanup before the parent's hook)
//! - spawned subtasks outliving and being reparented past their parent
//! - binding resolution up the task tree, including the stale-cache case
//!   and the `join` keep-alive discipline that avoids it

use std::cell::RefCell;
use std::rc::Rc;
use stepline::test_utils::init_test_logging;
use stepline::{Error, ErrorKind, Runtime, StepOutcome, Value};
use stepline::{assert_with_log, test_complete, test_phase, test_section};

type EventLog = Rc<RefCell<Vec<String>>>;

fn events() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

fn record(log: &EventLog, event: impl Into<String>) {
    log.borrow_mut().push(event.into());
}

#[test]
fn fork_join_orders_results_by_declaration_not_completion() {
    init_test_logging();
    test_phase!("fork join slot ordering");

    let mut rt = Runtime::deterministic();
    let log = events();

    let sink = log.clone();
    let handle = rt.task(move |cx| {
        cx.fork(|cx| {
            // Declared first, finishes last.
            cx.step(|cx, _| {
                cx.sleep(10);
                StepOutcome::done()
            });
            cx.step(|_, _| StepOutcome::ok("a"));
        });
        cx.fork(|cx| {
            cx.step(|cx, _| {
                cx.sleep(5);
                StepOutcome::done()
            });
            cx.step(|_, _| StepOutcome::ok("b"));
        });
        cx.step(move |_, input| {
            record(&sink, format!("joined {input}"));
            StepOutcome::Ok(input)
        });
    });

    rt.run();

    assert_with_log!(
        *log.borrow() == vec!["joined [a, b]"],
        "results follow declaration order",
        vec!["joined [a, b]"],
        log.borrow()
    );
    assert_eq!(rt.now().as_millis(), 10);
    assert!(handle.outcome(&rt).unwrap().is_ok());
    test_complete!("fork join slot ordering");
}

#[test]
fn failed_fork_cleans_up_siblings_before_the_parent_hook() {
    init_test_logging();
    test_phase!("fork failure propagation order");

    let mut rt = Runtime::deterministic();
    let log = events();

    let sink = log.clone();
    let handle = rt.task(move |cx| {
        let cleanup = sink.clone();
        cx.fork(move |cx| {
            cx.step(|cx, _| {
                cx.sleep(1_000);
                StepOutcome::done()
            });
            cx.defer(move |_| record(&cleanup, "sibling cleaned up"));
        });
        cx.fork(|cx| {
            cx.step(|_, _| Error::user("deliberate").into());
        });
        cx.step(|_, _| unreachable!("join after a failed fork"));
        let failed = sink.clone();
        cx.on_failure(move |_, e| {
            record(&failed, format!("parent saw: {}", e.message().unwrap_or("")));
        });
        cx.on_final(move |_, settlement| {
            record(&sink, format!("final hook, ok={}", settlement.is_ok()));
        });
    });

    rt.run();

    assert_eq!(
        *log.borrow(),
        vec![
            "sibling cleaned up",
            "parent saw: deliberate",
            "final hook, ok=false"
        ]
    );
    assert_eq!(handle.outcome(&rt).unwrap().unwrap_err().kind(), ErrorKind::User);
    test_complete!("fork failure propagation order");
}

#[test]
fn spawned_task_survives_its_parent_and_reparents() {
    init_test_logging();
    test_phase!("spawn reparenting");

    let mut rt = Runtime::deterministic();
    let log = events();

    let sink = log.clone();
    let mut spawned = None;
    let parent = rt.task(|cx| {
        let slow = sink.clone();
        spawned = Some(cx.spawn(move |cx| {
            cx.step(|cx, _| {
                cx.sleep(100);
                StepOutcome::done()
            });
            cx.step(move |_, _| {
                record(&slow, "orphan finished");
                StepOutcome::ok("orphan result")
            });
        }));
        cx.step(move |_, _| {
            record(&sink, "parent finished");
            StepOutcome::done()
        });
    });

    test_section!("parent finishes while the spawn sleeps");
    rt.run_until_idle();
    let spawned = spawned.unwrap();
    assert!(parent.is_done(&rt));
    assert!(spawned.is_alive(&rt));

    test_section!("orphan completes after reparenting");
    rt.run();
    assert_eq!(*log.borrow(), vec!["parent finished", "orphan finished"]);
    assert!(matches!(
        spawned.outcome(&rt),
        Some(Ok(Value::Str(s))) if s == "orphan result"
    ));
    test_complete!("spawn reparenting");
}

#[test]
fn bindings_resolve_up_the_tree_and_writes_hit_the_owner() {
    init_test_logging();
    test_phase!("binding ancestor walk");

    let mut rt = Runtime::deterministic();
    let log = events();

    let sink = log.clone();
    rt.task(move |cx| {
        cx.var("counter", 0);
        cx.fork(|cx| {
            cx.step(|cx, _| {
                let current = cx.get("counter").unwrap().unwrap();
                let next = current.as_int().unwrap() + 1;
                cx.set("counter", next).unwrap();
                StepOutcome::done()
            });
        });
        cx.fork(|cx| {
            cx.step(|cx, _| {
                // Runs after the first fork on the FIFO queue.
                let current = cx.get("counter").unwrap().unwrap();
                cx.set("counter", current.as_int().unwrap() + 10).unwrap();
                StepOutcome::done()
            });
        });
        cx.step(move |cx, _| {
            let v = cx.get("counter").unwrap().unwrap();
            record(&sink, format!("counter = {v}"));
            StepOutcome::done()
        });
    });

    rt.run();
    assert_eq!(*log.borrow(), vec!["counter = 11"]);
    test_complete!("binding ancestor walk");
}

#[test]
fn cached_binding_to_a_dead_owner_reports_stale() {
    init_test_logging();
    test_phase!("stale binding cache");

    let mut rt = Runtime::deterministic();
    let log = events();

    let sink = log.clone();
    rt.task(move |cx| {
        cx.var("owned", "here");
        let probe = sink.clone();
        cx.spawn(move |cx| {
            cx.step(|cx, _| {
                // Populates the binding cache while the parent lives.
                let v = cx.get("owned").unwrap().unwrap();
                assert_eq!(v, Value::Str("here".into()));
                cx.sleep(100);
                StepOutcome::done()
            });
            cx.step(move |cx, _| {
                // The parent is gone; the cached owner must not silently
                // read some recycled task.
                match cx.get("owned") {
                    Err(e) => record(&probe, format!("{:?}", e.kind())),
                    Ok(v) => record(&probe, format!("unexpected {v:?}")),
                }
                StepOutcome::done()
            });
        });
        // Keeps the owner alive long enough for the cache to be populated,
        // but not until the probe step runs.
        cx.step(|cx, _| {
            cx.sleep(10);
            StepOutcome::done()
        });
    });

    rt.run();
    assert_eq!(*log.borrow(), vec!["StaleBinding"]);
    test_complete!("stale binding cache");
}

#[test]
fn joining_the_reader_keeps_the_binding_owner_alive() {
    init_test_logging();
    test_phase!("join keep-alive");

    let mut rt = Runtime::deterministic();
    let log = events();

    let sink = log.clone();
    rt.task(move |cx| {
        cx.var("owned", "still here");
        let probe = sink.clone();
        let reader = cx.spawn(move |cx| {
            cx.step(|cx, _| {
                assert!(cx.binding("owned").unwrap().is_some());
                cx.sleep(100);
                StepOutcome::done()
            });
            cx.step(move |cx, _| {
                let v = cx.get("owned").unwrap().unwrap();
                record(&probe, format!("read {v}"));
                StepOutcome::done()
            });
        });
        // The owner waits for the reader, so the binding stays valid for
        // as long as the reader needs it.
        cx.step(move |cx, _| {
            cx.join(reader);
            StepOutcome::done()
        });
    });

    rt.run();
    assert_eq!(*log.borrow(), vec!["read still here"]);
    test_complete!("join keep-alive");
}

#[test]
fn raise_on_a_parent_unwinds_outstanding_forks_first() {
    init_test_logging();
    test_phase!("raise unwinds forks");

    let mut rt = Runtime::deterministic();
    let log = events();

    let sink = log.clone();
    let handle = rt.task(move |cx| {
        let cleanup = sink.clone();
        cx.fork(move |cx| {
            cx.step(|cx, _| {
                cx.sleep(10_000);
                StepOutcome::done()
            });
            cx.defer(move |_| record(&cleanup, "fork cleaned up"));
        });
        cx.step(|_, _| unreachable!("parent resumes only to fail"));
        cx.on_failure(move |_, _| record(&sink, "parent failed"));
    });

    rt.run_until_idle();
    handle.raise(&mut rt, Error::user("outside push")).unwrap();
    rt.run_until_idle();

    assert_eq!(*log.borrow(), vec!["fork cleaned up", "parent failed"]);
    assert_eq!(handle.outcome(&rt).unwrap().unwrap_err().kind(), ErrorKind::User);
    test_complete!("raise unwinds forks");
}
