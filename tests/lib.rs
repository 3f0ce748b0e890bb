// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

//! End-to-end scenarios driving the public API through the virtual event
//! loop, the way an instrumented host program would.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use txtrace::prelude::*;
use txtrace::shim::TargetFn;
use txtrace::tracer::ActiveContext;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn callback_instrumentation_end_to_end() {
    init_logger();
    let tracer = Tracer::new();
    let event_loop = EventLoop::new();
    let shim = Shim::new(&tracer);

    let finished = Rc::new(RefCell::new(Vec::new()));
    {
        let finished = finished.clone();
        tracer.on_transaction_finished(move |tx| {
            finished.borrow_mut().push(tx.full_name());
        });
    }

    // An async "read": stashes its callback and completes from a timer.
    let target: TargetFn = {
        let event_loop = event_loop.clone();
        Rc::new(move |args: Vec<Arg>| {
            let cb = match args.into_iter().next_back() {
                Some(Arg::Callback(cb)) => cb,
                _ => panic!("expected a trailing callback"),
            };
            event_loop.set_timeout(25, move || cb.invoke(vec![Value::Null, Value::Int(42)]));
            Ok(Ret::Value(Value::Null))
        })
    };

    let results = Rc::new(RefCell::new(Vec::new()));
    let wrapped = {
        let results = results.clone();
        shim.record_named(
            "fs/read",
            target,
            ArgSpec::new()
                .callback(CallbackSource::At(Position::Last))
                .after(move |segment, outcome| {
                    assert!(!segment.is_open());
                    if let SegmentOutcome::Callback(args) = outcome {
                        results.borrow_mut().push(args.clone());
                    }
                }),
        )
    };

    let tx = tracer.with_transaction("web/show", |tx| {
        let user_cb = Callback::new(|_args| {});
        wrapped.call(vec![Arg::Callback(user_cb)]).unwrap();
        tx.clone()
    });

    // Quiescence waits on the bound callback.
    assert!(tx.is_active());
    assert!(finished.borrow().is_empty());

    event_loop.run();

    assert!(!tx.is_active());
    assert_eq!(*finished.borrow(), vec!["web/show".to_string()]);
    assert_eq!(*results.borrow(), vec![vec![Value::Null, Value::Int(42)]]);

    let records = tx.segment_records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].name, "fs/read");
    assert_eq!(records[1].parent_id, records[0].id);
}

#[test]
fn interleaved_transactions_keep_their_contexts() {
    init_logger();
    let tracer = Tracer::new();
    let event_loop = EventLoop::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    let finished = Rc::new(RefCell::new(Vec::new()));
    {
        let finished = finished.clone();
        tracer.on_transaction_finished(move |tx| finished.borrow_mut().push(tx.full_name()));
    }

    let start = |name: &'static str, delay: u64| {
        tracer.with_transaction(name, |tx| {
            let deferred = Deferred::new(&tracer, &event_loop, {
                let event_loop = event_loop.clone();
                move |resolver| {
                    event_loop.set_timeout(delay, move || resolver.resolve(Value::Int(1)));
                }
            });
            let on_ok = {
                let tracer = tracer.clone();
                let tx = tx.clone();
                let order = order.clone();
                let finished = finished.clone();
                Box::new(move |_value: Value| {
                    // The continuation runs under its own transaction even
                    // though the other one settled in between.
                    let active = tracer.current_transaction().unwrap();
                    assert!(Transaction::ptr_eq(&active, &tx));
                    if name == "slow" {
                        // The fast transaction fully finished, notification
                        // included, before this deferred even resolved.
                        assert!(finished.borrow().iter().any(|done| done == "fast"));
                    }
                    order.borrow_mut().push(name.to_string());
                    Outcome::Value(Value::Null)
                })
            };
            deferred.then(Some(on_ok), None);
            tx.clone()
        })
    };

    let slow = start("slow", 20);
    let fast = start("fast", 5);
    assert!(slow.is_active() && fast.is_active());

    event_loop.run();

    assert_eq!(*order.borrow(), vec!["fast".to_string(), "slow".to_string()]);
    assert_eq!(*finished.borrow(), vec!["fast".to_string(), "slow".to_string()]);
    assert!(!slow.is_active() && !fast.is_active());
}

#[test]
fn deferred_fan_out_restores_each_attachment_context() {
    init_logger();
    let tracer = Tracer::new();
    let event_loop = EventLoop::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let tx = tracer.with_transaction("fan", |tx| {
        let deferred = Deferred::new(&tracer, &event_loop, {
            let event_loop = event_loop.clone();
            move |resolver| {
                event_loop.set_timeout(10, move || resolver.resolve(Value::Str("done".into())));
            }
        });

        for branch in ["left", "right"] {
            let segment = tx.start_segment(None, branch.to_string()).unwrap();
            tracer.run_with_context(ActiveContext::of_segment(segment), || {
                let on_ok = {
                    let tracer = tracer.clone();
                    let order = order.clone();
                    Box::new(move |_value: Value| {
                        let segment = tracer.current_segment().unwrap();
                        order.borrow_mut().push(segment.name());
                        Outcome::Value(Value::Null)
                    })
                };
                deferred.then(Some(on_ok), None);
            });
        }
        tx.clone()
    });

    event_loop.run();

    // Once each, in attachment order, each under its own segment.
    assert_eq!(*order.borrow(), vec!["left".to_string(), "right".to_string()]);
    assert!(!tx.is_active());
}

#[test]
fn wrappers_are_inert_outside_a_transaction() {
    init_logger();
    let tracer = Tracer::new();
    let shim = Shim::new(&tracer);

    let finished = Rc::new(Cell::new(0));
    {
        let finished = finished.clone();
        tracer.on_transaction_finished(move |_tx| finished.set(finished.get() + 1));
    }

    let target: TargetFn = Rc::new(|args: Vec<Arg>| {
        if let Some(Arg::Callback(cb)) = args.into_iter().next_back() {
            cb.invoke(vec![Value::Null]);
        }
        Ok(Ret::Value(Value::Int(5)))
    });
    let wrapped = shim.record_named(
        "untraced",
        target,
        ArgSpec::new().callback(CallbackSource::At(Position::Last)),
    );

    let seen = Rc::new(Cell::new(false));
    let user_cb = {
        let tracer = tracer.clone();
        let seen = seen.clone();
        Callback::new(move |_args| {
            assert!(tracer.current().is_empty());
            seen.set(true);
        })
    };

    let ret = wrapped.call(vec![Arg::Callback(user_cb)]).unwrap();
    assert!(matches!(ret, Ret::Value(Value::Int(5))));
    assert!(seen.get());
    assert_eq!(finished.get(), 0);
    assert!(tracer.current().is_empty());
}

#[test]
fn unhandled_rejections_surface_and_do_not_wedge_the_transaction() {
    init_logger();
    let tracer = Tracer::new();
    let event_loop = EventLoop::new();

    let reported = Rc::new(RefCell::new(Vec::new()));
    {
        let reported = reported.clone();
        event_loop.set_unhandled_rejection_hook(move |err| reported.borrow_mut().push(err));
    }

    let tx = tracer.with_transaction("doomed", |tx| {
        let _deferred = Deferred::new(&tracer, &event_loop, {
            let event_loop = event_loop.clone();
            move |resolver| {
                event_loop
                    .set_timeout(5, move || resolver.reject(HostError::new("db unreachable")));
            }
        });
        tx.clone()
    });

    event_loop.run();

    assert_eq!(*reported.borrow(), vec![HostError::new("db unreachable")]);
    assert!(!tx.is_active());
}

#[test]
fn finished_notification_fires_for_ignored_transactions() {
    init_logger();
    let tracer = Tracer::new();

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = seen.clone();
        tracer.on_transaction_finished(move |tx| {
            seen.borrow_mut().push((tx.full_name(), tx.is_ignored()));
        });
    }

    tracer.with_transaction("kept", |_tx| {});
    tracer.with_transaction("skipped", |tx| tx.ignore());

    assert_eq!(
        *seen.borrow(),
        vec![
            ("kept".to_string(), false),
            ("skipped".to_string(), true),
        ]
    );
}

#[test]
fn nested_wrapped_calls_record_parent_child() {
    init_logger();
    let tracer = Tracer::new();
    let shim = Shim::new(&tracer);

    let inner = shim.record_named(
        "cache/get",
        Rc::new(|_args| Ok(Ret::Value(Value::Null))) as TargetFn,
        ArgSpec::new(),
    );
    let outer = {
        let inner = inner.clone();
        shim.record_named(
            "web/handler",
            Rc::new(move |_args| {
                inner.call(vec![])?;
                Ok(Ret::Value(Value::Null))
            }) as TargetFn,
            ArgSpec::new(),
        )
    };

    let tx = tracer.with_transaction("req", |tx| {
        outer.call(vec![]).unwrap();
        tx.clone()
    });

    let records = tx.segment_records();
    assert_eq!(records.len(), 3);
    let handler = records.iter().find(|r| r.name == "web/handler").unwrap();
    let cache = records.iter().find(|r| r.name == "cache/get").unwrap();
    assert_eq!(handler.parent_id, records[0].id);
    assert_eq!(cache.parent_id, handler.id);
}

#[test]
fn deferred_chains_hop_schedulers_without_losing_context() {
    init_logger();
    let tracer = Tracer::new();
    let event_loop = EventLoop::new();
    let hops = Rc::new(RefCell::new(Vec::new()));

    let (tx, done) = tracer.with_transaction("pipeline", |tx| {
        let deferred = Deferred::resolved(&tracer, &event_loop, Value::Int(0));

        let step = |label: &'static str| {
            let tracer = tracer.clone();
            let event_loop = event_loop.clone();
            let hops = hops.clone();
            Box::new(move |value: Value| {
                assert!(tracer.current_transaction().is_some());
                hops.borrow_mut().push(label);
                let n = value.as_int().unwrap();
                // Detour through a timer before the next step.
                let next = Deferred::new(&tracer, &event_loop, {
                    let event_loop = event_loop.clone();
                    move |resolver| {
                        event_loop.set_timeout(1, move || resolver.resolve(Value::Int(n + 1)));
                    }
                });
                Outcome::Chain(next)
            }) as Box<dyn Fn(Value) -> Outcome>
        };

        let done = Rc::new(Cell::new(0));
        {
            let done = done.clone();
            deferred
                .then(Some(step("first")), None)
                .then(Some(step("second")), None)
                .then(
                    Some(Box::new(move |value: Value| {
                        done.set(value.as_int().unwrap());
                        Outcome::Value(Value::Null)
                    })),
                    None,
                );
        }
        (tx.clone(), done)
    });

    event_loop.run();

    assert_eq!(*hops.borrow(), vec!["first", "second"]);
    assert_eq!(done.get(), 2);
    assert!(!tx.is_active());
}
