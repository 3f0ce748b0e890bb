// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

//! The deferred-value bridge.
//!
//! A [`Deferred`] resolves its continuations through the event loop's
//! microtask queue, so ordinary function wrapping cannot intercept it:
//! construction, continuation attachment, and the moment continuations run
//! are three independently-scheduled events. The bridge captures context at
//! each of the first two so the third always observes the right one:
//!
//! - settlement bookkeeping runs under the context active at construction;
//! - each continuation runs under the context active when it was attached,
//!   even when it is attached to an already-settled value.

use std::cell::Cell;
use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use crate::binder::ContextBinding;
use crate::error::HostError;
use crate::event_loop::EventLoop;
use crate::tracer::Tracer;
use crate::value::Value;

/// The final state of a deferred value.
pub type Settled = Result<Value, HostError>;

/// What a continuation produced.
pub enum Outcome {
    Value(Value),
    Fault(HostError),
    /// Settle with whatever the given deferred value settles to.
    Chain(Deferred),
}

pub type OnFulfilled = Box<dyn Fn(Value) -> Outcome>;
pub type OnRejected = Box<dyn Fn(HostError) -> Outcome>;
pub type Executor = Box<dyn FnOnce(Resolver)>;

pub(crate) const MISSING_RESOLVER: &str = "resolver is not a function";

/// A future/promise-like value representing a result not yet available.
///
/// Handles are cheap clones of one shared state; wrapping a handle in a
/// richer type keeps identity checks ([`Deferred::same_deferred`]) working.
#[derive(Clone)]
pub struct Deferred {
    inner: Rc<DeferredInner>,
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred").field("id", &self.inner.id).finish_non_exhaustive()
    }
}

struct DeferredInner {
    id: u64,
    event_loop: EventLoop,
    tracer: Tracer,
    // Context active when the value was created; settlement bookkeeping
    // re-enters it.
    construction: ContextBinding,
    state: RefCell<DeferredState>,
    rejection_handled: Cell<bool>,
}

enum DeferredState {
    Pending {
        subscribers: Vec<Subscriber>,
        watchers: Vec<Watcher>,
    },
    Settled(Settled),
}

struct Subscriber {
    on_ok: Option<OnFulfilled>,
    on_err: Option<OnRejected>,
    // Context active when the continuation was attached.
    binding: ContextBinding,
    downstream: Deferred,
}

struct Watcher {
    f: Box<dyn FnOnce(&Settled)>,
    binding: ContextBinding,
}

/// The resolving/rejecting entry points handed to an executor.
#[derive(Clone)]
pub struct Resolver {
    deferred: Deferred,
}

impl Resolver {
    pub fn resolve(&self, value: Value) {
        self.deferred.settle(Ok(value));
    }

    pub fn reject(&self, err: HostError) {
        self.deferred.settle(Err(err));
    }
}

impl Deferred {
    /// Create a deferred value and run `executor` synchronously with its
    /// resolver.
    pub fn new(
        tracer: &Tracer,
        event_loop: &EventLoop,
        executor: impl FnOnce(Resolver) + 'static,
    ) -> Deferred {
        let deferred = Deferred::pending(tracer, event_loop);
        executor(Resolver {
            deferred: deferred.clone(),
        });
        deferred
    }

    /// Construction entry point for instrumented call sites where the
    /// initializer is supplied dynamically. A missing initializer fails the
    /// same way the plain constructor would.
    pub fn constructed(
        tracer: &Tracer,
        event_loop: &EventLoop,
        executor: Option<Executor>,
    ) -> Result<Deferred, HostError> {
        match executor {
            Some(executor) => Ok(Deferred::new(tracer, event_loop, executor)),
            None => Err(HostError::type_error(MISSING_RESOLVER)),
        }
    }

    pub fn resolved(tracer: &Tracer, event_loop: &EventLoop, value: Value) -> Deferred {
        let deferred = Deferred::pending(tracer, event_loop);
        deferred.settle(Ok(value));
        deferred
    }

    pub fn rejected(tracer: &Tracer, event_loop: &EventLoop, err: HostError) -> Deferred {
        let deferred = Deferred::pending(tracer, event_loop);
        deferred.settle(Err(err));
        deferred
    }

    fn pending(tracer: &Tracer, event_loop: &EventLoop) -> Deferred {
        Deferred {
            inner: Rc::new(DeferredInner {
                id: event_loop.next_deferred_id(),
                event_loop: event_loop.clone(),
                tracer: tracer.clone(),
                construction: ContextBinding::capture(tracer),
                state: RefCell::new(DeferredState::Pending {
                    subscribers: Vec::new(),
                    watchers: Vec::new(),
                }),
                rejection_handled: Cell::new(false),
            }),
        }
    }

    /// Attach continuations, capturing the context active right now for
    /// each. Returns the downstream deferred value of the chain.
    ///
    /// Attaching to an already-settled value schedules the continuation on
    /// the microtask queue; it never runs synchronously.
    pub fn then(&self, on_ok: Option<OnFulfilled>, on_err: Option<OnRejected>) -> Deferred {
        let downstream = Deferred::pending(&self.inner.tracer, &self.inner.event_loop);
        let subscriber = Subscriber {
            on_ok,
            on_err,
            binding: ContextBinding::capture(&self.inner.tracer),
            downstream: downstream.clone(),
        };

        // Someone is listening now; an unhandled rejection, if any, belongs
        // to the downstream value.
        self.mark_rejection_handled();

        let already_settled = {
            let mut state = self.inner.state.borrow_mut();
            match &mut *state {
                DeferredState::Pending { subscribers, .. } => {
                    subscribers.push(subscriber);
                    None
                }
                DeferredState::Settled(result) => Some((subscriber, result.clone())),
            }
        };
        if let Some((subscriber, result)) = already_settled {
            self.schedule_subscriber(subscriber, result);
        }

        downstream
    }

    pub fn catch(&self, on_err: OnRejected) -> Deferred {
        self.then(None, Some(on_err))
    }

    /// Observe settlement without consuming a rejection: an observer never
    /// counts as a rejection handler. The observer runs on the microtask
    /// queue under the context active at attachment.
    pub fn observe(&self, f: impl FnOnce(&Settled) + 'static) {
        let watcher = Watcher {
            f: Box::new(f),
            binding: ContextBinding::capture(&self.inner.tracer),
        };
        let already_settled = {
            let mut state = self.inner.state.borrow_mut();
            match &mut *state {
                DeferredState::Pending { watchers, .. } => {
                    watchers.push(watcher);
                    None
                }
                DeferredState::Settled(result) => Some((watcher, result.clone())),
            }
        };
        if let Some((watcher, result)) = already_settled {
            self.schedule_watcher(watcher, result);
        }
    }

    /// Resolves with the list of all values in input order, or rejects with
    /// the first rejection.
    pub fn all(tracer: &Tracer, event_loop: &EventLoop, items: Vec<Deferred>) -> Deferred {
        let aggregate = Deferred::pending(tracer, event_loop);
        if items.is_empty() {
            aggregate.settle(Ok(Value::List(Vec::new())));
            return aggregate;
        }

        let remaining = Rc::new(Cell::new(items.len()));
        let values = Rc::new(RefCell::new(vec![Value::Null; items.len()]));
        for (index, item) in items.into_iter().enumerate() {
            item.mark_rejection_handled();
            let aggregate = aggregate.clone();
            let remaining = remaining.clone();
            let values = values.clone();
            item.observe(move |settled| match settled {
                Ok(value) => {
                    values.borrow_mut()[index] = value.clone();
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let values = mem::take(&mut *values.borrow_mut());
                        aggregate.settle(Ok(Value::List(values)));
                    }
                }
                Err(err) => aggregate.settle(Err(err.clone())),
            });
        }
        aggregate
    }

    /// Settles with whichever input settles first, success or failure.
    pub fn race(tracer: &Tracer, event_loop: &EventLoop, items: Vec<Deferred>) -> Deferred {
        let aggregate = Deferred::pending(tracer, event_loop);
        for item in items {
            item.mark_rejection_handled();
            let aggregate = aggregate.clone();
            item.observe(move |settled| aggregate.settle(settled.clone()));
        }
        aggregate
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.inner.state.borrow(), DeferredState::Settled(_))
    }

    pub fn settled(&self) -> Option<Settled> {
        match &*self.inner.state.borrow() {
            DeferredState::Settled(result) => Some(result.clone()),
            DeferredState::Pending { .. } => None,
        }
    }

    pub fn same_deferred(a: &Deferred, b: &Deferred) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    // First settlement wins; later attempts are no-ops, not errors.
    fn settle(&self, result: Settled) {
        if self.is_settled() {
            return;
        }
        let construction = self.inner.construction.clone();
        construction.run(|| self.do_settle(result));
    }

    fn do_settle(&self, result: Settled) {
        let (subscribers, watchers) = {
            let mut state = self.inner.state.borrow_mut();
            match &mut *state {
                DeferredState::Settled(_) => return,
                DeferredState::Pending {
                    subscribers,
                    watchers,
                } => {
                    let subscribers = mem::take(subscribers);
                    let watchers = mem::take(watchers);
                    *state = DeferredState::Settled(result.clone());
                    (subscribers, watchers)
                }
            }
        };

        if let Err(err) = &result {
            if subscribers.is_empty() && !self.inner.rejection_handled.get() {
                self.inner
                    .event_loop
                    .track_rejection(self.inner.id, err.clone());
            }
        }

        for subscriber in subscribers {
            self.schedule_subscriber(subscriber, result.clone());
        }
        for watcher in watchers {
            self.schedule_watcher(watcher, result.clone());
        }
    }

    fn schedule_subscriber(&self, subscriber: Subscriber, result: Settled) {
        self.inner
            .event_loop
            .schedule_microtask(move || Deferred::dispatch(subscriber, result));
    }

    fn schedule_watcher(&self, watcher: Watcher, result: Settled) {
        self.inner.event_loop.schedule_microtask(move || {
            let Watcher { f, binding } = watcher;
            binding.run(|| f(&result));
        });
    }

    fn dispatch(subscriber: Subscriber, result: Settled) {
        let Subscriber {
            on_ok,
            on_err,
            binding,
            downstream,
        } = subscriber;

        match result {
            Ok(value) => match on_ok {
                Some(f) => {
                    let outcome = binding.run(|| f(value));
                    downstream.absorb(outcome);
                }
                None => downstream.settle(Ok(value)),
            },
            Err(err) => match on_err {
                Some(f) => {
                    let outcome = binding.run(|| f(err));
                    downstream.absorb(outcome);
                }
                None => downstream.settle(Err(err)),
            },
        }
    }

    fn absorb(&self, outcome: Outcome) {
        match outcome {
            Outcome::Value(value) => self.settle(Ok(value)),
            Outcome::Fault(err) => self.settle(Err(err)),
            Outcome::Chain(other) => {
                other.mark_rejection_handled();
                let downstream = self.clone();
                other.observe(move |settled| downstream.settle(settled.clone()));
            }
        }
    }

    fn mark_rejection_handled(&self) {
        if !self.inner.rejection_handled.replace(true) {
            self.inner.event_loop.untrack_rejection(self.inner.id);
        }
    }
}


#[cfg(test)]
impl Deferred {
    pub(crate) fn pending_for_test(tracer: &Tracer, event_loop: &EventLoop) -> Deferred {
        Deferred::pending(tracer, event_loop)
    }

    pub(crate) fn test_resolver(&self) -> Resolver {
        Resolver {
            deferred: self.clone(),
        }
    }
}
