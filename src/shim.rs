// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

//! Generic function instrumentation.
//!
//! A [`Shim`] wraps host-library functions so that calling the wrapper
//! records a segment around the call and propagates the active context into
//! whatever completion style the function uses: a plain return value, a
//! callback argument, or a deferred value. Wrapping is declarative: an
//! [`ArgSpec`] says where the interesting arguments sit and how the call
//! completes, and the shim derives the rest.
//!
//! Outside a transaction a wrapper is inert: it calls straight through with
//! no segment and no binding, adding close to zero overhead to untraced
//! calls.

use std::borrow::Cow;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::rc::Weak;

use crate::binder::Callback;
use crate::deferred::Deferred;
use crate::deferred::Settled;
use crate::error::HostError;
use crate::segment::Segment;
use crate::tracer::ActiveContext;
use crate::tracer::Tracer;
use crate::value::Value;

/// One argument of an instrumented call.
pub enum Arg {
    Value(Value),
    Callback(Callback),
    /// A batch of callbacks registered together; each is bound, none is
    /// treated as the completion of the call.
    Callbacks(Vec<Callback>),
}

/// What an instrumented call returned.
#[derive(Debug)]
pub enum Ret {
    Value(Value),
    Deferred(Deferred),
}

impl Ret {
    fn return_value(&self) -> Value {
        match self {
            Ret::Value(value) => value.clone(),
            Ret::Deferred(_) => Value::Null,
        }
    }
}

/// The callable being instrumented.
pub type TargetFn = Rc<dyn Fn(Vec<Arg>) -> Result<Ret, HostError>>;

/// An argument position that tolerates variadic call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    First,
    Second,
    Last,
    Index(usize),
}

impl Position {
    fn resolve(self, len: usize) -> Option<usize> {
        match self {
            Position::First => (len > 0).then(|| 0),
            Position::Second => (len > 1).then(|| 1),
            Position::Last => len.checked_sub(1),
            Position::Index(index) => (index < len).then(|| index),
        }
    }
}

/// Where a segment name comes from.
pub enum NameSource {
    Fixed(Cow<'static, str>),
    /// Use the string argument at the given position.
    FromArg(Position),
    Derive(fn(&[Arg]) -> String),
}

impl NameSource {
    fn resolve(&self, fallback: &str, args: &[Arg]) -> String {
        match self {
            NameSource::Fixed(name) => name.to_string(),
            NameSource::FromArg(position) => match position.resolve(args.len()) {
                Some(index) => match &args[index] {
                    Arg::Value(Value::Str(name)) => name.clone(),
                    _ => fallback.to_string(),
                },
                None => fallback.to_string(),
            },
            NameSource::Derive(f) => f(args),
        }
    }
}

/// Where the completion callback sits in the argument list.
pub enum CallbackSource {
    At(Position),
    Pick(fn(&[Arg]) -> Option<usize>),
}

impl CallbackSource {
    fn resolve(&self, args: &[Arg]) -> Option<usize> {
        match self {
            CallbackSource::At(position) => position.resolve(args.len()),
            CallbackSource::Pick(f) => f(args),
        }
    }
}

/// Runs once per recorded call, when its segment closes.
pub type AfterHook = Rc<dyn Fn(&Segment, &SegmentOutcome)>;

/// How a recorded call's segment was closed.
pub enum SegmentOutcome {
    /// Synchronous completion, carrying the return value.
    Return(Value),
    /// The completion callback fired with these arguments.
    Callback(Vec<Value>),
    /// The completion callback signalled an error.
    CallbackError(Vec<Value>),
    /// The returned deferred value settled.
    Settled(Settled),
    /// The call itself raised.
    Error(HostError),
}

/// Declarative description of an instrumented function's shape.
#[derive(Default)]
pub struct ArgSpec {
    name: Option<NameSource>,
    callback: Option<CallbackSource>,
    reject_callback: Option<Position>,
    promise: bool,
    stream: bool,
    after: Option<AfterHook>,
}

impl ArgSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, source: NameSource) -> Self {
        self.name = Some(source);
        self
    }

    /// The call completes through the callback at this position. Its
    /// segment stays open until the callback fires.
    pub fn callback(mut self, source: CallbackSource) -> Self {
        self.callback = Some(source);
        self
    }

    /// A separate error callback; firing it closes the segment as failed.
    pub fn reject_callback(mut self, position: Position) -> Self {
        self.reject_callback = Some(position);
        self
    }

    /// The call completes through a returned deferred value.
    pub fn promise(mut self) -> Self {
        self.promise = true;
        self
    }

    /// The call returns a stream-like value whose end is signalled the same
    /// way a deferred settlement is.
    pub fn stream(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn after(mut self, hook: impl Fn(&Segment, &SegmentOutcome) + 'static) -> Self {
        self.after = Some(Rc::new(hook));
        self
    }
}

// Closes the call's segment exactly once, whichever completion path gets
// there first.
struct Closer {
    segment: Segment,
    after: Option<AfterHook>,
    done: Cell<bool>,
}

impl Closer {
    fn close(&self, outcome: SegmentOutcome) {
        if self.done.replace(true) {
            return;
        }
        // The transaction may have force-closed the segment already.
        let _ = self.segment.end();
        if let Some(after) = &self.after {
            after(&self.segment, &outcome);
        }
    }
}

/// An instrumented function plus its recording spec.
pub struct Wrapped {
    name: Cow<'static, str>,
    target: TargetFn,
    spec: ArgSpec,
    tracer: Tracer,
}

impl Wrapped {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the instrumented function.
    ///
    /// With no active transaction this is a pass-through call. Otherwise a
    /// segment is opened under the active one, the call runs with that
    /// segment active, and the segment closes on whichever completion path
    /// the spec declares.
    pub fn call(&self, mut args: Vec<Arg>) -> Result<Ret, HostError> {
        let ctx = self.tracer.current();
        let tx = match ctx.transaction() {
            Some(tx) => tx.clone(),
            None => return (self.target)(args),
        };

        let name = match &self.spec.name {
            Some(source) => source.resolve(&self.name, &args),
            None => self.name.to_string(),
        };
        let parent = ctx.segment().map(Segment::id);
        let segment = match tx.start_segment(parent, name) {
            Some(segment) => segment,
            // Late call into an ended transaction: record nothing.
            None => return (self.target)(args),
        };

        let closer = Rc::new(Closer {
            segment: segment.clone(),
            after: self.spec.after.clone(),
            done: Cell::new(false),
        });

        let (bound_completion, result) = self
            .tracer
            .run_with_context(ActiveContext::of_segment(segment.clone()), || {
                let bound = self.apply_bindings(&mut args, &closer);
                (bound, (self.target)(args))
            });

        match result {
            Err(err) => {
                closer.close(SegmentOutcome::Error(err.clone()));
                Err(err)
            }
            Ok(ret) => {
                if self.spec.promise || self.spec.stream {
                    if let Ret::Deferred(deferred) = &ret {
                        let closer = closer.clone();
                        // Attach under the segment so the settlement watcher
                        // holds the transaction open and runs in-context.
                        self.tracer
                            .run_with_context(ActiveContext::of_segment(segment), || {
                                deferred.observe(move |settled| {
                                    closer.close(SegmentOutcome::Settled(settled.clone()))
                                });
                            });
                        return Ok(ret);
                    }
                }
                if !bound_completion {
                    closer.close(SegmentOutcome::Return(ret.return_value()));
                }
                Ok(ret)
            }
        }
    }

    // Bind the declared callbacks in place. Returns whether a completion
    // callback took over closing the segment.
    fn apply_bindings(&self, args: &mut Vec<Arg>, closer: &Rc<Closer>) -> bool {
        let mut bound_completion = false;

        if let Some(source) = &self.spec.callback {
            match source.resolve(args).and_then(|index| {
                match &args[index] {
                    Arg::Callback(cb) => Some((index, cb.clone())),
                    _ => None,
                }
            }) {
                Some((index, original)) => {
                    let wrapped = closing_callback(&original, closer.clone(), true);
                    self.tracer.bind(&wrapped);
                    args[index] = Arg::Callback(wrapped);
                    bound_completion = true;
                }
                // Variadic call site without the callback: record the
                // segment as a synchronous call instead.
                None => log::debug!("no completion callback found for `{}`", self.name),
            }
        }

        if let Some(position) = self.spec.reject_callback {
            let found = position.resolve(args.len()).and_then(|index| {
                match &args[index] {
                    Arg::Callback(cb) => Some((index, cb.clone())),
                    _ => None,
                }
            });
            if let Some((index, original)) = found {
                let wrapped = rejecting_callback(&original, closer.clone());
                self.tracer.bind(&wrapped);
                args[index] = Arg::Callback(wrapped);
                bound_completion = true;
            }
        }

        for arg in args.iter_mut() {
            if let Arg::Callbacks(batch) = arg {
                for cb in batch.iter() {
                    self.tracer.bind(cb);
                }
            }
        }

        bound_completion
    }
}

// Completion callback: run the original, then close the segment with the
// arguments it was given. A leading non-null argument is the error-first
// convention.
fn closing_callback(original: &Callback, closer: Rc<Closer>, error_first: bool) -> Callback {
    let original = original.clone();
    Callback::new(move |args: Vec<Value>| {
        original.invoke_raw(args.clone());
        let failed = error_first && args.first().map_or(false, |arg| !arg.is_null());
        let outcome = if failed {
            SegmentOutcome::CallbackError(args)
        } else {
            SegmentOutcome::Callback(args)
        };
        closer.close(outcome);
    })
}

fn rejecting_callback(original: &Callback, closer: Rc<Closer>) -> Callback {
    let original = original.clone();
    Callback::new(move |args: Vec<Value>| {
        original.invoke_raw(args.clone());
        closer.close(SegmentOutcome::CallbackError(args));
    })
}

type Registry = Rc<RefCell<HashMap<*const (), Weak<Wrapped>>>>;

// Ties a callable's registry entry to the callable itself. The entry holds
// the wrapper strongly, so the key stays resolvable while the callable is
// alive; dropping the last callable handle removes the key before the
// allocation is freed, so a reused address can never hit a stale entry.
struct CallableEntry {
    wrapped: Rc<Wrapped>,
    registry: Registry,
    key: Cell<*const ()>,
}

impl Drop for CallableEntry {
    fn drop(&mut self) {
        let key = self.key.get();
        if !key.is_null() {
            self.registry.borrow_mut().remove(&key);
        }
    }
}

/// The instrumentation registry for one tracer.
///
/// Wrapping is idempotent: recording the same target (or an already-wrapped
/// callable) again returns the existing wrapper, so host libraries that
/// compare function identity keep working.
pub struct Shim {
    tracer: Tracer,
    registry: Registry,
}

impl Shim {
    pub fn new(tracer: &Tracer) -> Self {
        Shim {
            tracer: tracer.clone(),
            registry: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn record(&self, target: TargetFn, spec: ArgSpec) -> Rc<Wrapped> {
        self.record_named("<anonymous>", target, spec)
    }

    /// Wrap `target` for recording. The spec of the first recording wins if
    /// the same target is recorded twice.
    pub fn record_named(
        &self,
        name: impl Into<Cow<'static, str>>,
        target: TargetFn,
        spec: ArgSpec,
    ) -> Rc<Wrapped> {
        let key = Rc::as_ptr(&target) as *const ();
        {
            let mut registry = self.registry.borrow_mut();
            registry.retain(|_, entry| entry.strong_count() > 0);
            if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
                return existing;
            }
        }
        let wrapped = Rc::new(Wrapped {
            name: name.into(),
            target,
            spec,
            tracer: self.tracer.clone(),
        });
        self.registry.borrow_mut().insert(key, Rc::downgrade(&wrapped));
        wrapped
    }

    /// A wrapper as a plain callable, for handing back to host code in place
    /// of the original. Recording the returned callable resolves to the same
    /// wrapper instead of double-wrapping.
    pub fn callable(&self, wrapped: &Rc<Wrapped>) -> TargetFn {
        let entry = Rc::new(CallableEntry {
            wrapped: wrapped.clone(),
            registry: self.registry.clone(),
            key: Cell::new(std::ptr::null()),
        });
        let callable: TargetFn = {
            let entry = entry.clone();
            Rc::new(move |args| entry.wrapped.call(args))
        };
        entry.key.set(Rc::as_ptr(&callable) as *const ());
        self.registry
            .borrow_mut()
            .insert(entry.key.get(), Rc::downgrade(wrapped));
        callable
    }
}
