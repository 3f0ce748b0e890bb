// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

//! Captures the active context and re-establishes it inside continuations,
//! regardless of when or from where they are later invoked.

use std::cell::RefCell;
use std::rc::Rc;

use crate::tracer::ActiveContext;
use crate::tracer::Tracer;
use crate::transaction::Ticket;
use crate::value::Value;

/// A context snapshot paired with the tracer it belongs to.
///
/// This is the single capture/restore primitive shared by bound callbacks,
/// deferred-value subscribers, and the future adapter. While the snapshot
/// references a live transaction it holds a quiescence ticket, keeping the
/// transaction from auto-ending before the continuation has run.
#[derive(Clone)]
pub struct ContextBinding {
    inner: Rc<BindingInner>,
}

struct BindingInner {
    tracer: Tracer,
    ctx: ActiveContext,
    ticket: RefCell<Option<Ticket>>,
}

impl ContextBinding {
    /// Capture the context active right now.
    pub fn capture(tracer: &Tracer) -> Self {
        Self::new(tracer, tracer.current())
    }

    pub fn new(tracer: &Tracer, ctx: ActiveContext) -> Self {
        let ticket = ctx.transaction().map(Ticket::new);
        ContextBinding {
            inner: Rc::new(BindingInner {
                tracer: tracer.clone(),
                ctx,
                ticket: RefCell::new(ticket),
            }),
        }
    }

    pub fn context(&self) -> &ActiveContext {
        &self.inner.ctx
    }

    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    /// Run a continuation under the captured context. The quiescence ticket
    /// is released once the continuation's synchronous phase completes, so
    /// the first invocation may be the one that lets the transaction end.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let ticket = self.inner.ticket.borrow_mut().take();
        let result = self.inner.tracer.run_with_context(self.inner.ctx.clone(), f);
        drop(ticket);
        result
    }

    /// Run under the captured context without releasing the ticket. Used by
    /// pollable continuations that resume more than once; pair with
    /// [`release`](ContextBinding::release) on completion.
    pub fn run_retaining<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.tracer.run_with_context(self.inner.ctx.clone(), f)
    }

    pub fn release(&self) {
        self.inner.ticket.borrow_mut().take();
    }
}

type CallbackFn = Box<dyn FnMut(Vec<Value>)>;

/// A callback-shaped host value.
///
/// Cloning a `Callback` clones the handle, not the function: identity checks
/// host libraries rely on (such as removing a registered handler) keep
/// working on the bound handle, because binding mutates the one shared slot
/// instead of producing a fresh wrapper.
#[derive(Clone)]
pub struct Callback {
    inner: Rc<CallbackInner>,
}

struct CallbackInner {
    func: RefCell<CallbackFn>,
    binding: RefCell<Option<ContextBinding>>,
}

impl Callback {
    pub fn new(f: impl FnMut(Vec<Value>) + 'static) -> Self {
        Callback {
            inner: Rc::new(CallbackInner {
                func: RefCell::new(Box::new(f)),
                binding: RefCell::new(None),
            }),
        }
    }

    /// Invoke the callback. If it is bound, the captured context is restored
    /// around the call and the invoker's context is reinstated afterwards.
    pub fn invoke(&self, args: Vec<Value>) {
        let binding = self.inner.binding.borrow().clone();
        match binding {
            Some(binding) => binding.run(|| self.invoke_raw(args)),
            None => self.invoke_raw(args),
        }
    }

    /// Call straight through to the target, ignoring any binding.
    pub(crate) fn invoke_raw(&self, args: Vec<Value>) {
        (self.inner.func.borrow_mut())(args)
    }

    pub fn is_bound(&self) -> bool {
        self.inner.binding.borrow().is_some()
    }

    /// Whether two handles point at the same underlying function.
    pub fn same_target(a: &Callback, b: &Callback) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

impl Tracer {
    /// Bind a callback to the context active right now.
    ///
    /// Binding is idempotent: re-binding refreshes the captured context in
    /// place, so the capture always reflects the most recent call site and
    /// the callback's identity never changes. The returned handle is a clone
    /// of the input.
    pub fn bind(&self, callback: &Callback) -> Callback {
        callback
            .inner
            .binding
            .replace(Some(ContextBinding::capture(self)));
        callback.clone()
    }

    /// Binding an absent callback is a no-op.
    pub fn bind_opt(&self, callback: Option<&Callback>) -> Option<Callback> {
        callback.map(|cb| self.bind(cb))
    }
}
