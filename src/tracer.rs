// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

use std::cell::RefCell;
use std::rc::Rc;

use crate::segment::Segment;
use crate::transaction::Ticket;
use crate::transaction::Transaction;
use crate::util::guard::Guard;

/// The `(active transaction, active segment)` pair at one point of
/// synchronous execution.
///
/// A non-empty segment implies a non-empty transaction owning it; the
/// constructors make other shapes unrepresentable.
#[derive(Clone, Default)]
pub struct ActiveContext {
    transaction: Option<Transaction>,
    segment: Option<Segment>,
}

impl ActiveContext {
    /// The empty context: nothing is being traced.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of_transaction(tx: Transaction) -> Self {
        ActiveContext {
            transaction: Some(tx),
            segment: None,
        }
    }

    pub fn of_segment(segment: Segment) -> Self {
        ActiveContext {
            transaction: Some(segment.transaction().clone()),
            segment: Some(segment),
        }
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.transaction.is_none()
    }
}

/// Decides whether a transaction's data is kept.
pub trait Sampler {
    fn should_sample(&self, name: &str) -> bool;
}

/// Keeps everything. The default policy.
pub struct AlwaysSampler;

impl Sampler for AlwaysSampler {
    fn should_sample(&self, _name: &str) -> bool {
        true
    }
}

/// When the sampling decision is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    AtCreation,
    AtEnd,
}

/// Tracer configuration.
///
/// # Examples
///
/// ```
/// use txtrace::tracer::SamplingMode;
/// use txtrace::tracer::Tracer;
/// use txtrace::tracer::TracerConfig;
///
/// let tracer = Tracer::with_config(TracerConfig::default().sampling_mode(SamplingMode::AtCreation));
/// ```
pub struct TracerConfig {
    pub(crate) sampler: Rc<dyn Sampler>,
    pub(crate) sampling_mode: SamplingMode,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            sampler: Rc::new(AlwaysSampler),
            sampling_mode: SamplingMode::AtEnd,
        }
    }
}

impl TracerConfig {
    pub fn sampler(self, sampler: impl Sampler + 'static) -> Self {
        Self {
            sampler: Rc::new(sampler),
            ..self
        }
    }

    pub fn sampling_mode(self, sampling_mode: SamplingMode) -> Self {
        Self {
            sampling_mode,
            ..self
        }
    }
}

pub(crate) type FinishObservers = Rc<RefCell<Vec<Rc<dyn Fn(&Transaction)>>>>;

/// The context manager: the sole authority on what is currently active.
///
/// A `Tracer` is a cheap cloneable handle around the single mutable context
/// slot. It is explicitly passed to every component that needs it, so tests
/// can build an isolated instance instead of sharing process state.
///
/// # Examples
///
/// ```
/// use txtrace::prelude::*;
///
/// let tracer = Tracer::new();
/// tracer.with_transaction("web/checkout", |tx| {
///     assert!(tx.is_active());
///     assert!(tracer.current_segment().is_some());
/// });
/// ```
#[derive(Clone)]
pub struct Tracer {
    inner: Rc<TracerInner>,
}

struct TracerInner {
    slot: RefCell<ActiveContext>,
    observers: FinishObservers,
    config: TracerConfig,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    pub fn new() -> Self {
        Self::with_config(TracerConfig::default())
    }

    pub fn with_config(config: TracerConfig) -> Self {
        Tracer {
            inner: Rc::new(TracerInner {
                slot: RefCell::new(ActiveContext::none()),
                observers: Rc::new(RefCell::new(Vec::new())),
                config,
            }),
        }
    }

    /// The currently active context.
    pub fn current(&self) -> ActiveContext {
        self.inner.slot.borrow().clone()
    }

    pub fn current_transaction(&self) -> Option<Transaction> {
        self.inner.slot.borrow().transaction().cloned()
    }

    pub fn current_segment(&self) -> Option<Segment> {
        self.inner.slot.borrow().segment().cloned()
    }

    /// Replace the active context without scoping. Prefer
    /// [`run_with_context`](Tracer::run_with_context), which restores the
    /// previous context on every exit path.
    pub fn set_context(&self, ctx: ActiveContext) {
        *self.inner.slot.borrow_mut() = ctx;
    }

    /// Run `f` with `ctx` active, restoring the immediately enclosing
    /// context afterwards, on normal return and on unwind alike.
    ///
    /// Nested calls behave as a stack even though only the top is
    /// materialized.
    pub fn run_with_context<R>(&self, ctx: ActiveContext, f: impl FnOnce() -> R) -> R {
        let prev = self.inner.slot.replace(ctx);
        let _restore = Guard::new(move || {
            self.inner.slot.replace(prev);
        });
        f()
    }

    /// Create a transaction without entering it. The transaction stays
    /// `Pending` until it is run.
    pub fn start_transaction(&self, name: impl Into<String>) -> Transaction {
        Transaction::new(
            name.into(),
            self.inner.observers.clone(),
            self.inner.config.sampler.clone(),
            self.inner.config.sampling_mode,
        )
    }

    /// Create a transaction, activate it, and run `f` with its root segment
    /// as the active context.
    ///
    /// The transaction ends automatically once `f` has returned and every
    /// continuation bound into the transaction has quiesced, unless it is
    /// marked externally handled.
    pub fn with_transaction<R>(
        &self,
        name: impl Into<String>,
        f: impl FnOnce(&Transaction) -> R,
    ) -> R {
        let tx = self.start_transaction(name);
        tx.activate();
        let sync_phase = Ticket::new(&tx);
        let result = self.run_with_context(ActiveContext::of_segment(tx.root_segment()), || f(&tx));
        drop(sync_phase);
        result
    }

    /// Register a hook fired exactly once per transaction, after the
    /// transaction is fully finalized.
    pub fn on_transaction_finished(&self, observer: impl Fn(&Transaction) + 'static) {
        self.inner.observers.borrow_mut().push(Rc::new(observer));
    }

    pub fn ptr_eq(a: &Tracer, b: &Tracer) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::transaction::TransactionState;

    #[test]
    fn context_defaults_to_empty() {
        let tracer = Tracer::new();
        assert!(tracer.current().is_empty());
        assert!(tracer.current_transaction().is_none());
    }

    #[test]
    fn nested_run_restores_enclosing_context() {
        let tracer = Tracer::new();
        let t1 = tracer.start_transaction("t1");
        let t2 = tracer.start_transaction("t2");

        tracer.run_with_context(ActiveContext::of_transaction(t1.clone()), || {
            tracer.run_with_context(ActiveContext::of_transaction(t2.clone()), || {
                let active = tracer.current_transaction().unwrap();
                assert!(Transaction::ptr_eq(&active, &t2));
            });
            let active = tracer.current_transaction().unwrap();
            assert!(Transaction::ptr_eq(&active, &t1));
        });
        assert!(tracer.current().is_empty());
    }

    #[test]
    fn context_restored_after_unwind() {
        let tracer = Tracer::new();
        let t1 = tracer.start_transaction("t1");

        tracer.run_with_context(ActiveContext::of_transaction(t1.clone()), || {
            let t2 = tracer.start_transaction("t2");
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                tracer.run_with_context(ActiveContext::of_transaction(t2), || {
                    panic!("inner body failed")
                })
            }));
            assert!(result.is_err());
            let active = tracer.current_transaction().unwrap();
            assert!(Transaction::ptr_eq(&active, &t1));
        });
    }

    #[test]
    fn with_transaction_enters_root_segment() {
        let tracer = Tracer::new();
        tracer.with_transaction("job", |tx| {
            let segment = tracer.current_segment().unwrap();
            assert!(Segment::same_segment(&segment, &tx.root_segment()));
        });
    }

    #[test]
    fn observers_may_register_observers_during_notification() {
        let tracer = Tracer::new();
        let late_fired = Rc::new(Cell::new(0));
        {
            let tracer = tracer.clone();
            let late_fired = late_fired.clone();
            tracer.clone().on_transaction_finished(move |_tx| {
                let late_fired = late_fired.clone();
                tracer.on_transaction_finished(move |_tx| late_fired.set(late_fired.get() + 1));
            });
        }

        // Registering from inside the notification must not panic, and the
        // new observer only sees transactions that finish afterwards.
        tracer.with_transaction("first", |_tx| {});
        assert_eq!(late_fired.get(), 0);

        tracer.with_transaction("second", |_tx| {});
        assert_eq!(late_fired.get(), 1);
    }

    #[test]
    fn with_transaction_auto_ends_at_quiescence() {
        let tracer = Tracer::new();
        let finished = Rc::new(Cell::new(false));
        {
            let finished = finished.clone();
            tracer.on_transaction_finished(move |_| finished.set(true));
        }
        let tx = tracer.with_transaction("job", |tx| tx.clone());
        assert_eq!(tx.state(), TransactionState::Ended);
        assert!(finished.get());
    }
}
