// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use minstant::Anchor;
use minstant::Instant;
use once_cell::sync::Lazy;

use crate::attribute::AttributeMap;
use crate::attribute::Destinations;
use crate::error::TraceError;
use crate::segment::RawSegment;
use crate::segment::Segment;
use crate::segment::SegmentId;
use crate::segment::SegmentRecord;
use crate::segment::ROOT_SEGMENT_ID;
use crate::tracer::FinishObservers;
use crate::tracer::Sampler;
use crate::tracer::SamplingMode;
use crate::value::Value;

static ANCHOR: Lazy<Anchor> = Lazy::new(Anchor::new);

/// Process-unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    fn next() -> Self {
        TransactionId(rand::random())
    }
}

/// Lifecycle of a transaction. `Ignored` is not a state: it is an orthogonal
/// flag queried via [`Transaction::is_ignored`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Active,
    Ended,
}

/// One logical unit of host work being traced end-to-end.
///
/// A `Transaction` is a cheap cloneable handle; the segment tree and all
/// lifecycle state live behind it and are owned exclusively by it.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) inner: Rc<RefCell<TransactionInner>>,
}

pub(crate) struct TransactionInner {
    id: TransactionId,
    begin_instant: Instant,
    end_instant: Instant,
    state: TransactionState,
    ignored: bool,
    externally_handled: bool,
    name: String,
    final_name: Option<String>,
    sampled: Option<bool>,
    sampler: Rc<dyn Sampler>,
    attributes: AttributeMap,
    segments: Vec<RawSegment>,
    next_segment_id: u32,
    // Outstanding continuation tickets; quiescence is `pending == 0`.
    pending: usize,
    observers: FinishObservers,
}

impl Transaction {
    pub(crate) fn new(
        name: String,
        observers: FinishObservers,
        sampler: Rc<dyn Sampler>,
        sampling_mode: SamplingMode,
    ) -> Self {
        let begin_instant = Instant::now();
        let sampled = match sampling_mode {
            SamplingMode::AtCreation => Some(sampler.should_sample(&name)),
            SamplingMode::AtEnd => None,
        };
        let root = RawSegment::begin_with(ROOT_SEGMENT_ID, SegmentId::default(), begin_instant, "ROOT");

        Transaction {
            inner: Rc::new(RefCell::new(TransactionInner {
                id: TransactionId::next(),
                begin_instant,
                end_instant: Instant::ZERO,
                state: TransactionState::Pending,
                ignored: false,
                externally_handled: false,
                name,
                final_name: None,
                sampled,
                sampler,
                attributes: AttributeMap::new(),
                segments: vec![root],
                next_segment_id: ROOT_SEGMENT_ID.0 + 1,
                pending: 0,
                observers,
            })),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.borrow().id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.borrow().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// The current name, or the finalized one once the transaction ended.
    pub fn full_name(&self) -> String {
        let inner = self.inner.borrow();
        inner
            .final_name
            .clone()
            .unwrap_or_else(|| inner.name.clone())
    }

    /// Rename the transaction. The name is finalized at end; renaming an
    /// ended transaction is ignored.
    pub fn set_name(&self, name: impl Into<String>) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == TransactionState::Ended {
            log::warn!("attempt to rename ended transaction `{}`", inner.name);
            return;
        }
        inner.name = name.into();
    }

    /// Mark the transaction as ignored. Settable any time before end.
    pub fn ignore(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == TransactionState::Ended {
            log::warn!("attempt to ignore ended transaction `{}`", inner.name);
            return;
        }
        inner.ignored = true;
    }

    pub fn is_ignored(&self) -> bool {
        self.inner.borrow().ignored
    }

    /// Defer ending to an external caller instead of automatic quiescence
    /// detection.
    pub fn set_externally_handled(&self, externally_handled: bool) {
        self.inner.borrow_mut().externally_handled = externally_handled;
    }

    pub fn is_externally_handled(&self) -> bool {
        self.inner.borrow().externally_handled
    }

    /// The sampling decision, once fixed. `None` until a deferred decision
    /// is made at end.
    pub fn is_sampled(&self) -> Option<bool> {
        self.inner.borrow().sampled
    }

    pub fn root_segment(&self) -> Segment {
        Segment {
            tx: self.clone(),
            id: ROOT_SEGMENT_ID,
        }
    }

    pub fn add_attribute(
        &self,
        key: impl Into<String>,
        value: Value,
        destinations: Destinations,
    ) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == TransactionState::Ended {
            log::warn!(
                "attribute write on ended transaction `{}` dropped",
                inner.name
            );
            return;
        }
        inner.attributes.insert(key.into(), value, destinations);
    }

    pub fn attributes(&self, destinations: Destinations) -> Vec<(String, Value)> {
        self.inner
            .borrow()
            .attributes
            .get(destinations)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Duration from creation to end; `None` while the transaction is live.
    pub fn duration(&self) -> Option<Duration> {
        let inner = self.inner.borrow();
        if inner.state == TransactionState::Ended {
            Some(inner.end_instant.duration_since(inner.begin_instant))
        } else {
            None
        }
    }

    /// Finalized snapshots of the whole segment tree, in start order.
    pub fn segment_records(&self) -> Vec<SegmentRecord> {
        let inner = self.inner.borrow();
        inner
            .segments
            .iter()
            .map(|raw| SegmentRecord {
                id: raw.id.0,
                parent_id: raw.parent_id.0,
                name: raw.name.to_string(),
                begin_unix_ns: raw.begin_instant.as_unix_nanos(&ANCHOR),
                duration_ns: if raw.is_open() {
                    0
                } else {
                    raw.end_instant.duration_since(raw.begin_instant).as_nanos() as u64
                },
                attributes: raw.attributes.clone(),
            })
            .collect()
    }

    /// End the transaction: finalize the name and sampling decision, close
    /// the segment tree, and fire the finished notification exactly once.
    ///
    /// A second call is a detectable programming error and mutates nothing.
    pub fn end(&self) -> Result<(), TraceError> {
        let observers: Vec<Rc<dyn Fn(&Transaction)>>;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == TransactionState::Ended {
                return Err(TraceError::TransactionEnded(inner.name.clone()));
            }

            let end_instant = Instant::now();
            inner.final_name = Some(inner.name.clone());
            if inner.sampled.is_none() {
                let name = inner.final_name.clone().unwrap_or_default();
                inner.sampled = Some(inner.sampler.should_sample(&name));
            }

            let mut left_open = 0usize;
            for raw in &mut inner.segments {
                if raw.is_open() {
                    raw.end_with(end_instant);
                    left_open += 1;
                }
            }
            // The root is expected to still be open here.
            if left_open > 1 {
                log::warn!(
                    "transaction `{}` ended with {} segments left open",
                    inner.name,
                    left_open - 1
                );
            }

            inner.end_instant = end_instant;
            inner.state = TransactionState::Ended;
            // Snapshot before dispatch: an observer may register further
            // observers while being notified.
            observers = inner.observers.borrow().iter().cloned().collect();
        }

        for observer in observers {
            observer(self);
        }
        Ok(())
    }

    pub fn ptr_eq(a: &Transaction, b: &Transaction) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn activate(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == TransactionState::Pending {
            inner.state = TransactionState::Active;
        }
    }

    /// Start a child segment under `parent`, or under the root when `parent`
    /// is `None`. Returns `None` once the transaction has ended: late
    /// continuations may still fire, but they no longer record.
    pub fn start_segment(
        &self,
        parent: Option<SegmentId>,
        name: impl Into<Cow<'static, str>>,
    ) -> Option<Segment> {
        let id = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == TransactionState::Ended {
                return None;
            }
            let id = SegmentId(inner.next_segment_id);
            inner.next_segment_id += 1;
            let parent_id = parent.unwrap_or(ROOT_SEGMENT_ID);
            inner
                .segments
                .push(RawSegment::begin_with(id, parent_id, Instant::now(), name));
            id
        };
        Some(Segment {
            tx: self.clone(),
            id,
        })
    }

    pub(crate) fn end_segment(&self, id: SegmentId) -> Result<(), TraceError> {
        let mut inner = self.inner.borrow_mut();
        let raw = &mut inner.segments[(id.0 - 1) as usize];
        if !raw.is_open() {
            return Err(TraceError::SegmentEnded(raw.name.to_string()));
        }
        raw.end_with(Instant::now());
        Ok(())
    }

    pub(crate) fn with_raw_segment<R>(
        &self,
        id: SegmentId,
        f: impl FnOnce(&mut RawSegment) -> R,
    ) -> R {
        let mut inner = self.inner.borrow_mut();
        f(&mut inner.segments[(id.0 - 1) as usize])
    }

    pub(crate) fn add_pending(&self) {
        self.inner.borrow_mut().pending += 1;
    }

    pub(crate) fn remove_pending(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(inner.pending > 0);
            inner.pending = inner.pending.saturating_sub(1);
        }
        self.maybe_complete();
    }

    // Automatic completion: all pending continuations have quiesced.
    fn maybe_complete(&self) {
        let ready = {
            let inner = self.inner.borrow();
            inner.state == TransactionState::Active
                && !inner.externally_handled
                && inner.pending == 0
        };
        if ready {
            // Cannot fail: state was checked just above and nothing runs in
            // between on a single thread.
            let _ = self.end();
        }
    }
}

/// Keeps a transaction from reaching quiescence while an asynchronous
/// continuation is outstanding. Dropping the ticket re-checks completion.
pub(crate) struct Ticket {
    tx: Transaction,
}

impl Ticket {
    pub(crate) fn new(tx: &Transaction) -> Ticket {
        tx.add_pending();
        Ticket { tx: tx.clone() }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.tx.remove_pending();
    }
}
