// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

use std::borrow::Cow;
use std::time::Duration;

use minstant::Instant;

use crate::attribute::AttributeMap;
use crate::attribute::Destinations;
use crate::error::TraceError;
use crate::transaction::Transaction;
use crate::value::Value;

/// Identifier of a segment within its owning transaction.
///
/// `SegmentId(0)` is reserved to mean "no parent"; the root segment is
/// always `SegmentId(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(pub u32);

impl Default for SegmentId {
    fn default() -> Self {
        SegmentId(0)
    }
}

pub(crate) const ROOT_SEGMENT_ID: SegmentId = SegmentId(1);

/// A segment as stored in the transaction's arena.
#[derive(Debug, Clone)]
pub(crate) struct RawSegment {
    pub id: SegmentId,
    pub parent_id: SegmentId,
    pub name: Cow<'static, str>,
    pub begin_instant: Instant,
    pub attributes: AttributeMap,

    // `Instant::ZERO` while the segment is open.
    pub end_instant: Instant,
}

impl RawSegment {
    #[inline]
    pub(crate) fn begin_with(
        id: SegmentId,
        parent_id: SegmentId,
        begin_instant: Instant,
        name: impl Into<Cow<'static, str>>,
    ) -> Self {
        RawSegment {
            id,
            parent_id,
            name: name.into(),
            begin_instant,
            attributes: AttributeMap::new(),
            end_instant: Instant::ZERO,
        }
    }

    #[inline]
    pub(crate) fn end_with(&mut self, end_instant: Instant) {
        self.end_instant = end_instant;
    }

    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.end_instant == Instant::ZERO
    }
}

/// A handle to one timed node in a transaction's call tree.
///
/// Handles are cheap to clone; the data lives in the arena owned by the
/// transaction, so no segment outlives its transaction's record of it.
#[derive(Clone)]
pub struct Segment {
    pub(crate) tx: Transaction,
    pub(crate) id: SegmentId,
}

impl Segment {
    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn name(&self) -> String {
        self.tx.with_raw_segment(self.id, |raw| raw.name.to_string())
    }

    pub fn is_open(&self) -> bool {
        self.tx.with_raw_segment(self.id, |raw| raw.is_open())
    }

    /// Close the segment, fixing its end timestamp.
    ///
    /// A second close is reported as [`TraceError::SegmentEnded`] and leaves
    /// the recorded timing untouched.
    pub fn end(&self) -> Result<(), TraceError> {
        self.tx.end_segment(self.id)
    }

    pub fn add_attribute(
        &self,
        key: impl Into<String>,
        value: Value,
        destinations: Destinations,
    ) {
        self.tx.with_raw_segment(self.id, |raw| {
            raw.attributes.insert(key.into(), value, destinations)
        });
    }

    /// Snapshot of the attributes targeting the given destinations.
    pub fn attributes(&self, destinations: Destinations) -> Vec<(String, Value)> {
        self.tx.with_raw_segment(self.id, |raw| {
            raw.attributes
                .get(destinations)
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect()
        })
    }

    /// Duration of the segment, or `None` while it is still open.
    pub fn duration(&self) -> Option<Duration> {
        self.tx.with_raw_segment(self.id, |raw| {
            if raw.is_open() {
                None
            } else {
                Some(raw.end_instant.duration_since(raw.begin_instant))
            }
        })
    }

    pub fn same_segment(a: &Segment, b: &Segment) -> bool {
        Transaction::ptr_eq(&a.tx, &b.tx) && a.id == b.id
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        Segment::same_segment(self, other)
    }
}

/// A finalized snapshot of one segment, for consumers of the finished
/// transaction.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub id: u32,
    pub parent_id: u32,
    pub name: String,
    pub begin_unix_ns: u64,
    pub duration_ns: u64,
    pub attributes: AttributeMap,
}
