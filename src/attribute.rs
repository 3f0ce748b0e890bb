// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

use bitflags::bitflags;

use crate::value::Value;

bitflags! {
    /// Destinations an attribute is reported to.
    ///
    /// Each destination is toggled independently by external configuration;
    /// the core only stores the partition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Destinations: u8 {
        const TRANS_EVENT = 1 << 0;
        const TRANS_TRACE = 1 << 1;
        const SPAN_EVENT  = 1 << 2;
        const ERROR_EVENT = 1 << 3;
    }
}

impl Destinations {
    /// The common default for user attributes.
    pub fn events_and_trace() -> Self {
        Destinations::TRANS_EVENT | Destinations::TRANS_TRACE
    }
}

/// Attributes keyed by name, each tagged with the destinations it belongs to.
///
/// Insertion order is preserved; inserting an existing key replaces its value
/// and destinations in place.
#[derive(Debug, Clone, Default)]
pub struct AttributeMap {
    entries: Vec<(String, Value, Destinations)>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value, destinations: Destinations) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _, _)| *k == key) {
            Some(entry) => {
                entry.1 = value;
                entry.2 = destinations;
            }
            None => self.entries.push((key, value, destinations)),
        }
    }

    /// All attributes targeting any of the given destinations.
    pub fn get(&self, destinations: Destinations) -> Vec<(&str, &Value)> {
        self.entries
            .iter()
            .filter(|(_, _, d)| d.intersects(destinations))
            .map(|(k, v, _)| (k.as_str(), v))
            .collect()
    }

    pub fn value_of(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _, _)| k == key)
            .map(|(_, v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
