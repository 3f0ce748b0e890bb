// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

use std::fmt;

use thiserror::Error;

/// Bookkeeping misuse detected by the tracing core.
///
/// These are programming errors in the code driving the tracer, never errors
/// of the traced host program. Host-visible errors travel as [`HostError`]
/// and pass through the core unchanged.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("transaction `{0}` has already ended")]
    TransactionEnded(String),
    #[error("segment `{0}` has already ended")]
    SegmentEnded(String),
}

/// An error raised by host code running under instrumentation.
///
/// Instrumentation forwards these unchanged in value and classification; it
/// never converts or swallows them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HostError {
    pub kind: HostErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    Type,
    Range,
    Generic,
}

impl fmt::Display for HostErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostErrorKind::Type => f.write_str("TypeError"),
            HostErrorKind::Range => f.write_str("RangeError"),
            HostErrorKind::Generic => f.write_str("Error"),
        }
    }
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: HostErrorKind::Generic,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self {
            kind: HostErrorKind::Type,
            message: message.into(),
        }
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self {
            kind: HostErrorKind::Range,
            message: message.into(),
        }
    }
}
