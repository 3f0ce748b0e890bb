// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

//! txtrace is a single-threaded transaction tracing core. It follows one
//! logical unit of work (a [`Transaction`](crate::transaction::Transaction))
//! across callbacks, deferred values, and futures, recording a tree of timed
//! [`Segment`](crate::segment::Segment)s as the work hops between scheduling
//! mechanisms.
//!
//! The pieces:
//!
//! - [`tracer`]: the context manager. One mutable slot holds the
//!   `(transaction, segment)` pair active right now; everything else reads
//!   and scopes that slot.
//! - [`binder`]: captures the slot into continuations, so a callback invoked
//!   later, from anywhere, runs under the context it was created in.
//! - [`shim`]: declarative function wrapping. Describe where a function's
//!   callback sits and how it completes; calling the wrapper records a
//!   segment and propagates context automatically.
//! - [`deferred`]: a promise-like value whose continuations run on a
//!   microtask queue, with context captured per attachment.
//! - [`future`]: adapters carrying context across `std::future` polls.
//! - [`event_loop`]: a deterministic virtual-time scheduler, used to model
//!   the host runtime in tests.
//!
//! Transactions end on their own: when the synchronous phase is over and
//! every bound continuation has run, the transaction has quiesced and is
//! finalized. No explicit `end()` call is needed in the common path.
//!
//! # Examples
//!
//! ```
//! use txtrace::prelude::*;
//!
//! let tracer = Tracer::new();
//! tracer.on_transaction_finished(|tx| {
//!     assert_eq!(tx.full_name(), "web/checkout");
//!     assert!(tx.duration().is_some());
//! });
//!
//! tracer.with_transaction("web/checkout", |tx| {
//!     tx.add_attribute("user.id", Value::Int(42), Destinations::TRANS_EVENT);
//! });
//! ```
//!
//! Context survives a trip through the host's scheduler:
//!
//! ```
//! use txtrace::prelude::*;
//!
//! let tracer = Tracer::new();
//! let event_loop = EventLoop::new();
//!
//! tracer.with_transaction("job", |_tx| {
//!     let callback = {
//!         let tracer = tracer.clone();
//!         Callback::new(move |_args| {
//!             // Runs under "job" even though it is invoked from a timer.
//!             assert!(tracer.current_transaction().is_some());
//!         })
//!     };
//!     let bound = tracer.bind(&callback);
//!     event_loop.set_timeout(10, move || bound.invoke(vec![]));
//! });
//!
//! event_loop.run();
//! ```

pub mod attribute;
pub mod binder;
pub mod deferred;
pub mod error;
pub mod event_loop;
pub mod future;
pub mod segment;
pub mod shim;
pub mod tracer;
pub mod transaction;
pub mod value;

pub(crate) mod util;

pub mod prelude {
    //! A "batteries included" import for the common API surface.
    #[doc(no_inline)]
    pub use crate::attribute::Destinations;
    #[doc(no_inline)]
    pub use crate::binder::Callback;
    #[doc(no_inline)]
    pub use crate::binder::ContextBinding;
    #[doc(no_inline)]
    pub use crate::deferred::Deferred;
    #[doc(no_inline)]
    pub use crate::deferred::Outcome;
    #[doc(no_inline)]
    pub use crate::deferred::Resolver;
    #[doc(no_inline)]
    pub use crate::error::HostError;
    #[doc(no_inline)]
    pub use crate::error::TraceError;
    #[doc(no_inline)]
    pub use crate::event_loop::EventLoop;
    #[doc(no_inline)]
    pub use crate::future::FutureExt;
    #[doc(no_inline)]
    pub use crate::segment::Segment;
    #[doc(no_inline)]
    pub use crate::shim::Arg;
    #[doc(no_inline)]
    pub use crate::shim::ArgSpec;
    #[doc(no_inline)]
    pub use crate::shim::CallbackSource;
    #[doc(no_inline)]
    pub use crate::shim::NameSource;
    #[doc(no_inline)]
    pub use crate::shim::Position;
    #[doc(no_inline)]
    pub use crate::shim::Ret;
    #[doc(no_inline)]
    pub use crate::shim::SegmentOutcome;
    #[doc(no_inline)]
    pub use crate::shim::Shim;
    #[doc(no_inline)]
    pub use crate::tracer::ActiveContext;
    #[doc(no_inline)]
    pub use crate::tracer::Tracer;
    #[doc(no_inline)]
    pub use crate::tracer::TracerConfig;
    #[doc(no_inline)]
    pub use crate::transaction::Transaction;
    #[doc(no_inline)]
    pub use crate::value::Value;
}
