// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

//! Adapters bridging the context slot into [`std::future::Future`].
//!
//! A future's poll runs on whatever call stack the executor happens to use,
//! so the active context must be re-established around every poll and
//! restored afterwards. The adapters do exactly that, and release their
//! quiescence hold when the future completes.

use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use pin_project::pin_project;

use crate::binder::ContextBinding;
use crate::segment::Segment;
use crate::tracer::ActiveContext;
use crate::tracer::Tracer;

impl<T: Future> FutureExt for T {}

/// An extension trait for tracing futures.
pub trait FutureExt: Sized {
    /// Bind this future to the context active right now. Every poll runs
    /// under that context; the transaction is held open until completion.
    fn bound(self, tracer: &Tracer) -> Bound<Self> {
        Bound {
            inner: self,
            binding: ContextBinding::capture(tracer),
        }
    }

    /// Run this future inside `segment`: every poll has the segment active,
    /// and the segment ends when the future completes.
    fn in_segment(self, segment: Segment, tracer: &Tracer) -> InSegment<Self> {
        let binding = ContextBinding::new(tracer, ActiveContext::of_segment(segment.clone()));
        InSegment {
            inner: self,
            binding,
            segment: Some(segment),
        }
    }
}

/// Adapter for [`FutureExt::bound()`].
#[pin_project]
pub struct Bound<T> {
    #[pin]
    inner: T,
    binding: ContextBinding,
}

impl<T: Future> Future for Bound<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = this.binding.run_retaining(|| this.inner.poll(cx));
        if res.is_ready() {
            this.binding.release();
        }
        res
    }
}

/// Adapter for [`FutureExt::in_segment()`].
#[pin_project]
pub struct InSegment<T> {
    #[pin]
    inner: T,
    binding: ContextBinding,
    segment: Option<Segment>,
}

impl<T: Future> Future for InSegment<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = this.binding.run_retaining(|| this.inner.poll(cx));
        if res.is_ready() {
            if let Some(segment) = this.segment.take() {
                // Ignore a force-close by the transaction.
                let _ = segment.end();
            }
            this.binding.release();
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    // Yields once before resolving, to force a second poll.
    struct YieldOnce {
        yielded: bool,
    }

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    fn yield_once() -> YieldOnce {
        YieldOnce { yielded: false }
    }

    #[test]
    fn bound_future_polls_under_the_captured_context() {
        let tracer = Tracer::new();
        let (tx, fut) = tracer.with_transaction("job", |tx| {
            let fut = {
                let tracer = tracer.clone();
                let tx = tx.clone();
                async move {
                    let active = tracer.current_transaction().unwrap();
                    assert!(Transaction::ptr_eq(&active, &tx));
                    yield_once().await;
                    // Still ours after resuming on a fresh stack.
                    let active = tracer.current_transaction().unwrap();
                    assert!(Transaction::ptr_eq(&active, &tx));
                }
            };
            (tx.clone(), fut.bound(&tracer))
        });

        // Held open by the future's binding.
        assert!(tx.is_active());
        assert!(tracer.current().is_empty());

        futures::executor::block_on(fut);
        assert!(!tx.is_active());
    }

    #[test]
    fn in_segment_ends_the_segment_on_completion() {
        let tracer = Tracer::new();
        let (tx, segment, fut) = tracer.with_transaction("job", |tx| {
            let segment = tx.start_segment(None, "io/wait").unwrap();
            let fut = {
                let tracer = tracer.clone();
                async move {
                    assert_eq!(tracer.current_segment().unwrap().name(), "io/wait");
                    yield_once().await;
                    assert_eq!(tracer.current_segment().unwrap().name(), "io/wait");
                }
            };
            (tx.clone(), segment.clone(), fut.in_segment(segment, &tracer))
        });
        assert!(segment.is_open());

        futures::executor::block_on(fut);
        assert!(!segment.is_open());
        assert!(!tx.is_active());
    }

    #[test]
    fn dropping_an_unpolled_future_releases_the_transaction() {
        let tracer = Tracer::new();
        let (tx, fut) = tracer.with_transaction("job", |tx| {
            (tx.clone(), async {}.bound(&tracer))
        });
        assert!(tx.is_active());
        drop(fut);
        assert!(!tx.is_active());
    }
}
