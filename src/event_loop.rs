// Copyright 2025 Txtrace Project Authors. Licensed under Apache-2.0.

//! A deterministic, single-threaded scheduler modeling the host runtime:
//! FIFO macrotasks, a microtask queue drained to exhaustion between them,
//! and virtual-time timers. Suspension points in tests are expressed with
//! [`EventLoop::set_timeout`] and the deferred-value microtask queue.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::HostError;

type Task = Box<dyn FnOnce()>;

#[derive(Clone, Default)]
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
}

#[derive(Default)]
struct LoopInner {
    macrotasks: VecDeque<Task>,
    microtasks: VecDeque<Task>,
    timers: BinaryHeap<Reverse<Timer>>,
    now: u64,
    timer_seq: u64,
    next_deferred_id: u64,
    pending_rejections: Vec<(u64, HostError)>,
    unhandled_hook: Option<Rc<dyn Fn(HostError)>>,
}

struct Timer {
    deadline: u64,
    seq: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time in ticks.
    pub fn now(&self) -> u64 {
        self.inner.borrow().now
    }

    /// Queue a macrotask.
    pub fn spawn(&self, task: impl FnOnce() + 'static) {
        self.inner.borrow_mut().macrotasks.push_back(Box::new(task));
    }

    /// Queue a microtask; microtasks run before the next macrotask.
    pub fn schedule_microtask(&self, task: impl FnOnce() + 'static) {
        self.inner.borrow_mut().microtasks.push_back(Box::new(task));
    }

    /// Fire `task` once the virtual clock reaches `now + delay`.
    pub fn set_timeout(&self, delay: u64, task: impl FnOnce() + 'static) {
        let mut inner = self.inner.borrow_mut();
        let deadline = inner.now + delay;
        let seq = inner.timer_seq;
        inner.timer_seq += 1;
        inner.timers.push(Reverse(Timer {
            deadline,
            seq,
            task: Box::new(task),
        }));
    }

    /// Called for every deferred value whose rejection no continuation
    /// handled by the end of a microtask drain.
    pub fn set_unhandled_rejection_hook(&self, hook: impl Fn(HostError) + 'static) {
        self.inner.borrow_mut().unhandled_hook = Some(Rc::new(hook));
    }

    /// Run to quiescence: every macrotask, microtask and timer.
    pub fn run(&self) {
        loop {
            self.drain_microtasks();
            self.report_unhandled_rejections();
            // The rejection hook may have queued more microtasks.
            if !self.inner.borrow().microtasks.is_empty() {
                continue;
            }
            match self.next_task() {
                Some(task) => task(),
                None => break,
            }
        }
    }

    fn drain_microtasks(&self) {
        loop {
            let task = self.inner.borrow_mut().microtasks.pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    fn next_task(&self) -> Option<Task> {
        let mut inner = self.inner.borrow_mut();
        if let Some(task) = inner.macrotasks.pop_front() {
            return Some(task);
        }
        if let Some(Reverse(timer)) = inner.timers.pop() {
            inner.now = inner.now.max(timer.deadline);
            return Some(timer.task);
        }
        None
    }

    fn report_unhandled_rejections(&self) {
        let (pending, hook) = {
            let mut inner = self.inner.borrow_mut();
            let pending = std::mem::take(&mut inner.pending_rejections);
            (pending, inner.unhandled_hook.clone())
        };
        for (_id, err) in pending {
            match &hook {
                Some(hook) => hook(err),
                None => log::warn!("unhandled deferred rejection: {err}"),
            }
        }
    }

    pub(crate) fn next_deferred_id(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        inner.next_deferred_id += 1;
        inner.next_deferred_id
    }

    pub(crate) fn track_rejection(&self, id: u64, err: HostError) {
        self.inner.borrow_mut().pending_rejections.push((id, err));
    }

    pub(crate) fn untrack_rejection(&self, id: u64) {
        self.inner
            .borrow_mut()
            .pending_rejections
            .retain(|(tracked, _)| *tracked != id);
    }
}
