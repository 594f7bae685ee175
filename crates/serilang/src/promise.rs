//! Promises: the native-side half of an awaitable.
//!
//! A promise settles at most once (Pending → Resolved or Pending →
//! Rejected); later calls are no-ops. Settling drains the waker list
//! exactly once. Wakers are plain data rather than callbacks, so the
//! settlement cascade, where a waker settles further promises, is processed
//! iteratively with a work list instead of re-entering the VM.
//!
//! While a promise is pending, values registered through [`Promise::add_root`]
//! are held live for the collector; once settled, the stored outcome itself
//! is traced.

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use ahash::AHashSet;

use crate::{
    error::RunError,
    fiber::FiberState,
    heap::{Heap, HeapId},
    object::{self, HeapData},
    scheduler::Scheduler,
    value::Value,
};

/// Shared handle to a promise.
pub type SharedPromise = Rc<RefCell<Promise>>;

/// Weak handle used by timers so an abandoned future does not keep its
/// promise alive.
pub type WeakPromise = Weak<RefCell<Promise>>;

/// A settled promise carries either a value or an error message.
pub type SettleOutcome = Result<Value, String>;

/// Promise lifecycle state. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Resolved,
    Rejected,
}

/// Continuation registered on a promise, run when it settles.
#[derive(Debug)]
pub enum Waker {
    /// Deliver the outcome to a suspended fiber and queue it as a
    /// microtask.
    ResumeFiber(HeapId),
    /// Forward the outcome to another promise (used by `timeout`/`race`).
    Forward(SharedPromise),
    /// Store a successful outcome into slot `index` of a results list,
    /// settling `target` when the last slot fills; any failure rejects
    /// `target` immediately.
    GatherSlot {
        target: SharedPromise,
        results: HeapId,
        index: usize,
        remaining: Rc<Cell<usize>>,
    },
}

/// The native-side half of an awaitable.
#[derive(Debug, Default)]
pub struct Promise {
    state: PromiseState,
    result: Option<SettleOutcome>,
    wakers: Vec<Waker>,
    roots: Vec<HeapId>,
}

impl Default for PromiseState {
    fn default() -> Self {
        Self::Pending
    }
}

impl Promise {
    /// Creates a fresh pending promise.
    #[must_use]
    pub fn new() -> SharedPromise {
        Rc::new(RefCell::new(Self::default()))
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PromiseState {
        self.state
    }

    /// True while unsettled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == PromiseState::Pending
    }

    /// The settled outcome, if any.
    #[must_use]
    pub fn result(&self) -> Option<&SettleOutcome> {
        self.result.as_ref()
    }

    /// Keeps a heap value alive while this promise is pending.
    pub fn add_root(&mut self, value: &Value) {
        if let Value::Obj(id) = value {
            self.roots.push(*id);
        }
    }

    /// Registers a continuation. Must only be called while pending; settled
    /// promises deliver immediately through [`settle`]/`Vm::await_value`.
    pub fn add_waker(&mut self, waker: Waker) {
        self.wakers.push(waker);
    }
}

/// Settles `promise` with `outcome`, running every waker exactly once and
/// cascading through forwarded promises. Settling an already-settled
/// promise is a no-op.
pub fn settle(promise: &SharedPromise, outcome: SettleOutcome, heap: &mut Heap, sched: &mut Scheduler) {
    run_worklist(vec![(Rc::clone(promise), outcome)], heap, sched);
}

/// Processes pending settlements until the cascade is exhausted.
pub(crate) fn run_worklist(
    mut worklist: Vec<(SharedPromise, SettleOutcome)>,
    heap: &mut Heap,
    sched: &mut Scheduler,
) {
    while let Some((p, outcome)) = worklist.pop() {
        let wakers = {
            let mut p = p.borrow_mut();
            if !p.is_pending() {
                continue;
            }
            p.state = if outcome.is_ok() { PromiseState::Resolved } else { PromiseState::Rejected };
            p.result = Some(outcome.clone());
            p.roots.clear();
            std::mem::take(&mut p.wakers)
        };
        for waker in wakers {
            deliver(waker, &outcome, heap, sched, &mut worklist);
        }
    }
}

/// Runs one waker against an outcome. Cascading settlements are pushed onto
/// `worklist` rather than recursed.
pub(crate) fn deliver(
    waker: Waker,
    outcome: &SettleOutcome,
    heap: &mut Heap,
    sched: &mut Scheduler,
    worklist: &mut Vec<(SharedPromise, SettleOutcome)>,
) {
    match waker {
        Waker::ResumeFiber(fiber) => {
            if let Ok(fib) = heap.fiber_mut(fiber) {
                if fib.state == FiberState::Dead {
                    return;
                }
                fib.pending_wake = Some(
                    outcome
                        .clone()
                        .map_err(RunError::runtime),
                );
                fib.state = FiberState::Suspended;
                sched.push_microtask(fiber);
            }
        }
        Waker::Forward(target) => {
            worklist.push((target, outcome.clone()));
        }
        Waker::GatherSlot { target, results, index, remaining } => match outcome {
            Err(message) => worklist.push((target, Err(message.clone()))),
            Ok(value) => {
                if let HeapData::List(list) = heap.get_mut(results) {
                    if let Some(slot) = list.items.get_mut(index) {
                        *slot = value.clone();
                    }
                }
                remaining.set(remaining.get().saturating_sub(1));
                if remaining.get() == 0 {
                    worklist.push((target, Ok(Value::Obj(results))));
                }
            }
        },
    }
}

/// Appends every heap reference reachable from a promise graph: pending
/// roots, the settled result, and waker targets. Promise-to-promise edges
/// are followed with a seen-set so forwarding cycles terminate.
pub fn trace_promise(start: &SharedPromise, out: &mut Vec<HeapId>) {
    let mut seen: AHashSet<*const RefCell<Promise>> = AHashSet::new();
    let mut stack = vec![Rc::clone(start)];
    while let Some(p) = stack.pop() {
        if !seen.insert(Rc::as_ptr(&p)) {
            continue;
        }
        let p = p.borrow();
        out.extend_from_slice(&p.roots);
        if let Some(Ok(value)) = &p.result {
            object::trace_value(value, out);
        }
        for waker in &p.wakers {
            match waker {
                Waker::ResumeFiber(fiber) => out.push(*fiber),
                Waker::Forward(target) => stack.push(Rc::clone(target)),
                Waker::GatherSlot { target, results, .. } => {
                    out.push(*results);
                    stack.push(Rc::clone(target));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualPoller;

    fn fixtures() -> (Heap, Scheduler) {
        (Heap::new(), Scheduler::new(Box::new(VirtualPoller::new())))
    }

    #[test]
    fn settle_is_monotonic() {
        let (mut heap, mut sched) = fixtures();
        let p = Promise::new();
        settle(&p, Ok(Value::Int(1)), &mut heap, &mut sched);
        settle(&p, Err("late".to_owned()), &mut heap, &mut sched);
        assert_eq!(p.borrow().state(), PromiseState::Resolved);
        assert!(matches!(p.borrow().result(), Some(Ok(Value::Int(1)))));
    }

    #[test]
    fn forward_waker_cascades() {
        let (mut heap, mut sched) = fixtures();
        let a = Promise::new();
        let b = Promise::new();
        a.borrow_mut().add_waker(Waker::Forward(Rc::clone(&b)));
        settle(&a, Err("boom".to_owned()), &mut heap, &mut sched);
        assert_eq!(b.borrow().state(), PromiseState::Rejected);
    }

    #[test]
    fn forwarding_cycle_terminates() {
        let (mut heap, mut sched) = fixtures();
        let a = Promise::new();
        let b = Promise::new();
        a.borrow_mut().add_waker(Waker::Forward(Rc::clone(&b)));
        b.borrow_mut().add_waker(Waker::Forward(Rc::clone(&a)));
        settle(&a, Ok(Value::Nil), &mut heap, &mut sched);
        assert_eq!(a.borrow().state(), PromiseState::Resolved);
        assert_eq!(b.borrow().state(), PromiseState::Resolved);
    }

    #[test]
    fn gather_slots_fill_then_settle() {
        let (mut heap, mut sched) = fixtures();
        let target = Promise::new();
        let results = heap.alloc(HeapData::List(crate::object::List {
            items: vec![Value::Nil, Value::Nil],
        }));
        let remaining = Rc::new(Cell::new(2usize));

        let slot0 = Waker::GatherSlot {
            target: Rc::clone(&target),
            results,
            index: 0,
            remaining: Rc::clone(&remaining),
        };
        let slot1 = Waker::GatherSlot {
            target: Rc::clone(&target),
            results,
            index: 1,
            remaining,
        };

        let mut worklist = Vec::new();
        deliver(slot0, &Ok(Value::Int(10)), &mut heap, &mut sched, &mut worklist);
        assert!(worklist.is_empty());
        assert!(target.borrow().is_pending());

        deliver(slot1, &Ok(Value::Int(20)), &mut heap, &mut sched, &mut worklist);
        let (p, outcome) = worklist.pop().unwrap();
        settle(&p, outcome, &mut heap, &mut sched);
        assert_eq!(target.borrow().state(), PromiseState::Resolved);
        match heap.get(results) {
            HeapData::List(l) => {
                assert!(matches!(l.items[0], Value::Int(10)));
                assert!(matches!(l.items[1], Value::Int(20)));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn trace_covers_roots_and_result() {
        let (mut heap, mut sched) = fixtures();
        let rooted = heap.alloc(HeapData::List(crate::object::List::default()));
        let p = Promise::new();
        p.borrow_mut().add_root(&Value::Obj(rooted));

        let mut out = Vec::new();
        trace_promise(&p, &mut out);
        assert!(out.contains(&rooted));

        let result = heap.alloc(HeapData::List(crate::object::List::default()));
        settle(&p, Ok(Value::Obj(result)), &mut heap, &mut sched);
        out.clear();
        trace_promise(&p, &mut out);
        assert!(out.contains(&result));
        // Pending roots are released on settlement.
        assert!(!out.contains(&rooted));
    }
}
