//! Execution tracing hooks.
//!
//! The VM reports coarse-grained events (fiber scheduling, collections,
//! uncaught errors) through a [`VmTracer`]. The default [`NoopTracer`]
//! does nothing; [`StderrTracer`] prints a human-readable log, useful when
//! debugging an embedding.

use crate::{error::RunError, fiber::FiberState, heap::HeapId};

/// Hook points for observing VM execution.
pub trait VmTracer {
    /// A fiber was dequeued and is about to run.
    fn on_fiber_start(&mut self, _fiber: HeapId) {}

    /// A fiber stopped running, with its new state.
    fn on_fiber_exit(&mut self, _fiber: HeapId, _state: FiberState) {}

    /// A collection cycle finished.
    fn on_gc(&mut self, _freed_objects: usize, _freed_bytes: usize, _live_objects: usize) {}

    /// A fiber died with an error no handler caught.
    fn on_uncaught(&mut self, _fiber: HeapId, _error: &RunError) {}
}

/// Tracer that ignores every event.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Tracer that logs every event to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_fiber_start(&mut self, fiber: HeapId) {
        eprintln!("[vm] run fiber {fiber}");
    }

    fn on_fiber_exit(&mut self, fiber: HeapId, state: FiberState) {
        eprintln!("[vm] fiber {fiber} -> {state:?}");
    }

    fn on_gc(&mut self, freed_objects: usize, freed_bytes: usize, live_objects: usize) {
        eprintln!("[vm] gc freed {freed_objects} objects / {freed_bytes} bytes, {live_objects} live");
    }

    fn on_uncaught(&mut self, fiber: HeapId, error: &RunError) {
        eprintln!("[vm] uncaught in fiber {fiber}: {error}");
    }
}
