//! Fibers: cooperative coroutines with their own stack and call frames.
//!
//! A fiber owns a value stack shared by all of its frames, a frame stack, an
//! FSM state, and the list of still-open upvalues pointing into its stack.
//! There is no native stack switching: suspension only happens at bytecode
//! boundaries, so the frame stack is a plain vector.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    chunk::Chunk,
    error::{RunError, RunResult},
    heap::{Heap, HeapId},
    object::{self, HeapData, Upvalue},
    value::Value,
};

/// Fiber lifecycle:
///
/// ```text
/// New ──resume──▶ Running ──yield/await──▶ Suspended ──wake──▶ Running ──return/error──▶ Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    New,
    Running,
    Suspended,
    Dead,
}

/// An installed `TryBegin` handler.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionHandler {
    /// Absolute instruction pointer of the handler.
    pub handler_ip: usize,
    /// Stack depth to restore before entering the handler.
    pub stack_top: usize,
}

/// One activation record.
#[derive(Debug)]
pub struct CallFrame {
    /// The executing closure.
    pub closure: HeapId,
    /// The closure's code, cached here so the dispatch loop never touches
    /// the heap to fetch instructions.
    pub chunk: Rc<Chunk>,
    /// Byte offset of the next instruction.
    pub ip: usize,
    /// Base pointer: index of the callee slot. Local slot `i` is
    /// `stack[bp + i]`.
    pub bp: usize,
    /// Innermost-last handler stack.
    pub handlers: SmallVec<[ExceptionHandler; 2]>,
}

/// An upvalue that still reads through this fiber's stack.
#[derive(Debug, Clone, Copy)]
pub struct OpenUpvalue {
    /// Absolute stack slot the upvalue points at.
    pub slot: usize,
    /// The heap upvalue object.
    pub upvalue: HeapId,
}

/// A cooperative coroutine.
#[derive(Debug)]
pub struct Fiber {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub state: FiberState,
    /// Yielded value while suspended; final result (or error payload) once
    /// dead.
    pub last: Value,
    pub open_upvalues: Vec<OpenUpvalue>,
    /// Outcome to deliver when the scheduler next runs this fiber: a value
    /// to push, or an error to throw at the resumption point.
    pub pending_wake: Option<RunResult<Value>>,
    /// Terminal error when the fiber died unwinding.
    pub error: Option<RunError>,
}

impl Default for Fiber {
    fn default() -> Self {
        Self::new()
    }
}

impl Fiber {
    /// Creates a fresh fiber in state `New`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
            state: FiberState::New,
            last: Value::Nil,
            open_upvalues: Vec::new(),
            pending_wake: None,
            error: None,
        }
    }

    /// Pops the top of the value stack.
    pub fn pop(&mut self) -> RunResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| RunError::internal("value stack underflow"))
    }

    /// Borrows the value `ofs` slots below the top.
    pub fn peek(&self, ofs: usize) -> RunResult<&Value> {
        let len = self.stack.len();
        len.checked_sub(ofs + 1)
            .and_then(|i| self.stack.get(i))
            .ok_or_else(|| RunError::internal("value stack underflow"))
    }

    /// Estimated bytes for heap accounting.
    #[must_use]
    pub fn shallow_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.stack.capacity() * std::mem::size_of::<Value>()
            + self.frames.capacity() * std::mem::size_of::<CallFrame>()
    }

    /// Appends every heap reference reachable from this fiber.
    pub fn trace(&self, out: &mut Vec<HeapId>) {
        object::trace_values(&self.stack, out);
        object::trace_value(&self.last, out);
        for frame in &self.frames {
            out.push(frame.closure);
        }
        for open in &self.open_upvalues {
            out.push(open.upvalue);
        }
        if let Some(Ok(v)) = &self.pending_wake {
            object::trace_value(v, out);
        }
    }
}

/// Captures the stack slot `slot` of `fiber_id` as an upvalue, reusing an
/// already-open upvalue for the same slot.
pub fn capture_upvalue(fib: &mut Fiber, fiber_id: HeapId, slot: usize, heap: &mut Heap) -> HeapId {
    for open in &fib.open_upvalues {
        if open.slot == slot {
            return open.upvalue;
        }
    }
    let upvalue = heap.alloc(HeapData::Upvalue(Upvalue::Open { fiber: fiber_id, slot }));
    fib.open_upvalues.push(OpenUpvalue { slot, upvalue });
    upvalue
}

/// Closes every open upvalue whose stack slot is at or above `from_slot`,
/// copying the current stack value into the upvalue. Runs on frame exit and
/// for the `CloseUpvalues` instruction.
pub fn close_upvalues_from(fib: &mut Fiber, from_slot: usize, heap: &mut Heap) {
    let mut i = 0;
    while i < fib.open_upvalues.len() {
        let open = fib.open_upvalues[i];
        if open.slot >= from_slot {
            let value = fib.stack.get(open.slot).cloned().unwrap_or(Value::Nil);
            *heap.get_mut(open.upvalue) = HeapData::Upvalue(Upvalue::Closed(value));
            fib.open_upvalues.swap_remove(i);
        } else {
            i += 1;
        }
    }
}

/// Reads an upvalue: through the owning fiber's stack while open, from the
/// owned copy once closed. `current` is the fiber the VM has checked out, so
/// reads against it cannot go through the heap.
pub fn read_upvalue(
    upvalue: HeapId,
    current: &Fiber,
    current_id: HeapId,
    heap: &Heap,
) -> RunResult<Value> {
    match heap.get(upvalue) {
        HeapData::Upvalue(Upvalue::Closed(v)) => Ok(v.clone()),
        HeapData::Upvalue(Upvalue::Open { fiber, slot }) => {
            let stack = if *fiber == current_id {
                &current.stack
            } else {
                &heap.fiber(*fiber)?.stack
            };
            stack
                .get(*slot)
                .cloned()
                .ok_or_else(|| RunError::internal("open upvalue points past stack top"))
        }
        other => Err(RunError::internal(format!(
            "expected upvalue, got {}",
            other.type_name()
        ))),
    }
}

/// Writes an upvalue, mirroring [`read_upvalue`].
pub fn write_upvalue(
    upvalue: HeapId,
    value: Value,
    current: &mut Fiber,
    current_id: HeapId,
    heap: &mut Heap,
) -> RunResult<()> {
    // Determine the destination without holding a heap borrow across the
    // fiber lookup.
    let open = match heap.get_mut(upvalue) {
        HeapData::Upvalue(uv) => match uv {
            Upvalue::Closed(slot) => {
                *slot = value;
                return Ok(());
            }
            Upvalue::Open { fiber, slot } => (*fiber, *slot),
        },
        other => {
            return Err(RunError::internal(format!(
                "expected upvalue, got {}",
                other.type_name()
            )));
        }
    };
    let (fiber, slot) = open;
    let stack = if fiber == current_id {
        &mut current.stack
    } else {
        &mut heap.fiber_mut(fiber)?.stack
    };
    let dest = stack
        .get_mut(slot)
        .ok_or_else(|| RunError::internal("open upvalue points past stack top"))?;
    *dest = value;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fiber_on_heap(heap: &mut Heap) -> HeapId {
        heap.alloc(HeapData::Fiber(Some(Box::new(Fiber::new()))))
    }

    #[test]
    fn capture_reuses_open_upvalue_for_same_slot() {
        let mut heap = Heap::new();
        let fid = fiber_on_heap(&mut heap);
        let mut fib = Fiber::new();
        fib.stack.push(Value::Int(1));
        let a = capture_upvalue(&mut fib, fid, 0, &mut heap);
        let b = capture_upvalue(&mut fib, fid, 0, &mut heap);
        assert_eq!(a, b);
        assert_eq!(fib.open_upvalues.len(), 1);
    }

    #[test]
    fn close_snapshots_last_written_value() {
        let mut heap = Heap::new();
        let fid = fiber_on_heap(&mut heap);
        let mut fib = Fiber::new();
        fib.stack.push(Value::Int(1));
        let uv = capture_upvalue(&mut fib, fid, 0, &mut heap);

        fib.stack[0] = Value::Int(42);
        close_upvalues_from(&mut fib, 0, &mut heap);
        assert!(fib.open_upvalues.is_empty());

        let read = read_upvalue(uv, &fib, fid, &heap).unwrap();
        assert!(matches!(read, Value::Int(42)));

        // Writes after closing hit the owned copy.
        write_upvalue(uv, Value::Int(7), &mut fib, fid, &mut heap).unwrap();
        let read = read_upvalue(uv, &fib, fid, &heap).unwrap();
        assert!(matches!(read, Value::Int(7)));
    }

    #[test]
    fn close_respects_threshold() {
        let mut heap = Heap::new();
        let fid = fiber_on_heap(&mut heap);
        let mut fib = Fiber::new();
        fib.stack.extend([Value::Int(0), Value::Int(1), Value::Int(2)]);
        let low = capture_upvalue(&mut fib, fid, 0, &mut heap);
        let high = capture_upvalue(&mut fib, fid, 2, &mut heap);

        close_upvalues_from(&mut fib, 1, &mut heap);
        assert!(matches!(heap.get(high), HeapData::Upvalue(Upvalue::Closed(_))));
        assert!(matches!(heap.get(low), HeapData::Upvalue(Upvalue::Open { .. })));
        assert_eq!(fib.open_upvalues.len(), 1);
    }
}
