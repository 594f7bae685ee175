//! The calling protocol and object-access dispatch.
//!
//! A callable sits on the stack below its arguments; its call consumes the
//! callable plus arguments and leaves exactly one value in place. Closures
//! push frames, native functions run the binding pipeline, classes
//! construct instances, and bound methods re-insert their receiver as the
//! first positional argument.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    binding::function::invoke_native,
    error::{RunError, RunResult},
    fiber::{self, CallFrame, Fiber, FiberState},
    heap::HeapId,
    object::{BoundMethod, Closure, Function, HeapData, Instance, NativeInstance, ValueMap},
    value::Value,
    vm::Vm,
};

/// What the heap says about a callee, copied out so dispatch can mutate the
/// VM freely.
enum CalleeKind {
    Closure,
    Class,
    NativeClass,
    Native { name: String, spec: Rc<crate::binding::spec::ArgSpec>, fun: crate::object::NativeFn },
    Bound { receiver: Value, callable: Value },
    NotCallable(&'static str),
}

impl Vm {
    /// Dispatches `Call{nargs, nkwargs}`: the callable is at
    /// `top - nargs - 2*nkwargs - 1`.
    pub(crate) fn call_value(
        &mut self,
        fib: &mut Fiber,
        fid: HeapId,
        nargs: usize,
        nkwargs: usize,
    ) -> RunResult<()> {
        let callee_index = fib
            .stack
            .len()
            .checked_sub(nargs + 2 * nkwargs + 1)
            .ok_or_else(|| RunError::internal("value stack underflow in call"))?;
        let callee = fib.stack[callee_index].clone();

        let Some(id) = callee.as_obj() else {
            return Err(RunError::type_error(format!(
                "'{}' is not callable",
                callee.obj_type(&self.heap)
            )));
        };

        let kind = match self.heap.get(id) {
            HeapData::Closure(_) => CalleeKind::Closure,
            HeapData::Class(_) => CalleeKind::Class,
            HeapData::NativeClass(_) => CalleeKind::NativeClass,
            HeapData::NativeFunction(nf) => CalleeKind::Native {
                name: nf.name.clone(),
                spec: Rc::clone(&nf.spec),
                fun: Rc::clone(&nf.fun),
            },
            HeapData::BoundMethod(bm) => CalleeKind::Bound {
                receiver: bm.receiver.clone(),
                callable: bm.callable.clone(),
            },
            other => CalleeKind::NotCallable(other.type_name()),
        };

        match kind {
            CalleeKind::Closure => self.call_closure(fib, id, callee_index, nargs, nkwargs),
            CalleeKind::Class => self.construct_instance(fib, id, callee_index, nkwargs),
            CalleeKind::NativeClass => {
                self.construct_native(fib, fid, id, callee_index, nargs, nkwargs)
            }
            CalleeKind::Native { name, spec, fun } => {
                invoke_native(self, fib, fid, callee_index, &name, &spec, &fun, nargs, nkwargs)
            }
            CalleeKind::Bound { receiver, callable } => {
                fib.stack[callee_index] = callable;
                fib.stack.insert(callee_index + 1, receiver);
                self.call_value(fib, fid, nargs + 1, nkwargs)
            }
            CalleeKind::NotCallable(kind) => {
                Err(RunError::type_error(format!("'{kind}' object is not callable")))
            }
        }
    }

    /// Pushes a frame for a closure call. The callee slot becomes the
    /// frame's base pointer; parameters land in local slots `1..=nparams`.
    fn call_closure(
        &mut self,
        fib: &mut Fiber,
        closure: HeapId,
        callee_index: usize,
        nargs: usize,
        nkwargs: usize,
    ) -> RunResult<()> {
        if nkwargs != 0 {
            return Err(RunError::arity(
                "closure call does not support keyword arguments",
            ));
        }
        let function = match self.heap.get(closure) {
            HeapData::Closure(c) => c.function,
            _ => return Err(RunError::internal("callee is not a closure")),
        };
        let (chunk, entry, nparams, ndefaults, nlocals) = match self.heap.get(function) {
            HeapData::Function(f) => (
                Rc::clone(&f.chunk),
                f.entry as usize,
                f.nparams as usize,
                f.ndefaults as usize,
                f.nlocals as usize,
            ),
            _ => return Err(RunError::internal("closure has no function")),
        };

        let required = nparams.saturating_sub(ndefaults);
        if nargs < required || nargs > nparams {
            return Err(RunError::arity(format!(
                "<closure>: arity mismatch (expected {nparams}, got {nargs})"
            )));
        }
        // Defaulted parameters start as nil; the function prologue fills
        // real defaults.
        for _ in nargs..nparams {
            fib.stack.push(Value::Nil);
        }

        let bp = callee_index;
        let frame_top = bp + nlocals;
        if fib.stack.len() < frame_top {
            fib.stack.resize(frame_top, Value::Nil);
        }
        fib.frames.push(CallFrame {
            closure,
            chunk,
            ip: entry,
            bp,
            handlers: SmallVec::new(),
        });
        Ok(())
    }

    /// Dispatches `TailCall{nargs}`: a closure callee reuses the current
    /// frame's stack window; any other callee falls back to a normal call.
    pub(crate) fn tail_call(&mut self, fib: &mut Fiber, fid: HeapId, nargs: usize) -> RunResult<()> {
        let callee_index = fib
            .stack
            .len()
            .checked_sub(nargs + 1)
            .ok_or_else(|| RunError::internal("value stack underflow in tail call"))?;
        let callee = fib.stack[callee_index].clone();
        let is_closure = callee
            .as_obj()
            .is_some_and(|id| matches!(self.heap.get(id), HeapData::Closure(_)));
        if !is_closure {
            return self.call_value(fib, fid, nargs, 0);
        }

        let bp = fib
            .frames
            .last()
            .map(|f| f.bp)
            .ok_or_else(|| RunError::internal("tail call without a frame"))?;
        fiber::close_upvalues_from(fib, bp, &mut self.heap);

        // Slide callee + args down over the current frame window.
        let moved: Vec<Value> = fib.stack.split_off(callee_index);
        fib.stack.truncate(bp);
        fib.stack.extend(moved);
        fib.frames.pop();

        let closure = fib.stack[bp]
            .as_obj()
            .ok_or_else(|| RunError::internal("tail callee vanished"))?;
        self.call_closure(fib, closure, bp, nargs, 0)
    }

    /// Calling a script class constructs an instance whose fields start as
    /// a copy of the class's method table. Arguments are discarded; an
    /// `__init__` field, when present, is invoked explicitly by script code.
    fn construct_instance(
        &mut self,
        fib: &mut Fiber,
        class: HeapId,
        callee_index: usize,
        _nkwargs: usize,
    ) -> RunResult<()> {
        let fields: ValueMap = match self.heap.get(class) {
            HeapData::Class(c) => c.methods.clone(),
            _ => return Err(RunError::internal("callee is not a class")),
        };
        let instance = self.heap.alloc(HeapData::Instance(Instance { class, fields }));
        fib.stack.truncate(callee_index);
        fib.stack.push(Value::Obj(instance));
        Ok(())
    }

    /// Calling a native class allocates a native instance and runs the
    /// registered `__init__`, which installs the foreign payload.
    fn construct_native(
        &mut self,
        fib: &mut Fiber,
        fid: HeapId,
        class: HeapId,
        callee_index: usize,
        nargs: usize,
        nkwargs: usize,
    ) -> RunResult<()> {
        let (init, class_name) = match self.heap.get(class) {
            HeapData::NativeClass(c) => (c.methods.get("__init__").cloned(), c.name.clone()),
            _ => return Err(RunError::internal("callee is not a native class")),
        };
        let instance = self.heap.alloc(HeapData::NativeInstance(NativeInstance {
            class,
            foreign: None,
            finalizer: None,
        }));
        match init {
            Some(init_fn) => {
                fib.stack[callee_index] = init_fn;
                fib.stack.insert(callee_index + 1, Value::Obj(instance));
                self.call_value(fib, fid, nargs + 1, nkwargs)?;
                // __init__ returns nil; the construction yields the instance.
                fib.stack[callee_index] = Value::Obj(instance);
                Ok(())
            }
            None => {
                if nargs != 0 || nkwargs != 0 {
                    return Err(RunError::arity(format!("{class_name}() takes no arguments")));
                }
                fib.stack.truncate(callee_index);
                fib.stack.push(Value::Obj(instance));
                Ok(())
            }
        }
    }

    /// Builds a closure for `MakeClosure`/`MakeFiber`, popping `nupvals`
    /// capture descriptors: `2*slot` captures the enclosing frame's local,
    /// `2*slot + 1` shares the enclosing closure's upvalue.
    pub(crate) fn make_closure_obj(
        &mut self,
        fib: &mut Fiber,
        fid: HeapId,
        entry: u32,
        nparams: u32,
        nlocals: u32,
        nupvals: u32,
    ) -> RunResult<HeapId> {
        let mut captures = Vec::with_capacity(nupvals as usize);
        for _ in 0..nupvals {
            match fib.pop()? {
                Value::Int(code) if code >= 0 => captures.push(code as u64),
                other => {
                    return Err(RunError::internal(format!(
                        "capture descriptor is not an index: {}",
                        other.fmt_desc(&self.heap)
                    )));
                }
            }
        }
        captures.reverse();

        let (chunk, bp, enclosing) = {
            let frame = fib
                .frames
                .last()
                .ok_or_else(|| RunError::internal("closure creation without a frame"))?;
            (Rc::clone(&frame.chunk), frame.bp, frame.closure)
        };

        let mut upvalues = Vec::with_capacity(captures.len());
        for code in captures {
            let slot = (code >> 1) as usize;
            if code & 1 == 0 {
                upvalues.push(fiber::capture_upvalue(fib, fid, bp + slot, &mut self.heap));
            } else {
                let shared = match self.heap.get(enclosing) {
                    HeapData::Closure(c) => c.upvalues.get(slot).copied(),
                    _ => None,
                };
                upvalues.push(shared.ok_or_else(|| {
                    RunError::internal(format!("enclosing upvalue slot {slot} out of range"))
                })?);
            }
        }

        let function = self.heap.alloc(HeapData::Function(Function {
            chunk,
            entry,
            nparams,
            ndefaults: 0,
            nlocals,
            has_vararg: false,
            has_kwarg: false,
        }));
        Ok(self.heap.alloc(HeapData::Closure(Closure { function, upvalues })))
    }

    /// `MakeFiber`: a fiber in state `New` whose root frame is set up like
    /// a closure call awaiting its arguments from the first `Resume`.
    pub(crate) fn make_fiber_obj(
        &mut self,
        fib: &mut Fiber,
        fid: HeapId,
        entry: u32,
        nparams: u32,
        nlocals: u32,
        nupvals: u32,
    ) -> RunResult<HeapId> {
        let closure = self.make_closure_obj(fib, fid, entry, nparams, nlocals, nupvals)?;
        let chunk = match self.heap.get(closure) {
            HeapData::Closure(c) => match self.heap.get(c.function) {
                HeapData::Function(f) => Rc::clone(&f.chunk),
                _ => return Err(RunError::internal("closure has no function")),
            },
            _ => return Err(RunError::internal("fiber body is not a closure")),
        };
        let mut new_fib = Fiber::new();
        new_fib.stack.push(Value::Obj(closure));
        new_fib.frames.push(CallFrame {
            closure,
            chunk,
            ip: entry as usize,
            bp: 0,
            handlers: SmallVec::new(),
        });
        Ok(self.heap.alloc(HeapData::Fiber(Some(Box::new(new_fib)))))
    }

    /// `Resume{nargs}`: push the arguments onto the target fiber's stack
    /// and transfer control. The current fiber goes to the back of the run
    /// queue; the target runs next.
    pub(crate) fn resume_fiber(&mut self, fib: &mut Fiber, fid: HeapId, nargs: usize) -> RunResult<()> {
        let target_index = fib
            .stack
            .len()
            .checked_sub(nargs + 1)
            .ok_or_else(|| RunError::internal("value stack underflow in resume"))?;
        let target_val = fib.stack[target_index].clone();
        let target = match target_val.as_obj() {
            Some(id) if matches!(self.heap.get(id), HeapData::Fiber(_)) => id,
            _ => {
                return Err(RunError::type_error(format!(
                    "cannot resume a '{}'",
                    target_val.obj_type(&self.heap)
                )));
            }
        };
        if target == fid {
            return Err(RunError::value_error("cannot resume the running fiber"));
        }

        let args: Vec<Value> = fib.stack.split_off(target_index + 1);
        fib.stack.truncate(target_index);

        let state = self.heap.fiber(target)?.state;
        match state {
            FiberState::Dead => return Err(RunError::value_error("cannot resume a dead fiber")),
            FiberState::Running => {
                return Err(RunError::value_error("cannot resume a running fiber"));
            }
            FiberState::New => {
                let (root_closure, nargs_given) = {
                    let tf = self.heap.fiber(target)?;
                    let closure = tf
                        .frames
                        .first()
                        .map(|f| f.closure)
                        .ok_or_else(|| RunError::internal("fiber has no root frame"))?;
                    (closure, args.len())
                };
                let function = match self.heap.get(root_closure) {
                    HeapData::Closure(c) => c.function,
                    _ => return Err(RunError::internal("fiber root is not a closure")),
                };
                let (nparams, nlocals) = match self.heap.get(function) {
                    HeapData::Function(f) => (f.nparams as usize, f.nlocals as usize),
                    _ => return Err(RunError::internal("closure has no function")),
                };
                if nargs_given != nparams {
                    return Err(RunError::arity(format!(
                        "fiber expects {nparams} arguments, got {nargs_given}"
                    )));
                }
                let tf = self.heap.fiber_mut(target)?;
                tf.stack.extend(args);
                if tf.stack.len() < nlocals {
                    tf.stack.resize(nlocals, Value::Nil);
                }
                tf.state = FiberState::Suspended;
            }
            FiberState::Suspended => {
                let tf = self.heap.fiber_mut(target)?;
                tf.stack.extend(args);
            }
        }

        self.scheduler.push_microtask(target);
        self.scheduler.push_task(fid);
        fib.state = FiberState::Suspended;
        Ok(())
    }

    /// Member access (`GetField`), including bound-method creation for
    /// callable members of instances and native instances.
    pub(crate) fn member_get(&mut self, receiver: &Value, name: &str) -> RunResult<Value> {
        let no_member = |kind: &dyn std::fmt::Display| {
            RunError::type_error(format!("'{kind}' has no member '{name}'"))
        };
        let Some(id) = receiver.as_obj() else {
            return Err(no_member(&receiver.obj_type(&self.heap)));
        };

        let found: Option<Value> = match self.heap.get(id) {
            HeapData::Instance(i) => {
                // Field lookup shadows class methods.
                match i.fields.get(name) {
                    Some(v) => Some(v.clone()),
                    None => match self.heap.get(i.class) {
                        HeapData::Class(c) => c.methods.get(name).cloned(),
                        _ => None,
                    },
                }
            }
            HeapData::Class(c) => return c.methods.get(name).cloned().ok_or_else(|| no_member(&"class")),
            HeapData::Dict(d) => {
                return d
                    .map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RunError::value_error(format!("key not found: '{name}'")));
            }
            HeapData::Module(m) => {
                return m.dict.get(name).cloned().ok_or_else(|| {
                    RunError::runtime(format!("module '{}' has no member '{name}'", m.name))
                });
            }
            HeapData::NativeInstance(ni) => match self.heap.get(ni.class) {
                HeapData::NativeClass(c) => c.methods.get(name).cloned(),
                _ => None,
            },
            HeapData::NativeClass(c) => return c.methods.get(name).cloned().ok_or_else(|| no_member(&"native class")),
            other => return Err(no_member(&other.obj_type())),
        };

        let member = found.ok_or_else(|| no_member(&self.heap.get(id).obj_type()))?;

        // Callable members bind their receiver.
        let is_callable = member.as_obj().is_some_and(|mid| {
            matches!(
                self.heap.get(mid),
                HeapData::Closure(_) | HeapData::NativeFunction(_)
            )
        });
        if is_callable {
            let bound = self.heap.alloc(HeapData::BoundMethod(BoundMethod {
                receiver: receiver.clone(),
                callable: member,
            }));
            Ok(Value::Obj(bound))
        } else {
            Ok(member)
        }
    }

    /// Member assignment (`SetField`).
    pub(crate) fn member_set(&mut self, receiver: &Value, name: &str, value: Value) -> RunResult<()> {
        let Some(id) = receiver.as_obj() else {
            return Err(RunError::type_error(format!(
                "cannot set member '{name}' on '{}'",
                receiver.obj_type(&self.heap)
            )));
        };
        match self.heap.get_mut(id) {
            HeapData::Instance(i) => {
                i.fields.insert(name.to_owned(), value);
                Ok(())
            }
            HeapData::Dict(d) => {
                d.map.insert(name.to_owned(), value);
                Ok(())
            }
            HeapData::Module(m) => {
                m.dict.insert(name.to_owned(), value);
                Ok(())
            }
            other => Err(RunError::type_error(format!(
                "cannot set member '{name}' on '{}'",
                other.obj_type()
            ))),
        }
    }

    /// Subscript read (`GetItem`): integer-indexed lists (negative indices
    /// count from the end) and string-keyed dicts.
    pub(crate) fn item_get(&mut self, container: &Value, index: &Value) -> RunResult<Value> {
        let Some(id) = container.as_obj() else {
            return Err(RunError::type_error(format!(
                "'{}' is not subscriptable",
                container.obj_type(&self.heap)
            )));
        };
        match self.heap.get(id) {
            HeapData::List(l) => {
                let i = list_index(l.items.len(), index, &self.heap)?;
                Ok(l.items[i].clone())
            }
            HeapData::Dict(d) => {
                let key = index.as_str().ok_or_else(|| {
                    RunError::type_error(format!(
                        "dict key must be a string, got {}",
                        index.fmt_desc(&self.heap)
                    ))
                })?;
                d.map
                    .get(key)
                    .cloned()
                    .ok_or_else(|| RunError::value_error(format!("key not found: '{key}'")))
            }
            other => Err(RunError::type_error(format!(
                "'{}' is not subscriptable",
                other.obj_type()
            ))),
        }
    }

    /// Subscript write (`SetItem`).
    pub(crate) fn item_set(&mut self, container: &Value, index: &Value, value: Value) -> RunResult<()> {
        enum Target {
            List(usize),
            Dict(String),
        }
        let Some(id) = container.as_obj() else {
            return Err(RunError::type_error(format!(
                "'{}' is not subscriptable",
                container.obj_type(&self.heap)
            )));
        };
        // Key validation happens against an immutable borrow first.
        let target = match self.heap.get(id) {
            HeapData::List(l) => Target::List(list_index(l.items.len(), index, &self.heap)?),
            HeapData::Dict(_) => {
                let key = index.as_str().ok_or_else(|| {
                    RunError::type_error(format!(
                        "dict key must be a string, got {}",
                        index.fmt_desc(&self.heap)
                    ))
                })?;
                Target::Dict(key.to_owned())
            }
            other => {
                return Err(RunError::type_error(format!(
                    "'{}' is not subscriptable",
                    other.obj_type()
                )));
            }
        };
        match (target, self.heap.get_mut(id)) {
            (Target::List(i), HeapData::List(l)) => l.items[i] = value,
            (Target::Dict(key), HeapData::Dict(d)) => {
                d.map.insert(key, value);
            }
            _ => return Err(RunError::internal("container changed kind during assignment")),
        }
        Ok(())
    }

    /// Reads an upvalue slot of the current closure.
    pub(crate) fn load_upvalue(&self, fib: &Fiber, fid: HeapId, slot: usize) -> RunResult<Value> {
        let upvalue = self.upvalue_at(fib, slot)?;
        fiber::read_upvalue(upvalue, fib, fid, &self.heap)
    }

    /// Writes an upvalue slot of the current closure.
    pub(crate) fn store_upvalue(
        &mut self,
        fib: &mut Fiber,
        fid: HeapId,
        slot: usize,
        value: Value,
    ) -> RunResult<()> {
        let upvalue = self.upvalue_at(fib, slot)?;
        fiber::write_upvalue(upvalue, value, fib, fid, &mut self.heap)
    }

    fn upvalue_at(&self, fib: &Fiber, slot: usize) -> RunResult<HeapId> {
        let closure = fib
            .frames
            .last()
            .map(|f| f.closure)
            .ok_or_else(|| RunError::internal("upvalue access without a frame"))?;
        match self.heap.get(closure) {
            HeapData::Closure(c) => c
                .upvalues
                .get(slot)
                .copied()
                .ok_or_else(|| RunError::value_error(format!("upvalue slot {slot} out of range"))),
            _ => Err(RunError::internal("frame closure is not a closure")),
        }
    }
}

/// Resolves a list index, counting negatives from the end.
fn list_index(len: usize, index: &Value, heap: &crate::heap::Heap) -> RunResult<usize> {
    let Value::Int(n) = index else {
        return Err(RunError::type_error(format!(
            "list index must be an int, got {}",
            index.fmt_desc(heap)
        )));
    };
    let n = *n;
    let resolved = if n < 0 { n + len as i64 } else { n };
    if resolved < 0 || resolved as usize >= len {
        return Err(RunError::value_error(format!("list index out of range: {n}")));
    }
    Ok(resolved as usize)
}
