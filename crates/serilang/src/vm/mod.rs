//! The virtual machine: fetch–decode–execute loop, scheduler drive and
//! garbage-collection roots.
//!
//! A VM owns the heap, the globals and builtins namespaces, the scheduler
//! and the module cache. [`Vm::evaluate`] wraps a chunk in a root fiber and
//! drives the scheduler until every fiber has finished; only one fiber runs
//! at a time, and the collector only runs between fiber time slices, never
//! while a fiber is checked out for execution.

mod call;

use std::rc::Rc;
use std::time::Duration;

use ahash::AHashMap;

use crate::{
    binding::{
        function::IntoNativeFn,
        module::{make_native, ClassBuilder, ModuleBuilder},
        spec::Param,
    },
    chunk::{Chunk, Instruction},
    error::{RunError, RunResult},
    fiber::{self, CallFrame, ExceptionHandler, Fiber, FiberState},
    heap::{Heap, HeapId, DEFAULT_GC_THRESHOLD},
    io::{Console, StdConsole},
    modules,
    object::{self, Class, Closure, Dict, Function, Future, HeapData, List, Module, ValueMap},
    promise::{self, Promise, SharedPromise, Waker},
    scheduler::{Poller, Scheduler, SleepPoller, TimerTask},
    tracer::{NoopTracer, VmTracer},
    value::{self, Value},
};

/// Compiler hook used by the `import` builtin. The compiler front-end is an
/// external collaborator; the VM only consumes the chunk it produces.
pub trait ModuleCompiler {
    /// Compiles module source to a chunk. Errors are surfaced to script
    /// code as runtime errors.
    fn compile(&self, name: &str, source: &str) -> Result<Chunk, String>;
}

/// Construction options for a [`Vm`].
pub struct VmOptions {
    /// Script stdout/stdin/stderr.
    pub console: Box<dyn Console>,
    /// Clock and sleep provider for the scheduler.
    pub poller: Box<dyn Poller>,
    /// Execution tracing hooks.
    pub tracer: Box<dyn VmTracer>,
    /// Initial garbage-collection threshold in bytes.
    pub gc_threshold: usize,
    /// Compiler hook for `import`.
    pub compiler: Option<Box<dyn ModuleCompiler>>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            console: Box::new(StdConsole),
            poller: Box::new(SleepPoller),
            tracer: Box::new(NoopTracer),
            gc_threshold: DEFAULT_GC_THRESHOLD,
            compiler: None,
        }
    }
}

/// An embeddable serilang virtual machine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) globals: AHashMap<String, Value>,
    pub(crate) builtins: AHashMap<String, Value>,
    pub(crate) scheduler: Scheduler,
    pub(crate) module_cache: AHashMap<String, HeapId>,
    pub(crate) console: Box<dyn Console>,
    pub(crate) tracer: Box<dyn VmTracer>,
    pub(crate) compiler: Option<Box<dyn ModuleCompiler>>,
    /// Most recent dead fiber's result.
    last: Value,
    /// Pending promises the VM keeps alive so their wakers (and the fibers
    /// behind them) survive collection; pruned once settled.
    promises: Vec<SharedPromise>,
    /// The fiber currently checked out for execution.
    executing: Option<HeapId>,
    /// Collection requested while a fiber was executing.
    gc_pending: bool,
    /// Root fiber of the active `evaluate`, if any.
    root_fiber: Option<HeapId>,
}

impl Vm {
    /// Creates a VM with default options and the built-in globals
    /// (`print`, `input`, `time`, `import`) and `async` module installed.
    pub fn new() -> RunResult<Self> {
        Self::with_options(VmOptions::default())
    }

    /// Creates a VM from explicit options.
    pub fn with_options(options: VmOptions) -> RunResult<Self> {
        let mut vm = Self {
            heap: Heap::with_threshold(options.gc_threshold),
            globals: AHashMap::new(),
            builtins: AHashMap::new(),
            scheduler: Scheduler::new(options.poller),
            module_cache: AHashMap::new(),
            console: options.console,
            tracer: options.tracer,
            compiler: options.compiler,
            last: Value::Nil,
            promises: Vec::new(),
            executing: None,
            gc_pending: false,
            root_fiber: None,
        };
        modules::builtins::install(&mut vm)?;
        modules::async_mod::install(&mut vm)?;
        Ok(vm)
    }

    // ------------------------------------------------------------------
    // Embedding surface
    // ------------------------------------------------------------------

    /// Starts registering a script-visible module.
    pub fn module(&mut self, name: &str) -> ModuleBuilder<'_> {
        ModuleBuilder::new(self, name)
    }

    /// Starts registering a global native class.
    pub fn native_class<T: std::any::Any>(&mut self, name: &str) -> ClassBuilder<'_, T> {
        ClassBuilder::new(self, None, name)
    }

    /// Registers a builtin function, visible to every namespace.
    pub fn def_builtin<M>(&mut self, name: &str, f: impl IntoNativeFn<M>) -> RunResult<()> {
        let spec = f.derived_spec()?;
        let value = make_native(self, name, spec, f.into_native());
        self.builtins.insert(name.to_owned(), value);
        Ok(())
    }

    /// Registers a builtin function with named parameters.
    pub fn def_builtin_with<M>(
        &mut self,
        name: &str,
        params: Vec<Param>,
        f: impl IntoNativeFn<M>,
    ) -> RunResult<()> {
        let derived = f.derived_spec()?;
        let spec = crate::binding::spec::ArgSpec::from_params(
            params,
            derived.has_vararg(),
            derived.has_kwarg(),
        )?;
        if spec.nparam() != derived.nparam() {
            return Err(RunError::internal(format!(
                "'{name}': spec names {} parameters but the host signature takes {}",
                spec.nparam(),
                derived.nparam(),
            )));
        }
        let value = make_native(self, name, spec, f.into_native());
        self.builtins.insert(name.to_owned(), value);
        Ok(())
    }

    /// The heap.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap, mutably; natives use this to allocate result objects.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Allocates a heap object.
    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        self.heap.alloc(data)
    }

    /// Allocates a list value.
    pub fn alloc_list(&mut self, items: Vec<Value>) -> Value {
        Value::Obj(self.heap.alloc(HeapData::List(List { items })))
    }

    /// Allocates a dict value.
    pub fn alloc_dict(&mut self, map: ValueMap) -> Value {
        Value::Obj(self.heap.alloc(HeapData::Dict(Dict { map })))
    }

    /// Reads a global binding.
    #[must_use]
    pub fn get_global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    /// Writes a global binding.
    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// The configured console.
    pub fn console_mut(&mut self) -> &mut dyn Console {
        &mut *self.console
    }

    /// Creates a pending promise the VM keeps alive until it settles.
    pub fn new_promise(&mut self) -> SharedPromise {
        let p = Promise::new();
        self.promises.push(Rc::clone(&p));
        p
    }

    /// Wraps a promise into a script-visible future value.
    pub fn new_future(&mut self, promise: SharedPromise) -> Value {
        Value::Obj(self.heap.alloc(HeapData::Future(Future { promise })))
    }

    /// Schedules a timer task after `delay`.
    pub fn schedule_after(&mut self, task: TimerTask, delay: Duration) {
        self.scheduler.push_after(task, delay);
    }

    /// Settles a promise, waking its awaiters.
    pub fn settle(&mut self, promise: &SharedPromise, outcome: promise::SettleOutcome) {
        promise::settle(promise, outcome, &mut self.heap, &mut self.scheduler);
    }

    /// Awaits a value on behalf of native code (§await contract): a
    /// non-future delivers synchronously; a settled future delivers its
    /// outcome; a pending future registers the waker.
    pub fn await_value(&mut self, awaited: &Value, waker: Waker) {
        let future = awaited.as_obj().and_then(|id| match self.heap.get(id) {
            HeapData::Future(f) => Some(Rc::clone(&f.promise)),
            _ => None,
        });
        match future {
            Some(p) => {
                let pending = p.borrow().is_pending();
                if pending {
                    p.borrow_mut().add_waker(waker);
                } else {
                    let outcome = p.borrow().result().cloned().unwrap_or(Ok(Value::Nil));
                    self.deliver_now(waker, outcome);
                }
            }
            None => self.deliver_now(waker, Ok(awaited.clone())),
        }
    }

    fn deliver_now(&mut self, waker: Waker, outcome: promise::SettleOutcome) {
        let mut worklist = Vec::new();
        promise::deliver(waker, &outcome, &mut self.heap, &mut self.scheduler, &mut worklist);
        promise::run_worklist(worklist, &mut self.heap, &mut self.scheduler);
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Runs a chunk in a fresh root fiber and drives the scheduler until
    /// every fiber completes. Returns the VM's last result; an unhandled
    /// error in the root fiber surfaces as the error.
    pub fn evaluate(&mut self, chunk: Chunk) -> RunResult<Value> {
        let root = self.spawn_root_fiber(&Rc::new(chunk));
        self.scheduler.push_task(root);
        let saved_root = self.root_fiber.replace(root);
        let outcome = self.run();
        self.root_fiber = saved_root;
        outcome?;
        let fib = self.heap.fiber(root)?;
        if let Some(err) = fib.error.clone() {
            return Err(err);
        }
        if fib.state != FiberState::Dead {
            return Err(RunError::runtime(
                "evaluation stalled: root fiber never completed",
            ));
        }
        Ok(self.last.clone())
    }

    /// The VM's most recent result.
    #[must_use]
    pub fn last(&self) -> &Value {
        &self.last
    }

    /// Drives the scheduler until it is idle: drain expired timers, run the
    /// next microtask or run-queue fiber, sleep until the next deadline
    /// when only timers remain.
    pub fn run(&mut self) -> RunResult<()> {
        loop {
            while let Some(task) = self.scheduler.pop_expired() {
                self.process_timer(task);
            }
            if let Some(fiber) = self.scheduler.next_task() {
                self.execute_fiber(fiber)?;
                if self.gc_pending || self.heap.should_collect() {
                    self.force_collect();
                }
            } else if self.scheduler.has_timers() {
                self.scheduler.wait_for_next();
            } else {
                break;
            }
        }
        Ok(())
    }

    fn process_timer(&mut self, task: TimerTask) {
        match task {
            TimerTask::WakeFiber(fiber) => {
                let alive = self
                    .heap
                    .fiber(fiber)
                    .map(|f| f.state != FiberState::Dead)
                    .unwrap_or(false);
                if alive {
                    self.scheduler.push_task(fiber);
                }
            }
            TimerTask::Resolve { promise, value } => {
                if let Some(p) = promise.upgrade() {
                    self.settle(&p, Ok(value));
                }
            }
            TimerTask::Reject { promise, message } => {
                if let Some(p) = promise.upgrade() {
                    self.settle(&p, Err(message));
                }
            }
        }
    }

    /// Forces a collection cycle, or defers it to the end of the current
    /// time slice when a fiber is executing.
    pub fn collect_garbage(&mut self) {
        if self.executing.is_some() {
            self.gc_pending = true;
        } else {
            self.force_collect();
        }
    }

    fn force_collect(&mut self) {
        self.gc_pending = false;
        let mut roots = Vec::new();
        object::trace_value(&self.last, &mut roots);
        for v in self.globals.values() {
            object::trace_value(v, &mut roots);
        }
        for v in self.builtins.values() {
            object::trace_value(v, &mut roots);
        }
        roots.extend(self.module_cache.values().copied());
        self.scheduler.trace(&mut roots);
        self.promises.retain(|p| p.borrow().is_pending());
        for p in &self.promises {
            promise::trace_promise(p, &mut roots);
        }
        if let Some(fiber) = self.root_fiber {
            roots.push(fiber);
        }
        let stats = self.heap.collect(&roots);
        self.tracer.on_gc(stats.freed_objects, stats.freed_bytes, stats.live_objects);
    }

    fn spawn_root_fiber(&mut self, chunk: &Rc<Chunk>) -> HeapId {
        let function = self.heap.alloc(HeapData::Function(Function {
            chunk: Rc::clone(chunk),
            entry: 0,
            nparams: 0,
            ndefaults: 0,
            nlocals: 0,
            has_vararg: false,
            has_kwarg: false,
        }));
        let closure = self.heap.alloc(HeapData::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        let mut fib = Fiber::new();
        fib.stack.push(Value::Obj(closure));
        fib.frames.push(CallFrame {
            closure,
            chunk: Rc::clone(chunk),
            ip: 0,
            bp: 0,
            handlers: smallvec::SmallVec::new(),
        });
        fib.state = FiberState::Suspended;
        self.heap.alloc(HeapData::Fiber(Some(Box::new(fib))))
    }

    /// Runs one fiber until it suspends, yields or dies.
    fn execute_fiber(&mut self, fid: HeapId) -> RunResult<()> {
        let mut fib = self.heap.take_fiber(fid)?;
        if fib.state == FiberState::Dead {
            self.heap.put_fiber(fid, fib);
            return Ok(());
        }
        self.executing = Some(fid);
        self.tracer.on_fiber_start(fid);
        fib.state = FiberState::Running;

        if let Some(outcome) = fib.pending_wake.take() {
            match outcome {
                Ok(v) => fib.stack.push(v),
                Err(err) => {
                    let thrown = Value::from(err.message.clone());
                    self.unwind(&mut fib, thrown, err);
                }
            }
        }
        if fib.state == FiberState::Running {
            self.run_fiber(&mut fib, fid);
        }

        if fib.state == FiberState::Dead {
            self.last = fib.last.clone();
            if let Some(err) = &fib.error {
                self.tracer.on_uncaught(fid, err);
                if self.root_fiber != Some(fid) {
                    let _ = self.console.stderr_write(&format!("{err}\n"));
                }
            }
        }
        self.tracer.on_fiber_exit(fid, fib.state);
        self.executing = None;
        self.heap.put_fiber(fid, fib);
        Ok(())
    }

    /// The fetch–decode–execute loop for one fiber time slice.
    fn run_fiber(&mut self, fib: &mut Fiber, fid: HeapId) {
        while fib.state == FiberState::Running {
            let Some(frame) = fib.frames.last() else {
                fib.state = FiberState::Dead;
                fib.last = fib.stack.pop().unwrap_or(Value::Nil);
                break;
            };
            let ip = frame.ip;
            if ip >= frame.chunk.code.len() {
                // Falling off the end of the code acts like Return.
                self.do_return(fib);
                continue;
            }
            let (ins, next_ip) = match Instruction::decode(&frame.chunk.code, ip) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.raise(fib, err.with_pos(ip));
                    continue;
                }
            };
            if let Some(frame) = fib.frames.last_mut() {
                frame.ip = next_ip;
            }
            if let Err(err) = self.step(fib, fid, ins, next_ip) {
                self.raise(fib, err.with_pos(ip));
            }
        }
    }

    /// Executes one instruction. Errors unwind like `Throw`.
    fn step(&mut self, fib: &mut Fiber, fid: HeapId, ins: Instruction, next_ip: usize) -> RunResult<()> {
        match ins {
            Instruction::Nop => {}

            // --- stack manipulation ---
            Instruction::Push { const_index } => {
                let chunk = cur_chunk(fib)?;
                let v = chunk.const_at(const_index)?.clone();
                fib.stack.push(v);
            }
            Instruction::Dup { top_ofs } => {
                let v = fib.peek(top_ofs as usize)?.clone();
                fib.stack.push(v);
            }
            Instruction::Swap => {
                let len = fib.stack.len();
                if len < 2 {
                    return Err(RunError::internal("value stack underflow"));
                }
                fib.stack.swap(len - 1, len - 2);
            }
            Instruction::Pop { count } => {
                for _ in 0..count {
                    fib.pop()?;
                }
            }

            // --- operators ---
            Instruction::UnaryOp { op } => {
                let v = fib.pop()?;
                let out = value::unary_op(op, &v, &self.heap)?;
                fib.stack.push(out);
            }
            Instruction::BinaryOp { op } => {
                let rhs = fib.pop()?;
                let lhs = fib.pop()?;
                let out = value::binary_op(op, &lhs, &rhs, &self.heap)?;
                fib.stack.push(out);
            }

            // --- locals / globals / upvalues ---
            Instruction::LoadLocal { slot } => {
                let bp = cur_bp(fib)?;
                let v = fib
                    .stack
                    .get(bp + slot as usize)
                    .cloned()
                    .ok_or_else(|| RunError::value_error(format!("local slot {slot} out of range")))?;
                fib.stack.push(v);
            }
            Instruction::StoreLocal { slot } => {
                let v = fib.pop()?;
                let index = cur_bp(fib)? + slot as usize;
                if index >= fib.stack.len() {
                    fib.stack.resize(index + 1, Value::Nil);
                }
                fib.stack[index] = v;
            }
            Instruction::LoadGlobal { name_index } => {
                let chunk = cur_chunk(fib)?;
                let name = chunk.name_at(name_index)?;
                let v = self
                    .globals
                    .get(name)
                    .or_else(|| self.builtins.get(name))
                    .cloned()
                    .ok_or_else(|| RunError::runtime(format!("undefined global '{name}'")))?;
                fib.stack.push(v);
            }
            Instruction::StoreGlobal { name_index } => {
                let chunk = cur_chunk(fib)?;
                let name = chunk.name_at(name_index)?.to_owned();
                let v = fib.pop()?;
                self.globals.insert(name, v);
            }
            Instruction::LoadUpvalue { slot } => {
                let v = self.load_upvalue(fib, fid, slot as usize)?;
                fib.stack.push(v);
            }
            Instruction::StoreUpvalue { slot } => {
                let v = fib.pop()?;
                self.store_upvalue(fib, fid, slot as usize, v)?;
            }
            Instruction::CloseUpvalues { from_slot } => {
                let from = cur_bp(fib)? + from_slot as usize;
                fiber::close_upvalues_from(fib, from, &mut self.heap);
            }

            // --- control flow ---
            Instruction::Jump { offset } => jump(fib, next_ip, offset)?,
            Instruction::JumpIfTrue { offset } => {
                if fib.pop()?.is_truthy() {
                    jump(fib, next_ip, offset)?;
                }
            }
            Instruction::JumpIfFalse { offset } => {
                if !fib.pop()?.is_truthy() {
                    jump(fib, next_ip, offset)?;
                }
            }
            Instruction::Return => self.do_return(fib),

            // --- closures and calls ---
            Instruction::MakeClosure { entry, nparams, nlocals, nupvals } => {
                let closure = self.make_closure_obj(fib, fid, entry, nparams, nlocals, nupvals)?;
                fib.stack.push(Value::Obj(closure));
            }
            Instruction::Call { nargs, nkwargs } => {
                self.call_value(fib, fid, nargs as usize, nkwargs as usize)?;
            }
            Instruction::TailCall { nargs } => {
                self.tail_call(fib, fid, nargs as usize)?;
            }

            // --- containers ---
            Instruction::MakeList { nelems } => {
                let n = nelems as usize;
                let start = fib
                    .stack
                    .len()
                    .checked_sub(n)
                    .ok_or_else(|| RunError::internal("value stack underflow"))?;
                let items = fib.stack.split_off(start);
                let v = self.alloc_list(items);
                fib.stack.push(v);
            }
            Instruction::MakeDict { npairs } => {
                let n = npairs as usize;
                let start = fib
                    .stack
                    .len()
                    .checked_sub(2 * n)
                    .ok_or_else(|| RunError::internal("value stack underflow"))?;
                let flat = fib.stack.split_off(start);
                let mut map = ValueMap::default();
                let mut it = flat.into_iter();
                while let (Some(key), Some(value)) = (it.next(), it.next()) {
                    let key = key
                        .as_str()
                        .ok_or_else(|| {
                            RunError::type_error(format!(
                                "dict key must be a string, got {}",
                                key.fmt_desc(&self.heap)
                            ))
                        })?
                        .to_owned();
                    map.insert(key, value);
                }
                let v = self.alloc_dict(map);
                fib.stack.push(v);
            }

            // --- classes and members ---
            Instruction::MakeClass { name_index, nmethods } => {
                let chunk = cur_chunk(fib)?;
                let name = chunk.name_at(name_index)?.to_owned();
                let n = nmethods as usize;
                let start = fib
                    .stack
                    .len()
                    .checked_sub(2 * n)
                    .ok_or_else(|| RunError::internal("value stack underflow"))?;
                let flat = fib.stack.split_off(start);
                let mut methods = ValueMap::default();
                let mut it = flat.into_iter();
                while let (Some(mname), Some(method)) = (it.next(), it.next()) {
                    let mname = mname
                        .as_str()
                        .ok_or_else(|| RunError::type_error("method name is not a string"))?
                        .to_owned();
                    methods.insert(mname, method);
                }
                let class = self.heap.alloc(HeapData::Class(Class { name, methods }));
                fib.stack.push(Value::Obj(class));
            }
            Instruction::GetField { name_index } => {
                let chunk = cur_chunk(fib)?;
                let name = chunk.name_at(name_index)?.to_owned();
                let receiver = fib.pop()?;
                let v = self.member_get(&receiver, &name)?;
                fib.stack.push(v);
            }
            Instruction::SetField { name_index } => {
                let chunk = cur_chunk(fib)?;
                let name = chunk.name_at(name_index)?.to_owned();
                let value = fib.pop()?;
                let receiver = fib.pop()?;
                self.member_set(&receiver, &name, value)?;
            }
            Instruction::GetItem => {
                let index = fib.pop()?;
                let container = fib.pop()?;
                let v = self.item_get(&container, &index)?;
                fib.stack.push(v);
            }
            Instruction::SetItem => {
                let value = fib.pop()?;
                let index = fib.pop()?;
                let container = fib.pop()?;
                self.item_set(&container, &index, value)?;
            }

            // --- fibers ---
            Instruction::MakeFiber { entry, nparams, nlocals, nupvals } => {
                let new_fiber = self.make_fiber_obj(fib, fid, entry, nparams, nlocals, nupvals)?;
                fib.stack.push(Value::Obj(new_fiber));
            }
            Instruction::Resume { nargs } => {
                self.resume_fiber(fib, fid, nargs as usize)?;
            }
            Instruction::Yield => {
                let v = fib.pop()?;
                fib.last = v;
                fib.state = FiberState::Suspended;
            }
            Instruction::Await => {
                let awaited = fib.pop()?;
                self.await_on(fib, fid, awaited);
            }

            // --- exceptions ---
            Instruction::Throw => {
                let thrown = fib.pop()?;
                let err = RunError::runtime(thrown.fmt_str(&self.heap));
                self.unwind(fib, thrown, err);
            }
            Instruction::TryBegin { handler_ofs } => {
                let handler_ip = checked_target(fib, next_ip, handler_ofs)?;
                let stack_top = fib.stack.len();
                let frame = fib
                    .frames
                    .last_mut()
                    .ok_or_else(|| RunError::internal("TryBegin without a frame"))?;
                frame.handlers.push(ExceptionHandler { handler_ip, stack_top });
            }
            Instruction::TryEnd => {
                let frame = fib
                    .frames
                    .last_mut()
                    .ok_or_else(|| RunError::internal("TryEnd without a frame"))?;
                if frame.handlers.pop().is_none() {
                    return Err(RunError::internal("TryEnd without TryBegin"));
                }
            }
        }
        Ok(())
    }

    /// Awaiting: non-futures deliver synchronously; a settled future
    /// schedules this fiber as a microtask with its outcome; a pending
    /// future registers a waker and suspends.
    fn await_on(&mut self, fib: &mut Fiber, fid: HeapId, awaited: Value) {
        let future = awaited.as_obj().and_then(|id| match self.heap.get(id) {
            HeapData::Future(f) => Some(Rc::clone(&f.promise)),
            _ => None,
        });
        let Some(promise) = future else {
            fib.stack.push(awaited);
            return;
        };
        let pending = promise.borrow().is_pending();
        if pending {
            promise.borrow_mut().add_waker(Waker::ResumeFiber(fid));
            fib.state = FiberState::Suspended;
        } else {
            let outcome = promise.borrow().result().cloned().unwrap_or(Ok(Value::Nil));
            fib.pending_wake = Some(outcome.map_err(RunError::runtime));
            fib.state = FiberState::Suspended;
            self.scheduler.push_microtask(fid);
        }
    }

    /// Pops the current frame, leaving the return value at the callee slot.
    /// The root frame's return kills the fiber and records `last`.
    fn do_return(&mut self, fib: &mut Fiber) {
        let Some(frame) = fib.frames.last() else {
            fib.state = FiberState::Dead;
            return;
        };
        let bp = frame.bp;
        fiber::close_upvalues_from(fib, bp, &mut self.heap);
        let ret = fib.stack.last().cloned().unwrap_or(Value::Nil);
        fib.stack.truncate(bp + 1);
        if fib.stack.len() == bp {
            fib.stack.push(ret.clone());
        } else if let Some(slot) = fib.stack.get_mut(bp) {
            *slot = ret.clone();
        }
        fib.frames.pop();
        if fib.frames.is_empty() {
            fib.state = FiberState::Dead;
            fib.last = ret;
        }
    }

    /// Converts a runtime error into a `Throw` with the error message as
    /// payload.
    fn raise(&mut self, fib: &mut Fiber, err: RunError) {
        let thrown = Value::from(err.message.clone());
        self.unwind(fib, thrown, err);
    }

    /// Unwinds frames and handlers until the innermost `TryBegin` catches
    /// the thrown value; without a handler the fiber dies with the error.
    /// Returns whether a handler was found.
    fn unwind(&mut self, fib: &mut Fiber, thrown: Value, err: RunError) -> bool {
        loop {
            if fib.frames.is_empty() {
                fib.state = FiberState::Dead;
                fib.last = thrown;
                fib.error = Some(err);
                return false;
            }
            let handler = fib.frames.last_mut().and_then(|f| f.handlers.pop());
            if let Some(h) = handler {
                fib.stack.truncate(h.stack_top);
                fib.stack.push(thrown);
                if let Some(frame) = fib.frames.last_mut() {
                    frame.ip = h.handler_ip;
                }
                return true;
            }
            let bp = fib.frames.last().map(|f| f.bp).unwrap_or(0);
            fiber::close_upvalues_from(fib, bp, &mut self.heap);
            fib.frames.pop();
        }
    }

    // ------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------

    /// The `import(name)` builtin: cache hit returns the cached module; on
    /// miss, `<name>.seri` is read, compiled through the registered hook
    /// and evaluated with a fresh globals namespace sharing this heap.
    pub fn import_module(&mut self, name: &str) -> RunResult<Value> {
        if let Some(id) = self.module_cache.get(name) {
            return Ok(Value::Obj(*id));
        }
        let path = format!("{name}.seri");
        let source = std::fs::read_to_string(&path)
            .map_err(|e| RunError::runtime(format!("cannot open '{path}': {e}")))?;
        let Some(compiler) = &self.compiler else {
            return Err(RunError::runtime(format!(
                "no module compiler installed; cannot import '{name}'"
            )));
        };
        let chunk = compiler
            .compile(name, &source)
            .map_err(|e| RunError::runtime(format!("cannot compile module '{name}': {e}")))?;

        let saved = std::mem::take(&mut self.globals);
        let outcome = self.eval_module_chunk(name, chunk);
        let module_globals = std::mem::replace(&mut self.globals, saved);
        outcome?;

        let dict: ValueMap = module_globals.into_iter().collect();
        let id = self.heap.alloc(HeapData::Module(Module { name: name.to_owned(), dict }));
        self.module_cache.insert(name.to_owned(), id);
        Ok(Value::Obj(id))
    }

    /// Evaluates a module chunk synchronously on a fresh root fiber.
    /// Module top level must not suspend.
    fn eval_module_chunk(&mut self, name: &str, chunk: Chunk) -> RunResult<()> {
        let root = self.spawn_root_fiber(&Rc::new(chunk));
        self.execute_fiber(root)?;
        let fib = self.heap.fiber(root)?;
        match fib.state {
            FiberState::Dead => match &fib.error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
            _ => Err(RunError::runtime(format!(
                "module '{name}' suspended during import"
            ))),
        }
    }
}

/// Current frame's chunk.
fn cur_chunk(fib: &Fiber) -> RunResult<Rc<Chunk>> {
    fib.frames
        .last()
        .map(|f| Rc::clone(&f.chunk))
        .ok_or_else(|| RunError::internal("no active frame"))
}

/// Current frame's base pointer.
fn cur_bp(fib: &Fiber) -> RunResult<usize> {
    fib.frames
        .last()
        .map(|f| f.bp)
        .ok_or_else(|| RunError::internal("no active frame"))
}

/// Validates a jump target relative to the byte after the instruction.
fn checked_target(fib: &Fiber, next_ip: usize, offset: i32) -> RunResult<usize> {
    let frame = fib
        .frames
        .last()
        .ok_or_else(|| RunError::internal("no active frame"))?;
    let target = next_ip as i64 + i64::from(offset);
    if target < 0 || target as usize > frame.chunk.code.len() {
        return Err(RunError::value_error(format!("jump target {target} out of range")));
    }
    Ok(target as usize)
}

/// Applies a jump.
fn jump(fib: &mut Fiber, next_ip: usize, offset: i32) -> RunResult<()> {
    let target = checked_target(fib, next_ip, offset)?;
    if let Some(frame) = fib.frames.last_mut() {
        frame.ip = target;
    }
    Ok(())
}
