#![doc = include_str!("../../../README.md")]

mod binding;
mod chunk;
mod error;
mod fiber;
mod heap;
mod io;
mod modules;
mod object;
mod promise;
mod scheduler;
mod tracer;
mod value;
mod vm;

pub use crate::{
    binding::{
        caster::{Carrier, Foreign, FromValueArg, IntoValue, KwArgs, VarArgs},
        function::{BoundArgs, IntoNativeCtor, IntoNativeFn, NativeCtx},
        module::{ClassBuilder, ModuleBuilder},
        spec::{param, ArgSpec, KwargMap, Param},
    },
    chunk::{Chunk, ChunkBuilder, Instruction, JumpPatch, OpCode},
    error::{CodePos, ErrorKind, RunError, RunResult},
    fiber::{CallFrame, ExceptionHandler, Fiber, FiberState},
    heap::{Heap, HeapId, HeapStats, SweepStats, DEFAULT_GC_THRESHOLD},
    io::{CollectConsole, Console, StdConsole},
    object::{
        BoundMethod, Class, Closure, Dict, Finalizer, Function, Future, HeapData, Instance, List,
        Module, NativeClass, NativeFn, NativeFunction, NativeInstance, ObjType, Upvalue, ValueMap,
    },
    promise::{Promise, PromiseState, SettleOutcome, SharedPromise, Waker, WeakPromise},
    scheduler::{Poller, Scheduler, SleepPoller, TimerTask, VirtualPoller},
    tracer::{NoopTracer, StderrTracer, VmTracer},
    value::{binary_op, unary_op, BinaryOp, UnaryOp, Value},
    vm::{ModuleCompiler, Vm, VmOptions},
};
