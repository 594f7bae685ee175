//! Heap object model.
//!
//! Every collector-owned object is one variant of [`HeapData`]; dispatch on
//! kind is an explicit match rather than a vtable, which keeps the hot
//! interpreter loop free of indirect calls. [`ObjType`] is the discriminator
//! visible to scripts through `type()` and error messages.

use std::{any::Any, rc::Rc};

use indexmap::IndexMap;
use strum::{Display, IntoStaticStr};

use crate::{
    binding::spec::ArgSpec,
    chunk::Chunk,
    fiber::Fiber,
    heap::{Heap, HeapId},
    promise::{self, SharedPromise},
    value::Value,
};

/// Insertion-ordered string-keyed map used by dicts, modules, classes and
/// instance fields.
pub type ValueMap = IndexMap<String, Value, ahash::RandomState>;

/// Formatting of nested containers stops at this depth.
const MAX_FMT_DEPTH: usize = 8;

/// Type discriminator for values and heap objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ObjType {
    #[strum(serialize = "nil")]
    Nil,
    #[strum(serialize = "bool")]
    Bool,
    #[strum(serialize = "int")]
    Int,
    #[strum(serialize = "double")]
    Double,
    #[strum(serialize = "str")]
    Str,
    #[strum(serialize = "list")]
    List,
    #[strum(serialize = "dict")]
    Dict,
    #[strum(serialize = "module")]
    Module,
    #[strum(serialize = "class")]
    Class,
    #[strum(serialize = "instance")]
    Instance,
    #[strum(serialize = "bound method")]
    BoundMethod,
    #[strum(serialize = "function")]
    Function,
    #[strum(serialize = "closure")]
    Closure,
    #[strum(serialize = "upvalue")]
    Upvalue,
    #[strum(serialize = "fiber")]
    Fiber,
    #[strum(serialize = "future")]
    Future,
    #[strum(serialize = "native function")]
    NativeFunction,
    #[strum(serialize = "native class")]
    NativeClass,
    #[strum(serialize = "native instance")]
    NativeInstance,
}

/// Ordered sequence of values.
#[derive(Debug, Default)]
pub struct List {
    pub items: Vec<Value>,
}

/// String-keyed mapping. Member access on a dict aliases item access.
#[derive(Debug, Default)]
pub struct Dict {
    pub map: ValueMap,
}

/// A named dict holding an imported compilation unit's top-level bindings.
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub dict: ValueMap,
}

/// A script class: a name plus callable methods. Calling the class builds an
/// [`Instance`] whose fields start as a copy of the method table.
#[derive(Debug)]
pub struct Class {
    pub name: String,
    pub methods: ValueMap,
}

/// An instance of a script class. Field lookup shadows class methods; the
/// class never owns instance state.
#[derive(Debug)]
pub struct Instance {
    pub class: HeapId,
    pub fields: ValueMap,
}

/// A receiver paired with a callable; calling it re-inserts the receiver as
/// the first positional argument.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub callable: Value,
}

/// Function descriptor: an entry offset into a chunk plus frame layout.
///
/// `nlocals` counts the whole frame window including the callee slot and the
/// parameter slots.
#[derive(Debug)]
pub struct Function {
    pub chunk: Rc<Chunk>,
    pub entry: u32,
    pub nparams: u32,
    pub ndefaults: u32,
    pub nlocals: u32,
    pub has_vararg: bool,
    pub has_kwarg: bool,
}

/// A function plus its captured upvalues.
#[derive(Debug)]
pub struct Closure {
    pub function: HeapId,
    pub upvalues: Vec<HeapId>,
}

/// A captured variable.
///
/// Open upvalues read through a live fiber's stack slot; when the owning
/// frame exits they are closed in place and own their value.
#[derive(Debug)]
pub enum Upvalue {
    Open { fiber: HeapId, slot: usize },
    Closed(Value),
}

/// Script-visible half of an awaitable.
#[derive(Debug)]
pub struct Future {
    pub promise: SharedPromise,
}

/// Host callback invoked by a native function.
///
/// Receives the call context and the already-bound arguments, and leaves its
/// result as a plain value; the VM pushes it for the caller.
pub type NativeFn =
    Rc<dyn Fn(&mut crate::binding::function::NativeCtx<'_, '_>, crate::binding::function::BoundArgs) -> crate::error::RunResult<Value>>;

/// A host-provided callable with a declarative argument spec.
pub struct NativeFunction {
    pub name: String,
    pub spec: Rc<ArgSpec>,
    pub fun: NativeFn,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Finalizer run exactly once when the collector sweeps a native instance.
pub type Finalizer = Rc<dyn Fn(&Rc<dyn Any>)>;

/// A registered host type. Calling it allocates a [`NativeInstance`] and
/// runs the registered `__init__`, which installs the foreign payload.
pub struct NativeClass {
    pub name: String,
    pub methods: ValueMap,
    pub finalizer: Option<Finalizer>,
}

impl std::fmt::Debug for NativeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeClass")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("has_finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// A native class instance holding an opaque host object.
pub struct NativeInstance {
    pub class: HeapId,
    /// `None` until `__init__` installs the host object.
    pub foreign: Option<Rc<dyn Any>>,
    pub finalizer: Option<Finalizer>,
}

impl std::fmt::Debug for NativeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeInstance")
            .field("class", &self.class)
            .field("initialized", &self.foreign.is_some())
            .finish()
    }
}

/// A collector-owned object.
///
/// The `Fiber` variant holds `None` while the VM has the fiber checked out
/// for execution; the collector never runs in that window.
#[derive(Debug)]
pub enum HeapData {
    List(List),
    Dict(Dict),
    Module(Module),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Fiber(Option<Box<Fiber>>),
    Future(Future),
    NativeFunction(NativeFunction),
    NativeClass(NativeClass),
    NativeInstance(NativeInstance),
}

impl HeapData {
    /// The object's type tag.
    #[must_use]
    pub fn obj_type(&self) -> ObjType {
        match self {
            Self::List(_) => ObjType::List,
            Self::Dict(_) => ObjType::Dict,
            Self::Module(_) => ObjType::Module,
            Self::Class(_) => ObjType::Class,
            Self::Instance(_) => ObjType::Instance,
            Self::BoundMethod(_) => ObjType::BoundMethod,
            Self::Function(_) => ObjType::Function,
            Self::Closure(_) => ObjType::Closure,
            Self::Upvalue(_) => ObjType::Upvalue,
            Self::Fiber(_) => ObjType::Fiber,
            Self::Future(_) => ObjType::Future,
            Self::NativeFunction(_) => ObjType::NativeFunction,
            Self::NativeClass(_) => ObjType::NativeClass,
            Self::NativeInstance(_) => ObjType::NativeInstance,
        }
    }

    /// Static variant name for heap statistics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.obj_type().into()
    }

    /// Estimated bytes attributed to this object at allocation time.
    #[must_use]
    pub fn shallow_size(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        let payload = match self {
            Self::List(l) => l.items.capacity() * std::mem::size_of::<Value>(),
            Self::Dict(d) => d.map.len() * map_entry_size(),
            Self::Module(m) => m.dict.len() * map_entry_size(),
            Self::Class(c) => c.methods.len() * map_entry_size(),
            Self::Instance(i) => i.fields.len() * map_entry_size(),
            Self::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<HeapId>(),
            Self::Fiber(f) => f
                .as_ref()
                .map_or(std::mem::size_of::<Fiber>(), |fib| fib.shallow_size()),
            Self::NativeClass(c) => c.methods.len() * map_entry_size(),
            _ => 0,
        };
        base + payload
    }

    /// Appends every heap reference directly reachable from this object.
    pub fn trace(&self, out: &mut Vec<HeapId>) {
        match self {
            Self::List(l) => trace_values(&l.items, out),
            Self::Dict(d) => trace_map(&d.map, out),
            Self::Module(m) => trace_map(&m.dict, out),
            Self::Class(c) => trace_map(&c.methods, out),
            Self::Instance(i) => {
                out.push(i.class);
                trace_map(&i.fields, out);
            }
            Self::BoundMethod(b) => {
                trace_value(&b.receiver, out);
                trace_value(&b.callable, out);
            }
            Self::Function(_) => {
                // Constant pools hold only immediate values.
            }
            Self::Closure(c) => {
                out.push(c.function);
                out.extend_from_slice(&c.upvalues);
            }
            Self::Upvalue(uv) => match uv {
                Upvalue::Open { fiber, .. } => out.push(*fiber),
                Upvalue::Closed(v) => trace_value(v, out),
            },
            Self::Fiber(slot) => {
                if let Some(fib) = slot {
                    fib.trace(out);
                }
            }
            Self::Future(fut) => promise::trace_promise(&fut.promise, out),
            Self::NativeFunction(_) => {}
            Self::NativeClass(c) => trace_map(&c.methods, out),
            Self::NativeInstance(i) => out.push(i.class),
        }
    }

    /// User-facing string conversion.
    #[must_use]
    pub fn fmt_str(&self, heap: &Heap, depth: usize) -> String {
        if depth > MAX_FMT_DEPTH {
            return "...".to_owned();
        }
        match self {
            Self::List(l) => {
                let mut out = String::from("[");
                for (i, item) in l.items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&fmt_nested(item, heap, depth + 1));
                }
                out.push(']');
                out
            }
            Self::Dict(d) => fmt_map(&d.map, heap, depth),
            Self::Module(m) => format!("<module '{}'>", m.name),
            Self::Class(c) => format!("<class '{}'>", c.name),
            Self::Instance(i) => match heap.get(i.class) {
                Self::Class(c) => format!("<'{}' instance>", c.name),
                _ => "<instance>".to_owned(),
            },
            Self::BoundMethod(_) => "<bound method>".to_owned(),
            Self::Function(_) => "function".to_owned(),
            Self::Closure(_) => "closure".to_owned(),
            Self::Upvalue(_) => "upvalue".to_owned(),
            Self::Fiber(_) => "fiber".to_owned(),
            Self::Future(_) => "<future>".to_owned(),
            Self::NativeFunction(f) => format!("<native fn '{}'>", f.name),
            Self::NativeClass(c) => format!("<native class '{}'>", c.name),
            Self::NativeInstance(i) => match heap.get(i.class) {
                Self::NativeClass(c) => format!("<'{}' native instance>", c.name),
                _ => "<native instance>".to_owned(),
            },
        }
    }

    /// Debug description.
    #[must_use]
    pub fn fmt_desc(&self, heap: &Heap) -> String {
        match self {
            Self::List(l) => format!("<list[{}]>", l.items.len()),
            Self::Dict(d) => format!("<dict{{{}}}>", d.map.len()),
            Self::Function(_) => "<function>".to_owned(),
            Self::Closure(_) => "<closure>".to_owned(),
            Self::Upvalue(_) => "<upvalue>".to_owned(),
            Self::Fiber(_) => "<fiber>".to_owned(),
            other => other.fmt_str(heap, 0),
        }
    }
}

fn map_entry_size() -> usize {
    std::mem::size_of::<(String, Value)>() + 16
}

/// Appends the heap reference inside `v`, if any.
pub fn trace_value(v: &Value, out: &mut Vec<HeapId>) {
    if let Value::Obj(id) = v {
        out.push(*id);
    }
}

/// Appends heap references from a slice of values.
pub fn trace_values(values: &[Value], out: &mut Vec<HeapId>) {
    for v in values {
        trace_value(v, out);
    }
}

/// Appends heap references from a value map.
pub fn trace_map(map: &ValueMap, out: &mut Vec<HeapId>) {
    for v in map.values() {
        trace_value(v, out);
    }
}

fn fmt_nested(v: &Value, heap: &Heap, depth: usize) -> String {
    match v {
        Value::Obj(id) => heap.get(*id).fmt_str(heap, depth),
        other => other.fmt_str(heap),
    }
}

fn fmt_map(map: &ValueMap, heap: &Heap, depth: usize) -> String {
    let mut out = String::from("{");
    for (i, (k, v)) in map.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(k);
        out.push_str(": ");
        out.push_str(&fmt_nested(v, heap, depth + 1));
    }
    out.push('}');
    out
}
