//! Module and native-class registrars.
//!
//! Embedders describe their API surface through these builders; all specs
//! are validated eagerly at registration time, so an incoherent signature is
//! an immediate `InternalError` rather than a latent dispatch failure.
//!
//! ```ignore
//! let mut m = vm.module("async");
//! m.def_with(
//!     "Sleep",
//!     vec![param("msecs"), param("result").default_value(Value::Nil)],
//!     |ctx, ms: i64, result: Value| { /* ... */ },
//! )?;
//!
//! let mut c = m.class::<Stopwatch>("Stopwatch");
//! c.init(|_ctx| Ok(Stopwatch::new()))?;
//! c.method("elapsed", |_ctx, this: Foreign<Stopwatch>| Ok(this.elapsed()))?;
//! ```

use std::{any::Any, marker::PhantomData, rc::Rc};

use crate::{
    binding::{
        function::{IntoNativeCtor, IntoNativeFn},
        spec::{ArgSpec, Param},
    },
    error::{RunError, RunResult},
    heap::HeapId,
    object::{HeapData, Module, NativeClass, NativeFn, NativeFunction, ValueMap},
    value::Value,
    vm::Vm,
};

/// Allocates a native function object.
pub(crate) fn make_native(vm: &mut Vm, name: &str, spec: ArgSpec, fun: NativeFn) -> Value {
    let id = vm.heap.alloc(HeapData::NativeFunction(NativeFunction {
        name: name.to_owned(),
        spec: Rc::new(spec),
        fun,
    }));
    Value::Obj(id)
}

/// Validates a named parameter list against the spec derived from the host
/// signature and merges them.
fn named_spec(
    name: &str,
    params: Vec<Param>,
    derived: ArgSpec,
    receiver: bool,
) -> RunResult<ArgSpec> {
    let mut spec = ArgSpec::from_params(params, derived.has_vararg(), derived.has_kwarg())?;
    if receiver {
        spec = spec.prepend_receiver();
    }
    if spec.nparam() != derived.nparam() {
        return Err(RunError::internal(format!(
            "'{name}': spec names {} parameters but the host signature takes {}",
            spec.nparam(),
            derived.nparam(),
        )));
    }
    Ok(spec)
}

/// Registrar for one script-visible module.
pub struct ModuleBuilder<'vm> {
    vm: &'vm mut Vm,
    module: HeapId,
}

impl<'vm> ModuleBuilder<'vm> {
    /// Creates the module object and installs it under `name` in the
    /// globals and the module cache.
    pub(crate) fn new(vm: &'vm mut Vm, name: &str) -> Self {
        let module = vm.heap.alloc(HeapData::Module(Module {
            name: name.to_owned(),
            dict: ValueMap::default(),
        }));
        vm.globals.insert(name.to_owned(), Value::Obj(module));
        vm.module_cache.insert(name.to_owned(), module);
        Self { vm, module }
    }

    /// The module's heap object.
    #[must_use]
    pub fn id(&self) -> HeapId {
        self.module
    }

    fn insert(&mut self, name: &str, value: Value) {
        if let HeapData::Module(m) = self.vm.heap.get_mut(self.module) {
            m.dict.insert(name.to_owned(), value);
        }
    }

    /// Registers a function; the spec is derived from the signature, so
    /// arguments bind positionally only.
    pub fn def<M>(&mut self, name: &str, f: impl IntoNativeFn<M>) -> RunResult<&mut Self> {
        let spec = f.derived_spec()?;
        let value = make_native(self.vm, name, spec, f.into_native());
        self.insert(name, value);
        Ok(self)
    }

    /// Registers a function with named parameters, keyword binding and
    /// defaults.
    pub fn def_with<M>(
        &mut self,
        name: &str,
        params: Vec<Param>,
        f: impl IntoNativeFn<M>,
    ) -> RunResult<&mut Self> {
        let spec = named_spec(name, params, f.derived_spec()?, false)?;
        let value = make_native(self.vm, name, spec, f.into_native());
        self.insert(name, value);
        Ok(self)
    }

    /// Starts registering a native class inside this module.
    pub fn class<T: Any>(&mut self, name: &str) -> ClassBuilder<'_, T> {
        ClassBuilder::new(self.vm, Some(self.module), name)
    }
}

/// Registrar for one native class exposing a host type `T`.
pub struct ClassBuilder<'vm, T> {
    vm: &'vm mut Vm,
    class: HeapId,
    _marker: PhantomData<fn() -> T>,
}

impl<'vm, T: Any> ClassBuilder<'vm, T> {
    /// Creates the class object and installs it in the module dict, or in
    /// the globals when `module` is `None`.
    pub(crate) fn new(vm: &'vm mut Vm, module: Option<HeapId>, name: &str) -> Self {
        let class = vm.heap.alloc(HeapData::NativeClass(NativeClass {
            name: name.to_owned(),
            methods: ValueMap::default(),
            finalizer: None,
        }));
        match module {
            Some(module) => {
                if let HeapData::Module(m) = vm.heap.get_mut(module) {
                    m.dict.insert(name.to_owned(), Value::Obj(class));
                }
            }
            None => {
                vm.globals.insert(name.to_owned(), Value::Obj(class));
            }
        }
        Self { vm, class, _marker: PhantomData }
    }

    /// The class's heap object.
    #[must_use]
    pub fn id(&self) -> HeapId {
        self.class
    }

    fn insert_method(&mut self, name: &str, spec: ArgSpec, fun: NativeFn) {
        let value = make_native(self.vm, name, spec, fun);
        if let HeapData::NativeClass(c) = self.vm.heap.get_mut(self.class) {
            c.methods.insert(name.to_owned(), value);
        }
    }

    /// Registers the constructor. The closure returns the foreign payload;
    /// the wrapper installs it into the receiver.
    pub fn init<M>(&mut self, f: impl IntoNativeCtor<M, T>) -> RunResult<&mut Self> {
        let spec = f.derived_spec()?;
        self.insert_method("__init__", spec, f.into_native());
        Ok(self)
    }

    /// Registers the constructor with named parameters (excluding the
    /// receiver).
    pub fn init_with<M>(
        &mut self,
        params: Vec<Param>,
        f: impl IntoNativeCtor<M, T>,
    ) -> RunResult<&mut Self> {
        let spec = named_spec("__init__", params, f.derived_spec()?, true)?;
        self.insert_method("__init__", spec, f.into_native());
        Ok(self)
    }

    /// Registers a method. The first host parameter after the context is
    /// the receiver, typically `Foreign<T>`.
    pub fn method<M>(&mut self, name: &str, f: impl IntoNativeFn<M>) -> RunResult<&mut Self> {
        let spec = f.derived_spec()?;
        if spec.nparam() == 0 {
            return Err(RunError::internal(format!(
                "'{name}': a method signature needs a receiver parameter"
            )));
        }
        self.insert_method(name, spec, f.into_native());
        Ok(self)
    }

    /// Registers a method with named parameters (excluding the receiver).
    pub fn method_with<M>(
        &mut self,
        name: &str,
        params: Vec<Param>,
        f: impl IntoNativeFn<M>,
    ) -> RunResult<&mut Self> {
        let spec = named_spec(name, params, f.derived_spec()?, true)?;
        self.insert_method(name, spec, f.into_native());
        Ok(self)
    }

    /// Registers a finalizer the collector invokes on sweep, exactly once
    /// per instance. Must be registered before instances are constructed:
    /// each instance captures the finalizer at `__init__` time.
    pub fn finalizer(&mut self, f: impl Fn(&T) + 'static) -> &mut Self {
        let wrapped: crate::object::Finalizer = Rc::new(move |any: &Rc<dyn Any>| {
            if let Some(t) = any.downcast_ref::<T>() {
                f(t);
            }
        });
        if let HeapData::NativeClass(c) = self.vm.heap.get_mut(self.class) {
            c.finalizer = Some(wrapped);
        }
        self
    }

    /// Opts instances out of finalization; for foreign objects whose
    /// lifetime is managed elsewhere.
    pub fn no_delete(&mut self) -> &mut Self {
        if let HeapData::NativeClass(c) = self.vm.heap.get_mut(self.class) {
            c.finalizer = None;
        }
        self
    }
}
