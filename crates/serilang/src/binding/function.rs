//! The native-call pipeline and host-function adapters.
//!
//! Dispatch proceeds in the order the runtime guarantees: collect the call's
//! positional and keyword arguments off the fiber stack, bind them against
//! the callable's [`ArgSpec`], pass each bound value through its caster,
//! invoke the host function with a [`NativeCtx`], and push the marshalled
//! result back for the caller.
//!
//! [`IntoNativeFn`] adapts plain Rust closures: parameter and return types
//! pick their casters, and the spec is derived from the signature: a
//! trailing [`VarArgs`](super::caster::VarArgs) parameter becomes the vararg
//! carrier, a trailing [`KwArgs`](super::caster::KwArgs) the kwarg sink.

use std::rc::Rc;

use crate::{
    binding::{
        caster::{Carrier, FromValueArg, IntoValue},
        spec::{ArgSpec, KwargMap},
    },
    error::{RunError, RunResult},
    fiber::Fiber,
    heap::{Heap, HeapId},
    object::{HeapData, NativeFn},
    value::Value,
    vm::Vm,
};

pub use crate::binding::spec::BoundArgs;

/// Call context handed to every native function.
pub struct NativeCtx<'vm, 'f> {
    /// The VM: heap, globals, scheduler, console.
    pub vm: &'vm mut Vm,
    /// The calling fiber, checked out of the heap for the duration of the
    /// call.
    pub fiber: &'f mut Fiber,
    /// Heap id of the calling fiber.
    pub fiber_id: HeapId,
}

/// Adapter from a host closure to a [`NativeFn`] plus a derived spec.
pub trait IntoNativeFn<M> {
    /// Derives the argument spec from the host signature.
    fn derived_spec(&self) -> RunResult<ArgSpec>;

    /// Wraps the closure into the uniform native calling convention.
    fn into_native(self) -> NativeFn;
}

/// Adapter for `__init__` constructors: the closure produces the foreign
/// payload, which the wrapper installs into the receiver.
pub trait IntoNativeCtor<M, T> {
    /// Derives the argument spec, including the leading receiver slot.
    fn derived_spec(&self) -> RunResult<ArgSpec>;

    /// Wraps the constructor into the uniform native calling convention.
    fn into_native(self) -> NativeFn;
}

/// Builds a spec from the carrier roles of a host signature, validating
/// that carriers only appear in trailing position.
pub(crate) fn derive_spec(carriers: &[Carrier]) -> RunResult<ArgSpec> {
    let n = carriers.len();
    let mut has_vararg = false;
    let mut has_kwarg = false;
    let mut nparam = n;
    if n >= 1 && carriers[n - 1] == Carrier::Kwarg {
        has_kwarg = true;
        nparam -= 1;
        if n >= 2 && carriers[n - 2] == Carrier::Vararg {
            has_vararg = true;
            nparam -= 1;
        }
    } else if n >= 1 && carriers[n - 1] == Carrier::Vararg {
        has_vararg = true;
        nparam -= 1;
    }
    if carriers[..nparam].iter().any(|c| *c != Carrier::None) {
        return Err(RunError::internal(
            "vararg/kwarg carriers must be trailing parameters",
        ));
    }
    Ok(ArgSpec::positional(nparam, has_vararg, has_kwarg))
}

/// Pulls the next host argument out of the bound-argument streams.
fn extract<T: FromValueArg>(
    plain: &mut std::vec::IntoIter<Value>,
    varargs: &mut Option<Vec<Value>>,
    kwargs: &mut Option<KwargMap>,
    heap: &Heap,
) -> RunResult<T> {
    match T::CARRIER {
        Carrier::None => {
            let value = plain
                .next()
                .ok_or_else(|| RunError::internal("bound arguments exhausted"))?;
            T::load(value, heap)
        }
        Carrier::Vararg => {
            let args = varargs
                .take()
                .ok_or_else(|| RunError::internal("vararg carrier already consumed"))?;
            T::load_varargs(args, heap)
        }
        Carrier::Kwarg => {
            let map = kwargs
                .take()
                .ok_or_else(|| RunError::internal("kwarg carrier already consumed"))?;
            T::load_kwargs(map, heap)
        }
    }
}

/// Installs the constructed foreign payload into a native instance,
/// copying the class finalizer.
fn install_foreign(
    vm: &mut Vm,
    instance: HeapId,
    foreign: Rc<dyn std::any::Any>,
) -> RunResult<()> {
    let class = match vm.heap.get(instance) {
        HeapData::NativeInstance(ni) => {
            if ni.foreign.is_some() {
                return Err(RunError::type_error("__init__ called twice"));
            }
            ni.class
        }
        _ => return Err(RunError::type_error("self is not a native instance")),
    };
    let finalizer = match vm.heap.get(class) {
        HeapData::NativeClass(c) => c.finalizer.clone(),
        _ => None,
    };
    match vm.heap.get_mut(instance) {
        HeapData::NativeInstance(ni) => {
            ni.foreign = Some(foreign);
            ni.finalizer = finalizer;
            Ok(())
        }
        _ => Err(RunError::type_error("self is not a native instance")),
    }
}

macro_rules! impl_native_adapters {
    ($($A:ident),*) => {
        impl<F, R $(, $A)*> IntoNativeFn<(R, $($A,)*)> for F
        where
            F: Fn(&mut NativeCtx<'_, '_> $(, $A)*) -> RunResult<R> + 'static,
            R: IntoValue + 'static,
            $($A: FromValueArg + 'static,)*
        {
            fn derived_spec(&self) -> RunResult<ArgSpec> {
                derive_spec(&[$($A::CARRIER),*])
            }

            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn into_native(self) -> NativeFn {
                Rc::new(move |ctx: &mut NativeCtx<'_, '_>, args: BoundArgs| {
                    let BoundArgs { params, varargs, kwargs } = args;
                    let mut plain = params.into_iter();
                    let mut varargs = Some(varargs);
                    let mut kwargs = Some(kwargs);
                    $(let $A: $A =
                        extract::<$A>(&mut plain, &mut varargs, &mut kwargs, &ctx.vm.heap)?;)*
                    let out = (self)(ctx $(, $A)*)?;
                    out.into_value(&mut ctx.vm.heap)
                })
            }
        }

        impl<F, T $(, $A)*> IntoNativeCtor<($($A,)*), T> for F
        where
            F: Fn(&mut NativeCtx<'_, '_> $(, $A)*) -> RunResult<T> + 'static,
            T: std::any::Any + 'static,
            $($A: FromValueArg + 'static,)*
        {
            fn derived_spec(&self) -> RunResult<ArgSpec> {
                // Leading slot is the receiver inserted by the bound call.
                derive_spec(&[Carrier::None $(, $A::CARRIER)*])
            }

            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn into_native(self) -> NativeFn {
                Rc::new(move |ctx: &mut NativeCtx<'_, '_>, args: BoundArgs| {
                    let BoundArgs { params, varargs, kwargs } = args;
                    let mut plain = params.into_iter();
                    let receiver = plain
                        .next()
                        .ok_or_else(|| RunError::internal("missing 'self'"))?;
                    let Some(instance) = receiver.as_obj() else {
                        return Err(RunError::type_error("self is not a native instance"));
                    };
                    let mut varargs = Some(varargs);
                    let mut kwargs = Some(kwargs);
                    $(let $A: $A =
                        extract::<$A>(&mut plain, &mut varargs, &mut kwargs, &ctx.vm.heap)?;)*
                    let foreign = (self)(ctx $(, $A)*)?;
                    install_foreign(ctx.vm, instance, Rc::new(foreign))?;
                    Ok(Value::Nil)
                })
            }
        }
    };
}

impl_native_adapters!();
impl_native_adapters!(A1);
impl_native_adapters!(A1, A2);
impl_native_adapters!(A1, A2, A3);
impl_native_adapters!(A1, A2, A3, A4);
impl_native_adapters!(A1, A2, A3, A4, A5);
impl_native_adapters!(A1, A2, A3, A4, A5, A6);
impl_native_adapters!(A1, A2, A3, A4, A5, A6, A7);
impl_native_adapters!(A1, A2, A3, A4, A5, A6, A7, A8);

/// Runs a native function call against the fiber stack.
///
/// The callable sits at `callee_index`, positionals above it, then
/// `nkwargs` (name, value) pairs. On success exactly one return value
/// replaces the callable and its arguments.
pub(crate) fn invoke_native(
    vm: &mut Vm,
    fib: &mut Fiber,
    fiber_id: HeapId,
    callee_index: usize,
    name: &str,
    spec: &ArgSpec,
    fun: &NativeFn,
    nargs: usize,
    nkwargs: usize,
) -> RunResult<()> {
    let base = callee_index + 1;
    let kw_start = base + nargs;

    let mut keywords = Vec::with_capacity(nkwargs);
    for i in 0..nkwargs {
        let key_index = kw_start + 2 * i;
        let key = fib.stack[key_index]
            .as_str()
            .ok_or_else(|| RunError::internal("keyword name is not a string"))?
            .to_owned();
        if keywords.iter().any(|(k, _)| *k == key) {
            return Err(RunError::arity(format!("{name}(): duplicate keyword '{key}'")));
        }
        let value = fib.stack[key_index + 1].clone();
        keywords.push((key, value));
    }
    let positionals: Vec<Value> = fib.stack[base..kw_start].to_vec();
    fib.stack.truncate(callee_index);

    let bound = spec.bind(name, positionals, keywords)?;
    let mut ctx = NativeCtx { vm, fiber: fib, fiber_id };
    let result = fun(&mut ctx, bound)?;
    fib.stack.push(result);
    Ok(())
}
