//! Type casters between script values and host types.
//!
//! Inbound, [`FromValueArg`] turns a bound [`Value`] into the host parameter
//! type, raising a readable type error on mismatch. The carrier types
//! [`VarArgs`] and [`KwArgs`] are recognized structurally: a trailing
//! `VarArgs` parameter absorbs excess positionals and a trailing `KwArgs`
//! absorbs unknown keywords. Outbound, [`IntoValue`] marshals the host
//! return value back onto the fiber stack.

use std::{any::Any, rc::Rc};

use crate::{
    binding::spec::KwargMap,
    error::{RunError, RunResult},
    heap::Heap,
    object::HeapData,
    value::Value,
};

/// How a parameter participates in binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    /// Ordinary parameter bound through the spec.
    None,
    /// Absorbs excess positional arguments.
    Vararg,
    /// Absorbs unknown keyword arguments.
    Kwarg,
}

/// Excess-positional carrier.
#[derive(Debug, Default)]
pub struct VarArgs(pub Vec<Value>);

/// Unknown-keyword carrier.
#[derive(Debug, Default)]
pub struct KwArgs(pub KwargMap);

/// Handle to the foreign payload of a native instance.
#[derive(Debug)]
pub struct Foreign<T: 'static>(pub Rc<T>);

impl<T: 'static> Clone for Foreign<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T: 'static> std::ops::Deref for Foreign<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Inbound caster: produces the host parameter type from a bound value.
pub trait FromValueArg: Sized {
    /// Carrier role of this parameter type.
    const CARRIER: Carrier = Carrier::None;

    /// Converts an ordinary bound value.
    fn load(value: Value, heap: &Heap) -> RunResult<Self>;

    /// Converts the vararg carrier. Only called when `CARRIER` is `Vararg`.
    fn load_varargs(_args: Vec<Value>, _heap: &Heap) -> RunResult<Self> {
        Err(RunError::internal("parameter type is not a vararg carrier"))
    }

    /// Converts the kwarg carrier. Only called when `CARRIER` is `Kwarg`.
    fn load_kwargs(_kwargs: KwargMap, _heap: &Heap) -> RunResult<Self> {
        Err(RunError::internal("parameter type is not a kwarg carrier"))
    }
}

fn expected(what: &str, got: &Value, heap: &Heap) -> RunError {
    RunError::type_error(format!("expected {what}, got {}", got.fmt_desc(heap)))
}

impl FromValueArg for Value {
    fn load(value: Value, _heap: &Heap) -> RunResult<Self> {
        Ok(value)
    }
}

impl FromValueArg for bool {
    fn load(value: Value, heap: &Heap) -> RunResult<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(expected("bool", &other, heap)),
        }
    }
}

impl FromValueArg for i64 {
    fn load(value: Value, heap: &Heap) -> RunResult<Self> {
        match value {
            Value::Int(n) => Ok(n),
            Value::Bool(b) => Ok(Self::from(b)),
            other => Err(expected("int", &other, heap)),
        }
    }
}

impl FromValueArg for f64 {
    fn load(value: Value, heap: &Heap) -> RunResult<Self> {
        match value {
            Value::Double(x) => Ok(x),
            Value::Int(n) => Ok(n as Self),
            other => Err(expected("double", &other, heap)),
        }
    }
}

impl FromValueArg for String {
    fn load(value: Value, heap: &Heap) -> RunResult<Self> {
        match value {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(expected("str", &other, heap)),
        }
    }
}

impl FromValueArg for VarArgs {
    const CARRIER: Carrier = Carrier::Vararg;

    fn load(value: Value, heap: &Heap) -> RunResult<Self> {
        Err(expected("vararg carrier", &value, heap))
    }

    fn load_varargs(args: Vec<Value>, _heap: &Heap) -> RunResult<Self> {
        Ok(Self(args))
    }
}

impl FromValueArg for KwArgs {
    const CARRIER: Carrier = Carrier::Kwarg;

    fn load(value: Value, heap: &Heap) -> RunResult<Self> {
        Err(expected("kwarg carrier", &value, heap))
    }

    fn load_kwargs(kwargs: KwargMap, _heap: &Heap) -> RunResult<Self> {
        Ok(Self(kwargs))
    }
}

impl<T: Any> FromValueArg for Foreign<T> {
    fn load(value: Value, heap: &Heap) -> RunResult<Self> {
        let Some(id) = value.as_obj() else {
            return Err(expected("native instance", &value, heap));
        };
        let HeapData::NativeInstance(instance) = heap.get(id) else {
            return Err(expected("native instance", &value, heap));
        };
        let Some(foreign) = &instance.foreign else {
            return Err(RunError::type_error(
                "null native instance for requested type",
            ));
        };
        Rc::clone(foreign)
            .downcast::<T>()
            .map(Foreign)
            .map_err(|_| {
                RunError::type_error(format!(
                    "native instance holds a different foreign type ({})",
                    value.fmt_desc(heap)
                ))
            })
    }
}

/// Outbound caster: marshals a host return value.
pub trait IntoValue {
    fn into_value(self, heap: &mut Heap) -> RunResult<Value>;
}

impl IntoValue for Value {
    fn into_value(self, _heap: &mut Heap) -> RunResult<Value> {
        Ok(self)
    }
}

impl IntoValue for () {
    fn into_value(self, _heap: &mut Heap) -> RunResult<Value> {
        Ok(Value::Nil)
    }
}

impl IntoValue for bool {
    fn into_value(self, _heap: &mut Heap) -> RunResult<Value> {
        Ok(Value::Bool(self))
    }
}

impl IntoValue for i64 {
    fn into_value(self, _heap: &mut Heap) -> RunResult<Value> {
        Ok(Value::Int(self))
    }
}

impl IntoValue for f64 {
    fn into_value(self, _heap: &mut Heap) -> RunResult<Value> {
        Ok(Value::Double(self))
    }
}

impl IntoValue for String {
    fn into_value(self, _heap: &mut Heap) -> RunResult<Value> {
        Ok(Value::from(self))
    }
}

impl IntoValue for &'static str {
    fn into_value(self, _heap: &mut Heap) -> RunResult<Value> {
        Ok(Value::str(self))
    }
}

impl IntoValue for Vec<Value> {
    fn into_value(self, heap: &mut Heap) -> RunResult<Value> {
        let id = heap.alloc(HeapData::List(crate::object::List { items: self }));
        Ok(Value::Obj(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{NativeClass, NativeInstance, ValueMap};

    #[test]
    fn primitive_casters() {
        let heap = Heap::new();
        assert_eq!(i64::load(Value::Int(5), &heap).unwrap(), 5);
        assert_eq!(i64::load(Value::Bool(true), &heap).unwrap(), 1);
        assert!(i64::load(Value::str("x"), &heap).is_err());
        assert_eq!(f64::load(Value::Int(2), &heap).unwrap(), 2.0);
        assert_eq!(String::load(Value::str("hi"), &heap).unwrap(), "hi");
        let err = bool::load(Value::Int(1), &heap).unwrap_err();
        assert!(err.message.contains("expected bool, got <int: 1>"));
    }

    #[test]
    fn foreign_caster_downcasts_and_reports_mismatch() {
        let mut heap = Heap::new();
        let class = heap.alloc(HeapData::NativeClass(NativeClass {
            name: "Point".to_owned(),
            methods: ValueMap::default(),
            finalizer: None,
        }));
        let instance = heap.alloc(HeapData::NativeInstance(NativeInstance {
            class,
            foreign: Some(Rc::new(42_u32)),
            finalizer: None,
        }));

        let loaded = Foreign::<u32>::load(Value::Obj(instance), &heap).unwrap();
        assert_eq!(*loaded, 42);

        let err = Foreign::<String>::load(Value::Obj(instance), &heap).unwrap_err();
        assert!(err.message.contains("different foreign type"));

        let err = Foreign::<u32>::load(Value::Int(1), &heap).unwrap_err();
        assert!(err.message.contains("expected native instance"));
    }
}
