//! Native binding layer exercised through real VM calls.

use std::cell::Cell;

use serilang::{
    param, ChunkBuilder, CollectConsole, ErrorKind, Foreign, Instruction, KwArgs, NativeCtx,
    NoopTracer, RunError, RunResult, Value, VarArgs, VirtualPoller, Vm, VmOptions,
};

fn test_vm() -> Vm {
    Vm::with_options(VmOptions {
        console: Box::new(CollectConsole::new()),
        poller: Box::new(VirtualPoller::new()),
        tracer: Box::new(NoopTracer),
        ..VmOptions::default()
    })
    .unwrap()
}

fn vm_with_math() -> Vm {
    let mut vm = test_vm();
    let mut m = vm.module("m");
    m.def_with(
        "add",
        vec![param("a"), param("b").default_value(Value::Int(10))],
        |_ctx: &mut NativeCtx<'_, '_>, a: i64, b: i64| -> RunResult<Value> {
            Ok(Value::Int(a + b))
        },
    )
    .unwrap();
    m.def(
        "sum_all",
        |_ctx: &mut NativeCtx<'_, '_>, rest: VarArgs| -> RunResult<Value> {
            let mut total = 0;
            for v in &rest.0 {
                match v {
                    Value::Int(n) => total += n,
                    other => return Err(RunError::type_error(format!("not an int: {other:?}"))),
                }
            }
            Ok(Value::Int(total))
        },
    )
    .unwrap();
    m.def(
        "kw_names",
        |_ctx: &mut NativeCtx<'_, '_>, kwargs: KwArgs| -> RunResult<Value> {
            let mut names: Vec<&str> = kwargs.0.keys().map(String::as_str).collect();
            names.sort_unstable();
            Ok(Value::from(names.join(",")))
        },
    )
    .unwrap();
    vm
}

/// Builds a chunk that calls `m.<name>` with pre-pushed arguments.
fn call_chunk(
    name: &str,
    push_args: impl FnOnce(&mut ChunkBuilder),
    nargs: u8,
    nkwargs: u8,
) -> serilang::Chunk {
    let mut b = ChunkBuilder::new();
    let module = b.add_const(Value::str("m")).unwrap();
    let member = b.add_const(Value::str(name)).unwrap();
    b.emit(Instruction::LoadGlobal { name_index: module });
    b.emit(Instruction::GetField { name_index: member });
    push_args(&mut b);
    b.emit(Instruction::Call { nargs, nkwargs });
    b.emit(Instruction::Return);
    b.build()
}

#[test]
fn positional_call_with_default() {
    let mut vm = vm_with_math();
    let chunk = call_chunk(
        "add",
        |b| {
            b.push_const(Value::Int(1)).unwrap();
        },
        1,
        0,
    );
    let result = vm.evaluate(chunk).unwrap();
    assert!(matches!(result, Value::Int(11)));
}

#[test]
fn keyword_overrides_default() {
    let mut vm = vm_with_math();
    let chunk = call_chunk(
        "add",
        |b| {
            b.push_const(Value::Int(1)).unwrap();
            b.push_const(Value::str("b")).unwrap();
            b.push_const(Value::Int(2)).unwrap();
        },
        1,
        1,
    );
    let result = vm.evaluate(chunk).unwrap();
    assert!(matches!(result, Value::Int(3)));
}

#[test]
fn keyword_for_filled_positional_is_rejected() {
    let mut vm = vm_with_math();
    let chunk = call_chunk(
        "add",
        |b| {
            b.push_const(Value::Int(1)).unwrap();
            b.push_const(Value::str("a")).unwrap();
            b.push_const(Value::Int(2)).unwrap();
        },
        1,
        1,
    );
    let err = vm.evaluate(chunk).unwrap_err();
    assert!(err.message.contains("multiple values for argument 'a'"));
}

#[test]
fn missing_required_argument_is_an_arity_error() {
    let mut vm = vm_with_math();
    let chunk = call_chunk("add", |_| {}, 0, 0);
    let err = vm.evaluate(chunk).unwrap_err();
    // Raised as a runtime throw, so the kind surfaces in the message.
    assert!(err.message.contains("missing argument 'a'"));
}

#[test]
fn unknown_keyword_is_rejected_without_kwarg_sink() {
    let mut vm = vm_with_math();
    let chunk = call_chunk(
        "add",
        |b| {
            b.push_const(Value::Int(1)).unwrap();
            b.push_const(Value::str("z")).unwrap();
            b.push_const(Value::Int(2)).unwrap();
        },
        1,
        1,
    );
    let err = vm.evaluate(chunk).unwrap_err();
    assert!(err.message.contains("unexpected keyword argument 'z'"));
}

#[test]
fn excess_positionals_flow_into_the_vararg_carrier() {
    let mut vm = vm_with_math();
    let chunk = call_chunk(
        "sum_all",
        |b| {
            for n in [1, 2, 3, 4] {
                b.push_const(Value::Int(n)).unwrap();
            }
        },
        4,
        0,
    );
    let result = vm.evaluate(chunk).unwrap();
    assert!(matches!(result, Value::Int(10)));
}

#[test]
fn unknown_keywords_flow_into_the_kwarg_sink() {
    let mut vm = vm_with_math();
    let chunk = call_chunk(
        "kw_names",
        |b| {
            b.push_const(Value::str("x")).unwrap();
            b.push_const(Value::Int(1)).unwrap();
            b.push_const(Value::str("y")).unwrap();
            b.push_const(Value::Int(2)).unwrap();
        },
        0,
        2,
    );
    let result = vm.evaluate(chunk).unwrap();
    assert_eq!(result.as_str(), Some("x,y"));
}

#[test]
fn caster_mismatch_reports_expected_and_got() {
    let mut vm = vm_with_math();
    let chunk = call_chunk(
        "add",
        |b| {
            b.push_const(Value::str("nope")).unwrap();
        },
        1,
        0,
    );
    let err = vm.evaluate(chunk).unwrap_err();
    assert!(err.message.contains("expected int, got <str: nope>"));
}

#[test]
fn registration_rejects_incoherent_named_spec() {
    let mut vm = test_vm();
    let mut m = vm.module("bad");
    let err = m
        .def_with(
            "f",
            vec![param("only_one")],
            |_ctx: &mut NativeCtx<'_, '_>, _a: i64, _b: i64| -> RunResult<Value> {
                Ok(Value::Nil)
            },
        )
        .err()
        .expect("registration must fail");
    assert_eq!(err.kind, ErrorKind::Internal);
    assert!(err.message.contains("names 1 parameters"));
}

struct Counter {
    hits: Cell<i64>,
}

fn vm_with_counter() -> Vm {
    let mut vm = test_vm();
    let mut m = vm.module("m");
    let mut c = m.class::<Counter>("Counter");
    c.init_with(
        vec![param("start").default_value(Value::Int(0))],
        |_ctx: &mut NativeCtx<'_, '_>, start: i64| -> RunResult<Counter> {
            Ok(Counter { hits: Cell::new(start) })
        },
    )
    .unwrap();
    c.method(
        "incr",
        |_ctx: &mut NativeCtx<'_, '_>, this: Foreign<Counter>| -> RunResult<Value> {
            this.hits.set(this.hits.get() + 1);
            Ok(Value::Int(this.hits.get()))
        },
    )
    .unwrap();
    c.method_with(
        "add",
        vec![param("n")],
        |_ctx: &mut NativeCtx<'_, '_>, this: Foreign<Counter>, n: i64| -> RunResult<Value> {
            this.hits.set(this.hits.get() + n);
            Ok(Value::Int(this.hits.get()))
        },
    )
    .unwrap();
    vm
}

#[test]
fn native_class_construction_and_methods() {
    let mut vm = vm_with_counter();
    let mut b = ChunkBuilder::new();
    let m = b.add_const(Value::str("m")).unwrap();
    let counter = b.add_const(Value::str("Counter")).unwrap();
    let c = b.add_const(Value::str("c")).unwrap();
    let incr = b.add_const(Value::str("incr")).unwrap();

    b.emit(Instruction::LoadGlobal { name_index: m });
    b.emit(Instruction::GetField { name_index: counter });
    b.emit(Instruction::Call { nargs: 0, nkwargs: 0 });
    b.emit(Instruction::StoreGlobal { name_index: c });
    for _ in 0..2 {
        b.emit(Instruction::LoadGlobal { name_index: c });
        b.emit(Instruction::GetField { name_index: incr });
        b.emit(Instruction::Call { nargs: 0, nkwargs: 0 });
        b.emit(Instruction::Pop { count: 1 });
    }
    b.emit(Instruction::LoadGlobal { name_index: c });
    b.emit(Instruction::GetField { name_index: incr });
    b.emit(Instruction::Call { nargs: 0, nkwargs: 0 });
    b.emit(Instruction::Return);

    let result = vm.evaluate(b.build()).unwrap();
    assert!(matches!(result, Value::Int(3)));
}

#[test]
fn native_init_accepts_keyword_arguments() {
    let mut vm = vm_with_counter();
    let mut b = ChunkBuilder::new();
    let m = b.add_const(Value::str("m")).unwrap();
    let counter = b.add_const(Value::str("Counter")).unwrap();
    let add = b.add_const(Value::str("add")).unwrap();

    b.emit(Instruction::LoadGlobal { name_index: m });
    b.emit(Instruction::GetField { name_index: counter });
    b.push_const(Value::str("start")).unwrap();
    b.push_const(Value::Int(40)).unwrap();
    b.emit(Instruction::Call { nargs: 0, nkwargs: 1 });
    b.emit(Instruction::GetField { name_index: add });
    b.push_const(Value::str("n")).unwrap();
    b.push_const(Value::Int(2)).unwrap();
    b.emit(Instruction::Call { nargs: 0, nkwargs: 1 });
    b.emit(Instruction::Return);

    let result = vm.evaluate(b.build()).unwrap();
    assert!(matches!(result, Value::Int(42)));
}

#[test]
fn foreign_caster_rejects_wrong_class() {
    let mut vm = vm_with_counter();
    {
        let mut m = vm.module("other");
        let mut c = m.class::<String>("Name");
        c.init(|_ctx: &mut NativeCtx<'_, '_>| -> RunResult<String> { Ok("x".to_owned()) })
            .unwrap();
    }
    // Call Counter.incr with a Name instance as receiver via an unbound
    // class method fetched from the class object.
    let mut b = ChunkBuilder::new();
    let m = b.add_const(Value::str("m")).unwrap();
    let other = b.add_const(Value::str("other")).unwrap();
    let counter = b.add_const(Value::str("Counter")).unwrap();
    let name = b.add_const(Value::str("Name")).unwrap();
    let incr = b.add_const(Value::str("incr")).unwrap();

    b.emit(Instruction::LoadGlobal { name_index: m });
    b.emit(Instruction::GetField { name_index: counter });
    b.emit(Instruction::GetField { name_index: incr });
    b.emit(Instruction::LoadGlobal { name_index: other });
    b.emit(Instruction::GetField { name_index: name });
    b.emit(Instruction::Call { nargs: 0, nkwargs: 0 });
    b.emit(Instruction::Call { nargs: 1, nkwargs: 0 });
    b.emit(Instruction::Return);

    let err = vm.evaluate(b.build()).unwrap_err();
    assert!(err.message.contains("different foreign type"));
}

#[test]
fn natives_can_allocate_and_return_lists() {
    let mut vm = test_vm();
    vm.module("m")
        .def(
            "pair",
            |ctx: &mut NativeCtx<'_, '_>, a: Value, b: Value| -> RunResult<Value> {
                Ok(ctx.vm.alloc_list(vec![a, b]))
            },
        )
        .unwrap();
    let chunk = call_chunk(
        "pair",
        |b| {
            b.push_const(Value::Int(1)).unwrap();
            b.push_const(Value::str("two")).unwrap();
        },
        2,
        0,
    );
    let result = vm.evaluate(chunk).unwrap();
    let id = result.as_obj().unwrap();
    match vm.heap().get(id) {
        serilang::HeapData::List(l) => {
            assert!(matches!(l.items[0], Value::Int(1)));
            assert_eq!(l.items[1].as_str(), Some("two"));
        }
        other => panic!("expected list, got {other:?}"),
    }
}
