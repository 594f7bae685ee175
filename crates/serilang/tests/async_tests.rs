//! Async primitive tests driven on virtual time.
//!
//! Every test uses a `VirtualPoller`, so "sleeping" advances a virtual
//! clock inside the scheduler instead of blocking the test thread.

use serilang::{
    ChunkBuilder, CollectConsole, ErrorKind, HeapData, Instruction, NoopTracer, OpCode, Value,
    VirtualPoller, Vm, VmOptions,
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

/// Emits `async.<member>` onto the stack.
fn load_async_member(b: &mut ChunkBuilder, member: &str) {
    let async_name = b.add_const(Value::str("async")).unwrap();
    let member_name = b.add_const(Value::str(member)).unwrap();
    b.emit(Instruction::LoadGlobal { name_index: async_name });
    b.emit(Instruction::GetField { name_index: member_name });
}

/// Emits `async.sleep(ms, result)` leaving the future on the stack.
fn emit_sleep(b: &mut ChunkBuilder, ms: i64, result: Value) {
    load_async_member(b, "sleep");
    b.push_const(Value::Int(ms)).unwrap();
    b.push_const(result).unwrap();
    b.emit(Instruction::Call { nargs: 2, nkwargs: 0 });
}

#[test]
fn sleep_resolves_to_its_result() {
    let mut b = ChunkBuilder::new();
    emit_sleep(&mut b, 10, Value::str("done"));
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);
    let result = test_vm().evaluate(b.build()).unwrap();
    assert_eq!(result.as_str(), Some("done"));
}

#[test]
fn sleep_default_result_is_nil() {
    let mut b = ChunkBuilder::new();
    load_async_member(&mut b, "sleep");
    b.push_const(Value::Int(5)).unwrap();
    b.emit(Instruction::Call { nargs: 1, nkwargs: 0 });
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);
    let result = test_vm().evaluate(b.build()).unwrap();
    assert!(matches!(result, Value::Nil));
}

#[test]
fn gather_preserves_original_order() {
    // Futures complete out of order (10ms, 20ms, 30ms) but the results
    // keep their pre-assigned positions.
    let mut b = ChunkBuilder::new();
    load_async_member(&mut b, "gather");
    emit_sleep(&mut b, 30, Value::Int(1));
    emit_sleep(&mut b, 10, Value::Int(2));
    emit_sleep(&mut b, 20, Value::Int(3));
    b.emit(Instruction::MakeList { nelems: 3 });
    b.emit(Instruction::Call { nargs: 1, nkwargs: 0 });
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);

    let mut vm = test_vm();
    let result = vm.evaluate(b.build()).unwrap();
    let id = result.as_obj().expect("gather resolves to a list");
    match vm.heap().get(id) {
        HeapData::List(l) => {
            assert_eq!(l.items.len(), 3);
            assert!(matches!(l.items[0], Value::Int(1)));
            assert!(matches!(l.items[1], Value::Int(2)));
            assert!(matches!(l.items[2], Value::Int(3)));
        }
        other => panic!("expected list, got {other:?}"),
    }
}

#[test]
fn gather_of_empty_list_resolves_immediately() {
    let mut b = ChunkBuilder::new();
    load_async_member(&mut b, "gather");
    b.emit(Instruction::MakeList { nelems: 0 });
    b.emit(Instruction::Call { nargs: 1, nkwargs: 0 });
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);

    let mut vm = test_vm();
    let result = vm.evaluate(b.build()).unwrap();
    let id = result.as_obj().expect("gather resolves to a list");
    match vm.heap().get(id) {
        HeapData::List(l) => assert!(l.items.is_empty()),
        other => panic!("expected list, got {other:?}"),
    }
}

#[test]
fn gather_accepts_already_settled_values() {
    // Plain values in the list deliver synchronously.
    let mut b = ChunkBuilder::new();
    load_async_member(&mut b, "gather");
    b.push_const(Value::Int(4)).unwrap();
    emit_sleep(&mut b, 5, Value::Int(5));
    b.emit(Instruction::MakeList { nelems: 2 });
    b.emit(Instruction::Call { nargs: 1, nkwargs: 0 });
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);

    let mut vm = test_vm();
    let result = vm.evaluate(b.build()).unwrap();
    let id = result.as_obj().unwrap();
    match vm.heap().get(id) {
        HeapData::List(l) => {
            assert!(matches!(l.items[0], Value::Int(4)));
            assert!(matches!(l.items[1], Value::Int(5)));
        }
        other => panic!("expected list, got {other:?}"),
    }
}

#[test]
fn race_settles_with_the_first_winner() {
    let mut b = ChunkBuilder::new();
    load_async_member(&mut b, "race");
    emit_sleep(&mut b, 5, Value::str("a"));
    emit_sleep(&mut b, 10, Value::str("b"));
    b.emit(Instruction::MakeList { nelems: 2 });
    b.emit(Instruction::Call { nargs: 1, nkwargs: 0 });
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);
    let result = test_vm().evaluate(b.build()).unwrap();
    assert_eq!(result.as_str(), Some("a"));
}

#[test]
fn race_of_empty_list_resolves_to_nil() {
    let mut b = ChunkBuilder::new();
    load_async_member(&mut b, "race");
    b.emit(Instruction::MakeList { nelems: 0 });
    b.emit(Instruction::Call { nargs: 1, nkwargs: 0 });
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);
    let result = test_vm().evaluate(b.build()).unwrap();
    assert!(matches!(result, Value::Nil));
}

#[test]
fn timeout_rejects_with_its_message() {
    let mut b = ChunkBuilder::new();
    load_async_member(&mut b, "timeout");
    emit_sleep(&mut b, 20, Value::str("ok"));
    b.push_const(Value::Int(5)).unwrap();
    b.emit(Instruction::Call { nargs: 2, nkwargs: 0 });
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);

    let err = test_vm().evaluate(b.build()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.message, "Timeout after 5 ms");
}

#[test]
fn timeout_forwards_a_fast_result() {
    let mut b = ChunkBuilder::new();
    load_async_member(&mut b, "timeout");
    emit_sleep(&mut b, 5, Value::str("fast"));
    b.push_const(Value::Int(50)).unwrap();
    b.emit(Instruction::Call { nargs: 2, nkwargs: 0 });
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);
    let result = test_vm().evaluate(b.build()).unwrap();
    assert_eq!(result.as_str(), Some("fast"));
}

#[test]
fn timeout_rejection_is_catchable() {
    let mut b = ChunkBuilder::new();
    let handler = b.emit_jump(OpCode::TryBegin).unwrap();
    load_async_member(&mut b, "timeout");
    emit_sleep(&mut b, 20, Value::str("ok"));
    b.push_const(Value::Int(5)).unwrap();
    b.emit(Instruction::Call { nargs: 2, nkwargs: 0 });
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);
    b.patch_jump(handler).unwrap();
    // Handler receives the rejection message as the thrown value.
    b.emit(Instruction::Return);

    let result = test_vm().evaluate(b.build()).unwrap();
    assert_eq!(result.as_str(), Some("Timeout after 5 ms"));
}

#[test]
fn gather_rejects_on_first_failure() {
    // gather([timeout(sleep(30, "slow"), 5), sleep(10, "ok")]) rejects with
    // the timeout message.
    let mut b = ChunkBuilder::new();
    load_async_member(&mut b, "gather");
    load_async_member(&mut b, "timeout");
    emit_sleep(&mut b, 30, Value::str("slow"));
    b.push_const(Value::Int(5)).unwrap();
    b.emit(Instruction::Call { nargs: 2, nkwargs: 0 });
    emit_sleep(&mut b, 10, Value::str("ok"));
    b.emit(Instruction::MakeList { nelems: 2 });
    b.emit(Instruction::Call { nargs: 1, nkwargs: 0 });
    b.emit(Instruction::Await);
    b.emit(Instruction::Return);

    let err = test_vm().evaluate(b.build()).unwrap_err();
    assert_eq!(err.message, "Timeout after 5 ms");
}

#[test]
fn awaiting_a_settled_future_twice_reuses_the_outcome() {
    // Await the same future from two points in the program: the second
    // await sees the already-settled promise.
    let mut b = ChunkBuilder::new();
    let f = b.add_const(Value::str("f")).unwrap();
    emit_sleep(&mut b, 5, Value::Int(21));
    b.emit(Instruction::StoreGlobal { name_index: f });
    b.emit(Instruction::LoadGlobal { name_index: f });
    b.emit(Instruction::Await);
    b.emit(Instruction::LoadGlobal { name_index: f });
    b.emit(Instruction::Await);
    b.emit(Instruction::BinaryOp { op: serilang::BinaryOp::Add });
    b.emit(Instruction::Return);
    let result = test_vm().evaluate(b.build()).unwrap();
    assert!(matches!(result, Value::Int(42)));
}
