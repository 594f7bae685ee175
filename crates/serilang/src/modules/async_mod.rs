//! The built-in `async` module: `sleep`, `timeout`, `gather`, `race`.
//!
//! All four return a future. `sleep` resolves after a delay; `timeout`
//! forwards an awaitable's outcome but rejects first when its deadline
//! fires; `gather` resolves with every result in original order or rejects
//! on the first failure; `race` settles with the first settled awaitable.

use std::{
    cell::Cell,
    rc::Rc,
    time::Duration,
};

use crate::{
    binding::function::NativeCtx,
    error::{RunError, RunResult},
    object::{HeapData, List},
    promise::Waker,
    scheduler::TimerTask,
    value::Value,
    vm::Vm,
};

use crate::binding::spec::param;

/// Installs the `async` module.
pub(crate) fn install(vm: &mut Vm) -> RunResult<()> {
    let mut m = vm.module("async");
    m.def_with(
        "sleep",
        vec![param("msecs"), param("result").default_value(Value::Nil)],
        sleep,
    )?;
    m.def_with(
        "timeout",
        vec![param("awaitable"), param("timeout_ms")],
        timeout,
    )?;
    m.def_with("gather", vec![param("awaitables")], gather)?;
    m.def_with("race", vec![param("awaitables")], race)?;
    Ok(())
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// `sleep(msecs, result=nil)`: a future resolved to `result` after the
/// delay.
fn sleep(ctx: &mut NativeCtx<'_, '_>, ms: i64, result: Value) -> RunResult<Value> {
    let promise = ctx.vm.new_promise();
    promise.borrow_mut().add_root(&result);
    ctx.vm.schedule_after(
        TimerTask::Resolve { promise: Rc::downgrade(&promise), value: result },
        millis(ms),
    );
    Ok(ctx.vm.new_future(promise))
}

/// `timeout(awaitable, timeout_ms)`: forwards the awaitable's outcome, but
/// rejects with `"Timeout after <ms> ms"` if the deadline fires first. The
/// original work still completes; its result is discarded.
fn timeout(ctx: &mut NativeCtx<'_, '_>, awaited: Value, ms: i64) -> RunResult<Value> {
    let ms = ms.max(0);
    let promise = ctx.vm.new_promise();
    promise.borrow_mut().add_root(&awaited);
    ctx.vm.schedule_after(
        TimerTask::Reject {
            promise: Rc::downgrade(&promise),
            message: format!("Timeout after {ms} ms"),
        },
        millis(ms),
    );
    ctx.vm.await_value(&awaited, Waker::Forward(Rc::clone(&promise)));
    Ok(ctx.vm.new_future(promise))
}

fn awaitable_items(ctx: &NativeCtx<'_, '_>, name: &str, list: &Value) -> RunResult<Vec<Value>> {
    match list.as_obj().map(|id| ctx.vm.heap().get(id)) {
        Some(HeapData::List(l)) => Ok(l.items.clone()),
        _ => Err(RunError::type_error(format!(
            "{name}() expects a list, got {}",
            list.fmt_desc(ctx.vm.heap())
        ))),
    }
}

/// `gather(list)`: resolves with the list of results in original order once
/// every awaitable succeeds; rejects on the first failure. An empty list
/// resolves immediately to an empty list.
fn gather(ctx: &mut NativeCtx<'_, '_>, awaitables: Value) -> RunResult<Value> {
    let items = awaitable_items(ctx, "gather", &awaitables)?;
    let promise = ctx.vm.new_promise();
    if items.is_empty() {
        let empty = ctx.vm.alloc(HeapData::List(List::default()));
        ctx.vm.settle(&promise, Ok(Value::Obj(empty)));
        return Ok(ctx.vm.new_future(promise));
    }

    let results = ctx.vm.alloc(HeapData::List(List {
        items: vec![Value::Nil; items.len()],
    }));
    promise.borrow_mut().add_root(&Value::Obj(results));
    let remaining = Rc::new(Cell::new(items.len()));
    for (index, awaited) in items.into_iter().enumerate() {
        ctx.vm.await_value(
            &awaited,
            Waker::GatherSlot {
                target: Rc::clone(&promise),
                results,
                index,
                remaining: Rc::clone(&remaining),
            },
        );
    }
    Ok(ctx.vm.new_future(promise))
}

/// `race(list)`: settles with the first settled awaitable's outcome. An
/// empty list resolves immediately to nil.
fn race(ctx: &mut NativeCtx<'_, '_>, awaitables: Value) -> RunResult<Value> {
    let items = awaitable_items(ctx, "race", &awaitables)?;
    let promise = ctx.vm.new_promise();
    if items.is_empty() {
        ctx.vm.settle(&promise, Ok(Value::Nil));
        return Ok(ctx.vm.new_future(promise));
    }
    for awaited in items {
        ctx.vm.await_value(&awaited, Waker::Forward(Rc::clone(&promise)));
    }
    Ok(ctx.vm.new_future(promise))
}
