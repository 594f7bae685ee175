//! Global builtin functions: `print`, `input`, `time`, `import`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    binding::{
        caster::{KwArgs, VarArgs},
        function::NativeCtx,
    },
    error::RunResult,
    value::Value,
    vm::Vm,
};

/// Installs the builtins into the VM's builtin namespace.
pub(crate) fn install(vm: &mut Vm) -> RunResult<()> {
    vm.def_builtin("print", print)?;
    vm.def_builtin("input", |ctx: &mut NativeCtx<'_, '_>| -> RunResult<Value> {
        let line = ctx.vm.console_mut().stdin_read_line()?;
        Ok(Value::from(line))
    })?;
    vm.def_builtin("time", |_ctx: &mut NativeCtx<'_, '_>| -> RunResult<Value> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(Value::Int(secs as i64))
    })?;
    vm.def_builtin(
        "import",
        |ctx: &mut NativeCtx<'_, '_>, name: String| -> RunResult<Value> {
            ctx.vm.import_module(&name)
        },
    )?;
    Ok(())
}

/// `print(*args, sep=" ", end="\n", flush=false)`.
fn print(ctx: &mut NativeCtx<'_, '_>, args: VarArgs, kwargs: KwArgs) -> RunResult<Value> {
    let heap = ctx.vm.heap();
    let sep = match kwargs.0.get("sep") {
        Some(v) => v.fmt_str(heap),
        None => " ".to_owned(),
    };
    let end = match kwargs.0.get("end") {
        Some(v) => v.fmt_str(heap),
        None => "\n".to_owned(),
    };
    let flush = kwargs.0.get("flush").is_some_and(Value::is_truthy);

    let mut out = String::new();
    for (i, v) in args.0.iter().enumerate() {
        if i > 0 {
            out.push_str(&sep);
        }
        out.push_str(&v.fmt_str(heap));
    }
    out.push_str(&end);

    let console = ctx.vm.console_mut();
    console.stdout_write(&out)?;
    if flush {
        console.flush()?;
    }
    Ok(Value::Nil)
}
