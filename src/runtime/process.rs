//! `process` for the module scope
//!
//! A Node-shaped process object: environment, platform, timing,
//! `nextTick`, and `stdout`/`stderr` writers that go through the runner's
//! console gate.

use boa_engine::{Context, JsArgs, JsResult, JsValue, NativeFunction, js_string, object::ObjectInitializer, property::Attribute};
use std::time::Instant;

use super::{
    RunnerHandle, bind_native,
    console::{ConsoleLevel, ConsoleRecord},
    eval_glue,
};

const PROCESS_JS: &str = r#"
(function (native) {
    const listeners = new Map();
    const process = {
        env: native.env,
        argv: ["rspack-test-runner"],
        execArgv: [],
        platform: native.platform,
        arch: native.arch,
        pid: native.pid,
        version: "v20.0.0",
        versions: { node: "20.0.0" },
        release: { name: "node" },
        exitCode: undefined,
        cwd: native.cwd,
        uptime: native.uptime,
        hrtime(previous) {
            const ns = native.now();
            const seconds = Math.floor(ns / 1e9);
            const nanos = ns % 1e9;
            if (!previous) return [seconds, nanos];
            let ds = seconds - previous[0];
            let dn = nanos - previous[1];
            if (dn < 0) { ds -= 1; dn += 1e9; }
            return [ds, dn];
        },
        memoryUsage: () => ({ rss: 0, heapTotal: 0, heapUsed: 0, external: 0, arrayBuffers: 0 }),
        nextTick: (callback, ...args) => queueMicrotask(() => callback(...args)),
        emitWarning: (warning) => native.stderr(String(warning && warning.message ? warning.message : warning)),
        exit(code) {
            const error = new Error(`process.exit(${code === undefined ? 0 : code}) called`);
            error.code = "ERR_PROCESS_EXIT";
            throw error;
        },
        on(name, fn) { (listeners.get(name) || listeners.set(name, []).get(name)).push(fn); return process; },
        once(name, fn) { return process.on(name, fn); },
        off(name, fn) { listeners.set(name, (listeners.get(name) || []).filter((l) => l !== fn)); return process; },
        removeListener(name, fn) { return process.off(name, fn); },
        emit(name, ...args) { for (const fn of listeners.get(name) || []) fn(...args); return listeners.has(name); },
        stdout: { write: (chunk) => { native.stdout(String(chunk)); return true; }, isTTY: false },
        stderr: { write: (chunk) => { native.stderr(String(chunk)); return true; }, isTTY: false },
    };
    process.hrtime.bigint = () => BigInt(Math.floor(native.now()));
    return process;
})
"#;

fn write_chunk(handle: &RunnerHandle, level: ConsoleLevel, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let chunk = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    let (print, records) = {
        let state = handle.borrow();
        (state.options.print_logger, state.console.clone())
    };
    if print || level == ConsoleLevel::Error {
        match level {
            ConsoleLevel::Error => eprint!("{chunk}"),
            _ => print!("{chunk}"),
        }
    }
    records.borrow_mut().push(ConsoleRecord {
        level,
        message: chunk.trim_end_matches('\n').to_string(),
    });
    Ok(JsValue::undefined())
}

fn stdout_write(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    write_chunk(handle, ConsoleLevel::Log, args, context)
}

fn stderr_write(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    write_chunk(handle, ConsoleLevel::Error, args, context)
}

fn env_object(context: &mut Context) -> JsResult<JsValue> {
    let env = boa_engine::JsObject::with_object_proto(context.intrinsics());
    for (key, value) in std::env::vars() {
        env.set(js_string!(key), js_string!(value), false, context)?;
    }
    env.set(js_string!("NODE_ENV"), js_string!("test"), false, context)?;
    Ok(env.into())
}

/// Build the `process` object for one runner
pub(crate) fn create_process(handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let started = Instant::now();
    let platform = match std::env::consts::OS {
        "windows" => "win32",
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    let env = env_object(context)?;
    let stdout = bind_native(handle, stdout_write, context);
    let stderr = bind_native(handle, stderr_write, context);

    let native = ObjectInitializer::new(context)
        .property(js_string!("env"), env, Attribute::all())
        .property(js_string!("platform"), js_string!(platform), Attribute::all())
        .property(js_string!("arch"), js_string!(arch), Attribute::all())
        .property(js_string!("pid"), std::process::id(), Attribute::all())
        .property(js_string!("stdout"), stdout, Attribute::all())
        .property(js_string!("stderr"), stderr, Attribute::all())
        .function(
            NativeFunction::from_fn_ptr(|_, _, _| {
                let cwd = std::env::current_dir().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
                Ok(js_string!(cwd).into())
            }),
            js_string!("cwd"),
            0,
        )
        .function(
            NativeFunction::from_copy_closure(move |_, _, _| Ok(started.elapsed().as_secs_f64().into())),
            js_string!("uptime"),
            0,
        )
        .function(
            NativeFunction::from_copy_closure(move |_, _, _| Ok((started.elapsed().as_nanos() as f64).into())),
            js_string!("now"),
            0,
        )
        .build();
    eval_glue("runner:process", PROCESS_JS, &[native.into()], context)
}
