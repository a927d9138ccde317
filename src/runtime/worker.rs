//! Worker shim
//!
//! `new Worker(url)` does not spawn a thread. The worker entry is executed
//! inline, in a job queued at construction, as a fresh CommonJS module
//! (bypassing the require cache) whose `self`/`postMessage`/`close`/
//! `addEventListener` bindings are a per-worker scope object. Messages in
//! both directions are structured-cloned and delivered as microtasks.
//!
//! Key features:
//! - `new Worker(url | URL, options)` resolving fake origins and `file://`
//! - `worker.postMessage(data)` / `self.postMessage(data)`
//! - `worker.terminate()` / `self.close()`
//! - Events: message, error

use boa_engine::{Context, JsArgs, JsNativeError, JsObject, JsResult, JsValue, job::PromiseJob, js_string};
use std::path::PathBuf;

use super::{
    RunnerHandle, bind_native, eval_glue,
    requirer::{self, RequireContext},
    scope::ModuleScope,
};
use crate::resolver::{ModulePath, TEST_CASES_ORIGIN, url_to_relative_path};

const WORKER_JS: &str = r#"
(function (start) {
    function emit(target, type, event) {
        const handler = target["on" + type];
        if (typeof handler === "function") handler.call(target, event);
        const listeners = target._listeners[type];
        if (listeners) for (const fn of listeners.slice()) fn.call(target, event);
    }
    function listen(target) {
        target._listeners = {};
        target.addEventListener = function (type, fn) {
            if (!target._listeners[type]) target._listeners[type] = [];
            target._listeners[type].push(fn);
        };
        target.removeEventListener = function (type, fn) {
            const listeners = target._listeners[type] || [];
            target._listeners[type] = listeners.filter(function (l) { return l !== fn; });
        };
    }
    function deliver(target, data, worker) {
        const event = { data: structuredClone(data) };
        return function () {
            if (!worker._terminated) emit(target, "message", event);
        };
    }
    function workerScope(worker, name) {
        const scope = {
            name: name,
            onmessage: null,
            postMessage: function (data) {
                if (!worker._terminated) queueMicrotask(deliver(worker, data, worker));
            },
            close: function () { worker._terminated = true; },
        };
        listen(scope);
        return scope;
    }

    function Worker(url, options) {
        if (!(this instanceof Worker)) throw new TypeError("Worker constructor requires 'new'");
        const href = typeof url === "string" ? url : url && url.href !== undefined ? url.href : String(url);
        const worker = this;
        listen(this);
        this.onmessage = null;
        this.onerror = null;
        this._terminated = false;
        this._scope = workerScope(this, (options && options.name) || "");
        let started;
        this._started = new Promise(function (resolve) { started = resolve; });
        start(href, this._scope, function (error) {
            if (error !== undefined) emit(worker, "error", error);
            started();
        });
    }
    Worker.prototype.postMessage = function (data) {
        this._started.then(deliver(this._scope, data, this));
    };
    Worker.prototype.terminate = function () {
        this._terminated = true;
        return Promise.resolve(0);
    };
    Worker.prototype.ref = function () {};
    Worker.prototype.unref = function () {};
    return Worker;
})
"#;

/// Map a worker URL onto a dist path request
fn worker_request(href: &str) -> ModulePath {
    if href.starts_with(TEST_CASES_ORIGIN) {
        return ModulePath::Single(url_to_relative_path(href));
    }
    if let Ok(url) = url::Url::parse(href)
        && url.scheme() == "file"
        && let Ok(path) = url.to_file_path()
    {
        return ModulePath::Single(path.to_string_lossy().into_owned());
    }
    if href.starts_with('/') || href.starts_with("./") || href.starts_with("../") {
        return ModulePath::Single(href.to_string());
    }
    ModulePath::Single(format!("./{href}"))
}

/// Execute the worker entry as a fresh CommonJS module with the worker
/// scope overlaid on its bindings
fn run_worker(handle: &RunnerHandle, href: &str, scope_object: &JsObject, context: &mut Context) -> JsResult<()> {
    let dist: PathBuf = handle.borrow().options.dist.clone();
    let request = worker_request(href).without_query();
    tracing::debug!(url = %href, request = %request, "starting inline worker");
    let Some(file) = requirer::get_file(handle, &request, &dist, context)? else {
        return Err(JsNativeError::error()
            .with_message(format!("Cannot find worker script '{href}'"))
            .into());
    };

    let mut overlay = ModuleScope::new();
    overlay.set("self", scope_object.clone());
    for name in ["postMessage", "close", "addEventListener", "removeEventListener"] {
        overlay.set(name, scope_object.get(js_string!(name), context)?);
    }
    let require_context = RequireContext {
        file: Some(file),
        overlay: Some(overlay),
        ..RequireContext::default()
    };
    requirer::require(handle, &dist, request, require_context, context)?;
    Ok(())
}

/// `start(href, scope, done)`: queue the worker entry as a job of its own,
/// then report to `done` with `undefined` or the error it threw
fn start_worker(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let href = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    let scope_object = args
        .get_or_undefined(1)
        .as_object()
        .ok_or_else(|| JsNativeError::typ().with_message("worker scope must be an object"))?;
    let done = args
        .get_or_undefined(2)
        .as_callable()
        .ok_or_else(|| JsNativeError::typ().with_message("worker callback must be a function"))?;

    let handle = handle.clone();
    let job = PromiseJob::with_realm(
        move |context| {
            let outcome = match run_worker(&handle, &href, &scope_object, context) {
                Ok(()) => JsValue::undefined(),
                Err(error) => {
                    tracing::debug!(url = %href, "worker entry failed");
                    error.to_opaque(context)
                }
            };
            done.call(&JsValue::undefined(), &[outcome], context)
        },
        context.realm().clone(),
    );
    context.enqueue_job(job.into());
    Ok(JsValue::undefined())
}

/// Create the `Worker` constructor for one runner
pub(crate) fn create_worker_class(handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let start = bind_native(handle, start_worker, context);
    eval_glue("runner:worker", WORKER_JS, &[start.into()], context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RunnerOptions, runtime::Runner};
    use std::fs;

    #[test]
    fn test_worker_request_mapping() {
        assert_eq!(
            worker_request("https://test.cases/path/worker.js"),
            ModulePath::Single("./worker.js".to_string())
        );
        assert_eq!(
            worker_request("file:///dist/w.js"),
            ModulePath::Single("/dist/w.js".to_string())
        );
        assert_eq!(worker_request("w.js"), ModulePath::Single("./w.js".to_string()));
    }

    #[test]
    fn test_worker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("worker.js"),
            "self.onmessage = (e) => postMessage(e.data * 2);",
        )
        .unwrap();
        fs::write(
            dir.path().join("main.js"),
            r#"
            const worker = new Worker("https://test.cases/path/worker.js");
            module.exports = new Promise((resolve) => {
                worker.onmessage = (e) => { worker.terminate(); resolve(e.data); };
                worker.postMessage(21);
            });
            "#,
        )
        .unwrap();
        let mut runner = Runner::new(RunnerOptions::new("main", dir.path(), dir.path()).print_logger(false)).unwrap();
        let value = runner.run("main.js").unwrap();
        assert_eq!(value.as_number(), Some(42.0));
    }

    #[test]
    fn test_missing_worker_script_fires_error_event() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.js"),
            r#"
            const worker = new Worker("https://test.cases/path/absent.js");
            module.exports = new Promise((resolve) => {
                worker.addEventListener("error", (e) => resolve(String(e && e.message)));
            });
            "#,
        )
        .unwrap();
        let mut runner = Runner::new(RunnerOptions::new("main", dir.path(), dir.path()).print_logger(false)).unwrap();
        let value = runner.run("main.js").unwrap();
        let message = value.as_string().unwrap().to_std_string_escaped();
        assert!(message.contains("Cannot find worker script"), "{message}");
    }

    #[test]
    fn test_close_drops_pending_messages() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("worker.js"),
            "postMessage('first'); close(); postMessage('second');",
        )
        .unwrap();
        fs::write(
            dir.path().join("main.js"),
            r#"
            const worker = new Worker("https://test.cases/path/worker.js");
            const seen = [];
            worker.onmessage = (e) => seen.push(e.data);
            module.exports = new Promise((resolve) => setTimeout(() => resolve(seen.join(",")), 0));
            "#,
        )
        .unwrap();
        let mut runner = Runner::new(RunnerOptions::new("main", dir.path(), dir.path()).print_logger(false)).unwrap();
        let value = runner.run("main.js").unwrap();
        assert_eq!(value.as_string().unwrap().to_std_string_escaped(), "");
    }
}
