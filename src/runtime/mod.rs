//! Sandboxed bundle runner powered by the Boa engine
//!
//! A [`Runner`] owns one Boa `Context` and executes the output of a test
//! build: CommonJS wrappers, ES modules, JSON files and mocked or built-in
//! host modules, all routed through one requirer dispatch. It provides:
//! - Per-module scopes with `require`/`module`/`exports` and shared base
//!   bindings (console, timers, process, Buffer, Worker, test env)
//! - ESM linking through a `ModuleLoader` that calls back into dispatch
//! - An event loop with unref'd timers that settles awaited values
//! - Relocation of errors onto the original file lines
//! - Optional DOM facsimile (web targets) and hot-update protocol
//!
//! Per-run state lives in [`RunnerState`] behind a `Gc<GcRefCell<_>>` that
//! every native function captures.

use boa_engine::{
    Context, JsError, JsNativeError, JsObject, JsResult, JsValue, NativeFunction, Source,
    builtins::promise::PromiseState,
    context::ContextBuilder,
    js_string,
    object::builtins::{JsArray, JsFunction, JsPromise},
    realm::Realm,
};
use boa_gc::{Finalize, Gc, GcRefCell, Trace};
use std::{
    cell::RefCell,
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
    time::{Duration, Instant},
};
use thiserror::Error;

pub(crate) mod buffer;
pub(crate) mod builtins;
pub(crate) mod cjs;
pub mod console;
pub mod dom;
pub(crate) mod esm;
pub mod expectation;
pub mod hot;
pub(crate) mod miss;
pub mod needs;
pub(crate) mod process;
pub(crate) mod realm;
pub mod relocate;
pub(crate) mod requirer;
pub mod scope;
pub mod test_env;
pub(crate) mod test_config;
pub(crate) mod timers;
pub(crate) mod worker;

use crate::config::{ConfigError, RunnerEnvironment, RunnerOptions};
use crate::resolver::{FileResolver, ModulePath, PackageResolver, ResolveError, TEST_CASES_ORIGIN};
use console::{ConsoleRecord, ConsoleRecords};
use dom::DomState;
use esm::{EsmRecord, RunnerModuleLoader};
use hot::HotSession;
use relocate::OffsetTable;
use requirer::RequireContext;
use scope::ModuleScope;
use test_config::JsTestConfig;
use test_env::{TestOutcome, TestRegistry};
use timers::TimerTable;

/// Errors that can occur while running bundles
#[derive(Error, Debug)]
pub enum RunnerError {
    /// An exception escaped sandboxed code; the message is relocated onto
    /// the original source when a location was recoverable
    #[error("{0}")]
    Js(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("awaited value never settled: no timers or event sources left to drive it")]
    Stalled,

    #[error("timed out after {0:?} waiting for an awaited value to settle")]
    Timeout(Duration),

    #[error("engine setup failed: {0}")]
    Setup(String),
}

/// Result type for runner operations
pub type RunnerResult<T> = Result<T, RunnerError>;

pub(crate) type RunnerHandle = Gc<GcRefCell<RunnerState>>;

/// Signature shared by native functions that capture the runner handle
pub(crate) type NativeFn = fn(&JsValue, &[JsValue], &RunnerHandle, &mut Context) -> JsResult<JsValue>;

/// Behaviour layered on top of the node runner (DOM facsimile, hot updates)
pub(crate) trait RunnerExtension {
    fn extend_base_scope(&self, _handle: &RunnerHandle, _scope: &mut ModuleScope, _context: &mut Context) -> JsResult<()> {
        Ok(())
    }

    fn extend_module_scope(
        &self,
        _handle: &RunnerHandle,
        _file: &crate::resolver::RunnerFile,
        _scope: &mut ModuleScope,
        _context: &mut Context,
    ) -> JsResult<()> {
        Ok(())
    }

    fn pre_execute(&self, _handle: &RunnerHandle, _file: &crate::resolver::RunnerFile, _context: &mut Context) -> JsResult<()> {
        Ok(())
    }

    fn post_execute(&self, _handle: &RunnerHandle, _file: &crate::resolver::RunnerFile, _context: &mut Context) -> JsResult<()> {
        Ok(())
    }

    /// Take over an entry the requirers cannot execute (e.g. an HTML page)
    fn run_entry(&self, _handle: &RunnerHandle, _request: &str, _context: &mut Context) -> JsResult<Option<JsValue>> {
        Ok(None)
    }

    /// Dispatch queued external events; `true` when something was delivered
    fn poll(&self, _handle: &RunnerHandle, _context: &mut Context) -> JsResult<bool> {
        Ok(false)
    }

    /// Whether external work (e.g. open event streams) may still deliver
    fn has_pending_work(&self, _handle: &RunnerHandle) -> bool {
        false
    }
}

/// Everything one runner instance mutates while executing
#[derive(Trace, Finalize)]
pub(crate) struct RunnerState {
    #[unsafe_ignore_trace]
    pub(crate) options: RunnerOptions,
    #[unsafe_ignore_trace]
    pub(crate) files: Rc<FileResolver>,
    #[unsafe_ignore_trace]
    pub(crate) packages: Rc<PackageResolver>,
    #[unsafe_ignore_trace]
    pub(crate) extensions: Rc<Vec<Rc<dyn RunnerExtension>>>,
    /// Offset tables of the module bodies currently on the JS stack
    #[unsafe_ignore_trace]
    pub(crate) executing: Vec<OffsetTable>,
    #[unsafe_ignore_trace]
    pub(crate) entry: Option<String>,
    #[unsafe_ignore_trace]
    pub(crate) hot: Option<Rc<RefCell<HotSession>>>,
    pub(crate) console: ConsoleRecords,
    pub(crate) helpers: Option<JsObject>,
    pub(crate) global_realm: Option<Realm>,
    pub(crate) esm_realm: Option<Realm>,
    pub(crate) base_scope: ModuleScope,
    pub(crate) require_cache: HashMap<String, JsObject>,
    pub(crate) esm_cache: HashMap<String, EsmRecord>,
    pub(crate) builtins: HashMap<String, JsValue>,
    pub(crate) timers: TimerTable,
    pub(crate) tests: TestRegistry,
    pub(crate) js_config: JsTestConfig,
    pub(crate) dom: Option<DomState>,
}

impl RunnerState {
    fn new(options: RunnerOptions, extensions: Vec<Rc<dyn RunnerExtension>>) -> Self {
        Self {
            files: Rc::new(FileResolver::new(options.cachable)),
            packages: Rc::new(PackageResolver::new()),
            extensions: Rc::new(extensions),
            executing: Vec::new(),
            entry: None,
            hot: None,
            console: Gc::new(GcRefCell::new(Vec::new())),
            helpers: None,
            global_realm: None,
            esm_realm: None,
            base_scope: ModuleScope::new(),
            require_cache: HashMap::new(),
            esm_cache: HashMap::new(),
            builtins: HashMap::new(),
            timers: TimerTable::default(),
            tests: TestRegistry::default(),
            js_config: JsTestConfig::default(),
            dom: None,
            options,
        }
    }
}

/// Wrap a native function that captures the runner handle
pub(crate) fn bind_native(handle: &RunnerHandle, f: NativeFn, context: &mut Context) -> JsFunction {
    NativeFunction::from_copy_closure_with_captures(f, handle.clone()).to_js_function(context.realm())
}

/// Look up one of the JS glue helpers installed at startup
pub(crate) fn helper(handle: &RunnerHandle, name: &str, context: &mut Context) -> JsResult<JsValue> {
    let helpers = handle
        .borrow()
        .helpers
        .clone()
        .ok_or_else(|| JsNativeError::error().with_message("runner helpers are not installed"))?;
    helpers.get(js_string!(name), context)
}

/// Call a JS helper by name with `undefined` as `this`
pub(crate) fn call_helper(handle: &RunnerHandle, name: &str, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let function = helper(handle, name, context)?;
    let function = function
        .as_callable()
        .map(|f| f.clone())
        .ok_or_else(|| JsNativeError::typ().with_message(format!("helper '{name}' is not callable")))?;
    function.call(&JsValue::undefined(), args, context)
}

/// Call a user-supplied hook function
pub(crate) fn call_hook(hook: &JsObject, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    hook.call(&JsValue::undefined(), args, context)
}

/// `Object.keys(object)` as Rust strings
pub(crate) fn object_keys(object: &JsObject, context: &mut Context) -> JsResult<Vec<String>> {
    let object_ctor = context.global_object().get(js_string!("Object"), context)?;
    let keys_fn = object_ctor
        .as_object()
        .map(|o| o.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("Object is not available"))?
        .get(js_string!("keys"), context)?;
    let keys_fn = keys_fn
        .as_callable()
        .map(|f| f.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("Object.keys is not callable"))?;
    let keys = keys_fn.call(&JsValue::undefined(), &[object.clone().into()], context)?;
    array_to_strings(&keys, context)
}

/// Convert a JS array of values to Rust strings
pub(crate) fn array_to_strings(value: &JsValue, context: &mut Context) -> JsResult<Vec<String>> {
    let Some(object) = value.as_object().map(|o| o.clone()) else {
        return Ok(Vec::new());
    };
    let array = JsArray::from_object(object)?;
    let length = array.length(context)?;
    let mut out = Vec::with_capacity(length as usize);
    for index in 0..length {
        let item = array.get(index as u32, context)?;
        out.push(item.to_string(context)?.to_std_string_escaped());
    }
    Ok(out)
}

/// Build an `Error` carrying a Node-style `code`
pub(crate) fn error_with_code(message: impl Into<String>, code: &str, context: &mut Context) -> JsError {
    let error = JsError::from(JsNativeError::error().with_message(message.into()));
    let value = error.to_opaque(context);
    if let Some(object) = value.as_object() {
        let _ = object.set(js_string!("code"), js_string!(code), false, context);
    }
    JsError::from_opaque(value)
}

/// Evaluate a glue script that evaluates to a function and call it with `args`
pub(crate) fn eval_glue(name: &str, code: &str, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let source = Source::from_bytes(code.as_bytes()).with_path(Path::new(name));
    let function = context.eval(source)?;
    let function = function
        .as_callable()
        .map(|f| f.clone())
        .ok_or_else(|| JsNativeError::typ().with_message(format!("{name} did not evaluate to a function")))?;
    function.call(&JsValue::undefined(), args, context)
}

const HELPERS_JS: &str = r#"
(function (host) {
    const isNamespace = (v) => v !== null && typeof v === "object" && v[Symbol.toStringTag] === "Module";
    const isThenable = (v) =>
        v !== null && (typeof v === "object" || typeof v === "function") && typeof v.then === "function";
    return {
        keys: (o) => Object.keys(o),
        nsObj: (m) => {
            Object.defineProperty(m, Symbol.toStringTag, { value: "Module" });
            return m;
        },
        isNamespace,
        isThenable,
        toPromise: (v) => Promise.resolve(v),
        esmResult: (p, ns) =>
            p.then(() => {
                const n = ns();
                return isThenable(n.default) ? n.default : n;
            }),
        esmNamespace: (p, ns) => p.then(() => ns()),
        esmEntryResult: (p, ns) =>
            p.then(() => {
                const n = ns();
                if (!isThenable(n.default)) return n;
                return Promise.resolve(n.default).then((v) => (isNamespace(v) && "default" in v ? v.default : v));
            }),
        invoke: (fn, thisArg) => {
            if (fn.length === 0) return fn.call(thisArg);
            let done;
            const finished = new Promise((resolve, reject) => {
                done = (err) => (err ? reject(err) : resolve());
            });
            fn.call(thisArg, done);
            return finished;
        },
        stats: host.stats,
    };
})
"#;

fn stats_native(_this: &JsValue, _args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let stats = handle.borrow().options.stats.clone();
    match stats.and_then(|stats| stats()) {
        Some(json) => JsValue::from_json(&json, context),
        None => Ok(JsValue::undefined()),
    }
}

/// A sandboxed execution environment for one compiled test output
pub struct Runner {
    context: Context,
    handle: RunnerHandle,
}

impl Runner {
    /// Create a runner for the given options. Web environments get the DOM
    /// facsimile layered on top.
    pub fn new(options: RunnerOptions) -> RunnerResult<Self> {
        let mut extensions: Vec<Rc<dyn RunnerExtension>> = Vec::new();
        if let RunnerEnvironment::Web(mode) = options.environment {
            extensions.push(Rc::new(dom::WebExtension::new(mode)));
        }
        Self::with_extensions(options, extensions)
    }

    /// Create a runner whose module scopes carry the `NEXT*` hot bindings
    /// of `session`
    pub fn with_hot_session(options: RunnerOptions, session: Rc<RefCell<HotSession>>) -> RunnerResult<Self> {
        let mut extensions: Vec<Rc<dyn RunnerExtension>> = Vec::new();
        if let RunnerEnvironment::Web(mode) = options.environment {
            extensions.push(Rc::new(dom::WebExtension::new(mode)));
        }
        extensions.push(Rc::new(hot::HotExtension));
        let runner = Self::with_extensions(options, extensions)?;
        runner.handle.borrow_mut().hot = Some(session);
        Ok(runner)
    }

    pub(crate) fn with_extensions(options: RunnerOptions, extensions: Vec<Rc<dyn RunnerExtension>>) -> RunnerResult<Self> {
        tracing::debug!(name = %options.name, dist = %options.dist.display(), "creating runner");
        let handle: RunnerHandle = Gc::new(GcRefCell::new(RunnerState::new(options, extensions)));
        let loader = Rc::new(RunnerModuleLoader::new(handle.clone()));
        let mut context = ContextBuilder::default()
            .module_loader(loader)
            .build()
            .map_err(|e| RunnerError::Setup(e.to_string()))?;

        // Bundled test output can nest deeply (large module graphs, recursion tests)
        context.runtime_limits_mut().set_recursion_limit(16384);
        context.runtime_limits_mut().set_stack_size_limit(1024 * 1024);

        realm::install_globals(&handle, &mut context).map_err(|e| RunnerError::Setup(e.to_string()))?;

        let host = JsObject::with_object_proto(context.intrinsics());
        let stats = bind_native(&handle, stats_native, &mut context);
        host.set(js_string!("stats"), stats, false, &mut context)
            .map_err(|e| RunnerError::Setup(e.to_string()))?;
        let helpers = eval_glue("runner:helpers", HELPERS_JS, &[host.into()], &mut context)
            .map_err(|e| RunnerError::Setup(e.to_string()))?;
        handle.borrow_mut().helpers = helpers.as_object().map(|o| o.clone());

        let mut runner = Self { context, handle };
        test_config::load(&runner.handle, &mut runner.context).map_err(|e| runner.failure(e, None))?;
        Ok(runner)
    }

    /// Runner name, used for ESM identifiers
    pub fn name(&self) -> String {
        self.handle.borrow().options.name.clone()
    }

    pub fn dist(&self) -> PathBuf {
        self.handle.borrow().options.dist.clone()
    }

    /// Effective case settings, including overrides from `test.config.js`
    pub fn test_config(&self) -> crate::config::TestConfig {
        self.handle.borrow().options.test_config.clone()
    }

    /// Execute an entry bundle and wait for its result to settle
    pub fn run(&mut self, file: &str) -> RunnerResult<JsValue> {
        let request = if file.starts_with("./") || file.starts_with(TEST_CASES_ORIGIN) {
            file.to_string()
        } else {
            format!("./{file}")
        };
        tracing::debug!(runner = %self.name(), entry = %request, "run");
        self.prepare_run()?;
        self.handle.borrow_mut().entry = Some(request.clone());

        let extensions = self.handle.borrow().extensions.clone();
        for extension in extensions.iter() {
            let taken = extension
                .run_entry(&self.handle, &request, &mut self.context)
                .map_err(|e| self.failure(e, None))?;
            if let Some(value) = taken {
                return self.settle(value, None);
            }
        }

        let dist = self.dist();
        let context = RequireContext {
            entry: true,
            ..RequireContext::default()
        };
        let required = requirer::require(
            &self.handle,
            &dist,
            ModulePath::from(request).without_query(),
            context,
            &mut self.context,
        )
        .and_then(|r| r.into_value(&mut self.context))
        .map_err(|e| self.failure(e, None))?;
        self.settle(required, None)
    }

    /// Execute several entries in order, returning the last result
    pub fn run_all(&mut self, files: &[String]) -> RunnerResult<JsValue> {
        let mut last = JsValue::undefined();
        for file in files {
            last = self.run(file)?;
        }
        Ok(last)
    }

    /// Require a module from `directory` without waiting on its result
    pub fn require(&mut self, directory: &Path, module_path: impl Into<ModulePath>) -> RunnerResult<JsValue> {
        self.prepare_if_needed()?;
        let module_path = module_path.into().without_query();
        requirer::require(
            &self.handle,
            directory,
            module_path,
            RequireContext::default(),
            &mut self.context,
        )
        .and_then(|r| r.into_value(&mut self.context))
        .map_err(|e| self.failure(e, None))
    }

    /// The runner's `(directory, modulePath)` require as a JS function
    pub fn get_require(&mut self) -> RunnerResult<JsFunction> {
        self.prepare_if_needed()?;
        Ok(requirer::create_runner_require(&self.handle, &mut self.context))
    }

    /// Read a property of the global context, `None` before the first run
    pub fn get_global(&mut self, name: &str) -> Option<JsValue> {
        let realm = self.handle.borrow().global_realm.clone()?;
        realm::with_realm(&mut self.context, &realm, |context| {
            context.global_object().get(js_string!(name), context).ok()
        })
    }

    /// Execute every registered test in order; a failure does not stop the rest
    pub fn run_tests(&mut self) -> RunnerResult<Vec<TestOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            let next = self.handle.borrow_mut().tests.next_test();
            let Some(test) = next else {
                break;
            };
            let started = Instant::now();
            let (before, after) = self.handle.borrow().tests.hooks();

            let mut result = Ok(());
            for hook in &before {
                result = self.invoke(hook, test.origin.as_ref());
                if result.is_err() {
                    break;
                }
            }
            if result.is_ok() {
                result = self.invoke(&test.func, test.origin.as_ref());
            }
            for hook in &after {
                let after_result = self.invoke(hook, test.origin.as_ref());
                if result.is_ok() {
                    result = after_result;
                }
            }

            let outcome = TestOutcome {
                name: test.name.clone(),
                passed: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                duration: started.elapsed(),
            };
            tracing::debug!(test = %outcome.name, passed = outcome.passed, "test finished");
            outcomes.push(outcome);
        }
        self.handle.borrow_mut().tests.record(&outcomes);
        Ok(outcomes)
    }

    /// Number of tests registered so far, including finished ones
    pub fn registered_tests(&self) -> usize {
        self.handle.borrow().tests.registered()
    }

    /// Outcomes of every test run so far
    pub fn test_outcomes(&self) -> Vec<TestOutcome> {
        self.handle.borrow().tests.outcomes().to_vec()
    }

    /// Everything sandboxed code printed through `console`
    pub fn console(&self) -> Vec<ConsoleRecord> {
        let records = self.handle.borrow().console.clone();
        let records = records.borrow().clone();
        records
    }

    /// Ask `test.config.js` `findBundle(index, options)` which files to run
    pub fn find_bundle(&mut self, index: usize) -> RunnerResult<Option<Vec<String>>> {
        let hook = self.handle.borrow().js_config.find_bundle.clone();
        let Some(hook) = hook else {
            return Ok(None);
        };
        let options = self.handle.borrow().options.compiler_options.to_value();
        let result = JsValue::from_json(&options, &mut self.context)
            .and_then(|options| call_hook(&hook, &[JsValue::from(index as u32), options], &mut self.context))
            .map_err(|e| self.failure(e, None))?;
        if result.is_undefined() || result.is_null() {
            return Ok(None);
        }
        if result.is_string() {
            let file = result
                .to_string(&mut self.context)
                .map_err(|e| self.failure(e, None))?
                .to_std_string_escaped();
            return Ok(Some(vec![file]));
        }
        array_to_strings(&result, &mut self.context)
            .map(Some)
            .map_err(|e| self.failure(e, None))
    }

    /// Settle a value: thenables are driven by the event loop until they
    /// fulfil or reject, plain values are returned as is
    pub fn settle_value(&mut self, value: JsValue) -> RunnerResult<JsValue> {
        self.settle(value, None)
    }

    /// JSON view of a value (`None` for undefined/functions)
    pub fn to_json(&mut self, value: &JsValue) -> Option<serde_json::Value> {
        value.to_json(&mut self.context).ok().flatten()
    }

    /// Convert a JsValue to a displayable string
    pub fn display(&mut self, value: &JsValue) -> String {
        value
            .to_string(&mut self.context)
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_else(|_| "[error converting value]".to_string())
    }

    /// Get mutable reference to the underlying context
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    fn prepare_if_needed(&mut self) -> RunnerResult<()> {
        if self.handle.borrow().global_realm.is_none() {
            self.prepare_run()?;
        }
        Ok(())
    }

    /// GlobalContext, base scope and scope hooks for a `run()`
    fn prepare_run(&mut self) -> RunnerResult<()> {
        let handle = self.handle.clone();
        let result = (|| {
            realm::global_realm(&handle, &mut self.context)?;
            let mut base = scope::create_base_scope(&handle, &mut self.context)?;
            scope::apply_scope_hooks(&handle, &mut base, &mut self.context)?;
            handle.borrow_mut().base_scope = base;
            realm::refresh_esm_realm(&handle, &mut self.context)
        })();
        result.map_err(|e| self.failure(e, None))
    }

    /// Synchronous throws escape the helper so their backtrace is kept
    fn invoke(&mut self, function: &JsObject, origin: Option<&OffsetTable>) -> RunnerResult<()> {
        let promise = call_helper(&self.handle, "invoke", &[function.clone().into()], &mut self.context)
            .map_err(|e| self.failure(e, origin))?;
        self.settle(promise, origin).map(|_| ())
    }

    fn to_promise(&mut self, value: JsValue) -> RunnerResult<JsPromise> {
        let promise = call_helper(&self.handle, "toPromise", &[value], &mut self.context)
            .map_err(|e| self.failure(e, None))?;
        let object = promise
            .as_object()
            .map(|o| o.clone())
            .ok_or_else(|| RunnerError::Js("Promise.resolve did not return an object".to_string()))?;
        JsPromise::from_object(object).map_err(|e| self.failure(e, None))
    }

    /// Drive jobs, timers and extension events until `value` settles
    fn settle(&mut self, value: JsValue, origin: Option<&OffsetTable>) -> RunnerResult<JsValue> {
        let promise = self.to_promise(value)?;
        let timeout = self.handle.borrow().options.test_config.timeout();
        let started = Instant::now();

        loop {
            self.context.run_jobs().map_err(|e| self.failure(e, origin))?;

            match promise.state() {
                PromiseState::Fulfilled(value) => return Ok(value),
                PromiseState::Rejected(reason) => return Err(self.failure(JsError::from_opaque(reason), origin)),
                PromiseState::Pending => {}
            }

            let elapsed = started.elapsed();
            if elapsed > timeout {
                return Err(RunnerError::Timeout(timeout));
            }

            if self.poll_extensions()? {
                continue;
            }

            let next = self.handle.borrow_mut().timers.next_deadline();
            match next {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        let remaining = timeout.saturating_sub(elapsed);
                        std::thread::sleep((deadline - now).min(remaining).min(self.poll_interval()));
                        continue;
                    }
                    let due = self.handle.borrow_mut().timers.take_due(now);
                    if let Some(due) = due {
                        due.callback
                            .call(&JsValue::undefined(), &due.args, &mut self.context)
                            .map_err(|e| self.failure(e, None))?;
                    }
                }
                None if self.extensions_pending() => std::thread::sleep(Duration::from_millis(5)),
                None => return Err(RunnerError::Stalled),
            }
        }
    }

    /// Upper bound on a single sleep while extensions may deliver events
    fn poll_interval(&self) -> Duration {
        if self.extensions_pending() {
            Duration::from_millis(5)
        } else {
            Duration::MAX
        }
    }

    fn poll_extensions(&mut self) -> RunnerResult<bool> {
        let extensions = self.handle.borrow().extensions.clone();
        let mut delivered = false;
        for extension in extensions.iter() {
            delivered |= extension
                .poll(&self.handle, &mut self.context)
                .map_err(|e| self.failure(e, None))?;
        }
        Ok(delivered)
    }

    fn extensions_pending(&self) -> bool {
        let extensions = self.handle.borrow().extensions.clone();
        extensions.iter().any(|e| e.has_pending_work(&self.handle))
    }

    /// Turn a JS exception into a relocated runner error
    fn failure(&mut self, error: JsError, origin: Option<&OffsetTable>) -> RunnerError {
        let error = match origin {
            Some(table) => relocate::relocate_error(error, table, &mut self.context),
            None => error,
        };
        RunnerError::Js(relocate::describe_error(&error, &mut self.context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompilerOptions, TestConfig, TestConfigHooks};
    use std::fs;

    fn runner_for(dir: &Path) -> Runner {
        Runner::new(RunnerOptions::new("main", dir, dir).print_logger(false)).unwrap()
    }

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_runner_creation() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Runner::new(RunnerOptions::new("main", dir.path(), dir.path())).is_ok());
    }

    #[test]
    fn test_cjs_exports_value() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "module.exports = 42;");
        let mut runner = runner_for(dir.path());
        let value = runner.run("main.js").unwrap();
        assert_eq!(value.as_number(), Some(42.0));
    }

    #[test]
    fn test_cjs_module_evaluates_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "counter.js", "globalThis.__count = (globalThis.__count || 0) + 1; module.exports = {};");
        write(
            dir.path(),
            "main.js",
            "require('./counter.js'); require('./counter.js'); module.exports = globalThis.__count;",
        );
        let mut runner = runner_for(dir.path());
        assert_eq!(runner.run("main.js").unwrap().as_number(), Some(1.0));
    }

    #[test]
    fn test_circular_require_sees_partial_exports() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.js", "exports.early = 1; const b = require('./b.js'); exports.fromB = b.sawEarly;");
        write(dir.path(), "b.js", "exports.sawEarly = require('./a.js').early;");
        let mut runner = runner_for(dir.path());
        let value = runner.run("a.js").unwrap();
        let json = runner.to_json(&value).unwrap();
        assert_eq!(json["fromB"], serde_json::json!(1));
    }

    #[test]
    fn test_json_require() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "data.json", r#"{"answer": 42}"#);
        write(dir.path(), "main.js", "module.exports = require('./data.json').answer;");
        let mut runner = runner_for(dir.path());
        assert_eq!(runner.run("main.js").unwrap().as_number(), Some(42.0));
    }

    #[test]
    fn test_query_suffix_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "module.exports = 'ok';");
        let mut runner = runner_for(dir.path());
        let value = runner.run("./main.js?v=3").unwrap();
        assert_eq!(runner.display(&value), "ok");
    }

    #[test]
    fn test_promise_export_is_awaited() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.js",
            "module.exports = new Promise((resolve) => setTimeout(() => resolve('late'), 5));",
        );
        let mut runner = runner_for(dir.path());
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "late");
    }

    #[test]
    fn test_never_settling_promise_is_stalled() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "module.exports = new Promise(() => {});");
        let mut runner = runner_for(dir.path());
        assert!(matches!(runner.run("main.js"), Err(RunnerError::Stalled)));
    }

    #[test]
    fn test_unref_timers_do_not_block() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.js",
            "setTimeout(() => { throw new Error('should not fire'); }, 60000); module.exports = 1;",
        );
        let mut runner = runner_for(dir.path());
        let started = Instant::now();
        assert_eq!(runner.run("main.js").unwrap().as_number(), Some(1.0));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_timeout_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.js",
            "module.exports = new Promise((resolve) => setTimeout(resolve, 10000));",
        );
        let config = TestConfig {
            timeout: Some(50),
            ..TestConfig::default()
        };
        let mut runner = Runner::new(RunnerOptions::new("main", dir.path(), dir.path()).test_config(config)).unwrap();
        assert!(matches!(runner.run("main.js"), Err(RunnerError::Timeout(_))));
    }

    const TEN_LINES: &str = "const l1 = 1;\nconst l2 = 2;\nconst l3 = 3;\nconst l4 = 4;\nthrow new Error('boom');\nconst l6 = 6;\nconst l7 = 7;\nconst l8 = 8;\nconst l9 = 9;\nconst l10 = 10;\n";

    fn assert_points_at_line_five(err: &str) {
        assert!(err.contains("boom"), "{err}");
        assert!(err.contains("index.js:5"), "{err}");
        assert!(err.contains("> 5 | throw new Error('boom');"), "{err}");
        for line in ["3 | const l3", "4 | const l4", "6 | const l6", "7 | const l7"] {
            assert!(err.contains(line), "missing {line:?} in {err}");
        }
        assert!(!err.contains("const l8"), "{err}");
    }

    #[test]
    fn test_error_is_relocated() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.js", TEN_LINES);
        let mut runner = runner_for(dir.path());
        let err = runner.run("index.js").unwrap_err().to_string();
        assert_points_at_line_five(&err);
    }

    #[test]
    fn test_error_is_relocated_in_new_context() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.js", TEN_LINES);
        let options = RunnerOptions::new("main", dir.path(), dir.path())
            .print_logger(false)
            .run_in_new_context(true);
        let mut runner = Runner::new(options).unwrap();
        let err = runner.run("index.js").unwrap_err().to_string();
        assert_points_at_line_five(&err);
    }

    #[test]
    fn test_nested_require_error_points_at_inner_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "inner.js", "const x = 1;\nnull.boom;\n");
        write(dir.path(), "main.js", "const a = 0;\nrequire('./inner.js');\n");
        let mut runner = runner_for(dir.path());
        let err = runner.run("main.js").unwrap_err().to_string();
        assert!(err.contains("TypeError"), "{err}");
        assert!(err.contains("inner.js:2"), "{err}");
        assert!(err.contains("> 2 | null.boom;"), "{err}");
        assert!(!err.contains("main.js:"), "{err}");
    }

    #[test]
    fn test_failing_require_keeps_partial_exports() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "partial.js", "exports.before = 1;\nthrow new Error('half way');\n");
        write(
            dir.path(),
            "main.js",
            "try { require('./partial.js'); } catch (e) {}\nmodule.exports = require('./partial.js').before;",
        );
        let mut runner = runner_for(dir.path());
        assert_eq!(runner.run("main.js").unwrap().as_number(), Some(1.0));
    }

    #[test]
    fn test_failing_test_is_relocated_and_siblings_pass() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.js",
            "it('first', () => {});\nit('broken', () => {\n  const v = 1;\n  throw new Error('in test');\n});\nit('last', () => {});\n",
        );
        let mut runner = runner_for(dir.path());
        runner.run("main.js").unwrap();
        let outcomes = runner.run_tests().unwrap();
        let passed: Vec<_> = outcomes.iter().map(|o| (o.name.as_str(), o.passed)).collect();
        assert_eq!(passed, vec![("first", true), ("broken", false), ("last", true)]);
        let err = outcomes[1].error.as_deref().unwrap();
        assert!(err.contains("in test"), "{err}");
        assert!(err.contains("main.js:4"), "{err}");
        assert!(err.contains("> 4 |   throw new Error('in test');"), "{err}");
    }

    fn esm_runner(dir: &Path) -> Runner {
        let config = TestConfig {
            esm: true,
            ..TestConfig::default()
        };
        Runner::new(RunnerOptions::new("main", dir, dir).print_logger(false).test_config(config)).unwrap()
    }

    #[test]
    fn test_esm_default_dynamic_import_is_unwrapped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "dep.mjs", "export default 42;");
        write(dir.path(), "index.mjs", "export default import('./dep.mjs');");
        let mut runner = esm_runner(dir.path());
        let value = runner.run("index.mjs").unwrap();
        assert_eq!(value.as_number(), Some(42.0));
    }

    #[test]
    fn test_esm_static_then_dynamic_import_evaluates_once() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "dep.mjs",
            "globalThis.__evals = (globalThis.__evals || 0) + 1;\nexport const y = 2;",
        );
        write(
            dir.path(),
            "index.mjs",
            "import * as a from './dep.mjs';\nexport default import('./dep.mjs').then((b) => [a === b, globalThis.__evals, b.y].join(','));",
        );
        let mut runner = esm_runner(dir.path());
        let value = runner.run("index.mjs").unwrap();
        assert_eq!(runner.display(&value), "true,1,2");
    }

    #[test]
    fn test_esm_dynamic_import_twice_shares_namespace() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "dep.mjs", "globalThis.__evals = (globalThis.__evals || 0) + 1;\nexport const y = 2;");
        write(
            dir.path(),
            "index.mjs",
            "export default Promise.all([import('./dep.mjs'), import('./dep.mjs')]).then(([a, b]) => [a === b, globalThis.__evals].join(','));",
        );
        let mut runner = esm_runner(dir.path());
        let value = runner.run("index.mjs").unwrap();
        assert_eq!(runner.display(&value), "true,1");
    }

    #[test]
    fn test_esm_imports_commonjs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "cjs.js", "module.exports = { v: 7 };");
        write(dir.path(), "index.mjs", "import cjs from './cjs.js';\nexport default 'v=' + cjs.v;");
        let mut runner = esm_runner(dir.path());
        let value = runner.run("index.mjs").unwrap();
        assert_eq!(runner.display(&value), "v=7");
    }

    #[test]
    fn test_syntax_error_points_at_original_line() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "const ok = 1;\nconst = ;\n");
        let mut runner = runner_for(dir.path());
        let err = runner.run("main.js").unwrap_err().to_string();
        assert!(err.contains("main.js:2"), "{err}");
        assert!(err.contains("> 2"), "{err}");
    }

    #[test]
    fn test_missing_module_has_code() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.js",
            "try { require('definitely-not-here'); } catch (e) { module.exports = e.code; }",
        );
        let mut runner = runner_for(dir.path());
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "MODULE_NOT_FOUND");
    }

    #[test]
    fn test_mocked_module() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "module.exports = require('fake-pkg').value;");
        let mut config = TestConfig::default();
        config
            .modules
            .insert("fake-pkg".to_string(), serde_json::json!({"value": 7}));
        let mut runner = Runner::new(RunnerOptions::new("main", dir.path(), dir.path()).test_config(config)).unwrap();
        assert_eq!(runner.run("main.js").unwrap().as_number(), Some(7.0));
    }

    #[test]
    fn test_node_prefix_builtin() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "module.exports = require('node:path').join('a', 'b');");
        let mut runner = runner_for(dir.path());
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "a/b");
    }

    #[test]
    fn test_stats_binding_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "uses.js", "module.exports = __STATS__.hash + ':' + __STATS_I__;");
        write(dir.path(), "plain.js", "module.exports = 'plain';");
        let calls = Rc::new(RefCell::new(0));
        let counter = calls.clone();
        let stats: crate::config::StatsAccessor = Rc::new(move || {
            *counter.borrow_mut() += 1;
            Some(serde_json::json!({"hash": "abc", "__index__": 2}))
        });
        let mut runner = Runner::new(RunnerOptions::new("main", dir.path(), dir.path()).stats(stats)).unwrap();

        let plain = runner.run("plain.js").unwrap();
        assert_eq!(runner.display(&plain), "plain");
        assert_eq!(*calls.borrow(), 0);

        let uses = runner.run("uses.js").unwrap();
        assert_eq!(runner.display(&uses), "abc:2");
    }

    #[test]
    fn test_scope_hook_is_per_runner() {
        struct Inject;
        impl TestConfigHooks for Inject {
            fn module_scope(&self, scope: &mut ModuleScope, _: &CompilerOptions, _: &mut Context) -> JsResult<()> {
                scope.set("injected", 5);
                Ok(())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "module.exports = typeof injected === 'undefined' ? -1 : injected;");

        let mut with_hook =
            Runner::new(RunnerOptions::new("a", dir.path(), dir.path()).hooks(Rc::new(Inject))).unwrap();
        let mut without = runner_for(dir.path());
        assert_eq!(with_hook.run("main.js").unwrap().as_number(), Some(5.0));
        assert_eq!(without.run("main.js").unwrap().as_number(), Some(-1.0));
    }

    #[test]
    fn test_registered_tests_run_after_entry() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.js",
            r#"
            it("passes", () => { expect(1 + 1).toBe(2); });
            it("fails", () => { expect(1).toBe(2); });
            it("async", async () => { await new Promise((r) => setTimeout(r, 1)); });
            it("done callback", (done) => { setTimeout(done, 1); });
            "#,
        );
        let mut runner = runner_for(dir.path());
        runner.run("main.js").unwrap();
        let outcomes = runner.run_tests().unwrap();
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);
        assert!(outcomes[2].passed);
        assert!(outcomes[3].passed);
    }

    #[test]
    fn test_new_context_has_own_globals() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "self.marker = 'set'; module.exports = 1;");
        let mut runner =
            Runner::new(RunnerOptions::new("main", dir.path(), dir.path()).run_in_new_context(true)).unwrap();
        runner.run("main.js").unwrap();
        let marker = runner.get_global("marker").unwrap();
        assert_eq!(runner.display(&marker), "set");
    }

    #[test]
    fn test_console_error_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "console.log('quiet'); console.error('loud');");
        let mut runner = runner_for(dir.path());
        runner.run("main.js").unwrap();
        let records = runner.console();
        assert!(records.iter().any(|r| r.message.contains("loud")));
    }
}
