//! Hot-update protocol
//!
//! Hot cases get `NEXT`, `NEXT_HMR` and `NEXT_START` in their module scope.
//! Each call advances the shared update index, asks the [`UpdateDriver`] to
//! rebuild, checks `errors<N>.js`/`warnings<N>.js` and hands the stats JSON
//! back to the bundle, whose own HMR runtime applies the update.
//!
//! - `NEXT(callback)` calls `callback(err, stats)` from a microtask
//! - `NEXT_HMR(module, options)` also runs `module.hot.check(options)` and
//!   rejects with `No update available` when nothing was updated
//! - `NEXT_START()` restarts the compiler cold and registers a test that
//!   runs the fresh bundles

use boa_engine::{Context, JsNativeError, JsResult, JsValue, js_string};
use serde::Serialize;
use serde_json::Value;
use std::{cell::RefCell, path::PathBuf, rc::Rc};
use thiserror::Error;

use super::{
    RunnerExtension, RunnerHandle, bind_native, eval_glue,
    expectation::{ExpectationChecker, ExpectationError},
    requirer::{self, RequireContext},
    scope::ModuleScope,
    test_env,
};
use crate::resolver::{FileResolver, ModulePath};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no more hot steps ({total} declared)")]
    NoMoreSteps { total: usize },

    #[error("should run all hot steps ({ran} / {total})")]
    StepsSkipped { ran: usize, total: usize },

    #[error("rebuild for hot step {step} failed: {message}")]
    Rebuild { step: usize, message: String },

    #[error("hot step {step}: {source}")]
    Expectation {
        step: usize,
        #[source]
        source: ExpectationError,
    },

    #[error("hot step checker rejected step {step}: {message}")]
    StepCheck { step: usize, message: String },
}

/// Progress through the update steps of a hot case
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotUpdateContext {
    pub update_index: usize,
    pub total_updates: usize,
    /// Files whose content changed in the current step
    pub changed_files: Vec<PathBuf>,
}

/// Rebuilds the bundle between hot steps
pub trait UpdateDriver {
    /// Materialise step `context.update_index` and rebuild incrementally,
    /// returning the stats JSON
    fn rebuild(&mut self, context: &mut HotUpdateContext) -> Result<Value, ProtocolError>;

    /// Close the compiler, create a new one and build from scratch
    fn restart(&mut self, context: &mut HotUpdateContext) -> Result<Value, ProtocolError>;

    /// Bundles to execute after a restart, relative to dist
    fn bundles(&self) -> Vec<String>;

    /// Inspect the stats of a finished step
    fn check_step(&mut self, _context: &HotUpdateContext, _stats: &Value) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Hot-update state shared by a runner and the processor that created it
pub struct HotSession {
    context: HotUpdateContext,
    expectations: ExpectationChecker,
    driver: Box<dyn UpdateDriver>,
    restarts: usize,
}

impl HotSession {
    pub fn new(source: impl Into<PathBuf>, context: HotUpdateContext, driver: Box<dyn UpdateDriver>) -> Self {
        Self {
            context,
            expectations: ExpectationChecker::new(source),
            driver,
            restarts: 0,
        }
    }

    pub fn context(&self) -> &HotUpdateContext {
        &self.context
    }

    fn next_index(&mut self) -> Result<usize, ProtocolError> {
        if self.context.update_index >= self.context.total_updates {
            return Err(ProtocolError::NoMoreSteps {
                total: self.context.total_updates,
            });
        }
        self.context.update_index += 1;
        Ok(self.context.update_index)
    }

    fn verify(&mut self, step: usize, stats: &Value) -> Result<(), ProtocolError> {
        self.expectations
            .check_stats(stats, &step.to_string())
            .map_err(|source| ProtocolError::Expectation { step, source })?;
        self.driver.check_step(&self.context, stats)
    }

    /// Advance to the next step with an incremental rebuild
    pub fn advance(&mut self) -> Result<Value, ProtocolError> {
        let step = self.next_index()?;
        tracing::debug!(step, total = self.context.total_updates, "hot step");
        let stats = self.driver.rebuild(&mut self.context)?;
        self.verify(step, &stats)?;
        Ok(stats)
    }

    /// Advance to the next step with a cold rebuild
    pub fn restart(&mut self) -> Result<Value, ProtocolError> {
        let step = self.next_index()?;
        self.restarts += 1;
        tracing::debug!(step, restart = self.restarts, "hot step with compiler restart");
        let stats = self.driver.restart(&mut self.context)?;
        self.verify(step, &stats)?;
        Ok(stats)
    }

    /// Every declared step must have run
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.context.update_index != self.context.total_updates {
            return Err(ProtocolError::StepsSkipped {
                ran: self.context.update_index,
                total: self.context.total_updates,
            });
        }
        Ok(())
    }
}

const HOT_JS: &str = r#"
(function (host) {
    const NEXT = (callback) => {
        Promise.resolve()
            .then(() => host.advance())
            .then((stats) => callback(null, stats), (error) => callback(error));
    };
    const NEXT_HMR = (m, options) =>
        Promise.resolve()
            .then(() => host.advance())
            .then((stats) =>
                m.hot.check(options || true).then((updatedModules) => {
                    if (!updatedModules) throw new Error("No update available");
                    return stats;
                }),
            );
    const NEXT_START = () => Promise.resolve().then(() => host.restart());
    return { NEXT, NEXT_HMR, NEXT_START };
})
"#;

fn session(handle: &RunnerHandle) -> JsResult<Rc<RefCell<HotSession>>> {
    handle
        .borrow()
        .hot
        .clone()
        .ok_or_else(|| JsNativeError::error().with_message("this runner has no hot session").into())
}

fn protocol_error(error: ProtocolError) -> boa_engine::JsError {
    JsNativeError::error().with_message(error.to_string()).into()
}

fn advance_native(_this: &JsValue, _args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let session = session(handle)?;
    let stats = session.borrow_mut().advance().map_err(protocol_error)?;
    JsValue::from_json(&stats, context)
}

fn restart_native(_this: &JsValue, _args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let session = session(handle)?;
    let stats = session.borrow_mut().restart().map_err(protocol_error)?;
    let index = session.borrow().context().update_index;

    let rerun = bind_native(handle, rerun_native, context);
    test_env::register_test(handle, format!("NEXT_START run with update index {index}"), rerun.into());
    JsValue::from_json(&stats, context)
}

/// Body of the test `NEXT_START` registers: forget every module and run the
/// freshly built bundles
fn rerun_native(_this: &JsValue, _args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let session = session(handle)?;
    let bundles = session.borrow().driver.bundles();
    let dist = {
        let mut state = handle.borrow_mut();
        state.require_cache.clear();
        state.esm_cache.clear();
        state.files = Rc::new(FileResolver::new(state.options.cachable));
        state.options.dist.clone()
    };
    let mut last = JsValue::undefined();
    for bundle in bundles {
        tracing::debug!(bundle = %bundle, "running restarted bundle");
        let request = ModulePath::Single(format!("./{}", bundle.trim_start_matches("./")));
        let require_context = RequireContext {
            entry: true,
            ..RequireContext::default()
        };
        last = requirer::require(handle, &dist, request, require_context, context)?.into_value(context)?;
    }
    Ok(last)
}

/// Installs the `NEXT*` bindings
pub(crate) struct HotExtension;

impl RunnerExtension for HotExtension {
    fn extend_base_scope(&self, handle: &RunnerHandle, scope: &mut ModuleScope, context: &mut Context) -> JsResult<()> {
        let host = boa_engine::JsObject::with_object_proto(context.intrinsics());
        let advance = bind_native(handle, advance_native, context);
        let restart = bind_native(handle, restart_native, context);
        host.set(js_string!("advance"), advance, false, context)?;
        host.set(js_string!("restart"), restart, false, context)?;
        let bindings = eval_glue("runner:hot", HOT_JS, &[host.into()], context)?;
        let bindings = bindings
            .as_object()
            .map(|o| o.clone())
            .ok_or_else(|| JsNativeError::typ().with_message("hot glue did not return an object"))?;
        for name in ["NEXT", "NEXT_HMR", "NEXT_START"] {
            scope.set(name, bindings.get(js_string!(name), context)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RunnerOptions, runtime::Runner};
    use serde_json::json;
    use std::fs;

    struct ScriptedDriver {
        hashes: Vec<&'static str>,
        errors: Vec<Value>,
    }

    impl UpdateDriver for ScriptedDriver {
        fn rebuild(&mut self, context: &mut HotUpdateContext) -> Result<Value, ProtocolError> {
            let step = context.update_index;
            Ok(json!({
                "hash": self.hashes[step - 1],
                "errors": self.errors.get(step - 1).cloned().unwrap_or(json!([])),
            }))
        }

        fn restart(&mut self, context: &mut HotUpdateContext) -> Result<Value, ProtocolError> {
            self.rebuild(context)
        }

        fn bundles(&self) -> Vec<String> {
            vec!["restarted.js".to_string()]
        }
    }

    fn hot_runner(dir: &std::path::Path, total: usize, errors: Vec<Value>) -> (Runner, Rc<RefCell<HotSession>>) {
        let driver = ScriptedDriver {
            hashes: vec!["h1", "h2", "h3"],
            errors,
        };
        let context = HotUpdateContext {
            total_updates: total,
            ..HotUpdateContext::default()
        };
        let session = Rc::new(RefCell::new(HotSession::new(dir, context, Box::new(driver))));
        let options = RunnerOptions::new("main", dir, dir).print_logger(false);
        let runner = Runner::with_hot_session(options, session.clone()).unwrap();
        (runner, session)
    }

    #[test]
    fn test_next_walks_steps_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.js"),
            r#"
            const step = () => new Promise((resolve, reject) => NEXT((err, stats) => (err ? reject(err) : resolve(stats.hash))));
            module.exports = step().then((a) => step().then((b) => a + b)).then((hashes) =>
                step().then(() => "unreachable", (e) => hashes + ":" + e.message));
            "#,
        )
        .unwrap();
        let (mut runner, session) = hot_runner(dir.path(), 2, Vec::new());
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "h1h2:no more hot steps (2 declared)");
        assert!(session.borrow().finish().is_ok());
    }

    #[test]
    fn test_skipped_steps_are_reported() {
        let session = HotSession::new(
            "/nonexistent",
            HotUpdateContext {
                update_index: 1,
                total_updates: 3,
                changed_files: Vec::new(),
            },
            Box::new(ScriptedDriver {
                hashes: vec![],
                errors: vec![],
            }),
        );
        assert_eq!(session.finish().unwrap_err().to_string(), "should run all hot steps (1 / 3)");
    }

    #[test]
    fn test_next_hmr_requires_an_update() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.js"),
            r#"
            const fakeModule = { hot: { check: () => Promise.resolve(null) } };
            module.exports = NEXT_HMR(fakeModule).then(() => "applied", (e) => e.message);
            "#,
        )
        .unwrap();
        let (mut runner, _) = hot_runner(dir.path(), 1, Vec::new());
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "No update available");
    }

    #[test]
    fn test_step_errors_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("errors1.js"), "module.exports = [/Unexpected token/];").unwrap();
        fs::write(
            dir.path().join("main.js"),
            r#"
            module.exports = new Promise((resolve) => NEXT((err) => resolve(err ? err.message : "ok")))
                .then((first) => new Promise((resolve) => NEXT((err) => resolve(first + "|" + (err ? err.message : "ok")))));
            "#,
        )
        .unwrap();
        let errors = vec![json!(["Unexpected token (1:1)"]), json!(["Something else"])];
        let (mut runner, _) = hot_runner(dir.path(), 2, errors);
        let value = runner.run("main.js").unwrap();
        let text = runner.display(&value);
        assert!(text.starts_with("ok|hot step 2:"), "{text}");
    }

    #[test]
    fn test_next_start_registers_a_test() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("restarted.js"), "module.exports = 'fresh';").unwrap();
        fs::write(dir.path().join("main.js"), "module.exports = NEXT_START().then((s) => s.hash);").unwrap();
        let (mut runner, _) = hot_runner(dir.path(), 1, Vec::new());
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "h1");
        assert_eq!(runner.registered_tests(), 1);
        let outcomes = runner.run_tests().unwrap();
        assert!(outcomes[0].passed, "{:?}", outcomes[0].error);
        assert!(outcomes[0].name.contains("NEXT_START"));
    }
}
