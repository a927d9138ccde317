//! Case processors
//!
//! A [`Processor`] drives one build of a case through
//! config → compiler → build → run → check. [`BasicProcessor`] runs the
//! bundles once; [`HotProcessor`] additionally slices the fixture into
//! update steps and runs the bundles with the `NEXT*` bindings.

use serde_json::{Value, json};
use std::{cell::RefCell, path::Path, rc::Rc};

use super::{
    TesterError, TesterResult,
    context::{SharedCompiler, TestContext},
    update::{HotDriver, StepChecker, UpdateSteps},
};
use crate::{
    config::{self, CompilerOptions, RunnerEnvironment, RunnerOptions, StatsAccessor, TestConfig},
    runtime::{
        Runner,
        expectation::{DiagnosticKind, ExpectationChecker, diagnostics},
        hot::{HotSession, HotUpdateContext},
        test_env::TestOutcome,
    },
};

/// Scratch key of the optional per-step stats checker of hot cases
pub const HOT_STEP_CHECKER: &str = "hotUpdateStepChecker";

/// One build of a case
pub trait Processor {
    fn name(&self) -> &str;

    /// Fill in the compiler manager's options
    fn config(&mut self, context: &mut TestContext) -> TesterResult<()>;

    fn compiler(&mut self, context: &mut TestContext) -> TesterResult<()> {
        context.compiler(self.name()).borrow_mut().create_compiler();
        Ok(())
    }

    fn build(&mut self, context: &mut TestContext) -> TesterResult<()>;

    /// Execute the bundles and their registered tests
    fn run(&mut self, context: &mut TestContext) -> TesterResult<Vec<TestOutcome>>;

    /// Compare diagnostics with the fixture's expectations
    fn check(&mut self, context: &mut TestContext) -> TesterResult<()>;

    /// Release the cached runner before the compilers are closed
    fn after_all(&mut self, context: &mut TestContext) -> TesterResult<()> {
        context.drop_runner(self.name());
        Ok(())
    }
}

/// Entry files when neither `bundlePath` nor `findBundle` name any
fn default_bundles(options: &CompilerOptions, dist: &Path) -> Vec<String> {
    if let Some(filename) = options.output.filename.as_deref() {
        if !filename.contains('[') {
            return vec![filename.to_string()];
        }
    }
    ["main.js", "bundle0.js", "main.mjs", "bundle0.mjs"]
        .into_iter()
        .find(|name| dist.join(name).is_file())
        .map(|name| vec![name.to_string()])
        .unwrap_or_default()
}

/// Entry files for a runner; `None` when the case executes nothing
fn select_bundles(runner: &mut Runner, options: &CompilerOptions) -> TesterResult<Option<Vec<String>>> {
    let config = runner.test_config();
    if config.no_tests {
        return Ok(None);
    }
    let bundles = match config.bundle_path {
        Some(path) => path.into_vec(),
        None => match runner.find_bundle(0)? {
            Some(bundles) => bundles,
            None => default_bundles(options, &runner.dist()),
        },
    };
    Ok(Some(bundles.into_iter().filter(|b| !b.is_empty()).collect()))
}

fn execute(runner: &mut Runner, bundles: &[String]) -> TesterResult<Vec<TestOutcome>> {
    if bundles.is_empty() {
        tracing::warn!(runner = %runner.name(), "no bundle to run");
        return Ok(Vec::new());
    }
    for bundle in bundles {
        runner.run(bundle)?;
    }
    Ok(runner.run_tests()?)
}

fn runner_options(name: &str, context: &TestContext, manager: &SharedCompiler) -> TesterResult<RunnerOptions> {
    let compiler_options = manager.borrow().compiler_options();
    let test_config = TestConfig::load(context.source())?;
    let environment = if compiler_options.is_web_target() {
        RunnerEnvironment::Web(test_config.document_type.unwrap_or_default())
    } else {
        RunnerEnvironment::Node
    };
    let stats_source = manager.clone();
    let stats: StatsAccessor = Rc::new(move || stats_source.try_borrow().ok().and_then(|m| m.stats().cloned()));
    Ok(RunnerOptions::new(name, context.source(), context.dist())
        .environment(environment)
        .compiler_options(compiler_options)
        .test_config(test_config)
        .stats(stats))
}

/// Check `stats` plus errors collected in the context against
/// `errors.js`/`warnings.js`
fn check_diagnostics(name: &str, context: &mut TestContext, stats: &Value) -> TesterResult<()> {
    let test_config = TestConfig::load(context.source())?;
    if test_config.no_tests {
        return Ok(());
    }
    if test_config.write_stats_json {
        let path = context.dist().join("stats.json");
        let text = serde_json::to_string_pretty(stats).unwrap_or_default();
        std::fs::write(&path, text).map_err(|source| TesterError::Io { path, source })?;
    }

    let mut errors: Vec<Value> = context
        .errors(name)
        .iter()
        .map(|message| json!({ "message": message }))
        .collect();
    errors.extend(diagnostics(stats, DiagnosticKind::Error));
    let collected = json!({
        "errors": errors,
        "warnings": diagnostics(stats, DiagnosticKind::Warning),
    });
    ExpectationChecker::new(context.source()).check_stats(&collected, "")?;

    // Expected errors are consumed by the check
    if context.source().join("errors.js").is_file() {
        context.clear_errors(name);
    }
    Ok(())
}

/// Build once, run the bundles, check diagnostics
pub struct BasicProcessor {
    name: String,
    defaults: Value,
}

impl BasicProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defaults: json!({ "mode": "production" }),
        }
    }

    /// Options the fixture's config file is merged over
    pub fn with_defaults(mut self, defaults: Value) -> Self {
        self.defaults = defaults;
        self
    }
}

impl Processor for BasicProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&mut self, context: &mut TestContext) -> TesterResult<()> {
        let file_options = config::load_compiler_config(context.source())?;
        let manager = context.compiler(&self.name);
        let mut manager = manager.borrow_mut();
        manager.set_options(self.defaults.clone());
        manager.merge_options(json!({
            "context": context.source(),
            "output": { "path": context.dist() },
        }));
        manager.merge_options(file_options);
        Ok(())
    }

    fn build(&mut self, context: &mut TestContext) -> TesterResult<()> {
        let manager = context.compiler(&self.name);
        let result = manager.borrow_mut().build(0).map(|_| ());
        match result {
            Ok(()) => Ok(()),
            // A failed build is an error the fixture may expect
            Err(e @ TesterError::Compile { .. }) => {
                tracing::debug!(name = %self.name, error = %e, "build failed");
                context.emit_error(&self.name, e.to_string());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn run(&mut self, context: &mut TestContext) -> TesterResult<Vec<TestOutcome>> {
        if context.has_error(&self.name) {
            return Ok(Vec::new());
        }
        let manager = context.compiler(&self.name);
        let options = runner_options(&self.name, context, &manager)?;
        let compiler_options = options.compiler_options.clone();
        let runner = context.get_runner(&self.name, |_| Runner::new(options))?;
        match select_bundles(runner, &compiler_options)? {
            Some(bundles) => execute(runner, &bundles),
            None => Ok(Vec::new()),
        }
    }

    fn check(&mut self, context: &mut TestContext) -> TesterResult<()> {
        let stats = context.compiler(&self.name).borrow().stats().cloned().unwrap_or_else(|| json!({}));
        check_diagnostics(&self.name, context, &stats)
    }
}

/// Basic processing plus update steps driven by `NEXT*`
pub struct HotProcessor {
    basic: BasicProcessor,
    steps: Option<Rc<UpdateSteps>>,
    session: Option<Rc<RefCell<HotSession>>>,
    initial_stats: Option<Value>,
}

impl HotProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        let basic = BasicProcessor::new(name).with_defaults(json!({
            "mode": "development",
            "devtool": false,
            "optimization": { "moduleIds": "named", "chunkIds": "named" },
        }));
        Self {
            basic,
            steps: None,
            session: None,
            initial_stats: None,
        }
    }

    /// Update progress of the last run, if the bundles ran
    pub fn update_context(&self) -> Option<HotUpdateContext> {
        self.session.as_ref().map(|s| s.borrow().context().clone())
    }
}

impl Processor for HotProcessor {
    fn name(&self) -> &str {
        self.basic.name()
    }

    fn config(&mut self, context: &mut TestContext) -> TesterResult<()> {
        let temp = context.temp().map(Path::to_path_buf).ok_or(TesterError::NoTemp)?;
        let steps = UpdateSteps::scan(context.source(), &temp).map_err(|source| TesterError::Io {
            path: context.source().to_path_buf(),
            source,
        })?;
        steps
            .materialize(0)
            .map_err(|source| TesterError::Io { path: temp.clone(), source })?;
        self.steps = Some(Rc::new(steps));

        self.basic.config(context)?;
        context
            .compiler(self.name())
            .borrow_mut()
            .merge_options(json!({ "context": temp }));
        Ok(())
    }

    fn build(&mut self, context: &mut TestContext) -> TesterResult<()> {
        self.basic.build(context)?;
        self.initial_stats = context.compiler(self.name()).borrow().stats().cloned();
        Ok(())
    }

    fn run(&mut self, context: &mut TestContext) -> TesterResult<Vec<TestOutcome>> {
        let name = self.name().to_string();
        if context.has_error(&name) {
            return Ok(Vec::new());
        }
        let steps = self.steps.clone().ok_or(TesterError::NoTemp)?;
        let manager = context.compiler(&name);
        let bundles = Rc::new(RefCell::new(Vec::new()));
        let checker = context.get_value::<StepChecker>(&name, HOT_STEP_CHECKER);
        let driver = HotDriver::new(manager.clone(), steps.clone(), bundles.clone(), checker);
        let update_context = HotUpdateContext {
            total_updates: steps.total_updates(),
            ..HotUpdateContext::default()
        };
        let session = Rc::new(RefCell::new(HotSession::new(context.source(), update_context, Box::new(driver))));
        self.session = Some(session.clone());

        let options = runner_options(&name, context, &manager)?;
        let compiler_options = options.compiler_options.clone();
        let runner = context.get_runner(&name, |_| Runner::with_hot_session(options, session))?;
        let Some(selected) = select_bundles(runner, &compiler_options)? else {
            return Ok(Vec::new());
        };
        *bundles.borrow_mut() = selected.clone();
        execute(runner, &selected)
    }

    fn check(&mut self, context: &mut TestContext) -> TesterResult<()> {
        if let Some(session) = &self.session {
            session.borrow().finish()?;
        }
        // errors.js describes the initial build; later steps have errors<N>.js
        let stats = self.initial_stats.clone().unwrap_or_else(|| json!({}));
        check_diagnostics(self.name(), context, &stats)
    }
}
