//! Per-case state shared by the processors of a [`Tester`](super::Tester)

use serde_json::Value;
use std::{
    any::Any,
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    rc::Rc,
};

use super::{
    TesterError, TesterResult,
    compiler::{BundlerKind, Compiler},
};
use crate::{
    config::{self, CompilerOptions},
    runtime::{Runner, RunnerResult},
};

/// Options, compiler instance and last stats of one named build
pub struct CompilerManager {
    name: String,
    source: PathBuf,
    dist: PathBuf,
    bundler: BundlerKind,
    options: Value,
    compiler: Option<Box<dyn Compiler>>,
    stats: Option<Value>,
}

impl CompilerManager {
    fn new(name: &str, source: &Path, dist: &Path, bundler: BundlerKind) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_path_buf(),
            dist: dist.to_path_buf(),
            bundler,
            options: Value::Object(Default::default()),
            compiler: None,
            stats: None,
        }
    }

    pub fn set_options(&mut self, options: Value) {
        self.options = options;
    }

    pub fn merge_options(&mut self, overlay: Value) {
        let base = std::mem::take(&mut self.options);
        self.options = config::merge_options(base, overlay);
    }

    pub fn options(&self) -> &Value {
        &self.options
    }

    /// Typed view of the options; unknown shapes fall back to defaults
    pub fn compiler_options(&self) -> CompilerOptions {
        CompilerOptions::from_value(self.options.clone()).unwrap_or_else(|e| {
            tracing::warn!(name = %self.name, error = %e, "bundler options do not match the typed view");
            CompilerOptions::default()
        })
    }

    /// Create the compiler unless one is alive
    pub fn create_compiler(&mut self) {
        if self.compiler.is_none() {
            tracing::debug!(name = %self.name, bundler = ?self.bundler, "creating compiler");
            self.compiler = Some(self.bundler.create(&self.source, &self.dist));
        }
    }

    pub fn has_compiler(&self) -> bool {
        self.compiler.is_some()
    }

    /// Build update step `step` and remember its stats
    pub fn build(&mut self, step: usize) -> TesterResult<&Value> {
        let compiler = self
            .compiler
            .as_mut()
            .ok_or_else(|| TesterError::NoCompiler(self.name.clone()))?;
        let stats = compiler.build(&self.options, step)?;
        tracing::debug!(
            name = %self.name,
            step,
            errors = stats.get("errors").and_then(serde_json::Value::as_array).map_or(0, Vec::len),
            "build finished"
        );
        Ok(self.stats.insert(stats))
    }

    pub fn stats(&self) -> Option<&Value> {
        self.stats.as_ref()
    }

    pub fn close(&mut self) -> TesterResult<()> {
        match self.compiler.take() {
            Some(mut compiler) => compiler.close(),
            None => Ok(()),
        }
    }
}

/// Shared handle to a [`CompilerManager`]; hot drivers keep one alive
/// while the runner executes
pub type SharedCompiler = Rc<RefCell<CompilerManager>>;

/// Everything the processors of one case share
pub struct TestContext {
    source: PathBuf,
    dist: PathBuf,
    temp: Option<PathBuf>,
    bundler: BundlerKind,
    compilers: BTreeMap<String, SharedCompiler>,
    errors: BTreeMap<String, Vec<String>>,
    values: HashMap<(String, String), Box<dyn Any>>,
    runners: HashMap<String, Runner>,
}

impl TestContext {
    pub fn new(source: impl Into<PathBuf>, dist: impl Into<PathBuf>, temp: Option<PathBuf>, bundler: BundlerKind) -> Self {
        Self {
            source: source.into(),
            dist: dist.into(),
            temp,
            bundler,
            compilers: BTreeMap::new(),
            errors: BTreeMap::new(),
            values: HashMap::new(),
            runners: HashMap::new(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn dist(&self) -> &Path {
        &self.dist
    }

    pub fn temp(&self) -> Option<&Path> {
        self.temp.as_deref()
    }

    /// The named compiler manager, created on first use
    pub fn compiler(&mut self, name: &str) -> SharedCompiler {
        self.compilers
            .entry(name.to_string())
            .or_insert_with(|| {
                Rc::new(RefCell::new(CompilerManager::new(
                    name,
                    &self.source,
                    &self.dist,
                    self.bundler.clone(),
                )))
            })
            .clone()
    }

    /// Close every compiler that is still alive
    pub fn close_compilers(&mut self) -> TesterResult<()> {
        for manager in self.compilers.values() {
            manager.borrow_mut().close()?;
        }
        Ok(())
    }

    pub fn emit_error(&mut self, name: &str, error: impl Into<String>) {
        self.errors.entry(name.to_string()).or_default().push(error.into());
    }

    pub fn errors(&self, name: &str) -> &[String] {
        self.errors.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has_error(&self, name: &str) -> bool {
        !self.errors(name).is_empty()
    }

    pub fn clear_errors(&mut self, name: &str) {
        self.errors.remove(name);
    }

    /// Scratch value stored by a processor under `(name, key)`
    pub fn get_value<T: Clone + 'static>(&self, name: &str, key: &str) -> Option<T> {
        self.values
            .get(&(name.to_string(), key.to_string()))
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn set_value<T: 'static>(&mut self, name: &str, key: &str, value: T) {
        self.values.insert((name.to_string(), key.to_string()), Box::new(value));
    }

    /// The runner cached under `name`, created by `create` on first use
    pub fn get_runner(
        &mut self,
        name: &str,
        create: impl FnOnce(&TestContext) -> RunnerResult<Runner>,
    ) -> RunnerResult<&mut Runner> {
        let runner = match self.runners.remove(name) {
            Some(runner) => runner,
            None => create(self)?,
        };
        Ok(self.runners.entry(name.to_string()).or_insert(runner))
    }

    /// Drop the cached runner of `name` so the next step starts fresh
    pub fn drop_runner(&mut self, name: &str) {
        self.runners.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerOptions;
    use serde_json::json;

    #[test]
    fn test_options_merge_and_typed_view() {
        let mut context = TestContext::new("/src", "/dist", None, BundlerKind::Prebuilt);
        let manager = context.compiler("main");
        manager.borrow_mut().set_options(json!({ "mode": "production", "output": { "path": "/dist" } }));
        manager
            .borrow_mut()
            .merge_options(json!({ "target": "web", "output": { "publicPath": "/assets/" } }));
        let options = manager.borrow().compiler_options();
        assert!(options.is_web_target());
        assert_eq!(options.output.public_path.as_deref(), Some("/assets/"));
        assert_eq!(options.mode.as_deref(), Some("production"));
        assert!(Rc::ptr_eq(&manager, &context.compiler("main")));
    }

    #[test]
    fn test_build_without_compiler() {
        let mut context = TestContext::new("/src", "/dist", None, BundlerKind::Prebuilt);
        let manager = context.compiler("main");
        let err = manager.borrow_mut().build(0).unwrap_err();
        assert!(matches!(err, TesterError::NoCompiler(name) if name == "main"));
    }

    #[test]
    fn test_values_and_errors() {
        let mut context = TestContext::new("/src", "/dist", None, BundlerKind::Prebuilt);
        context.set_value("main", "count", 3usize);
        assert_eq!(context.get_value::<usize>("main", "count"), Some(3));
        assert_eq!(context.get_value::<String>("main", "count"), None);
        assert_eq!(context.get_value::<usize>("other", "count"), None);

        context.emit_error("main", "boom");
        assert!(context.has_error("main"));
        assert_eq!(context.errors("main"), ["boom".to_string()]);
        context.clear_errors("main");
        assert!(!context.has_error("main"));
    }

    #[test]
    fn test_runner_is_cached_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TestContext::new(dir.path(), dir.path(), None, BundlerKind::Prebuilt);
        let mut created = 0;
        for _ in 0..2 {
            context
                .get_runner("main", |ctx| {
                    created += 1;
                    Runner::new(RunnerOptions::new("main", ctx.source(), ctx.dist()).print_logger(false))
                })
                .unwrap();
        }
        assert_eq!(created, 1);
    }
}
