//! Runner options, fixture test configuration and bundler option merging
//!
//! A fixture directory may carry:
//! - `test.config.json` - declarative per-case settings (`TestConfig`)
//! - `test.config.js` - live hooks evaluated inside the runner's engine
//! - `rspack.config.json` / `webpack.config.json` - bundler options

use boa_engine::{Context, JsResult, JsValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};
use thiserror::Error;

use crate::runtime::scope::ModuleScope;

/// Default wall-clock limit for settling one awaited value
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// File names probed for bundler options, in order
const COMPILER_CONFIG_FILES: &[&str] = &["rspack.config.json", "webpack.config.json"];

/// Errors raised while loading fixture configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which document facsimile a web runner installs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomMode {
    #[default]
    Fake,
    Jsdom,
}

/// `experiments` subset the runner cares about
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Experiments {
    pub output_module: bool,
    pub css: Option<bool>,
}

/// `output` subset the runner cares about
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputOptions {
    pub path: Option<PathBuf>,
    pub filename: Option<String>,
    pub public_path: Option<String>,
    pub hot_update_global: Option<String>,
    pub unique_name: Option<String>,
}

/// Typed view over bundler options. Unknown keys are kept in `extra` so the
/// whole document can be handed to an external bundler unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilerOptions {
    pub mode: Option<String>,
    pub target: Option<Value>,
    pub context: Option<PathBuf>,
    pub experiments: Experiments,
    pub output: OutputOptions,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompilerOptions {
    /// Parse from a JSON value (as produced by [`merge_options`])
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// First target string, `"web"` / `"node"` / `"webworker"` etc.
    pub fn target_name(&self) -> Option<&str> {
        match self.target.as_ref()? {
            Value::String(s) => Some(s.as_str()),
            Value::Array(items) => items.first().and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn is_web_target(&self) -> bool {
        matches!(self.target_name(), Some(t) if t.starts_with("web"))
    }
}

/// One bundle or several, as written in `bundlePath`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BundlePath {
    One(String),
    Many(Vec<String>),
}

impl BundlePath {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            BundlePath::One(p) => vec![p],
            BundlePath::Many(ps) => ps,
        }
    }
}

/// Declarative per-case settings from `test.config.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfig {
    /// Build and check only; do not execute bundles
    pub no_tests: bool,
    pub bundle_path: Option<BundlePath>,
    /// Mocked module exports, keyed by specifier
    pub modules: BTreeMap<String, Value>,
    pub document_type: Option<DomMode>,
    /// Settle limit in milliseconds
    pub timeout: Option<u64>,
    pub write_stats_json: bool,
    /// Forces the ESM requirer for every `.mjs` file
    pub esm: bool,
}

impl TestConfig {
    /// Load `test.config.json` from `dir`, or the default when absent
    pub fn load(dir: &Path) -> ConfigResult<Self> {
        let path = dir.join("test.config.json");
        match read_json(&path)? {
            Some(value) => serde_json::from_value(value).map_err(|source| ConfigError::Json { path, source }),
            None => Ok(Self::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Lazily computed stats JSON of the last build
pub type StatsAccessor = Rc<dyn Fn() -> Option<Value>>;

/// Rust-side counterparts of the `test.config.js` hooks
pub trait TestConfigHooks {
    /// Mutate the per-module scope after every built-in binding was added
    fn module_scope(
        &self,
        _scope: &mut ModuleScope,
        _options: &CompilerOptions,
        _context: &mut Context,
    ) -> JsResult<()> {
        Ok(())
    }

    /// `this` for a non-ESM module body; `None` means `module.exports`
    fn non_esm_this(&self, _module_path: &Path, _context: &mut Context) -> JsResult<Option<JsValue>> {
        Ok(None)
    }

    /// Replacement content for a DOM resource load
    fn resource_loader(&self, _url: &str) -> Option<String> {
        None
    }
}

/// Host execution environment of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunnerEnvironment {
    #[default]
    Node,
    Web(DomMode),
}

/// Everything a runner instance needs to execute bundles
#[derive(Clone)]
pub struct RunnerOptions {
    pub name: String,
    pub source: PathBuf,
    pub dist: PathBuf,
    pub environment: RunnerEnvironment,
    pub run_in_new_context: bool,
    pub cachable: bool,
    pub print_logger: bool,
    pub compiler_options: CompilerOptions,
    pub test_config: TestConfig,
    pub stats: Option<StatsAccessor>,
    pub hooks: Option<Rc<dyn TestConfigHooks>>,
}

impl fmt::Debug for RunnerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerOptions")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("dist", &self.dist)
            .field("environment", &self.environment)
            .field("run_in_new_context", &self.run_in_new_context)
            .field("cachable", &self.cachable)
            .field("print_logger", &self.print_logger)
            .finish_non_exhaustive()
    }
}

impl RunnerOptions {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>, dist: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            dist: dist.into(),
            environment: RunnerEnvironment::Node,
            run_in_new_context: false,
            cachable: true,
            print_logger: print_logger_from_env(),
            compiler_options: CompilerOptions::default(),
            test_config: TestConfig::default(),
            stats: None,
            hooks: None,
        }
    }

    pub fn environment(mut self, environment: RunnerEnvironment) -> Self {
        // Web runners always get their own global realm
        if matches!(environment, RunnerEnvironment::Web(_)) {
            self.run_in_new_context = true;
        }
        self.environment = environment;
        self
    }

    pub fn run_in_new_context(mut self, yes: bool) -> Self {
        self.run_in_new_context = yes;
        self
    }

    pub fn cachable(mut self, yes: bool) -> Self {
        self.cachable = yes;
        self
    }

    pub fn print_logger(mut self, yes: bool) -> Self {
        self.print_logger = yes;
        self
    }

    pub fn compiler_options(mut self, options: CompilerOptions) -> Self {
        self.compiler_options = options;
        self
    }

    pub fn test_config(mut self, config: TestConfig) -> Self {
        self.test_config = config;
        self
    }

    pub fn stats(mut self, stats: StatsAccessor) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn hooks(mut self, hooks: Rc<dyn TestConfigHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Whether `.mjs` files go through the ESM requirer
    pub fn esm_enabled(&self) -> bool {
        self.compiler_options.experiments.output_module || self.test_config.esm
    }
}

/// `PRINT_LOGGER=1|true` turns sandbox console output on
pub fn print_logger_from_env() -> bool {
    std::env::var("PRINT_LOGGER")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Read a JSON file, `None` when it does not exist
pub fn read_json(path: &Path) -> ConfigResult<Option<Value>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&text).map(Some).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the fixture's bundler options, `{}` when none are present
pub fn load_compiler_config(dir: &Path) -> ConfigResult<Value> {
    for name in COMPILER_CONFIG_FILES {
        if let Some(value) = read_json(&dir.join(name))? {
            return Ok(value);
        }
    }
    Ok(Value::Object(Map::new()))
}

/// Deep merge: objects recursively, arrays concatenated, scalars replaced
pub fn merge_options(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_options(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (Value::Array(mut base), Value::Array(overlay)) => {
            base.extend(overlay);
            Value::Array(base)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_objects_recursively() {
        let base = json!({"mode": "development", "output": {"path": "/a", "filename": "main.js"}});
        let overlay = json!({"output": {"filename": "bundle.js"}, "target": "web"});
        let merged = merge_options(base, overlay);
        assert_eq!(
            merged,
            json!({"mode": "development", "output": {"path": "/a", "filename": "bundle.js"}, "target": "web"})
        );
    }

    #[test]
    fn test_merge_concatenates_arrays() {
        let merged = merge_options(json!({"plugins": [1]}), json!({"plugins": [2, 3]}));
        assert_eq!(merged, json!({"plugins": [1, 2, 3]}));
    }

    #[test]
    fn test_compiler_options_keep_unknown_keys() {
        let options = CompilerOptions::from_value(json!({
            "mode": "production",
            "target": ["web", "es5"],
            "experiments": {"outputModule": true},
            "optimization": {"minimize": false}
        }))
        .unwrap();
        assert_eq!(options.mode.as_deref(), Some("production"));
        assert_eq!(options.target_name(), Some("web"));
        assert!(options.is_web_target());
        assert!(options.experiments.output_module);
        assert_eq!(options.to_value()["optimization"]["minimize"], json!(false));
    }

    #[test]
    fn test_load_test_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("test.config.json"),
            r#"{"noTests": true, "bundlePath": ["a.js", "b.js"], "documentType": "jsdom", "timeout": 500}"#,
        )
        .unwrap();
        let config = TestConfig::load(dir.path()).unwrap();
        assert!(config.no_tests);
        assert_eq!(config.bundle_path.clone().unwrap().into_vec(), vec!["a.js", "b.js"]);
        assert_eq!(config.document_type, Some(DomMode::Jsdom));
        assert_eq!(config.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_missing_test_config_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = TestConfig::load(dir.path()).unwrap();
        assert!(!config.no_tests);
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_invalid_json_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rspack.config.json"), "{ nope").unwrap();
        let err = load_compiler_config(dir.path()).unwrap_err();
        assert!(err.to_string().contains("rspack.config.json"));
    }

    #[test]
    fn test_web_environment_forces_new_context() {
        let options = RunnerOptions::new("main", "/src", "/dist").environment(RunnerEnvironment::Web(DomMode::Fake));
        assert!(options.run_in_new_context);
    }
}
