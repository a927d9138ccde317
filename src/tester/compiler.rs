//! Bundler drivers
//!
//! The runner never bundles anything itself. A [`Compiler`] turns merged
//! bundler options into files under dist plus a stats JSON document:
//! [`CommandCompiler`] shells out to an external bundler, [`PrebuiltCompiler`]
//! copies output that was prepared ahead of time.

use serde_json::{Value, json};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use walkdir::WalkDir;

use super::{TesterError, TesterResult};

/// Environment variable naming the external bundler command
pub const BUNDLER_ENV: &str = "RSPACK_TEST_BUNDLER";

/// Directory under dist that holds the options handed to the bundler
pub const BUILD_META_DIR: &str = ".rspack-test";

/// Directory of a fixture holding prepared build output, one subdirectory
/// per build step
pub const PREBUILT_DIR: &str = "__dist__";

/// Produces bundles and stats from bundler options
pub trait Compiler {
    /// Build `options` for update step `step`, returning the stats JSON
    fn build(&mut self, options: &Value, step: usize) -> TesterResult<Value>;

    fn close(&mut self) -> TesterResult<()> {
        Ok(())
    }
}

/// How compilers are created for a case
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BundlerKind {
    /// Command line of an external bundler; the options file path is
    /// appended as the last argument
    Command(String),
    #[default]
    Prebuilt,
}

impl BundlerKind {
    /// `RSPACK_TEST_BUNDLER` when set, prebuilt output otherwise
    pub fn from_env() -> Self {
        match std::env::var(BUNDLER_ENV) {
            Ok(command) if !command.trim().is_empty() => BundlerKind::Command(command),
            _ => BundlerKind::Prebuilt,
        }
    }

    pub(crate) fn create(&self, source: &Path, dist: &Path) -> Box<dyn Compiler> {
        match self {
            BundlerKind::Command(command) => Box::new(CommandCompiler::new(command.clone(), dist)),
            BundlerKind::Prebuilt => Box::new(PrebuiltCompiler::new(source, dist)),
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TesterError + '_ {
    move |source| TesterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Runs an external bundler process per build
pub struct CommandCompiler {
    command: String,
    dist: PathBuf,
}

impl CommandCompiler {
    pub fn new(command: impl Into<String>, dist: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            dist: dist.into(),
        }
    }

    fn write_options(&self, options: &Value) -> TesterResult<PathBuf> {
        let meta = self.dist.join(BUILD_META_DIR);
        fs::create_dir_all(&meta).map_err(io_error(&meta))?;
        let path = meta.join("config.json");
        let text = serde_json::to_string_pretty(options).map_err(|e| TesterError::Compile {
            step: 0,
            message: format!("bundler options are not serializable: {e}"),
        })?;
        fs::write(&path, text).map_err(io_error(&path))?;
        Ok(path)
    }
}

impl Compiler for CommandCompiler {
    fn build(&mut self, options: &Value, step: usize) -> TesterResult<Value> {
        let config = self.write_options(options)?;
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or_else(|| TesterError::Compile {
            step,
            message: format!("{BUNDLER_ENV} is empty"),
        })?;

        tracing::debug!(command = %self.command, step, config = %config.display(), "invoking bundler");
        let output = Command::new(program)
            .args(parts)
            .arg(&config)
            .env("RSPACK_TEST_DIST", &self.dist)
            .env("RSPACK_TEST_STEP", step.to_string())
            .output()
            .map_err(|e| TesterError::Compile {
                step,
                message: format!("failed to start '{program}': {e}"),
            })?;
        if !output.status.success() {
            return Err(TesterError::Compile {
                step,
                message: format!(
                    "bundler exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        // Stats either come back on stdout or next to the options file
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            return serde_json::from_str(stdout.trim()).map_err(|e| TesterError::Compile {
                step,
                message: format!("bundler printed invalid stats JSON: {e}"),
            });
        }
        let stats_path = self.dist.join(BUILD_META_DIR).join("stats.json");
        match crate::config::read_json(&stats_path)? {
            Some(stats) => Ok(stats),
            None => Ok(json!({ "errors": [], "warnings": [] })),
        }
    }
}

/// Copies `<fixture>/__dist__/<step>` into dist
pub struct PrebuiltCompiler {
    source: PathBuf,
    dist: PathBuf,
}

impl PrebuiltCompiler {
    pub fn new(source: impl Into<PathBuf>, dist: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dist: dist.into(),
        }
    }

    fn step_dir(&self, step: usize) -> Option<PathBuf> {
        let root = self.source.join(PREBUILT_DIR);
        let numbered = root.join(step.to_string());
        if numbered.is_dir() {
            return Some(numbered);
        }
        // A flat `__dist__` is the output of the only build
        let flat = step == 0 && root.is_dir() && !root.join("1").is_dir();
        flat.then_some(root)
    }
}

impl Compiler for PrebuiltCompiler {
    fn build(&mut self, _options: &Value, step: usize) -> TesterResult<Value> {
        let from = self.step_dir(step).ok_or_else(|| TesterError::Compile {
            step,
            message: format!("no prebuilt output for step {step} in {}", self.source.join(PREBUILT_DIR).display()),
        })?;
        tracing::debug!(from = %from.display(), to = %self.dist.display(), step, "copying prebuilt output");

        let mut stats = None;
        for entry in WalkDir::new(&from).min_depth(1) {
            let entry = entry.map_err(|e| TesterError::Compile {
                step,
                message: e.to_string(),
            })?;
            let relative = entry.path().strip_prefix(&from).unwrap_or(entry.path());
            if entry.file_type().is_dir() {
                continue;
            }
            if relative == Path::new("stats.json") {
                stats = crate::config::read_json(entry.path())?;
                continue;
            }
            let target = self.dist.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            fs::copy(entry.path(), &target).map_err(io_error(&target))?;
        }
        Ok(stats.unwrap_or_else(|| json!({ "errors": [], "warnings": [] })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prebuilt_copies_step_and_reads_stats() {
        let fixture = tempfile::tempdir().unwrap();
        let dist = tempfile::tempdir().unwrap();
        let step1 = fixture.path().join("__dist__/1/chunks");
        fs::create_dir_all(&step1).unwrap();
        fs::create_dir_all(fixture.path().join("__dist__/0")).unwrap();
        fs::write(fixture.path().join("__dist__/0/main.js"), "v0").unwrap();
        fs::write(step1.join("a.js"), "chunk").unwrap();
        fs::write(fixture.path().join("__dist__/1/stats.json"), r#"{"hash":"h1","errors":[]}"#).unwrap();

        let mut compiler = PrebuiltCompiler::new(fixture.path(), dist.path());
        let stats = compiler.build(&json!({}), 0).unwrap();
        assert_eq!(stats["errors"], json!([]));
        assert_eq!(fs::read_to_string(dist.path().join("main.js")).unwrap(), "v0");

        let stats = compiler.build(&json!({}), 1).unwrap();
        assert_eq!(stats["hash"], "h1");
        assert_eq!(fs::read_to_string(dist.path().join("chunks/a.js")).unwrap(), "chunk");
        assert!(!dist.path().join("stats.json").exists());

        assert!(matches!(compiler.build(&json!({}), 2), Err(TesterError::Compile { step: 2, .. })));
    }

    #[test]
    fn test_flat_prebuilt_dir() {
        let fixture = tempfile::tempdir().unwrap();
        let dist = tempfile::tempdir().unwrap();
        fs::create_dir_all(fixture.path().join("__dist__")).unwrap();
        fs::write(fixture.path().join("__dist__/main.js"), "flat").unwrap();
        let mut compiler = PrebuiltCompiler::new(fixture.path(), dist.path());
        compiler.build(&json!({}), 0).unwrap();
        assert_eq!(fs::read_to_string(dist.path().join("main.js")).unwrap(), "flat");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_compiler_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dist = dir.path().join("dist");
        let script = dir.path().join("bundler.sh");
        fs::write(
            &script,
            "cp \"$1\" \"$RSPACK_TEST_DIST/seen.json\"\necho '{\"hash\":\"step'$RSPACK_TEST_STEP'\",\"errors\":[]}'\n",
        )
        .unwrap();
        let mut compiler = CommandCompiler::new(format!("sh {}", script.display()), &dist);
        let stats = compiler.build(&json!({ "mode": "development" }), 3).unwrap();
        assert_eq!(stats["hash"], "step3");
        let seen: Value = serde_json::from_str(&fs::read_to_string(dist.join("seen.json")).unwrap()).unwrap();
        assert_eq!(seen["mode"], "development");
        assert!(dist.join(".rspack-test/config.json").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_compiler_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("bundler.sh");
        fs::write(&script, "echo broken >&2\nexit 3\n").unwrap();
        let mut compiler = CommandCompiler::new(format!("sh {}", script.display()), dir.path().join("dist"));
        let err = compiler.build(&json!({}), 0).unwrap_err().to_string();
        assert!(err.contains("broken"), "{err}");
    }
}
