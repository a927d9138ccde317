//! Update steps of hot cases
//!
//! Every file of a hot fixture may be split into slices by delimiter lines
//! (`---`, three or more dashes). Slice N is the content of the file at
//! update step N; files with fewer slices keep their last one. Step N is
//! materialised into a temp directory that the bundler watches.

use serde_json::Value;
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};
use walkdir::WalkDir;

use super::{compiler::PREBUILT_DIR, context::SharedCompiler};
use crate::runtime::hot::{HotUpdateContext, ProtocolError, UpdateDriver};

/// Whether `line` separates two slices
fn is_delimiter(line: &str) -> bool {
    let line = line.trim_end();
    line.len() >= 3 && line.bytes().all(|b| b == b'-')
}

/// Split text on delimiter lines; the delimiter line itself is dropped
pub fn split_slices(content: &str) -> Vec<String> {
    let mut slices = vec![String::new()];
    for line in content.split_inclusive('\n') {
        if is_delimiter(line) {
            slices.push(String::new());
        } else if let Some(current) = slices.last_mut() {
            current.push_str(line);
        }
    }
    slices
}

/// Sliced view of a fixture's files
#[derive(Debug)]
pub struct UpdateSteps {
    temp: PathBuf,
    files: BTreeMap<PathBuf, Vec<Vec<u8>>>,
    total_updates: usize,
}

impl UpdateSteps {
    /// Scan `source` (skipping prebuilt output) and prepare to write steps
    /// into `temp`
    pub fn scan(source: &Path, temp: impl Into<PathBuf>) -> std::io::Result<Self> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(source)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != PREBUILT_DIR);
        for entry in walker {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(source).unwrap_or(entry.path()).to_path_buf();
            let bytes = fs::read(entry.path())?;
            let slices = match String::from_utf8(bytes) {
                Ok(text) => split_slices(&text).into_iter().map(String::into_bytes).collect(),
                Err(raw) => vec![raw.into_bytes()],
            };
            files.insert(relative, slices);
        }
        let total_updates = files.values().map(Vec::len).max().unwrap_or(1).saturating_sub(1);
        tracing::debug!(source = %source.display(), files = files.len(), total_updates, "scanned update steps");
        Ok(Self {
            temp: temp.into(),
            files,
            total_updates,
        })
    }

    pub fn total_updates(&self) -> usize {
        self.total_updates
    }

    pub fn temp(&self) -> &Path {
        &self.temp
    }

    fn slice(slices: &[Vec<u8>], index: usize) -> &[u8] {
        slices
            .get(index)
            .or_else(|| slices.last())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Write step `index` into the temp directory; returns the files whose
    /// content differs from the previous step
    pub fn materialize(&self, index: usize) -> std::io::Result<Vec<PathBuf>> {
        let mut changed = Vec::new();
        for (relative, slices) in &self.files {
            let content = Self::slice(slices, index);
            let target = self.temp.join(relative);
            if index > 0 && content == Self::slice(slices, index - 1) && target.is_file() {
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, content)?;
            if index > 0 {
                changed.push(target);
            }
        }
        Ok(changed)
    }
}

/// Checks the stats of every finished hot step
pub type StepChecker = Rc<dyn Fn(&HotUpdateContext, &Value) -> Result<(), String>>;

/// Rebuilds through the case's compiler manager as the hot runner advances
pub struct HotDriver {
    compiler: SharedCompiler,
    steps: Rc<UpdateSteps>,
    bundles: Rc<RefCell<Vec<String>>>,
    checker: Option<StepChecker>,
}

impl HotDriver {
    /// `bundles` is shared so the processor can fill it in once the runner
    /// has picked the entry files
    pub fn new(
        compiler: SharedCompiler,
        steps: Rc<UpdateSteps>,
        bundles: Rc<RefCell<Vec<String>>>,
        checker: Option<StepChecker>,
    ) -> Self {
        Self {
            compiler,
            steps,
            bundles,
            checker,
        }
    }

    fn build(&mut self, context: &mut HotUpdateContext) -> Result<Value, ProtocolError> {
        let step = context.update_index;
        let rebuild = |message: String| ProtocolError::Rebuild { step, message };
        context.changed_files = self.steps.materialize(step).map_err(|e| rebuild(e.to_string()))?;
        tracing::debug!(step, changed = context.changed_files.len(), "materialised update step");
        let stats = self.compiler.borrow_mut().build(step).cloned();
        stats.map_err(|e| rebuild(e.to_string()))
    }
}

impl UpdateDriver for HotDriver {
    fn rebuild(&mut self, context: &mut HotUpdateContext) -> Result<Value, ProtocolError> {
        self.build(context)
    }

    fn restart(&mut self, context: &mut HotUpdateContext) -> Result<Value, ProtocolError> {
        {
            let mut manager = self.compiler.borrow_mut();
            manager.close().map_err(|e| ProtocolError::Rebuild {
                step: context.update_index,
                message: e.to_string(),
            })?;
            manager.create_compiler();
        }
        self.build(context)
    }

    fn bundles(&self) -> Vec<String> {
        self.bundles.borrow().clone()
    }

    fn check_step(&mut self, context: &HotUpdateContext, stats: &Value) -> Result<(), ProtocolError> {
        match &self.checker {
            Some(checker) => checker(context, stats).map_err(|message| ProtocolError::StepCheck {
                step: context.update_index,
                message,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_slices() {
        assert_eq!(split_slices("a\n---\nb\n-----  \nc"), vec!["a\n", "b\n", "c"]);
        assert_eq!(split_slices("no delimiters\n--\n"), vec!["no delimiters\n--\n"]);
        assert_eq!(split_slices("export default 1;\n---\n"), vec!["export default 1;\n", ""]);
    }

    #[test]
    fn test_materialize_steps() {
        let source = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("lib")).unwrap();
        fs::create_dir_all(source.path().join("__dist__/0")).unwrap();
        fs::write(source.path().join("__dist__/0/main.js"), "a\n---\nb\n---\nc\n---\nd\n").unwrap();
        fs::write(source.path().join("index.js"), "import './lib/a';\n").unwrap();
        fs::write(source.path().join("lib/a.js"), "export default 1;\n---\nexport default 2;\n---\nexport default 2;\n").unwrap();
        fs::write(source.path().join("b.js"), "b0\n---\nb1\n").unwrap();

        let steps = UpdateSteps::scan(source.path(), temp.path()).unwrap();
        assert_eq!(steps.total_updates(), 2);

        assert!(steps.materialize(0).unwrap().is_empty());
        assert_eq!(fs::read_to_string(temp.path().join("lib/a.js")).unwrap(), "export default 1;\n");
        assert!(!temp.path().join("__dist__").exists());

        let changed = steps.materialize(1).unwrap();
        assert_eq!(changed, vec![temp.path().join("b.js"), temp.path().join("lib/a.js")]);
        assert_eq!(fs::read_to_string(temp.path().join("b.js")).unwrap(), "b1\n");

        // b.js keeps its last slice, a.js repeats its content
        assert!(steps.materialize(2).unwrap().is_empty());
        assert_eq!(fs::read_to_string(temp.path().join("lib/a.js")).unwrap(), "export default 2;\n");
    }
}
