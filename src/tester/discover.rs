//! Fixture discovery

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{TesterResult, compiler::PREBUILT_DIR};
use crate::config::read_json;

/// Files whose presence makes a directory a case
const CASE_MARKERS: &[&str] = &[
    "index.js",
    "index.mjs",
    "rspack.config.json",
    "webpack.config.json",
    "test.config.json",
    PREBUILT_DIR,
];

/// A case found under a cases root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseEntry {
    /// Path relative to the root, `/`-separated
    pub name: String,
    pub path: PathBuf,
    /// Reason from `test.filter.json` when the case is skipped
    pub skipped: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CaseFilter {
    skip: Value,
}

/// Whether `test.filter.json` in `dir` skips the case, and why
fn skip_reason(dir: &Path) -> TesterResult<Option<String>> {
    let Some(value) = read_json(&dir.join("test.filter.json"))? else {
        return Ok(None);
    };
    let filter: CaseFilter = serde_json::from_value(value).unwrap_or_default();
    Ok(match filter.skip {
        Value::Bool(true) => Some("test.filter.json".to_string()),
        Value::String(reason) if !reason.is_empty() => Some(reason),
        _ => None,
    })
}

fn is_case(dir: &Path) -> bool {
    CASE_MARKERS.iter().any(|marker| dir.join(marker).exists())
}

/// Walk `root` for case directories, sorted by name. Directories starting
/// with `_` and `node_modules` are never entered; a case's own
/// subdirectories are not searched for further cases.
pub fn discover_cases(root: &Path) -> TesterResult<Vec<CaseEntry>> {
    let mut cases = Vec::new();
    let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| super::TesterError::Discover(e.to_string()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if file_name.starts_with('_') || file_name == "node_modules" {
            walker.skip_current_dir();
            continue;
        }
        if !is_case(entry.path()) {
            continue;
        }
        let name = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let skipped = skip_reason(entry.path())?;
        tracing::trace!(case = %name, skipped = skipped.is_some(), "discovered case");
        cases.push(CaseEntry {
            name,
            path: entry.path().to_path_buf(),
            skipped,
        });
        walker.skip_current_dir();
    }
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, file: &str, content: &str) {
        let path = root.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_discover_cases() {
        let root = tempfile::tempdir().unwrap();
        touch(root.path(), "hotCases/css/basic/index.js", "");
        touch(root.path(), "hotCases/css/basic/nested/index.js", "");
        touch(root.path(), "normal/a/rspack.config.json", "{}");
        touch(root.path(), "normal/b/__dist__/main.js", "");
        touch(root.path(), "normal/b/test.filter.json", r#"{"skip": true}"#);
        touch(root.path(), "normal/c/index.js", "");
        touch(root.path(), "normal/c/test.filter.json", r#"{"skip": false}"#);
        touch(root.path(), "normal/_helpers/index.js", "");
        touch(root.path(), "normal/empty/readme.md", "");

        let cases = discover_cases(root.path()).unwrap();
        let names: Vec<_> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["hotCases/css/basic", "normal/a", "normal/b", "normal/c"]);
        assert_eq!(cases[2].skipped.as_deref(), Some("test.filter.json"));
        assert_eq!(cases[3].skipped, None);
    }
}
