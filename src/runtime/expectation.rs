//! Error and warning expectations
//!
//! `errors.js`/`warnings.js` (or `errors<N>.js`/`warnings<N>.js` for hot
//! steps) export an array with one entry per expected diagnostic. An entry
//! is a RegExp matched against the message, an array of RegExps that must
//! all match, or an object whose RegExp-valued fields (`moduleName`,
//! `message`, ...) must match the same fields of the diagnostic. The files
//! are evaluated in a dedicated engine so they never see a bundle's globals.

use boa_engine::{Context, JsObject, JsValue, Source, js_string};
use serde_json::Value;
use std::{
    fmt,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExpectationError {
    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },

    #[error("failed to evaluate {}: {message}", path.display())]
    Evaluate { path: PathBuf, message: String },

    #[error("{count} unexpected {kind}(s) and no {} to expect them:\n{details}", path.display())]
    Unexpected {
        kind: DiagnosticKind,
        count: usize,
        path: PathBuf,
        details: String,
    },

    #[error("{}: {message}", path.display())]
    Mismatch { path: PathBuf, message: String },
}

/// Which stats list an expectation file describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Error,
    Warning,
}

impl DiagnosticKind {
    /// Field of the stats JSON holding the list
    pub fn field(self) -> &'static str {
        match self {
            DiagnosticKind::Error => "errors",
            DiagnosticKind::Warning => "warnings",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::Error => f.write_str("error"),
            DiagnosticKind::Warning => f.write_str("warning"),
        }
    }
}

/// Diagnostics of one kind from a stats JSON, strings normalised to
/// `{ message }` objects
pub fn diagnostics(stats: &Value, kind: DiagnosticKind) -> Vec<Value> {
    let Some(list) = stats.get(kind.field()).and_then(Value::as_array) else {
        return Vec::new();
    };
    list.iter()
        .map(|item| match item {
            Value::String(message) => serde_json::json!({ "message": message }),
            other => other.clone(),
        })
        .collect()
}

fn render(list: &[Value]) -> String {
    list.iter()
        .map(|item| {
            let message = item.get("message").and_then(Value::as_str).unwrap_or_default();
            match item.get("moduleName").and_then(Value::as_str) {
                Some(module) => format!("  {module}: {message}"),
                None => format!("  {message}"),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

const CHECK_JS: &str = r#"
(function (expected, actual, kind) {
    const show = (item) => (item.moduleName ? item.moduleName + ": " : "") + item.message;
    const listing = () => actual.map((item) => "  " + show(item)).join("\n");
    const check = (pattern, item) => {
        if (pattern instanceof RegExp) pattern = { message: pattern };
        if (Array.isArray(pattern)) return pattern.every((p) => check(p, item));
        return Object.keys(pattern).every((key) => {
            let value = item[key];
            if (value !== null && typeof value === "object") value = JSON.stringify(value);
            return pattern[key].test(String(value));
        });
    };
    if (!Array.isArray(expected)) return "expected the module to export an array of " + kind + " patterns";
    if (expected.length !== actual.length) {
        return "expected " + expected.length + " " + kind + "(s) but got " + actual.length + ":\n" + listing();
    }
    for (let i = 0; i < expected.length; i++) {
        if (!check(expected[i], actual[i])) {
            return kind + " " + i + " does not match " + String(expected[i]) + ":\n  " + show(actual[i]);
        }
    }
    return null;
})
"#;

/// Checks stats diagnostics against the expectation files of a directory
#[derive(Debug, Clone)]
pub struct ExpectationChecker {
    directory: PathBuf,
}

impl ExpectationChecker {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Check `errors<suffix>.js` and `warnings<suffix>.js`
    pub fn check_stats(&self, stats: &Value, suffix: &str) -> Result<(), ExpectationError> {
        self.check(stats, DiagnosticKind::Error, &format!("errors{suffix}"))?;
        self.check(stats, DiagnosticKind::Warning, &format!("warnings{suffix}"))
    }

    /// Check one list against `<stem>.js`
    pub fn check(&self, stats: &Value, kind: DiagnosticKind, stem: &str) -> Result<(), ExpectationError> {
        let actual = diagnostics(stats, kind);
        let path = self.directory.join(format!("{stem}.js"));
        if !path.is_file() {
            if actual.is_empty() {
                return Ok(());
            }
            return Err(ExpectationError::Unexpected {
                kind,
                count: actual.len(),
                path,
                details: render(&actual),
            });
        }
        let source = std::fs::read_to_string(&path).map_err(|source| ExpectationError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(file = %path.display(), actual = actual.len(), "checking {kind} expectations");

        match evaluate(&source, &path, &actual, kind) {
            Ok(None) => Ok(()),
            Ok(Some(message)) => Err(ExpectationError::Mismatch { path, message }),
            Err(message) => Err(ExpectationError::Evaluate { path, message }),
        }
    }
}

/// Run the expectation module and the matcher; `Ok(Some(_))` describes a
/// mismatch, `Err(_)` an evaluation failure
fn evaluate(source: &str, path: &Path, actual: &[Value], kind: DiagnosticKind) -> Result<Option<String>, String> {
    let mut context = Context::default();
    let context = &mut context;
    let describe = |e: boa_engine::JsError| e.to_string();

    let wrapper = format!("(function (module, exports) {{\n{source}\n}})");
    let function = context
        .eval(Source::from_bytes(wrapper.as_bytes()).with_path(path))
        .map_err(describe)?;
    let function = function
        .as_callable()
        .map(|f| f.clone())
        .ok_or("expectation wrapper is not a function")?;
    let module = JsObject::with_object_proto(context.intrinsics());
    let exports = JsObject::with_object_proto(context.intrinsics());
    module
        .set(js_string!("exports"), exports.clone(), false, context)
        .map_err(describe)?;
    function
        .call(&JsValue::undefined(), &[module.clone().into(), exports.into()], context)
        .map_err(describe)?;

    let mut expected = module.get(js_string!("exports"), context).map_err(describe)?;
    if let Some(factory) = expected.as_callable().map(|f| f.clone()) {
        expected = factory.call(&JsValue::undefined(), &[], context).map_err(describe)?;
    }

    let checker = context.eval(Source::from_bytes(CHECK_JS.as_bytes())).map_err(describe)?;
    let checker = checker
        .as_callable()
        .map(|f| f.clone())
        .ok_or("expectation checker is not a function")?;
    let actual = JsValue::from_json(&Value::Array(actual.to_vec()), context).map_err(describe)?;
    let verdict = checker
        .call(
            &JsValue::undefined(),
            &[expected, actual, js_string!(kind.to_string()).into()],
            context,
        )
        .map_err(describe)?;
    if verdict.is_null_or_undefined() {
        return Ok(None);
    }
    let message = verdict.to_string(context).map_err(describe)?;
    Ok(Some(message.to_std_string_escaped()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn test_missing_file_allows_clean_stats() {
        let dir = tempfile::tempdir().unwrap();
        let checker = ExpectationChecker::new(dir.path());
        assert!(checker.check_stats(&json!({"errors": [], "warnings": []}), "").is_ok());
        let err = checker
            .check_stats(&json!({"errors": ["Module not found"]}), "")
            .unwrap_err();
        assert!(matches!(err, ExpectationError::Unexpected { count: 1, .. }));
    }

    #[test]
    fn test_patterns_must_match_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("errors1.js"),
            "module.exports = [[/Module not found/, /'\\.\\/missing'/], { moduleName: /index/, message: /Unexpected token/ }];",
        )
        .unwrap();
        let checker = ExpectationChecker::new(dir.path());
        let stats = json!({
            "errors": [
                { "message": "Module not found: Can't resolve './missing'" },
                { "moduleName": "./index.js", "message": "Unexpected token (3:1)" }
            ]
        });
        assert!(checker.check(&stats, DiagnosticKind::Error, "errors1").is_ok());

        let swapped = json!({ "errors": [stats["errors"][1].clone(), stats["errors"][0].clone()] });
        let err = checker.check(&swapped, DiagnosticKind::Error, "errors1").unwrap_err();
        assert!(matches!(err, ExpectationError::Mismatch { .. }), "{err}");
    }

    #[test]
    fn test_count_mismatch_lists_actual() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("warnings.js"), "module.exports = [/a/, /b/];").unwrap();
        let checker = ExpectationChecker::new(dir.path());
        let err = checker
            .check(&json!({"warnings": ["only a"]}), DiagnosticKind::Warning, "warnings")
            .unwrap_err()
            .to_string();
        assert!(err.contains("expected 2 warning(s) but got 1"), "{err}");
        assert!(err.contains("only a"), "{err}");
    }

    #[test]
    fn test_broken_expectation_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("errors.js"), "module.exports = [;").unwrap();
        let checker = ExpectationChecker::new(dir.path());
        let err = checker.check(&json!({}), DiagnosticKind::Error, "errors").unwrap_err();
        assert!(matches!(err, ExpectationError::Evaluate { .. }));
    }
}
