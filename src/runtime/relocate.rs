//! Error relocation onto original source lines
//!
//! Module bodies are executed inside generated wrappers, so engine line
//! numbers are off by the wrapper's injected lines. Each wrapper records an
//! [`OffsetTable`]; when an error escapes, its location is recovered from the
//! error object, its stack, or its message, mapped back onto the file and
//! rendered with two lines of context around the offending one.

use boa_engine::{
    Context, JsError, JsNativeError, JsObject, JsValue, js_string, property::PropertyDescriptor,
};
use std::{path::PathBuf, rc::Rc};

const RELOCATED_MARKER: &str = "__relocated";
const CONTEXT_LINES: usize = 2;

/// How a wrapper shifted a file's lines
#[derive(Debug, Clone)]
pub struct OffsetTable {
    pub file: PathBuf,
    pub content: Rc<str>,
    /// Lines the wrapper emits before the file's first line
    pub injected_lines: usize,
    /// Columns a prologue adds in front of the file's first line
    pub first_line_columns: usize,
}

impl OffsetTable {
    pub fn new(file: impl Into<PathBuf>, content: Rc<str>, injected_lines: usize) -> Self {
        Self {
            file: file.into(),
            content,
            injected_lines,
            first_line_columns: 0,
        }
    }

    pub fn with_first_line_columns(mut self, columns: usize) -> Self {
        self.first_line_columns = columns;
        self
    }

    /// Map a wrapper position (1-based) to a position in the file
    pub fn map(&self, line: usize, column: usize) -> Option<(usize, usize)> {
        let line = line.checked_sub(self.injected_lines)?;
        if line == 0 || line > self.content.lines().count().max(1) {
            return None;
        }
        let column = if line == 1 {
            column.saturating_sub(self.first_line_columns).max(1)
        } else {
            column
        };
        Some((line, column))
    }

    /// `message` followed by the location and a window of source lines
    pub fn render(&self, message: &str, line: usize, column: usize) -> String {
        let lines: Vec<&str> = self.content.lines().collect();
        let first = line.saturating_sub(CONTEXT_LINES).max(1);
        let last = (line + CONTEXT_LINES).min(lines.len());
        let width = last.to_string().len();

        let mut out = format!("{message}\n    at {}:{line}:{column}", self.file.display());
        for number in first..=last {
            let marker = if number == line { '>' } else { ' ' };
            let text = lines.get(number - 1).copied().unwrap_or_default();
            out.push_str(&format!("\n{marker} {number:<width$} | {text}"));
        }
        out
    }
}

/// Find `LINE:COL` at the end of a stack frame, ignoring a closing paren
fn trailing_position(frame: &str) -> Option<(usize, usize)> {
    let frame = frame.trim().trim_end_matches(')');
    let (rest, column) = frame.rsplit_once(':')?;
    let (_, line) = rest.rsplit_once(':')?;
    Some((line.parse().ok()?, column.parse().ok()?))
}

/// Location of the innermost stack frame inside `file`, falling back to an
/// anonymous script frame (`at <anonymous>:LINE:COL`)
pub fn location_in_stack(stack: &str, file: &str) -> Option<(usize, usize)> {
    let frames = || stack.lines().map(str::trim).filter(|frame| frame.starts_with("at "));
    frames()
        .filter(|frame| frame.contains(file))
        .find_map(trailing_position)
        .or_else(|| {
            frames()
                .filter(|frame| frame.contains("<anonymous>:"))
                .find_map(trailing_position)
        })
}

/// Location embedded in an engine syntax error: `... at line N, col M`
pub fn location_in_message(message: &str) -> Option<(usize, usize)> {
    let index = message.rfind("at line ")?;
    let rest = &message[index + "at line ".len()..];
    let (line, rest) = rest.split_once(',')?;
    let column: String = rest
        .trim_start()
        .strip_prefix("col ")?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    Some((line.trim().parse().ok()?, column.parse().ok()?))
}

fn string_property(object: &JsObject, name: &str, context: &mut Context) -> Option<String> {
    let value = object.get(js_string!(name), context).ok()?;
    if value.is_undefined() || value.is_null() {
        return None;
    }
    value.to_string(context).ok().map(|s| s.to_std_string_escaped())
}

fn number_property(object: &JsObject, name: &str, context: &mut Context) -> Option<usize> {
    let value = object.get(js_string!(name), context).ok()?;
    let number = value.as_number()?;
    (number.is_finite() && number >= 0.0).then_some(number as usize)
}

fn native_of_kind(name: &str) -> JsNativeError {
    match name {
        "SyntaxError" => JsNativeError::syntax(),
        "TypeError" => JsNativeError::typ(),
        "RangeError" => JsNativeError::range(),
        "ReferenceError" => JsNativeError::reference(),
        "EvalError" => JsNativeError::eval(),
        "URIError" => JsNativeError::uri(),
        _ => JsNativeError::error(),
    }
}

/// Rewrite `error` so its message points into the original file. Errors
/// that were already relocated, or whose location cannot be recovered, are
/// returned unchanged.
///
/// The engine backtrace only survives on the [`JsError`] itself, so its
/// rendered frames are read before the error is turned into a value.
pub fn relocate_error(error: JsError, table: &OffsetTable, context: &mut Context) -> JsError {
    let file = table.file.to_string_lossy();
    let backtrace = location_in_stack(&error.to_string(), &file);
    let value = error.to_opaque(context);
    let Some(object) = value.as_object().map(|o| o.clone()) else {
        return error;
    };
    if object
        .get(js_string!(RELOCATED_MARKER), context)
        .map(|v| v.to_boolean())
        .unwrap_or(false)
    {
        return error;
    }

    let message = string_property(&object, "message", context).unwrap_or_default();
    let stack = string_property(&object, "stack", context);

    let position = backtrace.or(match (
        number_property(&object, "lineNumber", context),
        number_property(&object, "columnNumber", context),
    ) {
        (Some(line), Some(column)) => Some((line, column)),
        _ => None,
    })
    .or_else(|| stack.as_deref().and_then(|s| location_in_stack(s, &file)))
    .or_else(|| location_in_message(&message));

    let Some((line, column)) = position.and_then(|(line, column)| table.map(line, column)) else {
        return error;
    };

    let name = string_property(&object, "name", context).unwrap_or_else(|| "Error".to_string());
    let relocated = JsError::from(native_of_kind(&name).with_message(table.render(&message, line, column)));
    let relocated = relocated.to_opaque(context);
    if let Some(target) = relocated.as_object() {
        let original_stack = stack.map(|s| JsValue::from(js_string!(s))).unwrap_or_default();
        let _ = target.set(js_string!("originalStack"), original_stack, false, context);
        if let Ok(code) = object.get(js_string!("code"), context)
            && !code.is_undefined()
        {
            let _ = target.set(js_string!("code"), code, false, context);
        }
        let _ = target.define_property_or_throw(
            js_string!(RELOCATED_MARKER),
            PropertyDescriptor::builder()
                .value(true)
                .writable(false)
                .enumerable(false)
                .configurable(true)
                .build(),
            context,
        );
    }
    tracing::trace!(file = %file, line, column, "relocated error");
    JsError::from_opaque(relocated)
}

/// One-line-or-more description of an escaped exception
pub fn describe_error(error: &JsError, context: &mut Context) -> String {
    let value = error.to_opaque(context);
    if let Some(object) = value.as_object().map(|o| o.clone()) {
        let message = string_property(&object, "message", context);
        let name = string_property(&object, "name", context);
        match (name, message) {
            (Some(name), Some(message)) if !message.is_empty() => return format!("{name}: {message}"),
            (Some(name), _) => return name,
            (None, Some(message)) => return message,
            (None, None) => {}
        }
    }
    value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> OffsetTable {
        OffsetTable::new("/dist/main.js", Rc::from("one\ntwo\nthree\nfour\nfive\nsix"), 2)
    }

    #[test]
    fn test_map_subtracts_injected_lines() {
        assert_eq!(table().map(5, 4), Some((3, 4)));
        assert_eq!(table().map(2, 1), None);
        assert_eq!(table().map(40, 1), None);
    }

    #[test]
    fn test_map_first_line_columns() {
        let table = OffsetTable::new("/a.mjs", Rc::from("x\ny"), 0).with_first_line_columns(10);
        assert_eq!(table.map(1, 14), Some((1, 4)));
        assert_eq!(table.map(2, 14), Some((2, 14)));
    }

    #[test]
    fn test_render_marks_line() {
        let out = table().render("boom", 3, 2);
        assert!(out.starts_with("boom\n    at /dist/main.js:3:2"));
        assert!(out.contains("\n  1 | one"));
        assert!(out.contains("\n> 3 | three"));
        assert!(out.contains("\n  5 | five"));
        assert!(!out.contains("six"));
    }

    #[test]
    fn test_location_in_stack() {
        let stack = "Error: x\n    at foo (/dist/other.js:9:9)\n    at /dist/main.js:12:5";
        assert_eq!(location_in_stack(stack, "/dist/main.js"), Some((12, 5)));
        assert_eq!(location_in_stack("at <anonymous>:3:1", "/x.js"), Some((3, 1)));
        assert_eq!(location_in_stack("no frames", "/x.js"), None);
    }

    #[test]
    fn test_location_in_message() {
        assert_eq!(
            location_in_message("expected token ';', got 'x' in expression statement at line 4, col 12"),
            Some((4, 12))
        );
        assert_eq!(location_in_message("plain failure"), None);
    }

    #[test]
    fn test_relocate_keeps_unlocatable_errors() {
        let mut context = Context::default();
        let error = JsError::from(JsNativeError::typ().with_message("nowhere"));
        let relocated = relocate_error(error, &table(), &mut context);
        assert_eq!(describe_error(&relocated, &mut context), "TypeError: nowhere");
    }

    #[test]
    fn test_relocate_syntax_error_once() {
        let mut context = Context::default();
        let error = JsError::from(JsNativeError::syntax().with_message("unexpected token at line 5, col 1"));
        let relocated = relocate_error(error, &table(), &mut context);
        let text = describe_error(&relocated, &mut context);
        assert!(text.starts_with("SyntaxError: unexpected token"));
        assert!(text.contains("> 3 | three"));

        let again = relocate_error(relocated, &table(), &mut context);
        let text_again = describe_error(&again, &mut context);
        assert_eq!(text, text_again);
    }
}
