//! Module scope: the ordered name → value table that becomes the formal
//! parameters of a CommonJS module wrapper
//!
//! The base scope is assembled once per `run()`; every CommonJS module gets
//! a copy extended with its own `require`/`module`/`exports`/paths, then the
//! configured hooks, then the lazily computed bindings it references.

use boa_engine::{Context, JsObject, JsResult, JsValue, js_string, object::builtins::JsFunction};
use boa_gc::{Finalize, Trace};
use std::path::Path;

use super::{
    RunnerHandle, buffer, call_hook, helper, needs::{LazyBinding, NeedSet}, object_keys, process, realm,
    test_env, timers::TimerFunctions, worker,
};
use crate::resolver::RunnerFile;

#[derive(Debug, Clone, Trace, Finalize)]
struct Binding {
    name: String,
    value: JsValue,
}

/// Ordered set of bindings handed to a module body
#[derive(Debug, Clone, Default, Trace, Finalize)]
pub struct ModuleScope {
    bindings: Vec<Binding>,
}

impl ModuleScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a binding; replacing keeps the original position
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<JsValue>) {
        let name = name.into();
        let value = value.into();
        match self.bindings.iter_mut().find(|b| b.name == name) {
            Some(binding) => binding.value = value,
            None => self.bindings.push(Binding { name, value }),
        }
    }

    pub fn get(&self, name: &str) -> Option<&JsValue> {
        self.bindings.iter().find(|b| b.name == name).map(|b| &b.value)
    }

    pub fn remove(&mut self, name: &str) -> Option<JsValue> {
        let index = self.bindings.iter().position(|b| b.name == name)?;
        let binding = self.bindings.remove(index);
        Some(binding.value.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Overlay `other` on top of this scope
    pub fn extend(&mut self, other: &ModuleScope) {
        for binding in &other.bindings {
            self.set(binding.name.clone(), binding.value.clone());
        }
    }

    /// Names usable as parameters, with their values, in insertion order
    pub(crate) fn parameters(&self) -> (Vec<&str>, Vec<JsValue>) {
        let mut names = Vec::with_capacity(self.bindings.len());
        let mut values = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            if is_identifier(&binding.name) {
                names.push(binding.name.as_str());
                values.push(binding.value.clone());
            } else {
                tracing::warn!(name = %binding.name, "dropping scope binding that is not an identifier");
            }
        }
        (names, values)
    }

    /// Plain object view, for handing the scope to JS hooks
    pub fn to_object(&self, context: &mut Context) -> JsResult<JsObject> {
        let object = JsObject::with_object_proto(context.intrinsics());
        for binding in &self.bindings {
            object.set(js_string!(binding.name.clone()), binding.value.clone(), false, context)?;
        }
        Ok(object)
    }

    /// Rebuild from an object's own enumerable string keys
    pub fn from_object(object: &JsObject, context: &mut Context) -> JsResult<Self> {
        let mut scope = Self::new();
        for key in object_keys(object, context)? {
            let value = object.get(js_string!(key.clone()), context)?;
            scope.set(key, value);
        }
        Ok(scope)
    }
}

const RESERVED: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do", "else",
    "enum", "export", "extends", "false", "finally", "for", "function", "if", "import", "in", "instanceof", "let",
    "new", "null", "return", "static", "super", "switch", "this", "throw", "true", "try", "typeof", "var", "void",
    "while", "with", "yield",
];

/// Whether `name` can be used as a function parameter name
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_alphabetic() || first == '_' || first == '$') {
        return false;
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$') && !RESERVED.contains(&name)
}

/// Bindings every module of one `run()` shares
pub(crate) fn create_base_scope(handle: &RunnerHandle, context: &mut Context) -> JsResult<ModuleScope> {
    let global = realm::global_object(handle, context)?;
    let (mode, snapshot) = {
        let state = handle.borrow();
        (
            state.options.compiler_options.mode.clone(),
            state.options.source.join("__snapshot__"),
        )
    };

    let mut scope = ModuleScope::new();
    scope.set("console", global.get(js_string!("console"), context)?);
    let timers = TimerFunctions::new(handle, context);
    for (name, function) in timers.entries() {
        scope.set(name, function.clone());
    }
    scope.set("nsObj", helper(handle, "nsObj", context)?);
    scope.set("process", process::create_process(handle, context)?);
    scope.set("URL", global.get(js_string!("URL"), context)?);
    let (buffer, blob) = buffer::create_buffer_classes(context)?;
    scope.set("Blob", blob);
    scope.set("Symbol", global.get(js_string!("Symbol"), context)?);
    scope.set("Buffer", buffer);
    scope.set("self", global.clone());
    scope.set(
        "__MODE__",
        mode.map(|m| JsValue::from(js_string!(m))).unwrap_or_default(),
    );
    scope.set(
        "__SNAPSHOT__",
        js_string!(snapshot.to_string_lossy().into_owned()),
    );
    scope.set("Worker", worker::create_worker_class(handle, context)?);
    test_env::install(handle, &mut scope, context)?;

    let extensions = handle.borrow().extensions.clone();
    for extension in extensions.iter() {
        extension.extend_base_scope(handle, &mut scope, context)?;
    }
    tracing::trace!(bindings = scope.len(), "base scope assembled");
    Ok(scope)
}

/// Per-module scope of a CommonJS file
pub(crate) fn create_module_scope(
    handle: &RunnerHandle,
    file: &RunnerFile,
    module: &JsObject,
    require: JsFunction,
    context: &mut Context,
) -> JsResult<ModuleScope> {
    let mut scope = handle.borrow().base_scope.clone();
    let dirname = file.directory().to_string_lossy().into_owned();
    let filename = file.path.to_string_lossy().into_owned();

    scope.set("require", require);
    scope.set("module", module.clone());
    scope.set("exports", module.get(js_string!("exports"), context)?);
    scope.set("__dirname", js_string!(dirname));
    scope.set("__filename", js_string!(filename));

    let global_assign = JsObject::with_object_proto(context.intrinsics());
    let expect = scope.get("expect").cloned().unwrap_or_default();
    global_assign.set(js_string!("expect"), expect, false, context)?;
    scope.set("_globalAssign", global_assign);

    let extensions = handle.borrow().extensions.clone();
    for extension in extensions.iter() {
        extension.extend_module_scope(handle, file, &mut scope, context)?;
    }

    apply_scope_hooks(handle, &mut scope, context)?;

    let needs = NeedSet::analyze(&file.content, false);
    for binding in LazyBinding::ALL {
        if needs.contains(binding)
            && let Some(value) = lazy_value(handle, binding, context)?
        {
            scope.set(binding.name(), value);
        }
    }
    Ok(scope)
}

/// Run the Rust hook, then the JS `moduleScope(scope, stats, options)` hook
pub(crate) fn apply_scope_hooks(handle: &RunnerHandle, scope: &mut ModuleScope, context: &mut Context) -> JsResult<()> {
    let (hooks, options) = {
        let state = handle.borrow();
        (state.options.hooks.clone(), state.options.compiler_options.clone())
    };
    if let Some(hooks) = hooks {
        hooks.module_scope(scope, &options, context)?;
    }

    let Some(hook) = handle.borrow().js_config.module_scope.clone() else {
        return Ok(());
    };
    let object = scope.to_object(context)?;
    let stats = helper(handle, "stats", context)?;
    let options = JsValue::from_json(&options.to_value(), context)?;
    let returned = call_hook(&hook, &[object.clone().into(), stats, options], context)?;
    let source = returned.as_object().map(|o| o.clone()).unwrap_or(object);
    *scope = ModuleScope::from_object(&source, context)?;
    Ok(())
}

/// Materialise one lazy binding from the stats accessor
pub(crate) fn lazy_value(handle: &RunnerHandle, binding: LazyBinding, context: &mut Context) -> JsResult<Option<JsValue>> {
    let Some(stats) = handle.borrow().options.stats.clone() else {
        return Ok(None);
    };
    let Some(json) = stats() else {
        return Ok(None);
    };
    match binding {
        LazyBinding::Stats => Ok(Some(JsValue::from_json(&json, context)?)),
        LazyBinding::StatsIndex => Ok(json
            .get("__index__")
            .and_then(serde_json::Value::as_f64)
            .map(JsValue::from)),
    }
}

/// Directory prefix used by per-run ESM identifiers
pub(crate) fn identifier_prefix(name: &str) -> String {
    format!("{name}-")
}

/// Strip the identifier prefix and return the module's directory
pub(crate) fn identifier_directory<'a>(identifier: &'a str, name: &str) -> Option<&'a Path> {
    identifier
        .strip_prefix(&identifier_prefix(name))
        .map(Path::new)
        .and_then(Path::parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_in_place() {
        let mut scope = ModuleScope::new();
        scope.set("a", 1);
        scope.set("b", 2);
        scope.set("a", 3);
        assert_eq!(scope.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(scope.get("a").and_then(JsValue::as_number), Some(3.0));
    }

    #[test]
    fn test_remove_and_extend() {
        let mut base = ModuleScope::new();
        base.set("x", 1);
        base.set("y", 2);
        let mut overlay = ModuleScope::new();
        overlay.set("y", 20);
        overlay.set("z", 30);
        base.extend(&overlay);
        assert_eq!(base.remove("x").and_then(|v| v.as_number()), Some(1.0));
        assert_eq!(base.names().collect::<Vec<_>>(), vec!["y", "z"]);
        assert_eq!(base.get("y").and_then(JsValue::as_number), Some(20.0));
    }

    #[test]
    fn test_parameters_skip_invalid_names() {
        let mut scope = ModuleScope::new();
        scope.set("ok", 1);
        scope.set("not-ok", 2);
        scope.set("class", 3);
        let (names, values) = scope.parameters();
        assert_eq!(names, vec!["ok"]);
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_object_round_trip_keeps_order() {
        let mut context = Context::default();
        let mut scope = ModuleScope::new();
        scope.set("first", 1);
        scope.set("second", js_string!("two"));
        let object = scope.to_object(&mut context).unwrap();
        let back = ModuleScope::from_object(&object, &mut context).unwrap();
        assert_eq!(back.names().collect::<Vec<_>>(), vec!["first", "second"]);
    }

    #[test]
    fn test_identifier_directory() {
        assert_eq!(
            identifier_directory("main-/dist/chunks/a.mjs", "main"),
            Some(Path::new("/dist/chunks"))
        );
        assert_eq!(identifier_directory("other-/dist/a.mjs", "main"), None);
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("__STATS__"));
        assert!(is_identifier("$x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("new"));
    }
}
