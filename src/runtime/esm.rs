//! ES module requirer and module loader
//!
//! Source-text modules are parsed into the runner's ESM realm and cached by
//! file path. Static and dynamic imports reach [`RunnerModuleLoader`], which
//! re-enters the requirer dispatch from the importing module's directory;
//! anything that is not itself an ES module is wrapped into a synthetic
//! module.
//!
//! `import(...)` inside an ES module is rewritten to a module-local host
//! function. A module that was already evaluated, statically or
//! dynamically, hands back its existing namespace instead of being loaded,
//! linked and evaluated again.

use boa_engine::{
    Context, JsArgs, JsResult, JsString, JsValue, NativeFunction, Source, js_string,
    builtins::promise::PromiseState,
    module::{Module, ModuleLoader, Referrer, SyntheticModuleInitializer},
    object::builtins::JsPromise,
};
use boa_gc::{Finalize, Trace};
use std::{
    cell::RefCell,
    path::{Path, PathBuf},
    rc::Rc,
};

use super::{
    RunnerHandle, call_helper,
    needs::{self, LazyBinding, NeedSet},
    object_keys, realm,
    relocate::{self, OffsetTable},
    requirer::{self, RequireContext, Required},
    scope::{self, identifier_directory},
};
use crate::resolver::{ModulePath, RunnerFile};

/// Lifecycle of a cached module as the runner drives it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EsmStatus {
    Unlinked,
    Evaluating,
    Evaluated,
}

#[derive(Trace, Finalize)]
pub(crate) struct EsmRecord {
    pub(crate) module: Module,
    /// Promise of the first `load_link_evaluate`
    pub(crate) evaluation: Option<JsPromise>,
    #[unsafe_ignore_trace]
    pub(crate) identifier: String,
    #[unsafe_ignore_trace]
    pub(crate) url: String,
    /// Handed to Boa as a static import, so evaluated with its importer
    #[unsafe_ignore_trace]
    pub(crate) imported: bool,
}

impl EsmRecord {
    pub(crate) fn status(&self) -> EsmStatus {
        match &self.evaluation {
            None => EsmStatus::Unlinked,
            Some(promise) => match promise.state() {
                PromiseState::Pending => EsmStatus::Evaluating,
                _ => EsmStatus::Evaluated,
            },
        }
    }
}

/// `file://` URL of an absolute path
pub(crate) fn file_url(path: &Path) -> String {
    url::Url::from_file_path(path)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("file://{}", path.display()))
}

/// Global of the ESM realm that serves rewritten `import(...)` calls
pub(crate) const DYNAMIC_IMPORT_GLOBAL: &str = "__rspack_dynamic_import__";
/// Module-local function `import(...)` calls are rewritten to
const DYNAMIC_IMPORT_LOCAL: &str = "__rspack_import__";

/// Statement list assigning `import.meta` fields, kept on the first line.
/// Modules with dynamic imports also get a hoisted local import function
/// bound to their directory; it defers to a job like `import()` does.
fn import_meta_prologue(path: &Path, dynamic_imports: bool) -> String {
    let quote = |s: String| serde_json::to_string(&s).unwrap_or_else(|_| "\"\"".to_string());
    let directory = quote(path.parent().unwrap_or(path).to_string_lossy().into_owned());
    let mut prologue = format!(
        "import.meta.url = {}; import.meta.dirname = {directory}; import.meta.filename = {};",
        quote(file_url(path)),
        quote(path.to_string_lossy().into_owned()),
    );
    if dynamic_imports {
        prologue.push_str(&format!(
            " function {DYNAMIC_IMPORT_LOCAL}(request) {{ return Promise.resolve().then(() => {DYNAMIC_IMPORT_GLOBAL}({directory}, request)); }}"
        ));
    }
    prologue
}

/// Replace the `import` keyword of each `import(...)` expression; lines stay
/// where they were
fn rewrite_dynamic_imports(content: &str) -> Option<String> {
    let offsets = needs::dynamic_import_offsets(content);
    if offsets.is_empty() {
        return None;
    }
    let mut rewritten = String::with_capacity(content.len() + offsets.len() * DYNAMIC_IMPORT_LOCAL.len());
    let mut last = 0;
    for offset in offsets {
        rewritten.push_str(&content[last..offset]);
        rewritten.push_str(DYNAMIC_IMPORT_LOCAL);
        last = offset + "import".len();
    }
    rewritten.push_str(&content[last..]);
    Some(rewritten)
}

fn parse_module(handle: &RunnerHandle, file: &RunnerFile, context: &mut Context) -> JsResult<EsmRecord> {
    let name = handle.borrow().options.name.clone();
    let realm = realm::esm_realm(handle, context)?;
    let rewritten = rewrite_dynamic_imports(&file.content);
    let prologue = import_meta_prologue(&file.path, rewritten.is_some());
    let table = OffsetTable::new(&file.path, file.content.clone(), 0).with_first_line_columns(prologue.len());
    let code = format!("{prologue}{}", rewritten.as_deref().unwrap_or(&file.content));
    let source = Source::from_bytes(code.as_bytes()).with_path(&file.path);
    let module = Module::parse(source, Some(realm), context).map_err(|e| relocate::relocate_error(e, &table, context))?;
    Ok(EsmRecord {
        module,
        evaluation: None,
        identifier: format!("{}{}", scope::identifier_prefix(&name), file.path.display()),
        url: format!("{}?{name}", file_url(&file.path)),
        imported: false,
    })
}

/// Publish the lazy bindings a module references on the ESM realm's global
fn publish_lazy_bindings(handle: &RunnerHandle, file: &RunnerFile, context: &mut Context) -> JsResult<()> {
    let needs = NeedSet::analyze(&file.content, true);
    if needs.is_empty() {
        return Ok(());
    }
    let realm = realm::esm_realm(handle, context)?;
    for binding in LazyBinding::ALL {
        if !needs.contains(binding) {
            continue;
        }
        if let Some(value) = scope::lazy_value(handle, binding, context)? {
            realm::with_realm(context, &realm, |context| {
                context
                    .global_object()
                    .set(js_string!(binding.name()), value, false, context)
            })?;
        }
    }
    Ok(())
}

/// Evaluation promise of `module`, starting the evaluation only when neither
/// the runner nor an importing graph has done so
fn evaluation_of(handle: &RunnerHandle, module: &Module, context: &mut Context) -> JsPromise {
    let key = module.path().map(|p| p.to_string_lossy().into_owned());
    let existing = key
        .as_ref()
        .and_then(|key| handle.borrow().esm_cache.get(key).map(|r| (r.evaluation.clone(), r.imported, r.status())));
    match existing {
        Some((Some(promise), _, status)) => {
            tracing::trace!(path = ?key, ?status, "es module already evaluated");
            promise
        }
        Some((None, true, _)) => {
            tracing::trace!(path = ?key, "es module evaluated by its importer");
            JsPromise::resolve(JsValue::undefined(), context)
        }
        _ => {
            let promise = module.load_link_evaluate(context);
            if let Some(key) = key
                && let Some(record) = handle.borrow_mut().esm_cache.get_mut(&key)
            {
                record.evaluation = Some(promise.clone());
            }
            promise
        }
    }
}

fn namespace_getter(_this: &JsValue, _args: &[JsValue], module: &Module, context: &mut Context) -> JsResult<JsValue> {
    Ok(module.namespace(context).into())
}

pub(crate) fn require_esm(
    handle: &RunnerHandle,
    file: RunnerFile,
    require_context: &RequireContext,
    context: &mut Context,
) -> JsResult<Required> {
    publish_lazy_bindings(handle, &file, context)?;

    let key = file.path.to_string_lossy().into_owned();
    let cached = handle.borrow().esm_cache.get(&key).map(|r| r.module.clone());
    let module = match cached {
        Some(module) => module,
        None => {
            tracing::debug!(path = %key, "parsing es module");
            let record = parse_module(handle, &file, context)?;
            let module = record.module.clone();
            handle.borrow_mut().esm_cache.insert(key.clone(), record);
            module
        }
    };
    if require_context.unlinked {
        return Ok(Required::Module(module));
    }

    let evaluation = evaluation_of(handle, &module, context);
    let namespace = NativeFunction::from_copy_closure_with_captures(namespace_getter, module).to_js_function(context.realm());
    let unwrap = if require_context.entry { "esmEntryResult" } else { "esmResult" };
    let result = call_helper(handle, unwrap, &[evaluation.into(), namespace.into()], context)?;
    Ok(Required::Value(result))
}

/// `import(request)` from an ES module in `directory`: a promise of the
/// target's namespace object
fn import_dynamic(handle: &RunnerHandle, directory: &Path, request: String, context: &mut Context) -> JsResult<JsValue> {
    tracing::debug!(request = %request, from = %directory.display(), "dynamic import");
    let require_context = RequireContext {
        unlinked: true,
        ..RequireContext::default()
    };
    let module_path = ModulePath::from(request).without_query();
    let module = match requirer::require(handle, directory, module_path, require_context, context)? {
        Required::Module(module) => module,
        Required::Value(value) => as_module(handle, value, context)?,
    };
    let evaluation = evaluation_of(handle, &module, context);
    let namespace = NativeFunction::from_copy_closure_with_captures(namespace_getter, module).to_js_function(context.realm());
    call_helper(handle, "esmNamespace", &[evaluation.into(), namespace.into()], context)
}

/// `__rspack_dynamic_import__(directory, request)`; failures reject
pub(crate) fn dynamic_import_native(
    _this: &JsValue,
    args: &[JsValue],
    handle: &RunnerHandle,
    context: &mut Context,
) -> JsResult<JsValue> {
    let directory = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    let request = args.get_or_undefined(1).to_string(context)?.to_std_string_escaped();
    match import_dynamic(handle, Path::new(&directory), request, context) {
        Ok(promise) => Ok(promise),
        Err(error) => Ok(JsPromise::reject(error, context).into()),
    }
}

#[derive(Trace, Finalize)]
struct SyntheticExports {
    names: Vec<JsString>,
    values: Vec<JsValue>,
}

/// Wrap a required value as a module: every own key becomes an export, and
/// `default` is the value's own `default` or, failing that, the value itself
pub(crate) fn as_module(handle: &RunnerHandle, value: JsValue, context: &mut Context) -> JsResult<Module> {
    let mut names = vec![js_string!("default")];
    let mut values = Vec::new();

    let is_namespace = call_helper(handle, "isNamespace", &[value.clone()], context)?.to_boolean();
    let mut default = value.clone();
    if let Some(object) = value.as_object().map(|o| o.clone()) {
        for key in object_keys(&object, context)? {
            let export = object.get(js_string!(key.clone()), context)?;
            if key == "default" {
                default = export;
            } else {
                names.push(js_string!(key));
                values.push(export);
            }
        }
        if is_namespace && !object.has_own_property(js_string!("default"), context)? {
            default = JsValue::undefined();
        }
    }
    values.insert(0, default);

    let realm = realm::esm_realm(handle, context)?;
    let exports = SyntheticExports { names: names.clone(), values };
    let initializer = SyntheticModuleInitializer::from_copy_closure_with_captures(
        |module, exports: &SyntheticExports, _context| {
            for (name, value) in exports.names.iter().zip(&exports.values) {
                module.set_export(name, value.clone())?;
            }
            Ok(())
        },
        exports,
    );
    Ok(Module::synthetic(&names, initializer, None, Some(realm), context))
}

/// Routes module resolution back into the runner
pub(crate) struct RunnerModuleLoader {
    handle: RunnerHandle,
}

impl RunnerModuleLoader {
    pub(crate) fn new(handle: RunnerHandle) -> Self {
        Self { handle }
    }

    /// Directory imports of `referrer` resolve against
    fn referrer_directory(&self, referrer: &Referrer) -> PathBuf {
        let state = self.handle.borrow();
        let Some(path) = referrer.path() else {
            return state.options.dist.clone();
        };
        state
            .esm_cache
            .get(path.to_string_lossy().as_ref())
            .and_then(|record| record_directory(record, &state.options.name))
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| path.to_path_buf())
    }
}

impl ModuleLoader for RunnerModuleLoader {
    fn load_imported_module(
        self: Rc<Self>,
        referrer: Referrer,
        specifier: JsString,
        context: &RefCell<&mut Context>,
    ) -> impl std::future::Future<Output = JsResult<Module>> {
        let specifier = specifier.to_std_string_escaped();
        let directory = self.referrer_directory(&referrer);

        async move {
            let mut context = context.borrow_mut();
            let context: &mut Context = &mut context;
            tracing::debug!(specifier = %specifier, from = %directory.display(), "import");
            let require_context = RequireContext {
                unlinked: true,
                ..RequireContext::default()
            };
            let module_path = ModulePath::from(specifier).without_query();
            match requirer::require(&self.handle, &directory, module_path, require_context, context)? {
                Required::Module(module) => {
                    if let Some(path) = module.path()
                        && let Some(record) = self.handle.borrow_mut().esm_cache.get_mut(path.to_string_lossy().as_ref())
                    {
                        record.imported = true;
                    }
                    Ok(module)
                }
                Required::Value(value) => as_module(&self.handle, value, context),
            }
        }
    }
}

/// Directory of a module from its per-run identifier
pub(crate) fn record_directory(record: &EsmRecord, name: &str) -> Option<PathBuf> {
    identifier_directory(&record.identifier, name)
        .map(Path::to_path_buf)
        .or_else(|| {
            let url = url::Url::parse(&record.url).ok()?;
            let path = url.to_file_path().ok()?;
            path.parent().map(Path::to_path_buf)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_url() {
        assert_eq!(file_url(Path::new("/dist/a b.mjs")), "file:///dist/a%20b.mjs");
    }

    #[test]
    fn test_prologue_is_single_line() {
        let prologue = import_meta_prologue(Path::new("/dist/chunk/a.mjs"), false);
        assert!(!prologue.contains('\n'));
        assert!(prologue.contains("import.meta.url = \"file:///dist/chunk/a.mjs\""));
        assert!(prologue.contains("import.meta.dirname = \"/dist/chunk\""));
        assert!(!prologue.contains(DYNAMIC_IMPORT_LOCAL));

        let prologue = import_meta_prologue(Path::new("/dist/chunk/a.mjs"), true);
        assert!(!prologue.contains('\n'));
        assert!(prologue.contains(&format!("function {DYNAMIC_IMPORT_LOCAL}(request)")));
    }

    #[test]
    fn test_rewrite_keeps_lines() {
        let content = "const a = 1;\nexport default import('./dep.mjs');\nimport.meta.url;\n";
        let rewritten = rewrite_dynamic_imports(content).unwrap();
        assert_eq!(rewritten.lines().count(), content.lines().count());
        assert!(rewritten.contains("export default __rspack_import__('./dep.mjs');"));
        assert!(rewritten.contains("\nimport.meta.url;"));
        assert!(rewrite_dynamic_imports("export const x = 1;").is_none());
    }
}
