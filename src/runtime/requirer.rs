//! Requirer dispatch
//!
//! Every `require`, static import, dynamic import and script load funnels
//! through [`require`]: resolve the request to a file, then hand it to the
//! JSON, ESM or CommonJS requirer. Requests that are not files the runner
//! addresses directly fall through to the miss requirer.

use boa_engine::{
    Context, JsArgs, JsError, JsNativeError, JsResult, JsValue, NativeFunction, js_string,
    module::Module,
    object::builtins::{JsArray, JsFunction},
};
use boa_gc::{Finalize, Trace};
use std::path::{Path, PathBuf};

use super::{RunnerHandle, array_to_strings, bind_native, builtins, cjs, error_with_code, esm, miss, scope::ModuleScope};
use crate::resolver::{ModulePath, ResolveError, RunnerFile};

/// Per-call options of a require
#[derive(Debug, Default)]
pub(crate) struct RequireContext {
    /// Already resolved file, skips `get_file`
    pub(crate) file: Option<RunnerFile>,
    /// Return ES modules unlinked instead of evaluating them
    pub(crate) unlinked: bool,
    /// The request is the entry of a `run()`
    pub(crate) entry: bool,
    /// Bindings layered over the module scope; the module bypasses the
    /// require cache (worker entries)
    pub(crate) overlay: Option<ModuleScope>,
}

/// What a requirer produced
pub(crate) enum Required {
    Value(JsValue),
    Module(Module),
}

impl Required {
    pub(crate) fn into_value(self, context: &mut Context) -> JsResult<JsValue> {
        match self {
            Required::Value(value) => Ok(value),
            Required::Module(module) => Ok(module.namespace(context).into()),
        }
    }
}

/// Turn a resolver failure into a JS error carrying its Node-style code
pub(crate) fn resolve_error(error: ResolveError, context: &mut Context) -> JsError {
    error_with_code(error.to_string(), error.code(), context)
}

pub(crate) fn get_file(
    handle: &RunnerHandle,
    module_path: &ModulePath,
    directory: &Path,
    context: &mut Context,
) -> JsResult<Option<RunnerFile>> {
    let files = handle.borrow().files.clone();
    files
        .get_file(module_path, directory)
        .map_err(|e| resolve_error(e, context))
}

/// The entry requirer
pub(crate) fn require(
    handle: &RunnerHandle,
    directory: &Path,
    module_path: ModulePath,
    mut require_context: RequireContext,
    context: &mut Context,
) -> JsResult<Required> {
    let file = match require_context.file.take() {
        Some(file) => Some(file),
        None => get_file(handle, &module_path, directory, context)?,
    };
    let Some(file) = file else {
        return miss::require_miss(handle, directory, &module_path, context).map(Required::Value);
    };

    if file.is_json() {
        return require_json(&module_path, &file, context).map(Required::Value);
    }
    let esm_enabled = handle.borrow().options.esm_enabled();
    if file.is_mjs() && esm_enabled {
        return esm::require_esm(handle, file, &require_context, context);
    }
    cjs::require_cjs(handle, &module_path, file, require_context.overlay.as_ref(), context).map(Required::Value)
}

fn require_json(module_path: &ModulePath, file: &RunnerFile, context: &mut Context) -> JsResult<JsValue> {
    if matches!(module_path, ModulePath::Many(_)) {
        return Err(JsNativeError::error()
            .with_message("Array module path is not supported in hot cases")
            .into());
    }
    let json: serde_json::Value = serde_json::from_str(&file.content).map_err(|e| {
        JsNativeError::syntax().with_message(format!("{}: {e}", file.path.display()))
    })?;
    JsValue::from_json(&json, context)
}

/// Read a request argument: a string, or an array of strings
pub(crate) fn module_path_from_js(value: &JsValue, context: &mut Context) -> JsResult<ModulePath> {
    if let Some(object) = value.as_object().map(|o| o.clone())
        && object.is_array()
    {
        let array = JsArray::from_object(object)?;
        return Ok(ModulePath::Many(array_to_strings(&array.into(), context)?));
    }
    Ok(ModulePath::Single(value.to_string(context)?.to_std_string_escaped()))
}

/// Where a request would be loaded from, as `require.resolve` reports it
pub(crate) fn resolve_request(
    handle: &RunnerHandle,
    directory: &Path,
    request: &str,
    context: &mut Context,
) -> JsResult<String> {
    let module_path = ModulePath::from(request).without_query();
    if let Some(file) = get_file(handle, &module_path, directory, context)? {
        return Ok(file.path.to_string_lossy().into_owned());
    }
    if miss::is_mocked(handle, request, context)? || builtins::is_builtin(request) {
        return Ok(request.to_string());
    }
    let packages = handle.borrow().packages.clone();
    packages
        .resolve(request, directory)
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|e| resolve_error(e, context))
}

#[derive(Trace, Finalize)]
struct BoundRequire {
    handle: RunnerHandle,
    #[unsafe_ignore_trace]
    directory: PathBuf,
}

fn bound_require(_this: &JsValue, args: &[JsValue], bound: &BoundRequire, context: &mut Context) -> JsResult<JsValue> {
    let module_path = module_path_from_js(args.get_or_undefined(0), context)?.without_query();
    require(&bound.handle, &bound.directory, module_path, RequireContext::default(), context)?.into_value(context)
}

fn bound_resolve(_this: &JsValue, args: &[JsValue], bound: &BoundRequire, context: &mut Context) -> JsResult<JsValue> {
    let request = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    let resolved = resolve_request(&bound.handle, &bound.directory, &request, context)?;
    Ok(js_string!(resolved).into())
}

/// `require` bound to a module's directory
pub(crate) fn create_require(handle: &RunnerHandle, directory: &Path, context: &mut Context) -> JsResult<JsFunction> {
    let bound = || BoundRequire {
        handle: handle.clone(),
        directory: directory.to_path_buf(),
    };
    let require = NativeFunction::from_copy_closure_with_captures(bound_require, bound()).to_js_function(context.realm());
    let resolve = NativeFunction::from_copy_closure_with_captures(bound_resolve, bound()).to_js_function(context.realm());
    require.set(js_string!("resolve"), resolve, false, context)?;
    require.set(js_string!("webpackTestSuiteRequire"), true, false, context)?;
    Ok(require)
}

fn runner_require(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let directory = PathBuf::from(args.get_or_undefined(0).to_string(context)?.to_std_string_escaped());
    let module_path = module_path_from_js(args.get_or_undefined(1), context)?.without_query();
    require(handle, &directory, module_path, RequireContext::default(), context)?.into_value(context)
}

/// The runner-level `(currentDirectory, modulePath)` require
pub(crate) fn create_runner_require(handle: &RunnerHandle, context: &mut Context) -> JsFunction {
    bind_native(handle, runner_require, context)
}
