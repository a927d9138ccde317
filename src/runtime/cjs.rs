//! CommonJS requirer
//!
//! A module body is wrapped in a function whose parameters are exactly the
//! module scope's names, evaluated once in the GlobalContext realm and
//! called with the scope's values. The module record is cached before the
//! body runs so circular requires observe partial exports.

use boa_engine::{Context, JsNativeError, JsObject, JsResult, JsValue, Source, js_string};
use std::path::Path;

use super::{
    RunnerHandle, call_hook, realm,
    relocate::{self, OffsetTable},
    requirer,
    scope::{self, ModuleScope},
};
use crate::resolver::{ModulePath, RunnerFile};

/// Copies test globals onto the real global object when modules share it
const GLOBAL_ASSIGN_PRELUDE: &str = "Object.assign(global, _globalAssign);\n";

/// Build the wrapper source and the offset table describing it
pub(crate) fn wrap(file: &RunnerFile, parameters: &[&str], shared_global: bool) -> (String, OffsetTable) {
    let prelude = if shared_global { GLOBAL_ASSIGN_PRELUDE } else { "" };
    let code = format!("(function({}) {{\n{prelude}{}\n}})", parameters.join(", "), file.content);
    let table = OffsetTable::new(&file.path, file.content.clone(), 1 + prelude.lines().count());
    (code, table)
}

/// `this` of a module body: the Rust hook, then `nonEsmThis(request)`,
/// then `module.exports`
fn module_this(handle: &RunnerHandle, request: &ModulePath, exports: JsValue, context: &mut Context) -> JsResult<JsValue> {
    let (hooks, js_hook) = {
        let state = handle.borrow();
        (state.options.hooks.clone(), state.js_config.non_esm_this.clone())
    };
    let request = request.to_string();
    if let Some(hooks) = hooks
        && let Some(this) = hooks.non_esm_this(Path::new(&request), context)?
    {
        return Ok(this);
    }
    if let Some(hook) = js_hook {
        return call_hook(&hook, &[js_string!(request).into()], context);
    }
    Ok(exports)
}

pub(crate) fn require_cjs(
    handle: &RunnerHandle,
    request: &ModulePath,
    file: RunnerFile,
    overlay: Option<&ModuleScope>,
    context: &mut Context,
) -> JsResult<JsValue> {
    let key = file.path.to_string_lossy().into_owned();
    let cached = match overlay {
        Some(_) => None,
        None => handle.borrow().require_cache.get(&key).cloned(),
    };
    if let Some(module) = cached {
        tracing::trace!(path = %key, "require cache hit");
        return module.get(js_string!("exports"), context);
    }
    tracing::debug!(path = %key, "executing commonjs module");

    let module = JsObject::with_object_proto(context.intrinsics());
    let exports = JsObject::with_object_proto(context.intrinsics());
    module.set(js_string!("exports"), exports.clone(), false, context)?;
    module.set(js_string!("id"), js_string!(key.clone()), false, context)?;
    module.set(js_string!("loaded"), false, false, context)?;
    module.set(js_string!("webpackTestSuiteModule"), true, false, context)?;
    if overlay.is_none() {
        handle.borrow_mut().require_cache.insert(key, module.clone());
    }

    let require = requirer::create_require(handle, file.directory(), context)?;
    let mut scope = scope::create_module_scope(handle, &file, &module, require, context)?;
    if let Some(overlay) = overlay {
        scope.extend(overlay);
    }
    let shared_global = !handle.borrow().options.run_in_new_context;
    let (names, values) = scope.parameters();
    let (code, table) = wrap(&file, &names, shared_global);
    let this = module_this(handle, request, exports.into(), context)?;

    let extensions = handle.borrow().extensions.clone();
    for extension in extensions.iter() {
        extension.pre_execute(handle, &file, context)?;
    }
    handle.borrow_mut().executing.push(table.clone());

    let result = (|| {
        let realm = realm::global_realm(handle, context)?;
        let source = Source::from_bytes(code.as_bytes()).with_path(&file.path);
        let function = realm::with_realm(context, &realm, |context| context.eval(source))?;
        let function = function
            .as_callable()
            .map(|f| f.clone())
            .ok_or_else(|| JsNativeError::typ().with_message("module wrapper is not a function"))?;
        function.call(&this, &values, context)
    })();

    handle.borrow_mut().executing.pop();
    for extension in extensions.iter() {
        extension.post_execute(handle, &file, context)?;
    }
    result.map_err(|e| relocate::relocate_error(e, &table, context))?;

    module.set(js_string!("loaded"), true, false, context)?;
    module.get(js_string!("exports"), context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_shared_global_has_prelude() {
        let file = RunnerFile::new("/dist/main.js", "module.exports = 1;", "");
        let (code, table) = wrap(&file, &["module", "exports"], true);
        assert!(code.starts_with("(function(module, exports) {\nObject.assign(global, _globalAssign);\n"));
        assert!(code.ends_with("module.exports = 1;\n})"));
        assert_eq!(table.injected_lines, 2);
    }

    #[test]
    fn test_wrap_new_context_has_no_prelude() {
        let file = RunnerFile::new("/dist/main.js", "a\nb", "");
        let (code, table) = wrap(&file, &[], false);
        assert_eq!(code, "(function() {\na\nb\n})");
        assert_eq!(table.injected_lines, 1);
        assert_eq!(table.map(3, 1), Some((2, 1)));
    }
}
