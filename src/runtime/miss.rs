//! Miss requirer: requests that are not files the runner addresses
//! directly (bare specifiers, `node:` modules)
//!
//! Lookup order: mocks from `test.config.json`, mocks from `test.config.js`,
//! built-in host modules, then packages under `node_modules`.

use boa_engine::{Context, JsResult, JsValue, js_string};
use std::path::Path;

use super::{RunnerHandle, builtins, error_with_code, requirer::{self, RequireContext}};
use crate::resolver::ModulePath;

/// Whether a mock (JSON or JS) is registered for `request`
pub(crate) fn is_mocked(handle: &RunnerHandle, request: &str, context: &mut Context) -> JsResult<bool> {
    if handle.borrow().options.test_config.modules.contains_key(request) {
        return Ok(true);
    }
    let modules = handle.borrow().js_config.modules.clone();
    match modules {
        Some(modules) => modules.has_own_property(js_string!(request), context),
        None => Ok(false),
    }
}

fn not_found(request: &str, context: &mut Context) -> boa_engine::JsError {
    error_with_code(format!("Cannot find module '{request}'"), "MODULE_NOT_FOUND", context)
}

pub(crate) fn require_miss(
    handle: &RunnerHandle,
    directory: &Path,
    module_path: &ModulePath,
    context: &mut Context,
) -> JsResult<JsValue> {
    let ModulePath::Single(request) = module_path else {
        return Err(not_found(&module_path.to_string(), context));
    };

    let mock = handle.borrow().options.test_config.modules.get(request).cloned();
    if let Some(mock) = mock {
        tracing::debug!(request = %request, "using json module mock");
        return JsValue::from_json(&mock, context);
    }
    let modules = handle.borrow().js_config.modules.clone();
    if let Some(modules) = modules
        && modules.has_own_property(js_string!(request.as_str()), context)?
    {
        tracing::debug!(request = %request, "using js module mock");
        return modules.get(js_string!(request.as_str()), context);
    }

    let name = request.strip_prefix("node:").unwrap_or(request);
    if let Some(builtin) = builtins::load_builtin(handle, name, context)? {
        return Ok(builtin);
    }

    let (packages, dist) = {
        let state = handle.borrow();
        (state.packages.clone(), state.options.dist.clone())
    };
    let resolved = packages
        .resolve(request, directory)
        .or_else(|_| packages.resolve(request, &dist));
    match resolved {
        Ok(path) => {
            tracing::debug!(request = %request, path = %path.display(), "resolved package");
            let module_path = ModulePath::Single(path.to_string_lossy().into_owned());
            requirer::require(handle, directory, module_path, RequireContext::default(), context)?.into_value(context)
        }
        Err(_) => Err(not_found(request, context)),
    }
}
