//! Live `test.config.js` hooks
//!
//! The file is executed through the CommonJS requirer of the runner that
//! will use it, so its functions are ordinary JS functions in the same
//! engine as the bundle they customise.

use boa_engine::{Context, JsObject, JsResult, JsValue, js_string};
use boa_gc::{Finalize, Trace};

use super::{
    RunnerHandle,
    requirer::{self, RequireContext},
    scope,
};
use crate::{config::BundlePath, resolver::ModulePath};

/// Hooks exported by `test.config.js`
#[derive(Debug, Clone, Default, Trace, Finalize)]
pub(crate) struct JsTestConfig {
    /// `moduleScope(scope, stats, options) -> scope | void`
    pub(crate) module_scope: Option<JsObject>,
    /// `nonEsmThis(modulePath) -> this`
    pub(crate) non_esm_this: Option<JsObject>,
    /// `resourceLoader(url, element) -> content | undefined`
    pub(crate) resource_loader: Option<JsObject>,
    /// `modules: { [specifier]: exports }`
    pub(crate) modules: Option<JsObject>,
    /// `findBundle(index, options) -> string | string[]`
    pub(crate) find_bundle: Option<JsObject>,
}

fn callable(exports: &JsObject, name: &str, context: &mut Context) -> JsResult<Option<JsObject>> {
    let value = exports.get(js_string!(name), context)?;
    Ok(value.as_callable().map(|f| f.clone()))
}

/// Copy the declarative fields `test.config.js` may carry over the ones
/// from `test.config.json`
fn overlay_declarative(handle: &RunnerHandle, exports: &JsObject, context: &mut Context) -> JsResult<()> {
    let no_tests = exports.get(js_string!("noTests"), context)?;
    let timeout = exports.get(js_string!("timeout"), context)?;
    let bundle_path = exports.get(js_string!("bundlePath"), context)?;
    let bundle_path = match bundle_path.to_json(context)? {
        Some(json) => serde_json::from_value::<BundlePath>(json).ok(),
        None => None,
    };

    let mut state = handle.borrow_mut();
    let config = &mut state.options.test_config;
    if !no_tests.is_undefined() {
        config.no_tests = no_tests.to_boolean();
    }
    if let Some(ms) = timeout.as_number() {
        config.timeout = Some(ms.max(0.0) as u64);
    }
    if bundle_path.is_some() {
        config.bundle_path = bundle_path;
    }
    Ok(())
}

/// Load `<source>/test.config.js` into the runner, if the fixture has one
pub(crate) fn load(handle: &RunnerHandle, context: &mut Context) -> JsResult<()> {
    let source = handle.borrow().options.source.clone();
    let path = source.join("test.config.js");
    if !path.is_file() {
        return Ok(());
    }
    tracing::debug!(path = %path.display(), "loading test.config.js");

    // The config module needs console, process and friends like any other
    let base = scope::create_base_scope(handle, context)?;
    handle.borrow_mut().base_scope = base;

    let module_path = ModulePath::Single(path.to_string_lossy().into_owned());
    let exports = requirer::require(handle, &source, module_path, RequireContext::default(), context)?.into_value(context)?;
    let Some(exports) = exports.as_object().map(|o| o.clone()) else {
        return Ok(());
    };

    let modules = exports.get(js_string!("modules"), context)?;
    let config = JsTestConfig {
        module_scope: callable(&exports, "moduleScope", context)?,
        non_esm_this: callable(&exports, "nonEsmThis", context)?,
        resource_loader: callable(&exports, "resourceLoader", context)?,
        modules: modules.as_object().map(|o| o.clone()),
        find_bundle: callable(&exports, "findBundle", context)?,
    };
    overlay_declarative(handle, &exports, context)?;
    handle.borrow_mut().js_config = config;
    Ok(())
}

/// Ask the `resourceLoader` hook for replacement content
pub(crate) fn resource_override(
    handle: &RunnerHandle,
    url: &str,
    element: JsValue,
    context: &mut Context,
) -> JsResult<Option<String>> {
    let rust_hook = handle.borrow().options.hooks.clone();
    if let Some(content) = rust_hook.and_then(|hooks| hooks.resource_loader(url)) {
        return Ok(Some(content));
    }
    let Some(hook) = handle.borrow().js_config.resource_loader.clone() else {
        return Ok(None);
    };
    let content = hook.call(&JsValue::undefined(), &[js_string!(url).into(), element], context)?;
    if content.is_undefined() || content.is_null() {
        return Ok(None);
    }
    Ok(Some(content.to_string(context)?.to_std_string_escaped()))
}

#[cfg(test)]
mod tests {
    use crate::{config::RunnerOptions, runtime::Runner};
    use std::fs;

    #[test]
    fn test_js_config_hooks_are_live() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("test.config.js"),
            r#"
            module.exports = {
                moduleScope(scope) { scope.fromConfig = "yes"; },
                modules: { "virtual-mod": { answer: 41 } },
                nonEsmThis() { return { marker: "this" }; },
                findBundle(index) { return ["a.js", "b.js"]; },
                timeout: 1234,
            };
            "#,
        )
        .unwrap();
        fs::write(
            dir.path().join("main.js"),
            "module.exports = fromConfig + ':' + (require('virtual-mod').answer + 1) + ':' + this.marker;",
        )
        .unwrap();

        let mut runner = Runner::new(RunnerOptions::new("main", dir.path(), dir.path()).print_logger(false)).unwrap();
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "yes:42:this");
        assert_eq!(
            runner.find_bundle(0).unwrap(),
            Some(vec!["a.js".to_string(), "b.js".to_string()])
        );
        assert_eq!(runner.test_config().timeout, Some(1234));
    }

    #[test]
    fn test_missing_config_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = Runner::new(RunnerOptions::new("main", dir.path(), dir.path())).unwrap();
        assert_eq!(runner.find_bundle(0).unwrap(), None);
    }
}
