//! Global realms of a runner
//!
//! The GlobalContext is the context's default realm, or a dedicated realm
//! when the runner was asked to run in a new context. ES modules always get
//! their own realm whose global object carries the base scope bindings.

use boa_engine::{Context, JsObject, JsResult, js_string, realm::Realm};
use boa_runtime::{
    extensions::{ConsoleExtension, EncodingExtension, MicrotaskExtension, StructuredCloneExtension, UrlExtension},
    register_extensions,
};

use super::{RunnerHandle, bind_native, console::RunnerLogger, esm, timers::TimerFunctions};

/// Run `f` with `realm` as the current realm
pub(crate) fn with_realm<R>(context: &mut Context, realm: &Realm, f: impl FnOnce(&mut Context) -> R) -> R {
    let previous = context.enter_realm(realm.clone());
    let result = f(context);
    context.enter_realm(previous);
    result
}

/// Install console, URL, encoding, structuredClone, queueMicrotask, timers
/// and `global` into the current realm
pub(crate) fn install_globals(handle: &RunnerHandle, context: &mut Context) -> JsResult<()> {
    let (print, records) = {
        let state = handle.borrow();
        (state.options.print_logger, state.console.clone())
    };
    register_extensions(
        (
            ConsoleExtension(RunnerLogger::new(print, records)),
            UrlExtension,
            EncodingExtension,
            StructuredCloneExtension,
            MicrotaskExtension,
        ),
        None,
        context,
    )?;

    let global = context.global_object();
    global.set(js_string!("global"), global.clone(), false, context)?;

    let timers = TimerFunctions::new(handle, context);
    for (name, function) in timers.entries() {
        global.set(js_string!(name), function.clone(), false, context)?;
    }
    Ok(())
}

/// The GlobalContext realm, created on first use and kept for the runner's
/// lifetime
pub(crate) fn global_realm(handle: &RunnerHandle, context: &mut Context) -> JsResult<Realm> {
    if let Some(realm) = handle.borrow().global_realm.clone() {
        return Ok(realm);
    }
    let new_context = handle.borrow().options.run_in_new_context;
    let realm = if new_context {
        let realm = context.create_realm()?;
        with_realm(context, &realm, |context| install_globals(handle, context))?;
        tracing::debug!("created isolated global realm");
        realm
    } else {
        context.realm().clone()
    };
    handle.borrow_mut().global_realm = Some(realm.clone());
    Ok(realm)
}

/// Global object of the GlobalContext
pub(crate) fn global_object(handle: &RunnerHandle, context: &mut Context) -> JsResult<JsObject> {
    let realm = global_realm(handle, context)?;
    Ok(with_realm(context, &realm, |context| context.global_object()))
}

/// Realm ES modules are parsed and evaluated in
pub(crate) fn esm_realm(handle: &RunnerHandle, context: &mut Context) -> JsResult<Realm> {
    if let Some(realm) = handle.borrow().esm_realm.clone() {
        return Ok(realm);
    }
    let realm = context.create_realm()?;
    with_realm(context, &realm, |context| {
        install_globals(handle, context)?;
        let import = bind_native(handle, esm::dynamic_import_native, context);
        context
            .global_object()
            .set(js_string!(esm::DYNAMIC_IMPORT_GLOBAL), import, false, context)
    })?;
    handle.borrow_mut().esm_realm = Some(realm.clone());
    copy_base_scope(handle, &realm, context)?;
    tracing::debug!("created esm realm");
    Ok(realm)
}

/// Re-publish the current base scope onto an existing ESM realm
pub(crate) fn refresh_esm_realm(handle: &RunnerHandle, context: &mut Context) -> JsResult<()> {
    let realm = handle.borrow().esm_realm.clone();
    match realm {
        Some(realm) => copy_base_scope(handle, &realm, context),
        None => Ok(()),
    }
}

fn copy_base_scope(handle: &RunnerHandle, realm: &Realm, context: &mut Context) -> JsResult<()> {
    let scope = handle.borrow().base_scope.clone();
    with_realm(context, realm, |context| {
        let global = context.global_object();
        for name in scope.names() {
            if let Some(value) = scope.get(name) {
                global.set(js_string!(name), value.clone(), false, context)?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;

    #[test]
    fn test_with_realm_restores_previous() {
        let mut context = Context::default();
        let realm = context.create_realm().unwrap();
        with_realm(&mut context, &realm, |context| {
            context
                .eval(Source::from_bytes("globalThis.onlyHere = 1;"))
                .unwrap();
        });
        let seen = context
            .eval(Source::from_bytes("typeof globalThis.onlyHere"))
            .unwrap();
        assert_eq!(seen.to_string(&mut context).unwrap().to_std_string_escaped(), "undefined");
    }
}
