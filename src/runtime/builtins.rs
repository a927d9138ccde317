//! Host modules available to sandboxed `require`
//!
//! Bundles that are not fully self-contained still reach for a handful of
//! Node built-ins. `path`, `fs` and `url` are backed by Rust; `util`,
//! `events`, `assert` and `module` are small JS modules built on top of the
//! engine. Each module is instantiated once per runner.

use boa_engine::{
    Context, JsArgs, JsNativeError, JsObject, JsResult, JsValue, NativeFunction, js_string,
    object::{ObjectInitializer, builtins::JsArray},
    property::Attribute,
};
use std::path::{Path, PathBuf};

use super::{RunnerHandle, bind_native, error_with_code, eval_glue, requirer};

const BUILTINS: &[&str] = &["assert", "events", "fs", "module", "path", "url", "util"];

/// Whether `request` names a built-in (with or without `node:`)
pub(crate) fn is_builtin(request: &str) -> bool {
    BUILTINS.contains(&request.strip_prefix("node:").unwrap_or(request))
}

/// Instantiate (or fetch the cached instance of) a built-in module
pub(crate) fn load_builtin(handle: &RunnerHandle, name: &str, context: &mut Context) -> JsResult<Option<JsValue>> {
    if let Some(cached) = handle.borrow().builtins.get(name).cloned() {
        return Ok(Some(cached));
    }
    let module: JsValue = match name {
        "path" => create_path(context).into(),
        "fs" => create_fs(context).into(),
        "url" => create_url(context)?.into(),
        "util" => eval_glue("node:util", UTIL_JS, &[], context)?,
        "events" => eval_glue("node:events", EVENTS_JS, &[], context)?,
        "assert" => eval_glue("node:assert", ASSERT_JS, &[], context)?,
        "module" => {
            let create_require = bind_native(handle, create_require_native, context);
            eval_glue("node:module", MODULE_JS, &[create_require.into()], context)?
        }
        _ => return Ok(None),
    };
    tracing::debug!(module = name, "instantiated built-in module");
    handle.borrow_mut().builtins.insert(name.to_string(), module.clone());
    Ok(Some(module))
}

fn string_args(args: &[JsValue], context: &mut Context) -> JsResult<Vec<String>> {
    args.iter()
        .map(|v| v.to_string(context).map(|s| s.to_std_string_escaped()))
        .collect()
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args.get_or_undefined(index).to_string(context)?.to_std_string_escaped())
}

/// Resolve `.`/`..` segments of a POSIX path
pub(crate) fn normalize(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let trailing = path.len() > 1 && path.ends_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." if parts.last().is_some_and(|p| *p != "..") => {
                parts.pop();
            }
            ".." if absolute => {}
            part => parts.push(part),
        }
    }
    let mut out = parts.join("/");
    if absolute {
        out.insert(0, '/');
    }
    if out.is_empty() {
        return ".".to_string();
    }
    if trailing && !out.ends_with('/') {
        out.push('/');
    }
    out
}

pub(crate) fn join(parts: &[String]) -> String {
    let joined = parts.iter().filter(|p| !p.is_empty()).cloned().collect::<Vec<_>>().join("/");
    normalize(&joined)
}

pub(crate) fn dirname(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(index) => trimmed[..index].to_string(),
        None if path.starts_with('/') => "/".to_string(),
        None => ".".to_string(),
    }
}

pub(crate) fn basename(path: &str, ext: Option<&str>) -> String {
    let trimmed = path.trim_end_matches('/');
    let base = trimmed.rsplit('/').next().unwrap_or_default();
    match ext {
        Some(ext) if base != ext => base.strip_suffix(ext).unwrap_or(base).to_string(),
        _ => base.to_string(),
    }
}

pub(crate) fn extname(path: &str) -> String {
    let base = basename(path, None);
    match base.rfind('.') {
        Some(0) | None => String::new(),
        Some(index) => base[index..].to_string(),
    }
}

fn resolve(parts: &[String]) -> String {
    let mut resolved = String::new();
    for part in parts.iter().rev() {
        if part.is_empty() {
            continue;
        }
        resolved = if resolved.is_empty() { part.clone() } else { format!("{part}/{resolved}") };
        if part.starts_with('/') {
            break;
        }
    }
    if !resolved.starts_with('/') {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        resolved = format!("{}/{resolved}", cwd.display());
    }
    let normalized = normalize(&resolved);
    if normalized.len() > 1 { normalized.trim_end_matches('/').to_string() } else { normalized }
}

pub(crate) fn relative(from: &str, to: &str) -> String {
    let from = resolve(&[from.to_string()]);
    let to = resolve(&[to.to_string()]);
    let from_parts: Vec<&str> = from.split('/').filter(|p| !p.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|p| !p.is_empty()).collect();
    let common = from_parts.iter().zip(&to_parts).take_while(|(a, b)| a == b).count();
    let mut out: Vec<&str> = vec![".."; from_parts.len() - common];
    out.extend(&to_parts[common..]);
    out.join("/")
}

fn create_path(context: &mut Context) -> JsObject {
    ObjectInitializer::new(context)
        .property(js_string!("sep"), js_string!("/"), Attribute::all())
        .property(js_string!("delimiter"), js_string!(":"), Attribute::all())
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| Ok(js_string!(join(&string_args(args, context)?)).into())),
            js_string!("join"),
            0,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| Ok(js_string!(resolve(&string_args(args, context)?)).into())),
            js_string!("resolve"),
            0,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| Ok(js_string!(normalize(&string_arg(args, 0, context)?)).into())),
            js_string!("normalize"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| Ok(js_string!(dirname(&string_arg(args, 0, context)?)).into())),
            js_string!("dirname"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| {
                let path = string_arg(args, 0, context)?;
                let ext = match args.get_or_undefined(1) {
                    v if v.is_undefined() => None,
                    v => Some(v.to_string(context)?.to_std_string_escaped()),
                };
                Ok(js_string!(basename(&path, ext.as_deref())).into())
            }),
            js_string!("basename"),
            2,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| Ok(js_string!(extname(&string_arg(args, 0, context)?)).into())),
            js_string!("extname"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| Ok(string_arg(args, 0, context)?.starts_with('/').into())),
            js_string!("isAbsolute"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| {
                let from = string_arg(args, 0, context)?;
                let to = string_arg(args, 1, context)?;
                Ok(js_string!(relative(&from, &to)).into())
            }),
            js_string!("relative"),
            2,
        )
        .build()
}

fn io_error(error: std::io::Error, syscall: &str, path: &str, context: &mut Context) -> boa_engine::JsError {
    let code = match error.kind() {
        std::io::ErrorKind::NotFound => "ENOENT",
        std::io::ErrorKind::PermissionDenied => "EACCES",
        std::io::ErrorKind::AlreadyExists => "EEXIST",
        _ => "EIO",
    };
    error_with_code(format!("{code}: {error}, {syscall} '{path}'"), code, context)
}

fn read_file_sync(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let path = string_arg(args, 0, context)?;
    let encoding = args.get_or_undefined(1);
    let wants_text = encoding.is_string()
        || encoding
            .as_object()
            .map(|o| o.clone())
            .map(|o| o.get(js_string!("encoding"), context).map(|e| e.is_string()))
            .transpose()?
            .unwrap_or(false);
    if wants_text {
        let text = std::fs::read_to_string(&path).map_err(|e| io_error(e, "open", &path, context))?;
        return Ok(js_string!(text).into());
    }
    let bytes = std::fs::read(&path).map_err(|e| io_error(e, "open", &path, context))?;
    let array = JsArray::from_iter(bytes.into_iter().map(|b| JsValue::from(i32::from(b))), context);
    Ok(array.into())
}

fn write_file_sync(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let path = string_arg(args, 0, context)?;
    let data = string_arg(args, 1, context)?;
    std::fs::write(&path, data).map_err(|e| io_error(e, "open", &path, context))?;
    Ok(JsValue::undefined())
}

fn readdir_sync(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let path = string_arg(args, 0, context)?;
    let entries = std::fs::read_dir(&path).map_err(|e| io_error(e, "scandir", &path, context))?;
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    let array = JsArray::from_iter(names.into_iter().map(|n| JsValue::from(js_string!(n))), context);
    Ok(array.into())
}

fn stat_sync(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let path = string_arg(args, 0, context)?;
    let metadata = std::fs::metadata(&path).map_err(|e| io_error(e, "stat", &path, context))?;
    let is_file = metadata.is_file();
    let is_dir = metadata.is_dir();
    let stats = ObjectInitializer::new(context)
        .property(js_string!("size"), metadata.len() as f64, Attribute::all())
        .function(
            NativeFunction::from_copy_closure(move |_, _, _| Ok(is_file.into())),
            js_string!("isFile"),
            0,
        )
        .function(
            NativeFunction::from_copy_closure(move |_, _, _| Ok(is_dir.into())),
            js_string!("isDirectory"),
            0,
        )
        .build();
    Ok(stats.into())
}

fn create_fs(context: &mut Context) -> JsObject {
    ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(read_file_sync), js_string!("readFileSync"), 2)
        .function(NativeFunction::from_fn_ptr(write_file_sync), js_string!("writeFileSync"), 2)
        .function(NativeFunction::from_fn_ptr(readdir_sync), js_string!("readdirSync"), 1)
        .function(NativeFunction::from_fn_ptr(stat_sync), js_string!("statSync"), 1)
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| Ok(Path::new(&string_arg(args, 0, context)?).exists().into())),
            js_string!("existsSync"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| {
                let path = string_arg(args, 0, context)?;
                std::fs::create_dir_all(&path).map_err(|e| io_error(e, "mkdir", &path, context))?;
                Ok(JsValue::undefined())
            }),
            js_string!("mkdirSync"),
            2,
        )
        .build()
}

fn create_url(context: &mut Context) -> JsResult<JsObject> {
    let url_ctor = context.global_object().get(js_string!("URL"), context)?;
    let module = ObjectInitializer::new(context)
        .property(js_string!("URL"), url_ctor, Attribute::all())
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| {
                let path = string_arg(args, 0, context)?;
                let url = url::Url::from_file_path(&path)
                    .map_err(|_| JsNativeError::typ().with_message(format!("path must be absolute: {path}")))?;
                let constructor = context.global_object().get(js_string!("URL"), context)?;
                let constructor = constructor
                    .as_constructor()
                    .map(|c| c.clone())
                    .ok_or_else(|| JsNativeError::typ().with_message("URL is not a constructor"))?;
                Ok(constructor
                    .construct(&[js_string!(url.to_string()).into()], None, context)?
                    .into())
            }),
            js_string!("pathToFileURL"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_, args, context| {
                let href = string_arg(args, 0, context)?;
                let path = url::Url::parse(&href)
                    .ok()
                    .and_then(|u| u.to_file_path().ok())
                    .ok_or_else(|| JsNativeError::typ().with_message(format!("The URL must be of scheme file: {href}")))?;
                Ok(js_string!(path.to_string_lossy().into_owned()).into())
            }),
            js_string!("fileURLToPath"),
            1,
        )
        .build();
    Ok(module)
}

fn create_require_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let filename = string_arg(args, 0, context)?;
    let filename = filename.strip_prefix("file://").unwrap_or(&filename);
    let directory = Path::new(filename).parent().unwrap_or(Path::new("/"));
    Ok(requirer::create_require(handle, directory, context)?.into())
}

const UTIL_JS: &str = r#"
(function () {
    const inspect = (value) => {
        if (typeof value === "string") return JSON.stringify(value);
        if (typeof value === "function") return `[Function: ${value.name || "anonymous"}]`;
        if (value instanceof Error) return `${value.name}: ${value.message}`;
        try {
            const json = JSON.stringify(value);
            return json === undefined ? String(value) : json;
        } catch (e) {
            return String(value);
        }
    };
    const format = (first, ...rest) => {
        if (typeof first !== "string") return [first, ...rest].map(inspect).join(" ");
        let index = 0;
        const out = first.replace(/%[sdifjoO%]/g, (token) => {
            if (token === "%%") return "%";
            if (index >= rest.length) return token;
            const arg = rest[index++];
            switch (token) {
                case "%s": return String(arg);
                case "%d": case "%i": return String(parseInt(arg, 10));
                case "%f": return String(parseFloat(arg));
                default: return inspect(arg);
            }
        });
        return [out, ...rest.slice(index).map(inspect)].join(" ");
    };
    return {
        format,
        inspect,
        inherits(ctor, superCtor) {
            Object.setPrototypeOf(ctor.prototype, superCtor.prototype);
            Object.setPrototypeOf(ctor, superCtor);
        },
        promisify(fn) {
            return (...args) => new Promise((resolve, reject) =>
                fn(...args, (err, value) => (err ? reject(err) : resolve(value))));
        },
        deprecate: (fn) => fn,
        isDeepStrictEqual: (a, b) => JSON.stringify(a) === JSON.stringify(b),
        types: {
            isPromise: (v) => v instanceof Promise,
            isRegExp: (v) => v instanceof RegExp,
            isDate: (v) => v instanceof Date,
        },
        TextEncoder: globalThis.TextEncoder,
        TextDecoder: globalThis.TextDecoder,
    };
})
"#;

const EVENTS_JS: &str = r#"
(function () {
    class EventEmitter {
        constructor() { this._events = new Map(); }
        on(name, listener) {
            if (!this._events.has(name)) this._events.set(name, []);
            this._events.get(name).push(listener);
            return this;
        }
        addListener(name, listener) { return this.on(name, listener); }
        once(name, listener) {
            const wrapped = (...args) => { this.off(name, wrapped); listener.apply(this, args); };
            wrapped.listener = listener;
            return this.on(name, wrapped);
        }
        off(name, listener) {
            const list = this._events.get(name);
            if (list) this._events.set(name, list.filter((l) => l !== listener && l.listener !== listener));
            return this;
        }
        removeListener(name, listener) { return this.off(name, listener); }
        removeAllListeners(name) {
            if (name === undefined) this._events.clear(); else this._events.delete(name);
            return this;
        }
        emit(name, ...args) {
            const list = this._events.get(name);
            if (!list || list.length === 0) {
                if (name === "error") throw args[0];
                return false;
            }
            for (const listener of [...list]) listener.apply(this, args);
            return true;
        }
        listenerCount(name) { return (this._events.get(name) || []).length; }
        listeners(name) { return [...(this._events.get(name) || [])]; }
        setMaxListeners() { return this; }
    }
    const once = (emitter, name) => new Promise((resolve) => emitter.once(name, (...args) => resolve(args)));
    EventEmitter.EventEmitter = EventEmitter;
    EventEmitter.once = once;
    return EventEmitter;
})
"#;

const ASSERT_JS: &str = r#"
(function () {
    class AssertionError extends Error {
        constructor(options) {
            super(options.message);
            this.name = "AssertionError";
            this.code = "ERR_ASSERTION";
            this.actual = options.actual;
            this.expected = options.expected;
            this.operator = options.operator;
        }
    }
    const fail = (actual, expected, message, operator) => {
        throw new AssertionError({
            message: message || `${JSON.stringify(actual)} ${operator} ${JSON.stringify(expected)}`,
            actual, expected, operator,
        });
    };
    const deepEqual = (a, b) => {
        if (Object.is(a, b)) return true;
        if (typeof a !== "object" || typeof b !== "object" || a === null || b === null) return false;
        if (Object.getPrototypeOf(a) !== Object.getPrototypeOf(b)) return false;
        const ka = Object.keys(a), kb = Object.keys(b);
        return ka.length === kb.length && ka.every((k) => deepEqual(a[k], b[k]));
    };
    const matches = (error, expected) => {
        if (expected === undefined) return true;
        if (expected instanceof RegExp) return expected.test(String(error && error.message));
        if (typeof expected === "function") return error instanceof expected || expected(error) === true;
        return Object.keys(expected).every((k) => deepEqual(error[k], expected[k]));
    };
    const assert = (value, message) => assert.ok(value, message);
    assert.AssertionError = AssertionError;
    assert.ok = (value, message) => { if (!value) fail(value, true, message || "The expression evaluated to a falsy value", "=="); };
    assert.equal = (a, b, m) => { if (a != b) fail(a, b, m, "=="); };
    assert.notEqual = (a, b, m) => { if (a == b) fail(a, b, m, "!="); };
    assert.strictEqual = (a, b, m) => { if (!Object.is(a, b)) fail(a, b, m, "strictEqual"); };
    assert.notStrictEqual = (a, b, m) => { if (Object.is(a, b)) fail(a, b, m, "notStrictEqual"); };
    assert.deepEqual = assert.deepStrictEqual = (a, b, m) => { if (!deepEqual(a, b)) fail(a, b, m, "deepStrictEqual"); };
    assert.notDeepStrictEqual = (a, b, m) => { if (deepEqual(a, b)) fail(a, b, m, "notDeepStrictEqual"); };
    assert.fail = (message) => fail(undefined, undefined, message || "Failed", "fail");
    assert.throws = (fn, expected, message) => {
        try { fn(); } catch (e) {
            if (!matches(e, expected)) throw e;
            return;
        }
        fail(undefined, expected, message || "Missing expected exception.", "throws");
    };
    assert.rejects = async (promiseOrFn, expected, message) => {
        try { await (typeof promiseOrFn === "function" ? promiseOrFn() : promiseOrFn); } catch (e) {
            if (!matches(e, expected)) throw e;
            return;
        }
        fail(undefined, expected, message || "Missing expected rejection.", "rejects");
    };
    assert.match = (s, re, m) => { if (!re.test(s)) fail(s, re, m, "match"); };
    assert.strict = assert;
    return assert;
})
"#;

const MODULE_JS: &str = r#"
(function (createRequire) {
    return {
        createRequire,
        builtinModules: ["assert", "events", "fs", "module", "path", "url", "util"],
    };
})
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/b/../c/./d"), "/a/c/d");
        assert_eq!(normalize("a/../../b"), "../b");
        assert_eq!(normalize("/../a"), "/a");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("a/b/"), "a/b/");
    }

    #[test]
    fn test_join_dirname_basename() {
        assert_eq!(join(&["a".into(), "b".into(), "../c".into()]), "a/c");
        assert_eq!(dirname("/dist/chunks/a.js"), "/dist/chunks");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("a"), ".");
        assert_eq!(basename("/dist/a.js", Some(".js")), "a");
        assert_eq!(extname("/dist/a.min.js"), ".js");
        assert_eq!(extname("/dist/.hidden"), "");
    }

    #[test]
    fn test_relative() {
        assert_eq!(relative("/a/b/c", "/a/d"), "../../d");
        assert_eq!(relative("/a", "/a/b"), "b");
    }

    #[test]
    fn test_is_builtin() {
        assert!(is_builtin("node:path"));
        assert!(is_builtin("fs"));
        assert!(!is_builtin("lodash"));
    }
}
