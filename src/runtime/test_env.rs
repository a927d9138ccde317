//! Sandboxed test environment: `it`, `describe`, hooks, `expect`, `jest.fn`
//!
//! `it(name, fn)` does not run anything. It records the test in the
//! runner's [`TestRegistry`] together with the offset table of the module
//! that registered it; the runner executes registered tests after the
//! entry settles so errors can be relocated per test.

use boa_engine::{Context, JsArgs, JsNativeError, JsObject, JsResult, JsValue, js_string, object::ObjectInitializer, property::Attribute};
use boa_gc::{Finalize, Trace};
use serde::Serialize;
use std::time::Duration;

use super::{RunnerHandle, bind_native, eval_glue, relocate::OffsetTable, scope::ModuleScope};

/// A test registered by sandboxed code
#[derive(Clone, Trace, Finalize)]
pub(crate) struct RegisteredTest {
    #[unsafe_ignore_trace]
    pub(crate) name: String,
    pub(crate) func: JsObject,
    /// Module that was executing when the test was registered
    #[unsafe_ignore_trace]
    pub(crate) origin: Option<OffsetTable>,
}

/// Result of one registered test
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestOutcome {
    pub name: String,
    pub passed: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

#[derive(Default, Trace, Finalize)]
pub(crate) struct TestRegistry {
    tests: Vec<RegisteredTest>,
    before_each: Vec<JsObject>,
    after_each: Vec<JsObject>,
    #[unsafe_ignore_trace]
    cursor: usize,
    #[unsafe_ignore_trace]
    outcomes: Vec<TestOutcome>,
}

impl TestRegistry {
    pub(crate) fn register(&mut self, test: RegisteredTest) {
        self.tests.push(test);
    }

    /// The next test that has not run yet. Tests registered while others
    /// run are picked up in order.
    pub(crate) fn next_test(&mut self) -> Option<RegisteredTest> {
        let test = self.tests.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(test)
    }

    pub(crate) fn hooks(&self) -> (Vec<JsObject>, Vec<JsObject>) {
        (self.before_each.clone(), self.after_each.clone())
    }

    pub(crate) fn record(&mut self, outcomes: &[TestOutcome]) {
        self.outcomes.extend_from_slice(outcomes);
    }

    pub(crate) fn registered(&self) -> usize {
        self.tests.len()
    }

    pub(crate) fn outcomes(&self) -> &[TestOutcome] {
        &self.outcomes
    }
}

/// Register a test from Rust (hot `NEXT_START` grows the list this way)
pub(crate) fn register_test(handle: &RunnerHandle, name: impl Into<String>, func: JsObject) {
    let mut state = handle.borrow_mut();
    let origin = state.executing.last().cloned();
    let name = name.into();
    tracing::debug!(test = %name, "registered test");
    state.tests.register(RegisteredTest { name, func, origin });
}

fn register_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let name = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    let func = args
        .get_or_undefined(1)
        .as_callable()
        .map(|f| f.clone())
        .ok_or_else(|| JsNativeError::typ().with_message(format!("test '{name}' has no function")))?;
    register_test(handle, name, func);
    Ok(JsValue::undefined())
}

fn hook_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let kind = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    let func = args
        .get_or_undefined(1)
        .as_callable()
        .map(|f| f.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("hook must be a function"))?;
    let mut state = handle.borrow_mut();
    match kind.as_str() {
        "before" => state.tests.before_each.push(func),
        _ => state.tests.after_each.push(func),
    }
    Ok(JsValue::undefined())
}

const TEST_ENV_JS: &str = r#"
(function (host) {
    const fmt = (v) => {
        try {
            if (typeof v === "function") return `[Function ${v.name || "anonymous"}]`;
            if (typeof v === "string") return JSON.stringify(v);
            if (typeof v === "bigint") return `${v}n`;
            if (typeof v === "symbol") return v.toString();
            if (v === undefined) return "undefined";
            if (v instanceof Error) return `${v.name}: ${v.message}`;
            const s = JSON.stringify(v);
            return s === undefined ? String(v) : s;
        } catch (e) {
            return String(v);
        }
    };

    const isAsymmetric = (v) => v !== null && typeof v === "object" && typeof v.asymmetricMatch === "function";
    const equals = (a, b, strict) => {
        if (isAsymmetric(b)) return b.asymmetricMatch(a);
        if (Object.is(a, b)) return true;
        if (typeof a !== "object" || typeof b !== "object" || a === null || b === null) return false;
        if (strict && Object.getPrototypeOf(a) !== Object.getPrototypeOf(b)) return false;
        if (Array.isArray(a) !== Array.isArray(b)) return false;
        if (a instanceof Date && b instanceof Date) return a.getTime() === b.getTime();
        if (a instanceof RegExp && b instanceof RegExp) return String(a) === String(b);
        if (a instanceof Map && b instanceof Map) {
            if (a.size !== b.size) return false;
            for (const [k, v] of a) if (!b.has(k) || !equals(v, b.get(k), strict)) return false;
            return true;
        }
        if (a instanceof Set && b instanceof Set) {
            if (a.size !== b.size) return false;
            for (const v of a) if (!b.has(v)) return false;
            return true;
        }
        const keys = (o) => Object.keys(o).filter((k) => strict || o[k] !== undefined);
        const ka = keys(a);
        const kb = keys(b);
        if (ka.length !== kb.length) return false;
        return ka.every((k) => Object.prototype.hasOwnProperty.call(b, k) && equals(a[k], b[k], strict));
    };
    const matchesObject = (a, e) => {
        if (isAsymmetric(e)) return e.asymmetricMatch(a);
        if (e === null || typeof e !== "object") return equals(a, e, false);
        if (a === null || typeof a !== "object") return false;
        return Object.keys(e).every((k) => matchesObject(a[k], e[k]));
    };
    const calls = (spy) => {
        if (!spy || !spy.mock) throw new TypeError(`${fmt(spy)} is not a mock function`);
        return spy.mock.calls;
    };
    const thrownBy = (actual) => {
        if (typeof actual !== "function") return { thrown: true, error: actual };
        try {
            actual();
            return { thrown: false };
        } catch (error) {
            return { thrown: true, error };
        }
    };
    const throwMatches = (error, expected) => {
        if (expected === undefined) return true;
        const message = error && error.message !== undefined ? String(error.message) : String(error);
        if (typeof expected === "string") return message.includes(expected);
        if (expected instanceof RegExp) return expected.test(message);
        if (typeof expected === "function") return error instanceof expected;
        if (expected instanceof Error) return message === expected.message;
        return matchesObject(error, expected);
    };

    const table = {
        toBe: (n, a, e) => [Object.is(a, e), `expected ${fmt(a)} ${n}to be ${fmt(e)}`],
        toEqual: (n, a, e) => [equals(a, e, false), `expected ${fmt(a)} ${n}to equal ${fmt(e)}`],
        toStrictEqual: (n, a, e) => [equals(a, e, true), `expected ${fmt(a)} ${n}to strictly equal ${fmt(e)}`],
        toMatchObject: (n, a, e) => [matchesObject(a, e), `expected ${fmt(a)} ${n}to match object ${fmt(e)}`],
        toMatch: (n, a, e) => [
            typeof a === "string" && (e instanceof RegExp ? e.test(a) : a.includes(e)),
            `expected ${fmt(a)} ${n}to match ${String(e)}`,
        ],
        toContain: (n, a, e) => [
            a != null && (typeof a === "string" ? a.includes(e) : Array.from(a).includes(e)),
            `expected ${fmt(a)} ${n}to contain ${fmt(e)}`,
        ],
        toContainEqual: (n, a, e) => [
            a != null && Array.from(a).some((item) => equals(item, e, false)),
            `expected ${fmt(a)} ${n}to contain an item equal to ${fmt(e)}`,
        ],
        toHaveLength: (n, a, e) => [
            a != null && a.length === e,
            `expected length ${a == null ? fmt(a) : a.length} ${n}to be ${e}`,
        ],
        toHaveProperty: (n, a, key, ...value) => {
            const path = Array.isArray(key) ? key : String(key).split(".");
            let cur = a;
            let found = true;
            for (const part of path) {
                if (cur == null || !(part in Object(cur))) {
                    found = false;
                    break;
                }
                cur = cur[part];
            }
            const pass = found && (value.length === 0 || equals(cur, value[0], false));
            return [pass, `expected ${fmt(a)} ${n}to have property ${fmt(path.join("."))}`];
        },
        toBeTruthy: (n, a) => [!!a, `expected ${fmt(a)} ${n}to be truthy`],
        toBeFalsy: (n, a) => [!a, `expected ${fmt(a)} ${n}to be falsy`],
        toBeDefined: (n, a) => [a !== undefined, `expected ${fmt(a)} ${n}to be defined`],
        toBeUndefined: (n, a) => [a === undefined, `expected ${fmt(a)} ${n}to be undefined`],
        toBeNull: (n, a) => [a === null, `expected ${fmt(a)} ${n}to be null`],
        toBeNaN: (n, a) => [Number.isNaN(a), `expected ${fmt(a)} ${n}to be NaN`],
        toBeInstanceOf: (n, a, e) => [
            a instanceof e,
            `expected ${fmt(a)} ${n}to be an instance of ${e && e.name}`,
        ],
        toBeGreaterThan: (n, a, e) => [a > e, `expected ${fmt(a)} ${n}to be greater than ${fmt(e)}`],
        toBeGreaterThanOrEqual: (n, a, e) => [a >= e, `expected ${fmt(a)} ${n}to be greater than or equal to ${fmt(e)}`],
        toBeLessThan: (n, a, e) => [a < e, `expected ${fmt(a)} ${n}to be less than ${fmt(e)}`],
        toBeLessThanOrEqual: (n, a, e) => [a <= e, `expected ${fmt(a)} ${n}to be less than or equal to ${fmt(e)}`],
        toThrow: (n, a, e) => {
            const { thrown, error } = thrownBy(a);
            const pass = thrown && throwMatches(error, e);
            const detail = thrown ? `threw ${fmt(error)}` : "did not throw";
            return [pass, `expected function ${n}to throw${e === undefined ? "" : " " + fmt(e)}, but it ${detail}`];
        },
        toHaveBeenCalled: (n, a) => [calls(a).length > 0, `expected mock ${n}to have been called`],
        toHaveBeenCalledTimes: (n, a, e) => [
            calls(a).length === e,
            `expected mock ${n}to have been called ${e} times, but it was called ${calls(a).length} times`,
        ],
        toHaveBeenCalledWith: (n, a, ...args) => [
            calls(a).some((call) => equals(call, args, false)),
            `expected mock ${n}to have been called with ${fmt(args)}`,
        ],
    };
    table.toThrowError = table.toThrow;
    table.toBeCalled = table.toHaveBeenCalled;
    table.toBeCalledTimes = table.toHaveBeenCalledTimes;

    const fail = (message) => {
        const error = new Error(message);
        error.name = "AssertionError";
        throw error;
    };
    const build = (actual, mode) => {
        const make = (not) => {
            const out = {};
            for (const name of Object.keys(table)) {
                out[name] = (...args) => {
                    const check = (value) => {
                        const [pass, message] = table[name](not ? "not " : "", value, ...args);
                        if (pass === not) fail(message);
                    };
                    if (mode === "resolves") return Promise.resolve(actual).then(check);
                    if (mode === "rejects") {
                        return Promise.resolve(actual).then(
                            (v) => fail(`expected promise to reject, but it resolved with ${fmt(v)}`),
                            check,
                        );
                    }
                    check(actual);
                };
            }
            return out;
        };
        const matchers = make(false);
        matchers.not = make(true);
        return matchers;
    };

    const expect = (actual) => {
        const matchers = build(actual, null);
        matchers.resolves = build(actual, "resolves");
        matchers.rejects = build(actual, "rejects");
        return matchers;
    };
    expect.any = (ctor) => ({
        asymmetricMatch: (v) =>
            v != null && (Object(v) instanceof ctor || (ctor === Number && typeof v === "number") || (ctor === String && typeof v === "string")),
    });
    expect.anything = () => ({ asymmetricMatch: (v) => v != null });
    expect.stringContaining = (s) => ({ asymmetricMatch: (v) => typeof v === "string" && v.includes(s) });
    expect.objectContaining = (o) => ({ asymmetricMatch: (v) => matchesObject(v, o) });
    expect.assertions = () => {};
    expect.hasAssertions = () => {};

    const fn = (impl) => {
        let implementation = impl;
        const once = [];
        const spy = function (...args) {
            spy.mock.calls.push(args);
            spy.mock.instances.push(this);
            const f = once.length > 0 ? once.shift() : implementation;
            try {
                const value = f ? f.apply(this, args) : undefined;
                spy.mock.results.push({ type: "return", value });
                return value;
            } catch (error) {
                spy.mock.results.push({ type: "throw", value: error });
                throw error;
            }
        };
        spy.mock = { calls: [], instances: [], results: [] };
        spy._isMockFunction = true;
        spy.mockImplementation = (f) => { implementation = f; return spy; };
        spy.mockImplementationOnce = (f) => { once.push(f); return spy; };
        spy.mockReturnValue = (v) => spy.mockImplementation(() => v);
        spy.mockReturnValueOnce = (v) => spy.mockImplementationOnce(() => v);
        spy.mockResolvedValue = (v) => spy.mockImplementation(() => Promise.resolve(v));
        spy.mockRejectedValue = (v) => spy.mockImplementation(() => Promise.reject(v));
        spy.mockClear = () => {
            spy.mock.calls = [];
            spy.mock.instances = [];
            spy.mock.results = [];
            return spy;
        };
        spy.mockReset = () => {
            spy.mockClear();
            implementation = undefined;
            once.length = 0;
            return spy;
        };
        return spy;
    };
    const spyOn = (object, key) => {
        const original = object[key];
        const spy = fn(function (...args) { return original.apply(this, args); });
        spy.mockRestore = () => { object[key] = original; };
        object[key] = spy;
        return spy;
    };
    const jest = { fn, spyOn, isMockFunction: (f) => !!(f && f._isMockFunction), setTimeout: () => {} };

    const names = [];
    const it = (name, body) => {
        if (typeof body !== "function") return;
        host.register([...names, name].join(" "), body);
    };
    it.skip = () => {};
    it.todo = () => {};
    it.only = it;
    const describe = (name, body) => {
        names.push(name);
        try {
            body();
        } finally {
            names.pop();
        }
    };
    describe.skip = () => {};
    describe.only = describe;

    return {
        it,
        test: it,
        describe,
        beforeEach: (f) => host.hook("before", f),
        afterEach: (f) => host.hook("after", f),
        expect,
        jest,
    };
})
"#;

/// Bindings the test environment adds to the base scope
pub(crate) const TEST_BINDINGS: &[&str] = &["it", "test", "describe", "beforeEach", "afterEach", "expect", "jest"];

/// Install the test environment into `scope`
pub(crate) fn install(handle: &RunnerHandle, scope: &mut ModuleScope, context: &mut Context) -> JsResult<()> {
    let register = bind_native(handle, register_native, context);
    let hook = bind_native(handle, hook_native, context);
    let host = ObjectInitializer::new(context)
        .property(js_string!("register"), register, Attribute::all())
        .property(js_string!("hook"), hook, Attribute::all())
        .build();
    let env = eval_glue("runner:test-env", TEST_ENV_JS, &[host.into()], context)?;
    let env = env
        .as_object()
        .map(|o| o.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("test env glue returned no bindings"))?;
    for name in TEST_BINDINGS {
        scope.set(*name, env.get(js_string!(*name), context)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{config::RunnerOptions, runtime::Runner};
    use std::fs;

    fn run_tests(source: &str) -> Vec<super::TestOutcome> {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.js"), source).unwrap();
        let mut runner = Runner::new(RunnerOptions::new("main", dir.path(), dir.path()).print_logger(false)).unwrap();
        runner.run("main.js").unwrap();
        runner.run_tests().unwrap()
    }

    #[test]
    fn test_matchers() {
        let outcomes = run_tests(
            r#"
            it("equality", () => {
                expect({ a: [1, { b: 2 }] }).toEqual({ a: [1, { b: 2 }] });
                expect({ a: 1, b: undefined }).toEqual({ a: 1 });
                expect({ a: 1, b: undefined }).not.toStrictEqual({ a: 1 });
                expect("hello world").toMatch(/wor/);
                expect([1, 2, 3]).toContain(2);
                expect("abc").toHaveLength(3);
                expect(null).toBeNull();
                expect(undefined).toBeUndefined();
                expect(0).toBeFalsy();
                expect(new Error("x")).toBeInstanceOf(Error);
                expect(3).toBeGreaterThan(2);
                expect(2).toBeLessThan(3);
                expect(() => { throw new Error("bad thing"); }).toThrow("bad");
                expect(() => {}).not.toThrow();
                expect({ id: 1, extra: true }).toEqual({ id: expect.any(Number), extra: true });
            });
            it("negation fails", () => { expect(1).not.toBe(1); });
            "#,
        );
        assert!(outcomes[0].passed, "{:?}", outcomes[0].error);
        assert!(!outcomes[1].passed);
        assert!(outcomes[1].error.as_deref().unwrap_or_default().contains("not to be 1"));
    }

    #[test]
    fn test_spies_and_async_matchers() {
        let outcomes = run_tests(
            r#"
            it("spies", () => {
                const spy = jest.fn((x) => x + 1);
                spy(1);
                spy(2);
                expect(spy).toHaveBeenCalled();
                expect(spy).toHaveBeenCalledTimes(2);
                expect(spy).toHaveBeenCalledWith(2);
                expect(spy.mock.results[0].value).toBe(2);
            });
            it("resolves", () => expect(Promise.resolve(5)).resolves.toBe(5));
            it("rejects", () => expect(Promise.reject(new Error("no"))).rejects.toThrow("no"));
            it("rejects fails on resolve", () => expect(Promise.resolve(1)).rejects.toThrow());
            "#,
        );
        assert_eq!(
            outcomes.iter().map(|o| o.passed).collect::<Vec<_>>(),
            vec![true, true, true, false]
        );
    }

    #[test]
    fn test_describe_prefixes_and_hooks() {
        let outcomes = run_tests(
            r#"
            let counter = 0;
            beforeEach(() => { counter += 1; });
            describe("outer", () => {
                it("sees hook", () => { expect(counter).toBe(1); });
                it("sees hook again", () => { expect(counter).toBe(2); });
            });
            "#,
        );
        assert_eq!(outcomes[0].name, "outer sees hook");
        assert!(outcomes.iter().all(|o| o.passed), "{outcomes:?}");
    }
}
