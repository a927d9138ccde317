//! Browser facsimile for web targets
//!
//! The element model is JS glue evaluated once per runner in the
//! GlobalContext realm; everything that touches files, stylesheets or the
//! network calls back into Rust through a small host object. Two strategies
//! decide when inserted resources load:
//! - `fake`: `<script>` runs synchronously on insertion unless marked
//!   async/defer/module, stylesheets load synchronously
//! - `jsdom`: every resource loads in a microtask; the document starts from
//!   `index.html` and `.html` entries are loaded as pages

pub mod css;
pub(crate) mod event_source;
pub(crate) mod fake;
pub(crate) mod fetch;
pub(crate) mod jsdom;

use boa_engine::{Context, JsArgs, JsNativeError, JsObject, JsResult, JsValue, js_string};
use boa_gc::{Finalize, Trace};
use serde_json::{Map, Value, json};
use std::path::Path;

use super::{
    NativeFn, RunnerExtension, RunnerHandle, bind_native, eval_glue, realm,
    requirer::{self, RequireContext},
    scope::ModuleScope,
    test_config,
};
use crate::{
    config::DomMode,
    resolver::{ModulePath, RunnerFile, TEST_CASES_PATH_ORIGIN, url_to_relative_path},
};
use css::{ElementInfo, Stylesheet};
use event_source::{EventSourceTable, SourceEvent};
use jsdom::PageNode;

/// When an inserted resource is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timing {
    Immediate,
    Microtask,
}

impl Timing {
    fn as_str(self) -> &'static str {
        match self {
            Timing::Immediate => "immediate",
            Timing::Microtask => "microtask",
        }
    }
}

/// Attributes of a `<script>` that affect its timing
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ScriptAttributes {
    pub(crate) is_async: bool,
    pub(crate) defer: bool,
    pub(crate) module: bool,
}

/// Policy differences between the two document flavours
pub(crate) trait DomStrategy {
    fn script_timing(&self, script: &ScriptAttributes) -> Timing;

    fn link_timing(&self) -> Timing;

    /// Page the document is built from before anything runs
    fn initial_page(&self, _dist: &Path) -> Option<PageNode> {
        None
    }

    /// Whether `.html` entries are loaded as pages
    fn runs_pages(&self) -> bool {
        false
    }
}

fn strategy(mode: DomMode) -> &'static dyn DomStrategy {
    match mode {
        DomMode::Fake => &fake::FakeDom,
        DomMode::Jsdom => &jsdom::JsdomDom,
    }
}

/// Loaded stylesheets keyed by the element that owns them
#[derive(Debug, Default)]
pub(crate) struct SheetList {
    owners: Vec<u32>,
    sheets: Vec<Stylesheet>,
}

impl SheetList {
    pub(crate) fn insert(&mut self, owner: u32, sheet: Stylesheet) {
        match self.owners.iter().position(|o| *o == owner) {
            Some(index) => self.sheets[index] = sheet,
            None => {
                self.owners.push(owner);
                self.sheets.push(sheet);
            }
        }
    }

    pub(crate) fn remove(&mut self, owner: u32) {
        if let Some(index) = self.owners.iter().position(|o| *o == owner) {
            self.owners.remove(index);
            self.sheets.remove(index);
        }
    }

    pub(crate) fn sheets(&self) -> &[Stylesheet] {
        &self.sheets
    }
}

/// Per-runner DOM state
#[derive(Trace, Finalize)]
pub(crate) struct DomState {
    #[unsafe_ignore_trace]
    mode: DomMode,
    /// Object returned by the element-model glue
    glue: JsObject,
    /// `document.currentScript` for each CommonJS body on the stack
    script_stack: Vec<JsValue>,
    /// Element whose load is about to execute a module
    pending_script: Option<JsObject>,
    #[unsafe_ignore_trace]
    stylesheets: SheetList,
    event_sources: EventSourceTable,
}

/// Names the glue publishes onto the global object
const PUBLISHED: &[&str] = &[
    "document",
    "location",
    "navigator",
    "fetch",
    "Response",
    "Headers",
    "importScripts",
    "getComputedStyle",
    "EventSource",
    "Event",
    "CustomEvent",
    "MessageEvent",
    "EventTarget",
    "Node",
    "Element",
    "HTMLElement",
    "Text",
    "Document",
    "DocumentFragment",
];

/// Names also bound in every module scope
const SCOPE_BINDINGS: &[&str] = &[
    "document",
    "location",
    "navigator",
    "fetch",
    "importScripts",
    "getComputedStyle",
    "EventSource",
    "Event",
    "CustomEvent",
];

const DOM_JS: &str = r##"
(function (host) {
    const PAGE = host.pageUrl;
    const resolveUrl = (value) => {
        try {
            return new URL(String(value), PAGE).href;
        } catch (_) {
            return String(value);
        }
    };

    class Event {
        constructor(type, init = {}) {
            this.type = String(type);
            this.bubbles = !!init.bubbles;
            this.cancelable = !!init.cancelable;
            this.defaultPrevented = false;
            this.target = null;
            this.currentTarget = null;
            this.timeStamp = Date.now();
        }
        preventDefault() {
            if (this.cancelable) this.defaultPrevented = true;
        }
        stopPropagation() {
            this._stopped = true;
        }
        stopImmediatePropagation() {
            this._stopped = true;
        }
        initEvent(type, bubbles, cancelable) {
            this.type = String(type);
            this.bubbles = !!bubbles;
            this.cancelable = !!cancelable;
        }
    }
    class CustomEvent extends Event {
        constructor(type, init = {}) {
            super(type, init);
            this.detail = init.detail === undefined ? null : init.detail;
        }
    }
    class MessageEvent extends Event {
        constructor(type, init = {}) {
            super(type, init);
            this.data = init.data;
            this.lastEventId = init.lastEventId || "";
            this.origin = init.origin || "";
        }
    }

    class EventTarget {
        constructor() {
            this._listeners = {};
        }
        addEventListener(type, listener) {
            if (!listener) return;
            const listeners = (this._listeners[type] ||= []);
            if (!listeners.includes(listener)) listeners.push(listener);
        }
        removeEventListener(type, listener) {
            this._listeners[type] = (this._listeners[type] || []).filter((l) => l !== listener);
        }
        dispatchEvent(event) {
            if (!event.target) event.target = this;
            let node = this;
            while (node) {
                event.currentTarget = node;
                const handler = node["on" + event.type];
                if (typeof handler === "function") handler.call(node, event);
                for (const listener of ((node._listeners || {})[event.type] || []).slice()) {
                    if (typeof listener === "function") listener.call(node, event);
                    else listener.handleEvent(event);
                }
                if (!event.bubbles || event._stopped) break;
                node = node.parentNode;
            }
            return !event.defaultPrevented;
        }
    }

    const fire = (target, type) => target.dispatchEvent(new Event(type));

    const collect = (root, predicate) => {
        const out = [];
        const walk = (node) => {
            for (const child of node.childNodes) {
                if (child.nodeType === 1 && predicate(child)) out.push(child);
                walk(child);
            }
        };
        walk(root);
        return out;
    };

    const parseSelector = (text) => {
        const compound = text.trim().split(/\s*[\s>+~]\s*/).filter(Boolean).pop() || "";
        const parts = [];
        const pattern = /([#.:]{0,2})([\w-]+)|\[([\w-]+)(?:([~|^$*]?=)["']?([^"'\]]*)["']?)?\]|\*/g;
        let match;
        while ((match = pattern.exec(compound))) {
            if (match[0] === "*") continue;
            if (match[3]) {
                parts.push({ kind: "attr", name: match[3].toLowerCase(), op: match[4], value: match[5] });
            } else {
                const prefix = match[1];
                const kind = prefix === "#" ? "id" : prefix === "." ? "class" : prefix.startsWith(":") ? "pseudo" : "tag";
                parts.push({ kind, name: match[2] });
            }
        }
        return parts;
    };
    const matchesAttr = (value, part) => {
        if (value === null) return false;
        switch (part.op) {
            case undefined:
                return true;
            case "=":
                return value === part.value;
            case "^=":
                return value.startsWith(part.value);
            case "$=":
                return value.endsWith(part.value);
            case "*=":
                return value.includes(part.value);
            case "~=":
                return value.split(/\s+/).includes(part.value);
            default:
                return value === part.value || value.startsWith(part.value + "-");
        }
    };
    const matches = (el, parts) =>
        parts.every((part) => {
            switch (part.kind) {
                case "tag":
                    return el.localName === part.name.toLowerCase();
                case "id":
                    return el.id === part.name;
                case "class":
                    return el.classList.contains(part.name);
                case "pseudo":
                    return part.name === "root" && !!el.ownerDocument && el.ownerDocument.documentElement === el;
                default:
                    return matchesAttr(el.getAttribute(part.name), part);
            }
        });
    const selectorList = (selector) => String(selector).split(",").map(parseSelector);

    let sheetIds = 0;
    const sheetId = (el) => (el._sheetId ||= ++sheetIds);

    const connect = (node) => {
        if (node.nodeType !== 1) return;
        if (node.localName === "script") loadScript(node);
        else if (node.localName === "link") loadLink(node);
        else if (node.localName === "style") refreshStyle(node);
        for (const child of node.childNodes.slice()) connect(child);
    };
    const disconnect = (node) => {
        if (node.nodeType !== 1) return;
        if (node._sheetId) host.dropSheet(node._sheetId);
        for (const child of node.childNodes) disconnect(child);
    };

    class Node extends EventTarget {
        constructor(nodeType, nodeName, ownerDocument) {
            super();
            this.nodeType = nodeType;
            this.nodeName = nodeName;
            this.ownerDocument = ownerDocument;
            this.parentNode = null;
            this.childNodes = [];
        }
        get parentElement() {
            return this.parentNode && this.parentNode.nodeType === 1 ? this.parentNode : null;
        }
        get children() {
            return this.childNodes.filter((n) => n.nodeType === 1);
        }
        get firstChild() {
            return this.childNodes[0] || null;
        }
        get lastChild() {
            return this.childNodes[this.childNodes.length - 1] || null;
        }
        get firstElementChild() {
            return this.children[0] || null;
        }
        get nextSibling() {
            const parent = this.parentNode;
            return parent ? parent.childNodes[parent.childNodes.indexOf(this) + 1] || null : null;
        }
        get previousSibling() {
            const parent = this.parentNode;
            return parent ? parent.childNodes[parent.childNodes.indexOf(this) - 1] || null : null;
        }
        get isConnected() {
            let node = this;
            while (node.parentNode) node = node.parentNode;
            return node.nodeType === 9;
        }
        get textContent() {
            return this.childNodes.map((c) => c.textContent).join("");
        }
        set textContent(value) {
            for (const child of this.childNodes.slice()) this.removeChild(child);
            if (value !== undefined && value !== null && value !== "") {
                this.appendChild(new Text(String(value), this.ownerDocument || this));
            }
        }
        hasChildNodes() {
            return this.childNodes.length > 0;
        }
        appendChild(child) {
            return this.insertBefore(child, null);
        }
        append(...nodes) {
            for (const node of nodes) {
                this.appendChild(typeof node === "string" ? new Text(node, this.ownerDocument) : node);
            }
        }
        prepend(...nodes) {
            const first = this.firstChild;
            for (const node of nodes) {
                this.insertBefore(typeof node === "string" ? new Text(node, this.ownerDocument) : node, first);
            }
        }
        insertBefore(child, reference) {
            if (child.nodeType === 11) {
                for (const c of child.childNodes.slice()) this.insertBefore(c, reference);
                return child;
            }
            if (child.parentNode) child.parentNode.removeChild(child);
            const index = reference ? this.childNodes.indexOf(reference) : -1;
            if (index < 0) this.childNodes.push(child);
            else this.childNodes.splice(index, 0, child);
            child.parentNode = this;
            if (this.isConnected) {
                connect(child);
                if (this.localName === "style") refreshStyle(this);
            }
            return child;
        }
        removeChild(child) {
            const index = this.childNodes.indexOf(child);
            if (index < 0) throw new Error("The node to be removed is not a child of this node.");
            const wasConnected = this.isConnected;
            this.childNodes.splice(index, 1);
            child.parentNode = null;
            if (wasConnected) {
                disconnect(child);
                if (this.localName === "style") refreshStyle(this);
            }
            return child;
        }
        replaceChild(replacement, old) {
            this.insertBefore(replacement, old);
            return this.removeChild(old);
        }
        remove() {
            if (this.parentNode) this.parentNode.removeChild(this);
        }
        contains(node) {
            while (node) {
                if (node === this) return true;
                node = node.parentNode;
            }
            return false;
        }
        getElementsByTagName(tag) {
            const name = String(tag).toLowerCase();
            return collect(this, (el) => name === "*" || el.localName === name);
        }
        getElementsByClassName(name) {
            return collect(this, (el) => el.classList.contains(name));
        }
        querySelectorAll(selector) {
            const list = selectorList(selector);
            return collect(this, (el) => list.some((parts) => matches(el, parts)));
        }
        querySelector(selector) {
            return this.querySelectorAll(selector)[0] || null;
        }
    }

    class Text extends Node {
        constructor(data, ownerDocument) {
            super(3, "#text", ownerDocument);
            this.data = data;
        }
        get textContent() {
            return this.data;
        }
        set textContent(value) {
            this.data = String(value);
        }
        get nodeValue() {
            return this.data;
        }
    }

    class DocumentFragment extends Node {
        constructor(ownerDocument) {
            super(11, "#document-fragment", ownerDocument);
        }
    }

    const createStyle = () => {
        const style = {};
        Object.defineProperties(style, {
            setProperty: { value: (name, value) => { style[name] = String(value); } },
            getPropertyValue: { value: (name) => (style[name] === undefined ? "" : String(style[name])) },
            removeProperty: {
                value: (name) => {
                    const old = style.getPropertyValue(name);
                    delete style[name];
                    return old;
                },
            },
        });
        return style;
    };

    class Element extends Node {
        constructor(tag, ownerDocument, namespaceURI) {
            super(1, String(tag).toUpperCase(), ownerDocument);
            this.localName = String(tag).toLowerCase();
            this.tagName = this.nodeName;
            this.namespaceURI = namespaceURI || "http://www.w3.org/1999/xhtml";
            this._attributes = new Map();
            this.style = createStyle();
            this.dataset = {};
            this.sheet = null;
        }
        get attributes() {
            return Array.from(this._attributes, ([name, value]) => ({ name, value }));
        }
        setAttribute(name, value) {
            this._attributes.set(String(name).toLowerCase(), String(value));
        }
        getAttribute(name) {
            const value = this._attributes.get(String(name).toLowerCase());
            return value === undefined ? null : value;
        }
        hasAttribute(name) {
            return this._attributes.has(String(name).toLowerCase());
        }
        removeAttribute(name) {
            this._attributes.delete(String(name).toLowerCase());
        }
        get classList() {
            const el = this;
            const list = () => el.className.split(/\s+/).filter(Boolean);
            return {
                get length() {
                    return list().length;
                },
                contains: (name) => list().includes(name),
                add: (...names) => {
                    el.className = [...new Set([...list(), ...names])].join(" ");
                },
                remove: (...names) => {
                    el.className = list().filter((c) => !names.includes(c)).join(" ");
                },
                toggle: (name) => {
                    const has = list().includes(name);
                    el.className = (has ? list().filter((c) => c !== name) : [...list(), name]).join(" ");
                    return !has;
                },
            };
        }
        get innerHTML() {
            return this.textContent;
        }
        set innerHTML(value) {
            this.textContent = value;
        }
        getBoundingClientRect() {
            return { x: 0, y: 0, top: 0, left: 0, right: 0, bottom: 0, width: 0, height: 0 };
        }
        matches(selector) {
            return selectorList(selector).some((parts) => matches(this, parts));
        }
        closest(selector) {
            let el = this;
            while (el && el.nodeType === 1) {
                if (el.matches(selector)) return el;
                el = el.parentNode;
            }
            return null;
        }
        focus() {}
        blur() {}
        click() {
            this.dispatchEvent(new Event("click", { bubbles: true, cancelable: true }));
        }
    }
    for (const entry of ["id", "className:class", "src", "href", "rel", "type", "charset", "crossOrigin:crossorigin",
        "integrity", "nonce", "as", "media", "title", "name", "lang", "target", "fetchPriority:fetchpriority"]) {
        const [prop, attr = prop.toLowerCase()] = entry.split(":");
        Object.defineProperty(Element.prototype, prop, {
            get() {
                const value = this.getAttribute(attr);
                if (value === null) return "";
                return prop === "src" || prop === "href" ? resolveUrl(value) : value;
            },
            set(value) {
                this.setAttribute(attr, value);
            },
            configurable: true,
        });
    }
    for (const entry of ["async", "defer", "noModule:nomodule", "disabled"]) {
        const [prop, attr = prop] = entry.split(":");
        Object.defineProperty(Element.prototype, prop, {
            get() {
                return this.hasAttribute(attr);
            },
            set(value) {
                if (value) this.setAttribute(attr, "");
                else this.removeAttribute(attr);
            },
            configurable: true,
        });
    }

    const location = {
        href: PAGE,
        origin: "https://test.cases",
        protocol: "https:",
        host: "test.cases",
        hostname: "test.cases",
        port: "",
        pathname: new URL(PAGE).pathname,
        search: "",
        hash: "",
        toString() {
            return this.href;
        },
        assign() {},
        replace() {},
        reload() {},
    };

    const navigator = {
        userAgent: "Mozilla/5.0 (rspack-test-runner)",
        language: "en-US",
        languages: ["en-US", "en"],
        onLine: true,
        platform: "",
    };

    class Document extends Node {
        constructor() {
            super(9, "#document", null);
            this.documentElement = new Element("html", this);
            this.head = new Element("head", this);
            this.body = new Element("body", this);
            this.documentElement.appendChild(this.head);
            this.documentElement.appendChild(this.body);
            this.appendChild(this.documentElement);
            this.cookie = "";
            this.readyState = "complete";
            this.location = location;
        }
        get URL() {
            return location.href;
        }
        get baseURI() {
            return location.href;
        }
        get currentScript() {
            return host.currentScript();
        }
        get styleSheets() {
            return collect(this, (el) => !!el.sheet).map((el) => el.sheet);
        }
        createElement(tag) {
            return new Element(tag, this);
        }
        createElementNS(namespaceURI, tag) {
            return new Element(tag, this, namespaceURI);
        }
        createTextNode(data) {
            return new Text(String(data), this);
        }
        createComment() {
            return new Text("", this);
        }
        createDocumentFragment() {
            return new DocumentFragment(this);
        }
        createEvent() {
            return new Event("");
        }
        getElementById(id) {
            return collect(this, (el) => el.id === id)[0] || null;
        }
    }

    const document = new Document();

    const loadNow = (el) => {
        el._started = true;
        if (el.localName === "script") {
            fire(el, host.loadScript(el, el.src) ? "load" : "error");
            return;
        }
        if ((el.getAttribute("rel") || "").toLowerCase() !== "stylesheet") {
            fire(el, "load");
            return;
        }
        const rules = host.loadLink(sheetId(el), el.href, el);
        if (rules === null) {
            fire(el, "error");
            return;
        }
        el.sheet = { href: el.href, cssRules: withStyleAccess(rules), ownerNode: el };
        fire(el, "load");
    };
    const loadScript = (el) => {
        if (el._started || el.getAttribute("src") === null) return;
        el._started = true;
        const timing = host.scriptTiming(el.async, el.defer, el.getAttribute("type") || "");
        if (timing === "microtask") queueMicrotask(() => loadNow(el));
        else loadNow(el);
    };
    const loadLink = (el) => {
        if (el._started || el.getAttribute("href") === null) return;
        el._started = true;
        if (host.linkTiming() === "microtask") queueMicrotask(() => loadNow(el));
        else loadNow(el);
    };
    const withStyleAccess = (rules) => {
        for (const rule of rules) {
            Object.defineProperty(rule.style, "getPropertyValue", {
                value: (name) => (rule.style[name] === undefined ? "" : rule.style[name]),
            });
        }
        return rules;
    };
    const refreshStyle = (el) => {
        el.sheet = { href: null, cssRules: withStyleAccess(host.loadStyle(sheetId(el), el.textContent)), ownerNode: el };
    };

    const getComputedStyle = (el) => {
        const isRoot = !!el.ownerDocument && el.ownerDocument.documentElement === el;
        const resolved = host.computedStyle(el.localName, el.id, el.className, isRoot);
        return Object.assign(createStyle(), resolved, el.style);
    };

    class Headers {
        constructor(init = {}) {
            this._map = new Map(Object.entries(init).map(([k, v]) => [k.toLowerCase(), String(v)]));
        }
        get(name) {
            const value = this._map.get(String(name).toLowerCase());
            return value === undefined ? null : value;
        }
        has(name) {
            return this._map.has(String(name).toLowerCase());
        }
        forEach(fn) {
            this._map.forEach((v, k) => fn(v, k, this));
        }
    }
    class Response {
        constructor(body, init = {}) {
            this._body = body === undefined || body === null ? "" : String(body);
            this.status = init.status === undefined ? 200 : init.status;
            this.statusText = init.statusText || "";
            this.ok = this.status >= 200 && this.status < 300;
            this.url = init.url || "";
            this.headers = new Headers(init.headers || {});
            this.bodyUsed = false;
        }
        text() {
            this.bodyUsed = true;
            return Promise.resolve(this._body);
        }
        json() {
            return this.text().then((text) => JSON.parse(text));
        }
        arrayBuffer() {
            return this.text().then((text) => new TextEncoder().encode(text).buffer);
        }
        clone() {
            return new Response(this._body, { status: this.status, statusText: this.statusText, url: this.url });
        }
    }
    const fetch = (input) =>
        new Promise((resolve) => {
            const raw = input !== null && typeof input === "object" && typeof input.url === "string" ? input.url : String(input);
            const url = resolveUrl(raw);
            const r = host.fetch(url);
            resolve(new Response(r.body, {
                status: r.status,
                statusText: r.statusText,
                url,
                headers: { "content-type": r.contentType },
            }));
        });

    const importScripts = (...urls) => {
        for (const url of urls) host.importScript(resolveUrl(url));
    };

    class EventSource extends EventTarget {
        constructor(url) {
            super();
            this.url = resolveUrl(url);
            this.readyState = 0;
            this.withCredentials = false;
            this.onopen = null;
            this.onmessage = null;
            this.onerror = null;
            this._id = host.openEventSource(this.url, this);
        }
        close() {
            if (this.readyState === 2) return;
            this.readyState = 2;
            host.closeEventSource(this._id);
        }
    }
    EventSource.CONNECTING = 0;
    EventSource.OPEN = 1;
    EventSource.CLOSED = 2;

    const deliver = (source, type, data, lastEventId) => {
        if (source.readyState === 2) return;
        if (type === "open") {
            source.readyState = 1;
            fire(source, "open");
            return;
        }
        if (type === "error") {
            source.readyState = 2;
            fire(source, "error");
            return;
        }
        source.dispatchEvent(new MessageEvent(type, { data, lastEventId: lastEventId || "", origin: new URL(source.url).origin }));
    };

    const attachWindow = (win) => {
        win._listeners = {};
        for (const name of ["addEventListener", "removeEventListener", "dispatchEvent"]) {
            win[name] = EventTarget.prototype[name];
        }
        win.innerWidth = 1024;
        win.innerHeight = 768;
        win.devicePixelRatio = 1;
    };

    const scriptFor = (src) => {
        const el = new Element("script", document);
        el.setAttribute("src", src);
        return el;
    };

    const build = (node) => {
        if (node.text !== undefined) return new Text(node.text, document);
        const el = new Element(node.tag, document);
        for (const [name, value] of node.attrs) el.setAttribute(name, value);
        for (const child of node.children) {
            const built = build(child);
            built.parentNode = el;
            el.childNodes.push(built);
        }
        return el;
    };
    const buildDocument = (tree) => {
        for (const child of document.childNodes.slice()) document.removeChild(child);
        const html = build(tree);
        html.parentNode = document;
        document.childNodes.push(html);
        document.documentElement = html;
        document.head = html.children.find((c) => c.localName === "head") || null;
        document.body = html.children.find((c) => c.localName === "body") || null;
        return collect(document, (el) =>
            (el.localName === "script" && el.getAttribute("src") !== null) ||
            (el.localName === "link" && el.getAttribute("href") !== null));
    };
    const runPage = (resources) =>
        resources
            .reduce((previous, el) => previous.then(() => loadNow(el)), Promise.resolve())
            .then(() => {
                document.dispatchEvent(new Event("DOMContentLoaded"));
                globalThis.dispatchEvent(new Event("load"));
            });

    return {
        document,
        location,
        navigator,
        fetch,
        Response,
        Headers,
        importScripts,
        getComputedStyle,
        EventSource,
        Event,
        CustomEvent,
        MessageEvent,
        EventTarget,
        Node,
        Element,
        HTMLElement: Element,
        Text,
        Document,
        DocumentFragment,
        attachWindow,
        scriptFor,
        deliver,
        buildDocument,
        runPage,
    };
})
"##;

fn dom_state_missing() -> JsNativeError {
    JsNativeError::error().with_message("the DOM is not installed in this runner")
}

fn glue(handle: &RunnerHandle) -> JsResult<JsObject> {
    handle
        .borrow()
        .dom
        .as_ref()
        .map(|dom| dom.glue.clone())
        .ok_or_else(|| dom_state_missing().into())
}

/// Call a function exported by the element-model glue
pub(crate) fn call_glue(handle: &RunnerHandle, name: &str, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let glue = glue(handle)?;
    let function = glue.get(js_string!(name), context)?;
    let function = function
        .as_callable()
        .map(|f| f.clone())
        .ok_or_else(|| JsNativeError::typ().with_message(format!("dom glue '{name}' is not callable")))?;
    function.call(&JsValue::undefined(), args, context)
}

fn dom_mode(handle: &RunnerHandle) -> JsResult<DomMode> {
    handle
        .borrow()
        .dom
        .as_ref()
        .map(|dom| dom.mode)
        .ok_or_else(|| dom_state_missing().into())
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args.get_or_undefined(index).to_string(context)?.to_std_string_escaped())
}

fn script_timing_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let script = ScriptAttributes {
        is_async: args.get_or_undefined(0).to_boolean(),
        defer: args.get_or_undefined(1).to_boolean(),
        module: string_arg(args, 2, context)? == "module",
    };
    let timing = strategy(dom_mode(handle)?).script_timing(&script);
    Ok(js_string!(timing.as_str()).into())
}

fn link_timing_native(_this: &JsValue, _args: &[JsValue], handle: &RunnerHandle, _context: &mut Context) -> JsResult<JsValue> {
    let timing = strategy(dom_mode(handle)?).link_timing();
    Ok(js_string!(timing.as_str()).into())
}

/// Execute the file behind a `<script src>`; `false` when it does not exist
pub(crate) fn load_script(handle: &RunnerHandle, element: JsValue, url: &str, context: &mut Context) -> JsResult<bool> {
    let dist = handle.borrow().options.dist.clone();
    let Some(path) = fetch::resolve_path(&dist, url) else {
        tracing::warn!(url = %url, "script outside the test origins");
        return Ok(false);
    };
    let request = ModulePath::Single(path.to_string_lossy().into_owned());
    let file = match test_config::resource_override(handle, url, element.clone(), context)? {
        Some(content) => RunnerFile::new(path.clone(), content, ""),
        None => {
            let files = handle.borrow().files.clone();
            match files.get_file(&request, &dist) {
                Ok(Some(file)) => file,
                Ok(None) | Err(_) => {
                    tracing::debug!(url = %url, "script not found");
                    return Ok(false);
                }
            }
        }
    };

    if let Some(dom) = handle.borrow_mut().dom.as_mut() {
        dom.pending_script = element.as_object().map(|o| o.clone());
    }
    let require_context = RequireContext {
        file: Some(file),
        ..RequireContext::default()
    };
    let result = requirer::require(handle, &dist, request, require_context, context);
    if let Some(dom) = handle.borrow_mut().dom.as_mut() {
        dom.pending_script = None;
    }
    result?;
    Ok(true)
}

fn load_script_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let url = string_arg(args, 1, context)?;
    load_script(handle, args.get_or_undefined(0).clone(), &url, context).map(JsValue::from)
}

fn parse_sheet(css: &str, href: Option<String>) -> Stylesheet {
    Stylesheet::parse(css, href.clone()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "unparsable stylesheet");
        Stylesheet {
            href,
            rules: Vec::new(),
        }
    })
}

/// `cssRules` view of a sheet
fn rules_json(sheet: &Stylesheet) -> Value {
    let rules = sheet
        .rules
        .iter()
        .map(|rule| {
            let style: Map<String, Value> = rule
                .declarations
                .iter()
                .map(|d| (d.property.clone(), Value::String(d.value.clone())))
                .collect();
            let body = rule
                .declarations
                .iter()
                .map(|d| format!("{}: {};", d.property, d.value))
                .collect::<Vec<_>>()
                .join(" ");
            json!({
                "selectorText": rule.selector_text,
                "cssText": format!("{} {{ {body} }}", rule.selector_text),
                "style": style,
            })
        })
        .collect();
    Value::Array(rules)
}

fn store_sheet(handle: &RunnerHandle, owner: u32, sheet: &Stylesheet, context: &mut Context) -> JsResult<JsValue> {
    let rules = rules_json(sheet);
    if let Some(dom) = handle.borrow_mut().dom.as_mut() {
        dom.stylesheets.insert(owner, sheet.clone());
    }
    JsValue::from_json(&rules, context)
}

fn load_link_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let owner = args.get_or_undefined(0).to_u32(context)?;
    let url = string_arg(args, 1, context)?;
    let element = args.get_or_undefined(2).clone();
    let dist = handle.borrow().options.dist.clone();
    let css = match test_config::resource_override(handle, &url, element, context)? {
        Some(css) => Some(css),
        None => fetch::read_text(&dist, &url),
    };
    let Some(css) = css else {
        tracing::debug!(url = %url, "stylesheet not found");
        return Ok(JsValue::null());
    };
    let sheet = parse_sheet(&css, Some(url));
    store_sheet(handle, owner, &sheet, context)
}

fn load_style_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let owner = args.get_or_undefined(0).to_u32(context)?;
    let css = string_arg(args, 1, context)?;
    let sheet = parse_sheet(&css, None);
    store_sheet(handle, owner, &sheet, context)
}

fn drop_sheet_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let owner = args.get_or_undefined(0).to_u32(context)?;
    if let Some(dom) = handle.borrow_mut().dom.as_mut() {
        dom.stylesheets.remove(owner);
    }
    Ok(JsValue::undefined())
}

fn computed_style_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let id = string_arg(args, 1, context)?;
    let element = ElementInfo {
        tag: string_arg(args, 0, context)?,
        id: (!id.is_empty()).then_some(id),
        classes: string_arg(args, 2, context)?
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        is_root: args.get_or_undefined(3).to_boolean(),
    };
    let style: Map<String, Value> = {
        let state = handle.borrow();
        let dom = state.dom.as_ref().ok_or_else(dom_state_missing)?;
        css::computed_style(dom.stylesheets.sheets(), &element)
            .into_iter()
            .map(|(property, value)| (property, Value::String(value)))
            .collect()
    };
    JsValue::from_json(&Value::Object(style), context)
}

fn fetch_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let url = string_arg(args, 0, context)?;
    let dist = handle.borrow().options.dist.clone();
    let response = fetch::fetch(&dist, &url);
    tracing::trace!(url = %url, status = response.status, "fetch");
    JsValue::from_json(&response.to_json(), context)
}

fn import_script_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let url = string_arg(args, 0, context)?;
    if !url.starts_with(TEST_CASES_PATH_ORIGIN) {
        return Err(JsNativeError::error()
            .with_message(format!(
                "importScripts: unexpected url '{url}', expected it to start with '{TEST_CASES_PATH_ORIGIN}'"
            ))
            .into());
    }
    let dist = handle.borrow().options.dist.clone();
    let request = ModulePath::Single(url_to_relative_path(&url)).without_query();
    requirer::require(handle, &dist, request, RequireContext::default(), context)?;
    Ok(JsValue::undefined())
}

fn open_event_source_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let url = string_arg(args, 0, context)?;
    let target = args
        .get_or_undefined(1)
        .as_object()
        .map(|o| o.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("EventSource target must be an object"))?;
    let mut state = handle.borrow_mut();
    let dom = state.dom.as_mut().ok_or_else(dom_state_missing)?;
    Ok(JsValue::from(dom.event_sources.open(url, target)))
}

fn close_event_source_native(_this: &JsValue, args: &[JsValue], handle: &RunnerHandle, context: &mut Context) -> JsResult<JsValue> {
    let id = args.get_or_undefined(0).to_u32(context)?;
    if let Some(dom) = handle.borrow_mut().dom.as_mut() {
        dom.event_sources.close(id);
    }
    Ok(JsValue::undefined())
}

fn current_script_native(_this: &JsValue, _args: &[JsValue], handle: &RunnerHandle, _context: &mut Context) -> JsResult<JsValue> {
    let state = handle.borrow();
    Ok(state
        .dom
        .as_ref()
        .and_then(|dom| dom.script_stack.last().cloned())
        .unwrap_or_else(JsValue::null))
}

fn host_object(handle: &RunnerHandle, context: &mut Context) -> JsResult<JsObject> {
    let natives: [(&str, NativeFn); 12] = [
        ("scriptTiming", script_timing_native),
        ("linkTiming", link_timing_native),
        ("loadScript", load_script_native),
        ("loadLink", load_link_native),
        ("loadStyle", load_style_native),
        ("dropSheet", drop_sheet_native),
        ("computedStyle", computed_style_native),
        ("fetch", fetch_native),
        ("importScript", import_script_native),
        ("openEventSource", open_event_source_native),
        ("closeEventSource", close_event_source_native),
        ("currentScript", current_script_native),
    ];
    let host = JsObject::with_object_proto(context.intrinsics());
    for (name, native) in natives {
        let function = bind_native(handle, native, context);
        host.set(js_string!(name), function, false, context)?;
    }
    host.set(js_string!("pageUrl"), js_string!(fetch::PAGE_URL), false, context)?;
    Ok(host)
}

/// Install the element model into the GlobalContext, once per runner
fn ensure_dom(handle: &RunnerHandle, mode: DomMode, context: &mut Context) -> JsResult<()> {
    if handle.borrow().dom.is_some() {
        return Ok(());
    }
    let realm = realm::global_realm(handle, context)?;
    realm::with_realm(context, &realm, |context| {
        let host = host_object(handle, context)?;
        let glue = eval_glue("runner:dom", DOM_JS, &[host.into()], context)?;
        let glue = glue
            .as_object()
            .map(|o| o.clone())
            .ok_or_else(|| JsNativeError::typ().with_message("dom glue did not return an object"))?;

        let global = context.global_object();
        global.set(js_string!("window"), global.clone(), false, context)?;
        for name in PUBLISHED {
            let value = glue.get(js_string!(*name), context)?;
            global.set(js_string!(*name), value, false, context)?;
        }

        handle.borrow_mut().dom = Some(DomState {
            mode,
            glue,
            script_stack: Vec::new(),
            pending_script: None,
            stylesheets: SheetList::default(),
            event_sources: EventSourceTable::default(),
        });
        call_glue(handle, "attachWindow", &[global.into()], context)?;

        let dist = handle.borrow().options.dist.clone();
        if let Some(page) = strategy(mode).initial_page(&dist) {
            jsdom::build_document(handle, &page, context)?;
        }
        tracing::debug!(?mode, "dom installed");
        Ok(())
    })
}

/// DOM facsimile layered over the node runner
pub(crate) struct WebExtension {
    mode: DomMode,
}

impl WebExtension {
    pub(crate) fn new(mode: DomMode) -> Self {
        Self { mode }
    }
}

impl RunnerExtension for WebExtension {
    fn extend_base_scope(&self, handle: &RunnerHandle, scope: &mut ModuleScope, context: &mut Context) -> JsResult<()> {
        ensure_dom(handle, self.mode, context)?;
        let global = realm::global_object(handle, context)?;
        scope.set("window", global.clone());
        for name in SCOPE_BINDINGS {
            scope.set(*name, global.get(js_string!(*name), context)?);
        }
        Ok(())
    }

    fn pre_execute(&self, handle: &RunnerHandle, file: &RunnerFile, context: &mut Context) -> JsResult<()> {
        let pending = {
            let mut state = handle.borrow_mut();
            let Some(dom) = state.dom.as_mut() else {
                return Ok(());
            };
            dom.pending_script.take()
        };
        let script = match pending {
            Some(element) => element.into(),
            None => {
                let dist = handle.borrow().options.dist.clone();
                let url = fetch::fake_url(&dist, &file.path);
                call_glue(handle, "scriptFor", &[js_string!(url).into()], context)?
            }
        };
        if let Some(dom) = handle.borrow_mut().dom.as_mut() {
            dom.script_stack.push(script);
        }
        Ok(())
    }

    fn post_execute(&self, handle: &RunnerHandle, _file: &RunnerFile, _context: &mut Context) -> JsResult<()> {
        if let Some(dom) = handle.borrow_mut().dom.as_mut() {
            dom.script_stack.pop();
        }
        Ok(())
    }

    fn run_entry(&self, handle: &RunnerHandle, request: &str, context: &mut Context) -> JsResult<Option<JsValue>> {
        if !strategy(self.mode).runs_pages() || !request.ends_with(".html") {
            return Ok(None);
        }
        jsdom::run_page(handle, request, context).map(Some)
    }

    fn poll(&self, handle: &RunnerHandle, context: &mut Context) -> JsResult<bool> {
        let events = match handle.borrow_mut().dom.as_mut() {
            Some(dom) => dom.event_sources.drain(),
            None => return Ok(false),
        };
        if events.is_empty() {
            return Ok(false);
        }
        for (target, event) in events {
            let args: Vec<JsValue> = match event {
                SourceEvent::Open => vec![target.into(), js_string!("open").into()],
                SourceEvent::Message { event, data, id } => vec![
                    target.into(),
                    js_string!(event).into(),
                    js_string!(data).into(),
                    id.map(|id| JsValue::from(js_string!(id))).unwrap_or_default(),
                ],
                SourceEvent::Error(message) => {
                    tracing::debug!(error = %message, "event source failed");
                    vec![target.into(), js_string!("error").into()]
                }
            };
            call_glue(handle, "deliver", &args, context)?;
        }
        Ok(true)
    }

    fn has_pending_work(&self, handle: &RunnerHandle) -> bool {
        handle
            .borrow()
            .dom
            .as_ref()
            .is_some_and(|dom| !dom.event_sources.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::{DomMode, RunnerEnvironment, RunnerOptions},
        runtime::Runner,
    };
    use std::{fs, path::Path};

    fn web_runner(dir: &Path, mode: DomMode) -> Runner {
        let options = RunnerOptions::new("main", dir, dir)
            .environment(RunnerEnvironment::Web(mode))
            .print_logger(false);
        Runner::new(options).unwrap()
    }

    #[test]
    fn test_element_model_queries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.js"),
            r##"
            const div = document.createElement("div");
            div.id = "box";
            div.className = "a b";
            div.setAttribute("data-x", "1");
            const span = document.createElement("span");
            span.textContent = "hi";
            div.appendChild(span);
            document.body.appendChild(div);
            module.exports = [
                document.getElementById("box") === div,
                document.querySelector("#box span").textContent,
                document.querySelectorAll(".b").length,
                document.querySelector("div[data-x='1']") === div,
                div.classList.contains("a"),
                span.parentElement === div,
                typeof window.addEventListener,
            ].join(",");
            "##,
        )
        .unwrap();
        let mut runner = web_runner(dir.path(), DomMode::Fake);
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "true,hi,1,true,true,true,function");
    }

    #[test]
    fn test_fetch_maps_fake_origin() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("data.json"), r#"{"n": 3}"#).unwrap();
        fs::write(
            dir.path().join("main.js"),
            r#"
            module.exports = Promise.all([
                fetch("data.json").then((r) => r.json()).then((j) => j.n),
                fetch("https://test.cases/path/none.json").then((r) => r.status),
            ]).then((v) => v.join(","));
            "#,
        )
        .unwrap();
        let mut runner = web_runner(dir.path(), DomMode::Fake);
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "3,404");
    }

    #[test]
    fn test_import_scripts_requires_fake_origin() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("lib.js"), "self.fromLib = 'lib';").unwrap();
        fs::write(
            dir.path().join("main.js"),
            r#"
            importScripts("https://test.cases/path/lib.js");
            let error = "";
            try { importScripts("https://elsewhere.dev/x.js"); } catch (e) { error = e.message; }
            module.exports = self.fromLib + ":" + error.includes("unexpected url");
            "#,
        )
        .unwrap();
        let mut runner = web_runner(dir.path(), DomMode::Fake);
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "lib:true");
    }

    #[test]
    fn test_computed_style_from_linked_sheet() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.css"), ".hidden { display: none; }").unwrap();
        fs::write(
            dir.path().join("main.js"),
            r#"
            const link = document.createElement("link");
            link.rel = "stylesheet";
            link.href = "main.css";
            document.head.appendChild(link);
            const el = document.createElement("div");
            el.className = "hidden";
            document.body.appendChild(el);
            module.exports = getComputedStyle(el).getPropertyValue("display") + ":" + link.sheet.cssRules.length;
            "#,
        )
        .unwrap();
        let mut runner = web_runner(dir.path(), DomMode::Fake);
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "none:1");
    }

    #[test]
    fn test_resource_loader_overrides_script_and_link() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.css"), ".x { color: blue; }").unwrap();
        fs::write(
            dir.path().join("test.config.js"),
            r#"
            module.exports = {
                resourceLoader(url, element) {
                    if (url.endsWith("virtual.js")) return "self.fromVirtual = '" + element.localName + "';";
                    if (url.endsWith("real.css")) return ".x { color: red; }";
                },
            };
            "#,
        )
        .unwrap();
        fs::write(
            dir.path().join("main.js"),
            r#"
            const loaded = (el) => new Promise((resolve, reject) => {
                el.addEventListener("load", resolve);
                el.addEventListener("error", () => reject(new Error("failed " + el.localName)));
            });
            const script = document.createElement("script");
            script.src = "https://test.cases/path/virtual.js";
            const link = document.createElement("link");
            link.rel = "stylesheet";
            link.href = "real.css";
            const ready = Promise.all([loaded(script), loaded(link)]);
            document.head.appendChild(script);
            document.head.appendChild(link);
            module.exports = ready.then(() => self.fromVirtual + ":" + link.sheet.cssRules[0].style.color);
            "#,
        )
        .unwrap();
        let mut runner = web_runner(dir.path(), DomMode::Fake);
        let value = runner.run("main.js").unwrap();
        assert_eq!(runner.display(&value), "script:red");
    }
}
