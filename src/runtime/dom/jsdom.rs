//! Page-backed document
//!
//! HTML is parsed with html5ever into an `RcDom`, flattened into a
//! serializable tree and handed to the element-model glue. Scripts and
//! stylesheets of a page load one after another in document order; scripts
//! inserted later always load in a microtask.

use boa_engine::{Context, JsNativeError, JsResult, JsValue};
use html5ever::{parse_document, tendril::TendrilSink};
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use serde::Serialize;
use std::path::Path;

use super::{DomStrategy, ScriptAttributes, Timing, call_glue};
use crate::runtime::RunnerHandle;

/// Element or text node of a parsed page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub(crate) enum PageNode {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        children: Vec<PageNode>,
    },
    Text {
        text: String,
    },
}

fn convert(handle: &Handle) -> Option<PageNode> {
    match &handle.data {
        NodeData::Text { contents } => Some(PageNode::Text {
            text: contents.borrow().to_string(),
        }),
        NodeData::Element { name, attrs, .. } => {
            let attrs = attrs
                .borrow()
                .iter()
                .map(|attr| (attr.name.local.as_ref().to_string(), attr.value.to_string()))
                .collect();
            let children = handle.children.borrow().iter().filter_map(convert).collect();
            Some(PageNode::Element {
                tag: name.local.as_ref().to_string(),
                attrs,
                children,
            })
        }
        _ => None,
    }
}

/// Parse a page into its `<html>` element
pub(crate) fn parse_page(html: &str) -> Option<PageNode> {
    let dom = parse_document(RcDom::default(), Default::default()).one(html);
    let root = dom
        .document
        .children
        .borrow()
        .iter()
        .filter(|child| matches!(child.data, NodeData::Element { .. }))
        .find_map(convert);
    root
}

pub(crate) struct JsdomDom;

impl DomStrategy for JsdomDom {
    fn script_timing(&self, _script: &ScriptAttributes) -> Timing {
        Timing::Microtask
    }

    fn link_timing(&self) -> Timing {
        Timing::Microtask
    }

    fn initial_page(&self, dist: &Path) -> Option<PageNode> {
        let html = std::fs::read_to_string(dist.join("index.html")).ok()?;
        tracing::debug!(dist = %dist.display(), "document starts from index.html");
        parse_page(&html)
    }

    fn runs_pages(&self) -> bool {
        true
    }
}

/// Replace the document with `page`; returns the page's resources in
/// document order without loading them
pub(crate) fn build_document(handle: &RunnerHandle, page: &PageNode, context: &mut Context) -> JsResult<JsValue> {
    let tree = serde_json::to_value(page).map_err(|e| JsNativeError::error().with_message(e.to_string()))?;
    let tree = JsValue::from_json(&tree, context)?;
    call_glue(handle, "buildDocument", &[tree], context)
}

/// Load an `.html` entry as the page and run its resources
pub(crate) fn run_page(handle: &RunnerHandle, request: &str, context: &mut Context) -> JsResult<JsValue> {
    let dist = handle.borrow().options.dist.clone();
    let path = crate::resolver::join_normalized(&dist, request);
    let html = std::fs::read_to_string(&path).map_err(|e| {
        JsNativeError::error().with_message(format!("Cannot read page {}: {e}", path.display()))
    })?;
    tracing::debug!(page = %path.display(), "loading html entry");
    let page = parse_page(&html)
        .ok_or_else(|| JsNativeError::error().with_message(format!("{} has no document element", path.display())))?;
    let resources = build_document(handle, &page, context)?;
    call_glue(handle, "runPage", &[resources], context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DomMode, RunnerEnvironment, RunnerOptions},
        runtime::Runner,
    };
    use std::fs;

    #[test]
    fn test_parse_page_keeps_structure() {
        let page = parse_page("<!doctype html><title>t</title><script src=\"a.js\"></script>").unwrap();
        let PageNode::Element { tag, children, .. } = page else {
            panic!("expected an element");
        };
        assert_eq!(tag, "html");
        let PageNode::Element { tag: head, children: head_children, .. } = &children[0] else {
            panic!("expected head");
        };
        assert_eq!(head, "head");
        assert!(head_children.iter().any(|c| matches!(
            c,
            PageNode::Element { tag, attrs, .. } if tag == "script" && attrs == &vec![("src".to_string(), "a.js".to_string())]
        )));
    }

    fn runner(dir: &std::path::Path) -> Runner {
        let options = RunnerOptions::new("main", dir, dir)
            .environment(RunnerEnvironment::Web(DomMode::Jsdom))
            .print_logger(false);
        Runner::new(options).unwrap()
    }

    #[test]
    fn test_html_entry_runs_scripts_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("page.html"),
            r#"<html><head><script src="a.js"></script></head><body><div id="app"></div><script src="b.js"></script></body></html>"#,
        )
        .unwrap();
        fs::write(dir.path().join("a.js"), "self.order = ['a'];").unwrap();
        fs::write(
            dir.path().join("b.js"),
            "self.order.push('b:' + (document.getElementById('app') !== null));",
        )
        .unwrap();
        let mut runner = runner(dir.path());
        runner.run("page.html").unwrap();
        let order = runner.get_global("order").unwrap();
        assert_eq!(runner.display(&order), "a,b:true");
    }

    #[test]
    fn test_index_html_seeds_document() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("index.html"),
            r#"<html><body><p class="seed">x</p><script src="never.js"></script></body></html>"#,
        )
        .unwrap();
        fs::write(dir.path().join("never.js"), "throw new Error('page scripts must not run');").unwrap();
        fs::write(
            dir.path().join("main.js"),
            "module.exports = document.querySelectorAll('.seed').length;",
        )
        .unwrap();
        let mut runner = runner(dir.path());
        let value = runner.run("main.js").unwrap();
        assert_eq!(value.as_number(), Some(1.0));
    }
}
