//! Stylesheets for `getComputedStyle`
//!
//! Rules are parsed with lightningcss and kept as selector parts plus raw
//! declaration text. Matching is a cascade by source order only: the last
//! matching declaration wins.

use lightningcss::{
    printer::PrinterOptions,
    rules::CssRule,
    stylesheet::{ParserOptions, StyleSheet},
    traits::ToCss,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CssError {
    #[error("failed to parse stylesheet {source_name}: {message}")]
    Parse { source_name: String, message: String },
}

/// Part of a compound selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorPart {
    Type(String),
    Class(String),
    Id(String),
    Universal,
    Root,
}

/// One compound selector; descendant chains keep only their last compound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub text: String,
    pub parts: Vec<SelectorPart>,
}

impl Selector {
    /// Parse a selector; unsupported pieces (attributes, other pseudo
    /// classes) make the selector unmatchable
    pub fn parse(text: &str) -> Option<Self> {
        let compound = text.split([' ', '>', '+', '~']).filter(|s| !s.is_empty()).last()?;
        let mut parts = Vec::new();
        let mut rest = compound;
        while !rest.is_empty() {
            let (part, next) = match rest.as_bytes()[0] {
                b'*' => (SelectorPart::Universal, &rest[1..]),
                b'.' => {
                    let (name, next) = split_name(&rest[1..]);
                    (SelectorPart::Class(name.to_string()), next)
                }
                b'#' => {
                    let (name, next) = split_name(&rest[1..]);
                    (SelectorPart::Id(name.to_string()), next)
                }
                b':' => {
                    let (name, next) = split_name(&rest[1..]);
                    if name != "root" {
                        return None;
                    }
                    (SelectorPart::Root, next)
                }
                _ => {
                    let (name, next) = split_name(rest);
                    if name.is_empty() {
                        return None;
                    }
                    (SelectorPart::Type(name.to_ascii_lowercase()), next)
                }
            };
            parts.push(part);
            rest = next;
        }
        Some(Self {
            text: text.to_string(),
            parts,
        })
    }

    pub fn matches(&self, element: &ElementInfo) -> bool {
        self.parts.iter().all(|part| match part {
            SelectorPart::Universal => true,
            SelectorPart::Type(tag) => element.tag.eq_ignore_ascii_case(tag),
            SelectorPart::Class(class) => element.classes.iter().any(|c| c == class),
            SelectorPart::Id(id) => element.id.as_deref() == Some(id.as_str()),
            SelectorPart::Root => element.is_root,
        })
    }
}

fn split_name(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(s.len());
    s.split_at(end)
}

/// What a selector can see of an element
#[derive(Debug, Clone, Default)]
pub struct ElementInfo {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub is_root: bool,
}

#[derive(Debug, Clone)]
pub struct Declaration {
    pub property: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub selector_text: String,
    pub selectors: Vec<Selector>,
    pub declarations: Vec<Declaration>,
}

#[derive(Debug, Clone, Default)]
pub struct Stylesheet {
    pub href: Option<String>,
    pub rules: Vec<Rule>,
}

impl Stylesheet {
    pub fn parse(css: &str, href: Option<String>) -> Result<Self, CssError> {
        let source_name = href.clone().unwrap_or_else(|| "<style>".to_string());
        let sheet = StyleSheet::parse(css, ParserOptions::default()).map_err(|e| CssError::Parse {
            source_name: source_name.clone(),
            message: e.to_string(),
        })?;

        let mut rules = Vec::new();
        for rule in sheet.rules.0.iter() {
            let CssRule::Style(style) = rule else {
                continue;
            };
            let selector_text = style
                .selectors
                .to_css_string(PrinterOptions::default())
                .map_err(|e| CssError::Parse {
                    source_name: source_name.clone(),
                    message: e.to_string(),
                })?;
            let selectors = selector_text.split(',').filter_map(|s| Selector::parse(s.trim())).collect();

            let block = &style.declarations;
            let mut declarations = Vec::new();
            for property in block.declarations.iter().chain(block.important_declarations.iter()) {
                let Ok(value) = property.value_to_css_string(PrinterOptions::default()) else {
                    continue;
                };
                declarations.push(Declaration {
                    property: property.property_id().name().to_string(),
                    value,
                });
            }
            rules.push(Rule {
                selector_text,
                selectors,
                declarations,
            });
        }
        tracing::trace!(sheet = %source_name, rules = rules.len(), "parsed stylesheet");
        Ok(Self { href, rules })
    }
}

/// Resolve `property` for `element` across `sheets` in load order
pub fn computed_value(sheets: &[Stylesheet], element: &ElementInfo, property: &str) -> Option<String> {
    let mut value = None;
    for rule in sheets.iter().flat_map(|s| s.rules.iter()) {
        if !rule.selectors.iter().any(|s| s.matches(element)) {
            continue;
        }
        for declaration in &rule.declarations {
            if declaration.property == property {
                value = Some(declaration.value.clone());
            }
        }
    }
    value
}

/// Every property that resolves for `element`, in first-seen order
pub fn computed_style(sheets: &[Stylesheet], element: &ElementInfo) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for rule in sheets.iter().flat_map(|s| s.rules.iter()) {
        if !rule.selectors.iter().any(|s| s.matches(element)) {
            continue;
        }
        for declaration in &rule.declarations {
            match out.iter_mut().find(|(p, _)| *p == declaration.property) {
                Some(entry) => entry.1 = declaration.value.clone(),
                None => out.push((declaration.property.clone(), declaration.value.clone())),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(tag: &str, id: Option<&str>, classes: &[&str]) -> ElementInfo {
        ElementInfo {
            tag: tag.to_string(),
            id: id.map(str::to_string),
            classes: classes.iter().map(|c| c.to_string()).collect(),
            is_root: tag == "html",
        }
    }

    #[test]
    fn test_selector_parts() {
        let selector = Selector::parse("div.a#b").unwrap();
        assert_eq!(
            selector.parts,
            vec![
                SelectorPart::Type("div".to_string()),
                SelectorPart::Class("a".to_string()),
                SelectorPart::Id("b".to_string())
            ]
        );
        assert!(selector.matches(&element("DIV", Some("b"), &["a", "c"])));
        assert!(!selector.matches(&element("div", Some("b"), &["c"])));
        assert!(Selector::parse("a[href]").is_none());
    }

    #[test]
    fn test_descendant_matches_last_compound() {
        let selector = Selector::parse("body .item").unwrap();
        assert!(selector.matches(&element("span", None, &["item"])));
    }

    #[test]
    fn test_last_declaration_wins() {
        let a = Stylesheet::parse(".x { display: none; } :root { width: 10px; }", None).unwrap();
        let b = Stylesheet::parse("div.x { display: block; }", Some("b.css".to_string())).unwrap();
        let sheets = vec![a, b];
        let div = element("div", None, &["x"]);
        assert_eq!(computed_value(&sheets, &div, "display").as_deref(), Some("block"));
        assert_eq!(computed_value(&sheets, &element("span", None, &["x"]), "display").as_deref(), Some("none"));
        assert_eq!(computed_value(&sheets, &element("html", None, &[]), "width").as_deref(), Some("10px"));
        assert_eq!(computed_value(&sheets, &element("p", None, &[]), "display"), None);
    }
}
