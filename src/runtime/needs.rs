//! Need-set analysis for lazily computed module scope bindings
//!
//! `__STATS__` and `__STATS_I__` are expensive to build (they serialize the
//! last compilation's stats), so a module only receives them when it
//! actually references them as free identifiers. The analysis uses OXC's
//! semantic pass and falls back to a lexical scan when the file does not
//! parse.

use oxc_allocator::Allocator;
use oxc_ast::AstKind;
use oxc_parser::{ParseOptions, Parser};
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;

/// Scope bindings that are only materialised on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyBinding {
    Stats,
    StatsIndex,
}

impl LazyBinding {
    pub const ALL: [LazyBinding; 2] = [LazyBinding::Stats, LazyBinding::StatsIndex];

    pub fn name(self) -> &'static str {
        match self {
            LazyBinding::Stats => "__STATS__",
            LazyBinding::StatsIndex => "__STATS_I__",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }
}

/// Byte offsets of the `import` keyword of every `import(...)` expression
/// in an ES module, in source order. Empty when the module does not parse.
pub fn dynamic_import_offsets(source: &str) -> Vec<usize> {
    if !source.contains("import") {
        return Vec::new();
    }
    let allocator = Allocator::default();
    let parser_return = Parser::new(&allocator, source, SourceType::mjs()).parse();
    if parser_return.panicked || !parser_return.errors.is_empty() {
        return Vec::new();
    }
    let semantic_ret = SemanticBuilder::new().build(&parser_return.program);
    let mut offsets: Vec<usize> = semantic_ret
        .semantic
        .nodes()
        .iter()
        .filter_map(|node| match node.kind() {
            AstKind::ImportExpression(expression) => Some(expression.span.start as usize),
            _ => None,
        })
        .filter(|&start| source.get(start..).is_some_and(|rest| rest.starts_with("import")))
        .collect();
    offsets.sort_unstable();
    offsets
}

/// Which lazy bindings a module body references
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeedSet {
    stats: bool,
    stats_index: bool,
}

impl NeedSet {
    /// Analyse a module body. `module` selects ESM parsing.
    pub fn analyze(source: &str, module: bool) -> Self {
        if !source.contains("__STATS") {
            return Self::default();
        }
        match Self::from_semantics(source, module) {
            Some(needs) => needs,
            None => {
                tracing::trace!("need-set: falling back to lexical scan");
                Self::from_tokens(source)
            }
        }
    }

    pub fn contains(&self, binding: LazyBinding) -> bool {
        match binding {
            LazyBinding::Stats => self.stats,
            LazyBinding::StatsIndex => self.stats_index,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.stats && !self.stats_index
    }

    fn mark(&mut self, name: &str) {
        match LazyBinding::from_name(name) {
            Some(LazyBinding::Stats) => self.stats = true,
            Some(LazyBinding::StatsIndex) => self.stats_index = true,
            None => {}
        }
    }

    fn from_semantics(source: &str, module: bool) -> Option<Self> {
        let allocator = Allocator::default();
        let source_type = if module { SourceType::mjs() } else { SourceType::cjs() };
        let options = ParseOptions {
            allow_return_outside_function: true,
            ..ParseOptions::default()
        };
        let parser_return = Parser::new(&allocator, source, source_type)
            .with_options(options)
            .parse();
        if parser_return.panicked || !parser_return.errors.is_empty() {
            return None;
        }

        let semantic_ret = SemanticBuilder::new().build(&parser_return.program);
        let scoping = semantic_ret.semantic.into_scoping();
        let mut needs = Self::default();
        for name in scoping.root_unresolved_references().keys() {
            needs.mark(&name.to_string());
        }
        Some(needs)
    }

    /// Identifier tokens outside comments and string literals that are not
    /// property accesses
    fn from_tokens(source: &str) -> Self {
        let mut needs = Self::default();
        let bytes = source.as_bytes();
        let mut i = 0;
        let mut prev_significant = b' ';

        while i < bytes.len() {
            let c = bytes[i];
            match c {
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    i += 2;
                    while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                        i += 1;
                    }
                    i += 2;
                }
                b'"' | b'\'' | b'`' => {
                    i += 1;
                    while i < bytes.len() && bytes[i] != c {
                        if bytes[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                    i += 1;
                    prev_significant = c;
                }
                c if is_ident_start(c) => {
                    let start = i;
                    while i < bytes.len() && is_ident_part(bytes[i]) {
                        i += 1;
                    }
                    if prev_significant != b'.' {
                        needs.mark(&source[start..i]);
                    }
                    prev_significant = b'a';
                }
                c if c.is_ascii_whitespace() => i += 1,
                c => {
                    prev_significant = c;
                    i += 1;
                }
            }
        }
        needs
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$'
}

fn is_ident_part(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_import_offsets() {
        let src = "import * as a from './a.mjs';\nimport.meta.url;\nexport default import('./a.mjs').then(() => import ('./b.mjs'));";
        let offsets = dynamic_import_offsets(src);
        assert_eq!(offsets.len(), 2);
        assert!(offsets.iter().all(|&o| src[o..].starts_with("import")));
        assert!(src[offsets[0]..].starts_with("import('./a.mjs')"));
        assert!(src[offsets[1]..].starts_with("import ('./b.mjs')"));
        assert!(dynamic_import_offsets("export const x = 'import(1)';").is_empty());
    }

    #[test]
    fn test_no_mention_is_empty() {
        assert!(NeedSet::analyze("module.exports = 1;", false).is_empty());
    }

    #[test]
    fn test_free_reference_is_needed() {
        let needs = NeedSet::analyze("it('x', () => expect(__STATS__.hash).toBeDefined());", false);
        assert!(needs.contains(LazyBinding::Stats));
        assert!(!needs.contains(LazyBinding::StatsIndex));
    }

    #[test]
    fn test_comment_and_string_do_not_count() {
        let src = "// __STATS__\nconst s = \"__STATS_I__\";\nmodule.exports = s;";
        assert!(NeedSet::analyze(src, false).is_empty());
    }

    #[test]
    fn test_local_declaration_shadows() {
        let src = "var __STATS__ = {}; module.exports = __STATS__;";
        assert!(!NeedSet::analyze(src, false).contains(LazyBinding::Stats));
    }

    #[test]
    fn test_top_level_return_parses() {
        let src = "if (__STATS_I__ > 0) return; module.exports = 1;";
        assert!(NeedSet::analyze(src, false).contains(LazyBinding::StatsIndex));
    }

    #[test]
    fn test_lexical_fallback_on_syntax_error() {
        let src = "const = ; obj.__STATS__; __STATS_I__";
        let needs = NeedSet::analyze(src, false);
        assert!(!needs.contains(LazyBinding::Stats));
        assert!(needs.contains(LazyBinding::StatsIndex));
    }

    #[test]
    fn test_module_source() {
        let src = "export default __STATS__;";
        assert!(NeedSet::analyze(src, true).contains(LazyBinding::Stats));
    }
}
