//! Tree-sitter tier: syntax validation and AST-based symbol extraction.
//!
//! Grammars cover the extensions the service indexes most: C/C++ headers
//! and sources, Python, TypeScript and JavaScript. Unknown extensions pass
//! validation (there is nothing to validate against) and extract nothing.

use std::path::Path;

use tree_sitter::{Node, Parser};

use crate::types::{CodeNode, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    Cpp,
    Python,
    TypeScript,
    JavaScript,
}

impl Grammar {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.') {
            "cpp" | "hpp" | "h" | "cc" | "cxx" => Some(Grammar::Cpp),
            "py" => Some(Grammar::Python),
            "ts" | "tsx" => Some(Grammar::TypeScript),
            "js" | "jsx" | "mjs" => Some(Grammar::JavaScript),
            _ => None,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_str()?;
        Self::from_extension(ext)
    }

    fn language(&self) -> tree_sitter::Language {
        match self {
            Grammar::Cpp => tree_sitter_cpp::LANGUAGE.into(),
            Grammar::Python => tree_sitter_python::LANGUAGE.into(),
            Grammar::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Grammar::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
        }
    }
}

fn parse_with(grammar: Grammar, content: &str) -> Option<tree_sitter::Tree> {
    let mut parser = Parser::new();
    parser.set_language(&grammar.language()).ok()?;
    parser.parse(content, None)
}

/// True iff the content parses without error nodes under the grammar for
/// `extension`. Extensions without a grammar validate trivially.
pub fn validate_syntax(content: &str, extension: &str) -> bool {
    let Some(grammar) = Grammar::from_extension(extension) else {
        return true;
    };
    match parse_with(grammar, content) {
        Some(tree) => !tree.root_node().has_error(),
        None => false,
    }
}

const SYMBOL_KINDS: &[(&str, NodeKind)] = &[
    ("function_definition", NodeKind::Function),
    ("function_declaration", NodeKind::Function),
    ("function_item", NodeKind::Function),
    ("class_specifier", NodeKind::Class),
    ("class_definition", NodeKind::Class),
    ("class_declaration", NodeKind::Class),
    ("method_definition", NodeKind::Method),
];

/// Walk the syntax tree and emit one node per function/class/method
/// definition, taking the identifier (or type identifier) child as the name.
pub fn extract_symbols(path: &str, content: &str) -> Vec<CodeNode> {
    let Some(grammar) = Grammar::from_path(path) else {
        return Vec::new();
    };
    let Some(tree) = parse_with(grammar, content) else {
        return Vec::new();
    };

    let mut symbols = Vec::new();
    walk(tree.root_node(), path, content, &mut symbols);
    symbols
}

fn walk(node: Node, path: &str, content: &str, out: &mut Vec<CodeNode>) {
    if let Some(kind) = symbol_kind(node.kind()) {
        if let Some(name) = symbol_name(node, content) {
            let body = node.utf8_text(content.as_bytes()).unwrap_or_default();
            out.push(CodeNode::symbol(path, name, kind, body));
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(child, path, content, out);
    }
}

fn symbol_kind(ts_kind: &str) -> Option<NodeKind> {
    SYMBOL_KINDS
        .iter()
        .find(|(k, _)| *k == ts_kind)
        .map(|(_, kind)| *kind)
}

/// The `name` field when the grammar exposes one, otherwise the first
/// identifier-like descendant (C++ buries function names in declarators).
fn symbol_name(node: Node, content: &str) -> Option<String> {
    if let Some(name_node) = node.child_by_field_name("name") {
        return name_node
            .utf8_text(content.as_bytes())
            .ok()
            .map(str::to_string);
    }
    find_identifier(node, content, 0)
}

fn find_identifier(node: Node, content: &str, depth: u8) -> Option<String> {
    if depth > 3 {
        return None;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "identifier" | "type_identifier" | "property_identifier" | "field_identifier" => {
                return child
                    .utf8_text(content.as_bytes())
                    .ok()
                    .map(str::to_string);
            }
            _ => {}
        }
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(name) = find_identifier(child, content, depth + 1) {
            return Some(name);
        }
    }
    None
}
