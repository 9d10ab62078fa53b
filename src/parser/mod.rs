//! Symbol extraction from source files.
//!
//! Two tiers: a language-agnostic brace/regex parser that feeds the sync
//! pipeline, and a tree-sitter tier ([`ast`]) used for syntax validation and
//! on-the-fly symbol scans by the agent.

pub mod ast;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::types::{CodeNode, NodeKind};

/// Decode possibly-invalid UTF-8 input; invalid sequences become U+FFFD.
pub fn sanitize_utf8(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Truncate to at most `max_bytes`, never splitting a multibyte sequence.
pub fn utf8_safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn signature_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:function|class|struct|interface|def|void|int|auto|export|const|let|var)\s+([A-Za-z0-9_:]+)",
        )
        .expect("signature regex is valid")
    })
}

/// Pull the module name out of an `import … from "…"` line: the last path
/// segment of the quoted source, extension kept.
fn scan_import(line: &str) -> Option<String> {
    if !line.starts_with("import ") {
        return None;
    }
    let after_from = line.split(" from ").nth(1)?;
    let first_quote = after_from.find(['\'', '"'])?;
    let rest = &after_from[first_quote + 1..];
    let last_quote = rest.find(['\'', '"'])?;
    let path = &rest[..last_quote];

    let module = path.rsplit('/').next().unwrap_or(path);
    if module.is_empty() {
        return None;
    }
    Some(module.to_string())
}

/// Brace-depth streaming parser. Emits one `code_block` node per
/// signature-opened brace group and always a trailing file-level node
/// carrying the whole content.
pub fn extract_nodes_from_file(file_path: &str, content: &str) -> Vec<CodeNode> {
    let mut nodes = Vec::new();
    let mut imports: BTreeSet<String> = BTreeSet::new();

    let mut in_block = false;
    let mut brace_level: i32 = 0;
    let mut buffer = String::new();
    let mut current_name = String::new();

    for raw_line in content.lines() {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let trimmed = line.trim_start();

        if let Some(module) = scan_import(trimmed) {
            imports.insert(module);
        }

        let opens = trimmed.matches('{').count() as i32;
        let closes = trimmed.matches('}').count() as i32;

        if !in_block {
            if opens > 0 {
                if let Some(captures) = signature_regex().captures(trimmed) {
                    in_block = true;
                    current_name = captures[1].to_string();
                    buffer = format!("{line}\n");
                    brace_level = opens - closes;
                    if brace_level <= 0 {
                        // Signature opened and closed on one line.
                        emit_block(&mut nodes, file_path, &current_name, &buffer, &imports);
                        in_block = false;
                        buffer.clear();
                    }
                }
            }
        } else {
            buffer.push_str(line);
            buffer.push('\n');
            brace_level += opens - closes;
            if brace_level <= 0 {
                emit_block(&mut nodes, file_path, &current_name, &buffer, &imports);
                in_block = false;
                buffer.clear();
            }
        }
    }

    let file_name = Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.to_string());
    let mut file_node = CodeNode::file(file_path, file_name, content);
    file_node.dependencies = imports;
    nodes.push(file_node);

    nodes
}

fn emit_block(
    nodes: &mut Vec<CodeNode>,
    file_path: &str,
    name: &str,
    buffer: &str,
    imports: &BTreeSet<String>,
) {
    let mut node = CodeNode::symbol(file_path, name, NodeKind::CodeBlock, buffer);
    node.dependencies = imports.clone();
    nodes.push(node);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_truncate_respects_boundaries() {
        let s = "é".repeat(100); // 2 bytes each
        let out = utf8_safe_truncate(&s, 151);
        assert!(out.len() <= 151);
        assert_eq!(out.len() % 2, 0);

        assert_eq!(utf8_safe_truncate("short", 100), "short");
        assert_eq!(utf8_safe_truncate("abcdef", 3), "abc");
    }

    #[test]
    fn sanitize_replaces_invalid_sequences() {
        let bytes = b"valid \xFF tail";
        let out = sanitize_utf8(bytes);
        assert!(out.contains("valid"));
        assert!(out.contains('\u{FFFD}'));
    }

    #[test]
    fn extracts_function_block() {
        let src = "function greet(name) {\n  return `hi ${name}`;\n}\n";
        let nodes = extract_nodes_from_file("src/app.ts", src);

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "greet");
        assert_eq!(nodes[0].kind, NodeKind::CodeBlock);
        assert_eq!(nodes[0].id, "src/app.ts::greet");
        assert!(nodes[0].content.contains("return"));
    }

    #[test]
    fn file_node_is_always_last() {
        let nodes = extract_nodes_from_file("src/empty.ts", "// nothing here\n");
        assert_eq!(nodes.len(), 1);
        let file = &nodes[0];
        assert_eq!(file.kind, NodeKind::File);
        assert_eq!(file.id, "src/empty.ts");
        assert_eq!(file.name, "empty.ts");
        assert_eq!(file.structural_weight(), 1.0);
    }

    #[test]
    fn nested_braces_close_at_depth_zero() {
        let src = "class Stack {\n  push(x) {\n    this.items.push(x);\n  }\n}\nconst after = {\n};\n";
        let nodes = extract_nodes_from_file("src/stack.js", src);

        let stack = nodes.iter().find(|n| n.name == "Stack").unwrap();
        assert!(stack.content.contains("items.push"));
        assert!(nodes.iter().any(|n| n.name == "after"));
    }

    #[test]
    fn imports_become_dependencies() {
        let src = "import { bar } from \"./lib/utils.ts\";\nimport z from 'zod';\n\nfunction foo() {\n  return bar();\n}\n";
        let nodes = extract_nodes_from_file("src/a.ts", src);

        let foo = nodes.iter().find(|n| n.name == "foo").unwrap();
        assert!(foo.dependencies.contains("utils.ts"));
        assert!(foo.dependencies.contains("zod"));

        let file = nodes.last().unwrap();
        assert!(file.dependencies.contains("utils.ts"));
    }

    #[test]
    fn import_without_from_is_ignored() {
        assert_eq!(scan_import("import './side-effect';"), None);
        assert_eq!(scan_import("import { a } from \"mod\""), Some("mod".into()));
        assert_eq!(scan_import("const x = 1;"), None);
    }

    #[test]
    fn one_line_block_is_captured() {
        let src = "export const config = { mode: \"fast\" };\n";
        let nodes = extract_nodes_from_file("src/config.ts", src);
        assert!(nodes.iter().any(|n| n.name == "config"));
    }

    #[test]
    fn python_file_yields_only_file_node() {
        // No braces to track; the file node still carries the content.
        let src = "def run():\n    pass\n";
        let nodes = extract_nodes_from_file("tool.py", src);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, NodeKind::File);
    }
}
