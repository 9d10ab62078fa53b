//! Dependency graph over code nodes.
//!
//! Nodes live in a single arena keyed by id; dependency edges stay
//! unresolved strings and resolve by lookup, so there are no ownership
//! cycles to manage.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::types::CodeNode;

pub struct GraphStore {
    by_id: HashMap<String, Arc<CodeNode>>,
    by_name: HashMap<String, Arc<CodeNode>>,
    /// File nodes keyed by file stem (`utils` for `src/utils.ts`), the
    /// fuzzy fallback for import-style dependency names.
    by_stem: HashMap<String, Arc<CodeNode>>,
    insertion_order: Vec<Arc<CodeNode>>,
}

fn stem_of(path: &str) -> Option<String> {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
}

impl GraphStore {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            by_stem: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = Arc<CodeNode>>) -> Self {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node);
        }
        graph
    }

    pub fn add_node(&mut self, node: Arc<CodeNode>) {
        self.by_id.insert(node.id.clone(), Arc::clone(&node));
        self.by_name.insert(node.name.clone(), Arc::clone(&node));
        if node.kind == crate::types::NodeKind::File {
            if let Some(stem) = stem_of(&node.file_path) {
                self.by_stem.insert(stem, Arc::clone(&node));
            }
        }
        self.insertion_order.push(node);
    }

    pub fn get(&self, id: &str) -> Option<Arc<CodeNode>> {
        self.by_id.get(id).cloned()
    }

    /// Resolve a dependency name: exact id, exact symbol name, then the
    /// fuzzy path-stem fallback (`utils.ts` → file node with stem `utils`).
    pub fn resolve(&self, dependency: &str) -> Option<Arc<CodeNode>> {
        if let Some(node) = self.by_id.get(dependency) {
            return Some(Arc::clone(node));
        }
        if let Some(node) = self.by_name.get(dependency) {
            return Some(Arc::clone(node));
        }
        let stem = stem_of(dependency)?;
        self.by_stem.get(&stem).cloned()
    }

    pub fn all_nodes(&self) -> &[Arc<CodeNode>] {
        &self.insertion_order
    }

    pub fn len(&self) -> usize {
        self.insertion_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertion_order.is_empty()
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Recompute structural weights across a node set before indexing.
///
/// Each incoming dependency reference raises a node's weight:
/// `structural = 0.3 + 0.7 · (incoming / max_incoming)`, clamped to
/// `[0.3, 1.0]`. Dependency names are matched against node names, node ids,
/// and file stems, the same resolution retrieval uses.
pub fn calculate_static_weights(nodes: &mut [CodeNode]) {
    let mut target_index: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, node) in nodes.iter().enumerate() {
        let mut keys = vec![node.name.clone(), node.id.clone()];
        if let Some(stem) = stem_of(&node.file_path) {
            keys.push(stem);
        }
        keys.dedup();
        for key in keys {
            let targets = target_index.entry(key).or_default();
            if targets.last() != Some(&idx) {
                targets.push(idx);
            }
        }
    }

    let mut incoming = vec![0usize; nodes.len()];
    for (source_idx, node) in nodes.iter().enumerate() {
        for dep in &node.dependencies {
            let targets = target_index
                .get(dep)
                .or_else(|| stem_of(dep).and_then(|s| target_index.get(&s)));
            if let Some(targets) = targets {
                for &target_idx in targets {
                    if target_idx != source_idx {
                        incoming[target_idx] += 1;
                    }
                }
            }
        }
    }

    let max_incoming = incoming.iter().copied().max().unwrap_or(0);
    for (node, count) in nodes.iter_mut().zip(&incoming) {
        let weight = if max_incoming == 0 {
            0.3
        } else {
            (0.3 + 0.7 * (*count as f64 / max_incoming as f64)).clamp(0.3, 1.0)
        };
        node.weights.insert("structural".to_string(), weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeKind;

    fn file_node(path: &str) -> CodeNode {
        let name = Path::new(path)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        CodeNode::file(path, name, "")
    }

    #[test]
    fn resolve_by_exact_name() {
        let mut graph = GraphStore::new();
        graph.add_node(Arc::new(CodeNode::symbol(
            "src/a.ts",
            "bar",
            NodeKind::CodeBlock,
            "",
        )));

        assert!(graph.resolve("bar").is_some());
        assert!(graph.resolve("src/a.ts::bar").is_some());
        assert!(graph.resolve("baz").is_none());
    }

    #[test]
    fn resolve_falls_back_to_file_stem() {
        let mut graph = GraphStore::new();
        graph.add_node(Arc::new(file_node("src/utils.ts")));

        // Import captured as "utils.ts" resolves to the file node.
        let hit = graph.resolve("utils.ts").unwrap();
        assert_eq!(hit.file_path, "src/utils.ts");
        // And so does the bare stem.
        assert!(graph.resolve("utils").is_some());
    }

    #[test]
    fn weights_scale_with_incoming_references() {
        let mut nodes = vec![
            file_node("src/a.ts"),
            file_node("src/b.ts"),
            file_node("src/c.ts"),
        ];
        // a and b both depend on c; nothing depends on a or b.
        nodes[0].dependencies.insert("c.ts".into());
        nodes[1].dependencies.insert("c.ts".into());

        calculate_static_weights(&mut nodes);

        let c_weight = nodes[2].structural_weight();
        let a_weight = nodes[0].structural_weight();
        assert!((c_weight - 1.0).abs() < 1e-9);
        assert!((a_weight - 0.3).abs() < 1e-9);
    }

    #[test]
    fn weights_default_when_no_references() {
        let mut nodes = vec![file_node("src/a.ts"), file_node("src/b.ts")];
        calculate_static_weights(&mut nodes);
        for node in &nodes {
            assert!((node.structural_weight() - 0.3).abs() < 1e-9);
        }
    }

    #[test]
    fn weights_stay_clamped() {
        let mut nodes = vec![file_node("src/hub.ts"), file_node("src/a.ts")];
        nodes[1].dependencies.insert("hub.ts".into());
        calculate_static_weights(&mut nodes);
        for node in &nodes {
            let w = node.structural_weight();
            assert!((0.3..=1.0).contains(&w));
        }
    }

    #[test]
    fn self_references_do_not_count() {
        let mut nodes = vec![file_node("src/a.ts")];
        nodes[0].dependencies.insert("a.ts".into());
        calculate_static_weights(&mut nodes);
        assert!((nodes[0].structural_weight() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn graph_preserves_insertion_order() {
        let mut graph = GraphStore::new();
        graph.add_node(Arc::new(file_node("a.ts")));
        graph.add_node(Arc::new(file_node("b.ts")));
        let order: Vec<&str> = graph.all_nodes().iter().map(|n| n.file_path.as_str()).collect();
        assert_eq!(order, vec!["a.ts", "b.ts"]);
    }
}
