//! HNSW vector index over code nodes, with id↔node bimaps and disk
//! persistence.
//!
//! Scores are inner products, which equal cosine similarity because every
//! vector is L2-normalized on ingest. Persistence writes the full node
//! metadata as JSON plus a flat binary vector file; loading rebuilds the
//! HNSW graph from those vectors in insertion order.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use hnsw_rs::prelude::*;

use crate::error::{SynapseError, SynapseResult};
use crate::types::{CodeNode, EMBEDDING_DIM};

const HNSW_M: usize = 32;
const HNSW_EF_CONSTRUCTION: usize = 40;
const HNSW_EF_SEARCH: usize = 16;
const HNSW_MAX_ELEMENTS: usize = 100_000;
const HNSW_MAX_LAYER: usize = 16;

pub const METADATA_FILE: &str = "metadata.json";
pub const INDEX_FILE: &str = "index.bin";

/// Scale a vector to unit L2 norm in place. Zero vectors are left alone.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

pub struct VectorIndex {
    hnsw: Hnsw<'static, f32, DistDot>,
    /// Owned vector storage; the index holds references into it. Safe
    /// because entries are never removed or mutated after insertion.
    vectors: Vec<Vec<f32>>,
    nodes: Vec<Arc<CodeNode>>,
    id_to_node: HashMap<usize, Arc<CodeNode>>,
    name_to_id: HashMap<String, usize>,
    dimension: usize,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            hnsw: Hnsw::new(
                HNSW_M,
                HNSW_MAX_ELEMENTS,
                HNSW_MAX_LAYER,
                HNSW_EF_CONSTRUCTION,
                DistDot,
            ),
            vectors: Vec::new(),
            nodes: Vec::new(),
            id_to_node: HashMap::new(),
            name_to_id: HashMap::new(),
            dimension,
        }
    }

    pub fn with_default_dimension() -> Self {
        Self::new(EMBEDDING_DIM)
    }

    /// Index every node carrying an embedding. Embeddings are L2-normalized
    /// in place; internal ids are assigned sequentially in insertion order.
    /// Returns all input nodes (indexed or not) as shared handles so the
    /// caller can build the dependency graph over the same allocation.
    pub fn add_nodes(&mut self, nodes: Vec<CodeNode>) -> Vec<Arc<CodeNode>> {
        let mut all = Vec::with_capacity(nodes.len());

        for mut node in nodes {
            if !node.embedding.is_empty() {
                l2_normalize(&mut node.embedding);
                let node = Arc::new(node);
                let internal_id = self.nodes.len();

                self.vectors.push(node.embedding.clone());
                let vec_ref: &'static [f32] = unsafe {
                    std::slice::from_raw_parts(
                        self.vectors[internal_id].as_ptr(),
                        self.vectors[internal_id].len(),
                    )
                };
                self.hnsw.insert((vec_ref, internal_id));

                self.nodes.push(Arc::clone(&node));
                self.id_to_node.insert(internal_id, Arc::clone(&node));
                self.name_to_id.insert(node.id.clone(), internal_id);
                all.push(node);
            } else {
                all.push(Arc::new(node));
            }
        }

        tracing::info!(total = self.nodes.len(), "vector index updated");
        all
    }

    /// Top-k nearest nodes by cosine similarity. Empty index returns `[]`.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(Arc<CodeNode>, f32)> {
        if self.nodes.is_empty() || query.is_empty() {
            return Vec::new();
        }
        let mut normalized = query.to_vec();
        l2_normalize(&mut normalized);

        self.hnsw
            .search(&normalized, k, HNSW_EF_SEARCH)
            .into_iter()
            .filter_map(|neighbour| {
                self.id_to_node.get(&neighbour.d_id).map(|node| {
                    // DistDot reports 1 − dot; undo to get the similarity.
                    (Arc::clone(node), 1.0 - neighbour.distance)
                })
            })
            .collect()
    }

    pub fn get_by_name(&self, node_id: &str) -> Option<Arc<CodeNode>> {
        let internal = self.name_to_id.get(node_id)?;
        self.id_to_node.get(internal).cloned()
    }

    pub fn all_nodes(&self) -> &[Arc<CodeNode>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Persist metadata (all node fields) and the raw vectors.
    pub fn save(&self, dir: &Path) -> SynapseResult<()> {
        std::fs::create_dir_all(dir)?;

        let metadata: Vec<&CodeNode> = self.nodes.iter().map(|n| n.as_ref()).collect();
        std::fs::write(
            dir.join(METADATA_FILE),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        let mut file = std::fs::File::create(dir.join(INDEX_FILE))?;
        file.write_all(&(self.dimension as u32).to_le_bytes())?;
        file.write_all(&(self.vectors.len() as u64).to_le_bytes())?;
        for vector in &self.vectors {
            for value in vector {
                file.write_all(&value.to_le_bytes())?;
            }
        }

        tracing::info!(nodes = self.nodes.len(), dir = %dir.display(), "vector index persisted");
        Ok(())
    }

    /// Load a persisted index: node metadata from JSON, vectors from the
    /// binary file (falling back to the embeddings embedded in metadata),
    /// HNSW graph rebuilt in insertion order.
    pub fn load(dir: &Path) -> SynapseResult<Self> {
        let meta_path = dir.join(METADATA_FILE);
        if !meta_path.exists() {
            return Err(SynapseError::ConfigMissing(meta_path.display().to_string()));
        }
        let raw = std::fs::read_to_string(&meta_path)?;
        let mut metadata: Vec<CodeNode> = serde_json::from_str(&raw)?;

        let bin_path = dir.join(INDEX_FILE);
        if bin_path.exists() {
            let vectors = read_vectors(&bin_path)?;
            if vectors.len() == metadata.len() {
                for (node, vector) in metadata.iter_mut().zip(vectors) {
                    node.embedding = vector;
                }
            }
        }

        let dimension = metadata
            .iter()
            .find(|n| !n.embedding.is_empty())
            .map(|n| n.embedding.len())
            .unwrap_or(EMBEDDING_DIM);

        let mut index = Self::new(dimension);
        index.add_nodes(metadata);
        tracing::info!(nodes = index.len(), dir = %dir.display(), "vector index loaded");
        Ok(index)
    }
}

fn read_vectors(path: &Path) -> SynapseResult<Vec<Vec<f32>>> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 12];
    file.read_exact(&mut header)?;
    let dimension = u32::from_le_bytes(header[0..4].try_into().expect("4-byte slice")) as usize;
    let count = u64::from_le_bytes(header[4..12].try_into().expect("8-byte slice")) as usize;

    let mut body = Vec::new();
    file.read_to_end(&mut body)?;
    if body.len() != count * dimension * 4 {
        return Err(SynapseError::MalformedResponse(format!(
            "vector file truncated: expected {} bytes, got {}",
            count * dimension * 4,
            body.len()
        )));
    }

    let mut vectors = Vec::with_capacity(count);
    for i in 0..count {
        let mut vector = Vec::with_capacity(dimension);
        for j in 0..dimension {
            let offset = (i * dimension + j) * 4;
            let bytes: [u8; 4] = body[offset..offset + 4].try_into().expect("4-byte slice");
            vector.push(f32::from_le_bytes(bytes));
        }
        vectors.push(vector);
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeKind;

    fn node_with_embedding(id_path: &str, name: &str, embedding: Vec<f32>) -> CodeNode {
        let mut node = CodeNode::symbol(id_path, name, NodeKind::Function, "fn body");
        node.embedding = embedding;
        node
    }

    fn basis(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn indexed_embeddings_are_normalized() {
        let mut index = VectorIndex::new(4);
        let arcs = index.add_nodes(vec![node_with_embedding("a.rs", "f", vec![2.0, 0.0, 0.0, 0.0])]);
        let norm: f32 = arcs[0].embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn empty_embeddings_are_excluded_but_returned() {
        let mut index = VectorIndex::new(4);
        let arcs = index.add_nodes(vec![
            node_with_embedding("a.rs", "f", basis(4, 0)),
            CodeNode::file("b.rs", "b.rs", "content"),
        ]);
        assert_eq!(arcs.len(), 2);
        assert_eq!(index.len(), 1);
        assert!(index.get_by_name("b.rs").is_none());
    }

    #[test]
    fn search_finds_nearest() {
        let mut index = VectorIndex::new(4);
        index.add_nodes(vec![
            node_with_embedding("a.rs", "alpha", basis(4, 0)),
            node_with_embedding("b.rs", "beta", basis(4, 1)),
            node_with_embedding("c.rs", "gamma", basis(4, 2)),
        ]);

        let hits = index.search(&basis(4, 1), 2);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0.name, "beta");
        assert!((hits[0].1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn search_on_empty_index_returns_nothing() {
        let index = VectorIndex::new(4);
        assert!(index.search(&basis(4, 0), 5).is_empty());
    }

    #[test]
    fn bimap_round_trips_ids() {
        let mut index = VectorIndex::new(4);
        index.add_nodes(vec![node_with_embedding("src/a.rs", "f", basis(4, 0))]);
        let node = index.get_by_name("src/a.rs::f").unwrap();
        assert_eq!(node.id, "src/a.rs::f");
    }

    #[test]
    fn save_load_preserves_search_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = VectorIndex::new(4);
        index.add_nodes(vec![
            node_with_embedding("a.rs", "alpha", vec![0.9, 0.1, 0.0, 0.0]),
            node_with_embedding("b.rs", "beta", vec![0.1, 0.9, 0.0, 0.0]),
            node_with_embedding("c.rs", "gamma", vec![0.0, 0.0, 1.0, 0.0]),
        ]);
        index.save(dir.path()).unwrap();

        let loaded = VectorIndex::load(dir.path()).unwrap();
        assert_eq!(loaded.len(), 3);

        let query = basis(4, 0);
        let before: Vec<String> = index.search(&query, 3).iter().map(|(n, _)| n.id.clone()).collect();
        let after: Vec<String> = loaded.search(&query, 3).iter().map(|(n, _)| n.id.clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn loaded_nodes_have_unit_norm() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = VectorIndex::new(4);
        index.add_nodes(vec![node_with_embedding("a.rs", "f", vec![3.0, 4.0, 0.0, 0.0])]);
        index.save(dir.path()).unwrap();

        let loaded = VectorIndex::load(dir.path()).unwrap();
        for node in loaded.all_nodes() {
            let norm: f32 = node.embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn load_missing_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = VectorIndex::load(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, SynapseError::ConfigMissing(_)));
    }
}
