//! Hybrid retrieval: vector seeds, exponential graph expansion, scoring,
//! and the context renderers fed to the LLM.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;

use crate::graph::GraphStore;
use crate::index::VectorIndex;
use crate::telemetry;
use crate::types::{CodeNode, RetrievalResult};

const SEED_COUNT: usize = 200;
const MAX_HOPS: u32 = 3;
const DECAY_ALPHA: f64 = 0.5;
const VISITED_FACTOR: f64 = 2.5;
const TOPOLOGY_BYTE_LIMIT: usize = 250_000;

pub struct RetrievalEngine<'a> {
    index: &'a VectorIndex,
    graph: &'a GraphStore,
}

impl<'a> RetrievalEngine<'a> {
    pub fn new(index: &'a VectorIndex, graph: &'a GraphStore) -> Self {
        Self { index, graph }
    }

    /// Seed search, graph expansion, multi-dimensional scoring. Results are
    /// sorted by final score and truncated to `max_nodes`.
    pub fn retrieve(
        &self,
        query_embedding: &[f32],
        max_nodes: usize,
        use_graph: bool,
    ) -> Vec<RetrievalResult> {
        let started = Instant::now();

        let seeds = self.index.search(query_embedding, SEED_COUNT);
        let mut results = if use_graph {
            self.expand(seeds, max_nodes)
        } else {
            seeds
                .into_iter()
                .map(|(node, score)| RetrievalResult {
                    node,
                    graph_score: score as f64,
                    final_score: 0.0,
                    distance: 0,
                })
                .collect()
        };

        for result in &mut results {
            let structural = result.node.structural_weight();
            result.final_score = result.graph_score * (0.8 + 0.2 * structural);
        }

        results.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(max_nodes);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        telemetry::store_ms(&telemetry::VECTOR_LATENCY_MS, elapsed_ms);
        tracing::info!(
            candidates = results.len(),
            elapsed_ms,
            "retrieval pipeline complete"
        );

        results
    }

    /// BFS over dependency edges with exponential score decay:
    /// `score = base · e^(−α·distance)`, capped at three hops and
    /// `max_nodes · 2.5` visited nodes.
    fn expand(
        &self,
        seeds: Vec<(Arc<CodeNode>, f32)>,
        max_nodes: usize,
    ) -> Vec<RetrievalResult> {
        let visit_cap = (max_nodes as f64 * VISITED_FACTOR) as usize;
        let mut visited: HashMap<String, RetrievalResult> = HashMap::new();
        let mut queue: VecDeque<(Arc<CodeNode>, u32, f64)> = VecDeque::new();

        for (node, score) in seeds {
            if !visited.contains_key(&node.id) {
                visited.insert(
                    node.id.clone(),
                    RetrievalResult {
                        node: Arc::clone(&node),
                        graph_score: score as f64,
                        final_score: 0.0,
                        distance: 0,
                    },
                );
                queue.push_back((node, 0, score as f64));
            }
        }

        let mut scanned = visited.len() as u64;

        while let Some((current, distance, base_score)) = queue.pop_front() {
            if visited.len() >= visit_cap {
                break;
            }
            if distance >= MAX_HOPS {
                continue;
            }

            for dep in &current.dependencies {
                scanned += 1;
                let Some(candidate) = self.graph.resolve(dep) else {
                    continue;
                };
                if visited.contains_key(&candidate.id) {
                    continue;
                }
                let new_distance = distance + 1;
                let new_score = base_score * (-DECAY_ALPHA * new_distance as f64).exp();
                visited.insert(
                    candidate.id.clone(),
                    RetrievalResult {
                        node: Arc::clone(&candidate),
                        graph_score: new_score,
                        final_score: 0.0,
                        distance: new_distance,
                    },
                );
                queue.push_back((candidate, new_distance, new_score));
            }
        }

        telemetry::GRAPH_NODES_SCANNED.store(scanned, Ordering::Relaxed);
        visited.into_values().collect()
    }
}

/// Flat context: one framed block per file, highest-scored node first,
/// bounded by `max_chars`.
pub fn build_hierarchical_context(candidates: &[RetrievalResult], max_chars: usize) -> String {
    let rule = "-".repeat(50);
    let mut context = String::new();
    let mut included_files: std::collections::HashSet<&str> = std::collections::HashSet::new();

    for candidate in candidates {
        let node = candidate.node.as_ref();
        if included_files.contains(node.file_path.as_str()) {
            continue;
        }

        let entry = format!(
            "\n\n# FILE: {} | NODE: {} (Type: {})\n{rule}\n{}\n{rule}\n",
            node.file_path, node.name, node.kind, node.content
        );
        if context.len() + entry.len() > max_chars {
            break;
        }
        included_files.insert(node.file_path.as_str());
        context.push_str(&entry);
    }

    context
}

fn signature_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(def|class|async def|export|function|void|int|auto|struct|interface)\s+[A-Za-z0-9_]+",
        )
        .expect("signature regex is valid")
    })
}

/// Just the declaration lines of a body, for the T-Map structure tier.
fn extract_signatures(code: &str) -> String {
    let mut signatures = String::new();
    for line in code.lines() {
        if signature_line_regex().is_match(line) {
            signatures.push_str("    ");
            signatures.push_str(line.trim_end());
            signatures.push_str(" ...\n");
        }
    }
    if signatures.is_empty() {
        "    (Utility/Script Logic)".to_string()
    } else {
        signatures
    }
}

/// Three-tier topology map: full bodies for the top 3 candidates,
/// signatures and summaries for the next 12, one connectivity line for the
/// rest. Hard-stops at 250 KB.
pub fn build_topology_map(candidates: &[RetrievalResult]) -> String {
    let mut topo = String::from("### PROJECT ARCHITECTURAL TOPOLOGY (T-MAP)\n");

    for (rank, candidate) in candidates.iter().enumerate() {
        let node = candidate.node.as_ref();
        if rank < 3 {
            topo.push_str(&format!(
                "[TIER: IMPLEMENTATION] FILE: {} | NODE: {}\n{}\n---\n",
                node.file_path, node.name, node.content
            ));
        } else if rank < 15 {
            topo.push_str(&format!(
                "[TIER: STRUCTURE] FILE: {} | NODE: {} (Type: {})\n  AI_SUMMARY: {}\n  SIGNATURES:\n{}\n",
                node.file_path,
                node.name,
                node.kind,
                node.ai_summary,
                extract_signatures(&node.content)
            ));
        } else {
            topo.push_str(&format!(
                "[TIER: TOPOLOGY] {} -> {} (Ref: {} deps)\n",
                node.file_path,
                node.name,
                node.dependencies.len()
            ));
        }

        if topo.len() > TOPOLOGY_BYTE_LIMIT {
            break;
        }
    }

    topo
}

/// Sort order helper for handler responses: id, name, path, kind, score.
pub fn candidate_summary(result: &RetrievalResult) -> serde_json::Value {
    serde_json::json!({
        "id": result.node.id,
        "name": result.node.name,
        "file_path": result.node.file_path,
        "type": result.node.kind,
        "score": result.final_score,
        "ai_summary": result.node.ai_summary,
    })
}
