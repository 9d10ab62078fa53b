use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Embedding dimension produced by the remote embedding model.
pub const EMBEDDING_DIM: usize = 768;

// ─── Code Nodes ──────────────────────────────────────────────────────────────

/// Kind of syntactic unit a [`CodeNode`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Function,
    Class,
    CodeBlock,
    Method,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::File => write!(f, "file"),
            NodeKind::Function => write!(f, "function"),
            NodeKind::Class => write!(f, "class"),
            NodeKind::CodeBlock => write!(f, "code_block"),
            NodeKind::Method => write!(f, "method"),
        }
    }
}

/// A syntactic unit of the indexed repository: a whole file, a function, a
/// class, or a brace-delimited block.
///
/// `id` is stable across syncs: `<relative_path>` for file nodes,
/// `<relative_path>::<symbol>` for symbols. `dependencies` are unresolved
/// names; resolution is a lookup in the graph store, never a pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub file_path: String,
    pub content: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    #[serde(default)]
    pub ai_summary: String,
    #[serde(default = "default_quality")]
    pub ai_quality_score: f64,
}

fn default_quality() -> f64 {
    0.5
}

impl CodeNode {
    pub fn file(file_path: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        let file_path = file_path.into();
        Self {
            id: file_path.clone(),
            name: name.into(),
            kind: NodeKind::File,
            file_path,
            content: content.into(),
            dependencies: BTreeSet::new(),
            embedding: Vec::new(),
            weights: HashMap::from([("structural".to_string(), 1.0)]),
            ai_summary: String::new(),
            ai_quality_score: 0.5,
        }
    }

    pub fn symbol(
        file_path: impl Into<String>,
        name: impl Into<String>,
        kind: NodeKind,
        content: impl Into<String>,
    ) -> Self {
        let file_path = file_path.into();
        let name = name.into();
        Self {
            id: format!("{file_path}::{name}"),
            name,
            kind,
            file_path,
            content: content.into(),
            dependencies: BTreeSet::new(),
            embedding: Vec::new(),
            weights: HashMap::from([("structural".to_string(), 0.7)]),
            ai_summary: String::new(),
            ai_quality_score: 0.5,
        }
    }

    /// Structural weight, defaulting to 0.5 for unweighted nodes.
    pub fn structural_weight(&self) -> f64 {
        self.weights.get("structural").copied().unwrap_or(0.5)
    }
}

// ─── Retrieval ───────────────────────────────────────────────────────────────

/// One scored candidate out of the retrieval pipeline.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub node: Arc<CodeNode>,
    /// Vector score at distance 0, decayed by `e^(-α·distance)` beyond.
    pub graph_score: f64,
    /// `graph_score · (0.8 + 0.2 · structural_weight)`.
    pub final_score: f64,
    /// Dependency hops from the nearest seed.
    pub distance: u32,
}

// ─── Agent protocol ──────────────────────────────────────────────────────────

/// Action extracted from one LLM turn.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    ToolCall {
        name: String,
        params: serde_json::Value,
    },
    Final {
        answer: String,
    },
    Invalid,
}

/// Phase tag of a streamed agent event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentPhase {
    Startup,
    Thought,
    ToolExec,
    AstScan,
    Final,
    Error,
}

impl std::fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentPhase::Startup => write!(f, "STARTUP"),
            AgentPhase::Thought => write!(f, "THOUGHT"),
            AgentPhase::ToolExec => write!(f, "TOOL_EXEC"),
            AgentPhase::AstScan => write!(f, "AST_SCAN"),
            AgentPhase::Final => write!(f, "FINAL"),
            AgentPhase::Error => write!(f, "ERROR"),
        }
    }
}

/// Event streamed to the mission caller and mirrored into the trace buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub phase: AgentPhase,
    pub payload: String,
}

impl AgentEvent {
    pub fn new(phase: AgentPhase, payload: impl Into<String>) -> Self {
        Self {
            phase,
            payload: payload.into(),
        }
    }
}

// ─── LLM generation ──────────────────────────────────────────────────────────

/// Outcome of one text-generation call, token accounting included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub success: bool,
}

impl GenerationResult {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            text: reason.into(),
            success: false,
            ..Default::default()
        }
    }
}

// ─── Mission logging ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionKind {
    Agent,
    Ghost,
}

/// One completed mission: query in, answer out, with aggregate accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionRecord {
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub kind: MissionKind,
    pub user_query: String,
    pub full_prompt: String,
    pub ai_response: String,
    pub duration_ms: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Ids of the retrieval candidates that backed this mission, when a
    /// vector search ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_snapshot: Option<Vec<String>>,
}

/// One phase transition inside a mission, kept in the trace ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: String,
    pub detail: String,
    pub duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_schemes() {
        let file = CodeNode::file("src/app.ts", "app.ts", "export const x = 1;");
        assert_eq!(file.id, "src/app.ts");
        assert_eq!(file.kind, NodeKind::File);

        let sym = CodeNode::symbol("src/app.ts", "boot", NodeKind::CodeBlock, "function boot() {}");
        assert_eq!(sym.id, "src/app.ts::boot");
    }

    #[test]
    fn node_json_round_trip() {
        let mut node = CodeNode::symbol("a/b.py", "run", NodeKind::Function, "def run(): pass");
        node.dependencies.insert("helpers".into());
        node.embedding = vec![0.5; 4];
        node.ai_summary = "runs the thing".into();

        let json = serde_json::to_string(&node).unwrap();
        let back: CodeNode = serde_json::from_str(&json).unwrap();
        assert_eq!(node, back);
    }

    #[test]
    fn node_kind_serializes_snake_case() {
        let json = serde_json::to_string(&NodeKind::CodeBlock).unwrap();
        assert_eq!(json, "\"code_block\"");
        assert_eq!(NodeKind::CodeBlock.to_string(), "code_block");
    }

    #[test]
    fn structural_weight_defaults() {
        let mut node = CodeNode::file("x.ts", "x.ts", "");
        assert_eq!(node.structural_weight(), 1.0);
        node.weights.clear();
        assert_eq!(node.structural_weight(), 0.5);
    }

    #[test]
    fn missing_fields_deserialize_with_defaults() {
        let json = r#"{"id":"f.ts","name":"f.ts","type":"file","file_path":"f.ts","content":""}"#;
        let node: CodeNode = serde_json::from_str(json).unwrap();
        assert!(node.embedding.is_empty());
        assert_eq!(node.ai_quality_score, 0.5);
    }

    #[test]
    fn phase_display_matches_wire_format() {
        assert_eq!(AgentPhase::ToolExec.to_string(), "TOOL_EXEC");
        let json = serde_json::to_string(&AgentPhase::AstScan).unwrap();
        assert_eq!(json, "\"AST_SCAN\"");
    }

    #[test]
    fn generation_failure_carries_reason() {
        let gen = GenerationResult::failure("SAFETY block");
        assert!(!gen.success);
        assert_eq!(gen.total_tokens, 0);
        assert!(gen.text.contains("SAFETY"));
    }
}
