//! Tools the agent can invoke, and the registry that dispatches them.
//!
//! Tools are pure I/O: they never call back into the agent loop, and every
//! user-visible failure comes back as an `ERROR:`-prefixed string the loop
//! can reason about instead of an unwinding error.

pub mod fs_tools;
pub mod surgery;
pub mod web;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::telemetry::TraceBuffer;
use crate::types::TraceEntry;

/// Metadata sent to the LLM in the tool manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A capability the agent can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match the definition name).
    fn name(&self) -> &str;

    /// Definition for the LLM-facing manifest.
    fn definition(&self) -> ToolDefinition;

    /// Execute with JSON arguments; the observation is always a string.
    async fn execute(&self, args: serde_json::Value) -> String;
}

/// Registry of tools available to the agent.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    traces: Arc<TraceBuffer>,
}

impl ToolRegistry {
    pub fn new(traces: Arc<TraceBuffer>) -> Self {
        Self {
            tools: Vec::new(),
            traces,
        }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        tracing::info!(tool = tool.name(), "tool registered");
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// The JSON manifest embedded into the agent's system prompt.
    pub fn manifest_json(&self) -> String {
        serde_json::to_string_pretty(&self.definitions()).unwrap_or_else(|_| "[]".into())
    }

    /// Execute a tool by name, recording a timed trace entry.
    pub async fn dispatch(&self, name: &str, args: serde_json::Value) -> String {
        let Some(tool) = self.get(name) else {
            return format!("ERROR: Tool '{name}' not found.");
        };

        let started = Instant::now();
        let observation = tool.execute(args).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.traces.push(TraceEntry {
            session_id: String::new(),
            timestamp: Utc::now(),
            state: "TOOL_EXEC".into(),
            detail: name.to_string(),
            duration_ms,
        });

        observation
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
