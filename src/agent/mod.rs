//! The autonomous mission loop: a bounded ReAct state machine that turns an
//! LLM into a tool-driving pilot.
//!
//! Each step sends the tool manifest, the mission, and the accumulated
//! monologue to the model, extracts exactly one JSON action from the reply,
//! and either executes a tool, terminates on `FINAL_ANSWER`, or annotates
//! the monologue when the action is invalid or repeated. Every phase is
//! streamed to the caller and mirrored into the trace ring buffer.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::llm::LlmClient;
use crate::parser::ast;
use crate::telemetry::{MissionLogBuffer, TraceBuffer};
use crate::tool::ToolRegistry;
use crate::types::{
    AgentAction, AgentEvent, AgentPhase, GenerationResult, MissionKind, MissionRecord,
};

pub const DEFAULT_MAX_STEPS: usize = 10;
const FINAL_ANSWER: &str = "FINAL_ANSWER";
const TIMEOUT_ANSWER: &str = "Mission timed out before a final answer was reached.";

/// Locate the first balanced `{…}` group and parse it. Prose around the
/// object is tolerated; no braces (or unparseable content) yields an empty
/// object.
pub fn extract_json(raw: &str) -> serde_json::Value {
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut start = None;

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &raw[start.expect("start set when depth rose")..=i];
                        return serde_json::from_str(candidate)
                            .unwrap_or_else(|_| serde_json::json!({}));
                    }
                }
            }
            _ => {}
        }
    }

    serde_json::json!({})
}

/// Interpret an extracted object as an agent action.
pub fn parse_action(value: &serde_json::Value, raw_text: &str) -> AgentAction {
    let Some(tool) = value.get("tool").and_then(|t| t.as_str()) else {
        if raw_text.contains(FINAL_ANSWER) {
            return AgentAction::Final {
                answer: raw_text.to_string(),
            };
        }
        return AgentAction::Invalid;
    };

    let params = value
        .get("parameters")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    if tool == FINAL_ANSWER {
        let answer = params
            .get("answer")
            .and_then(|a| a.as_str())
            .unwrap_or("Done.")
            .to_string();
        return AgentAction::Final { answer };
    }

    AgentAction::ToolCall {
        name: tool.to_string(),
        params,
    }
}

fn action_signature(name: &str, params: &serde_json::Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    params.to_string().hash(&mut hasher);
    hasher.finish()
}

pub struct MissionRequest {
    pub project_id: String,
    pub prompt: String,
    /// Rank-tiered T-Map of the project, when an index is available.
    pub architectural_map: String,
}

impl MissionRequest {
    pub fn new(project_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            prompt: prompt.into(),
            architectural_map: String::new(),
        }
    }

    pub fn with_topology(mut self, architectural_map: String) -> Self {
        self.architectural_map = architectural_map;
        self
    }
}

pub struct AgentLoop {
    llm: Arc<LlmClient>,
    tools: Arc<ToolRegistry>,
    missions: Arc<MissionLogBuffer>,
    traces: Arc<TraceBuffer>,
    max_steps: usize,
}

impl AgentLoop {
    pub fn new(
        llm: Arc<LlmClient>,
        tools: Arc<ToolRegistry>,
        missions: Arc<MissionLogBuffer>,
        traces: Arc<TraceBuffer>,
    ) -> Self {
        Self {
            llm,
            tools,
            missions,
            traces,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    fn emit(
        &self,
        session_id: &str,
        event_tx: &UnboundedSender<AgentEvent>,
        phase: AgentPhase,
        payload: impl Into<String>,
    ) {
        let payload = payload.into();
        let _ = event_tx.send(AgentEvent::new(phase, payload.clone()));
        self.traces.push(crate::types::TraceEntry {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            state: phase.to_string(),
            detail: payload,
            duration_ms: 0.0,
        });
    }

    fn build_prompt(&self, request: &MissionRequest, monologue: &str) -> String {
        let mut prompt = format!(
            "### ROLE: Synapse Autonomous Pilot\n\
             ### TOOLS\n{}\n\n\
             ### MISSION\n{}\n\n\
             ### PROTOCOL\n\
             1. Respond with exactly one JSON object: {{\"tool\": \"name\", \"parameters\": {{...}}}}\n\
             2. Use {FINAL_ANSWER} with {{\"answer\": \"...\"}} once you have enough information.\n\
             3. Never repeat an identical action.\n",
            self.tools.manifest_json(),
            request.prompt
        );
        if !request.architectural_map.is_empty() {
            prompt.push_str("\n### PROJECT TOPOLOGY\n");
            prompt.push_str(&request.architectural_map);
        }
        if !monologue.is_empty() {
            prompt.push_str("\n### HISTORY\n");
            prompt.push_str(monologue);
        }
        prompt.push_str("\nNEXT ACTION:");
        prompt
    }

    /// Run one mission to completion. Returns the final answer; events are
    /// streamed through `event_tx` in emission order.
    pub async fn run(
        &self,
        request: MissionRequest,
        event_tx: UnboundedSender<AgentEvent>,
    ) -> String {
        let mission_start = Instant::now();
        let session_id = Uuid::new_v4().to_string();

        self.emit(
            &session_id,
            &event_tx,
            AgentPhase::Startup,
            format!("Mission accepted for project {}", request.project_id),
        );

        let mut monologue = String::new();
        let mut focal_code = String::new();
        let mut seen_actions: HashSet<u64> = HashSet::new();
        let mut last_gen = GenerationResult::default();
        let mut final_output: Option<String> = None;
        let mut aborted = false;

        for step in 0..self.max_steps {
            let prompt = self.build_prompt(&request, &monologue);

            let generation = match self.llm.generate_text_elite(&prompt).await {
                Ok(generation) => generation,
                Err(e) => {
                    self.emit(
                        &session_id,
                        &event_tx,
                        AgentPhase::Error,
                        format!("AI service unreachable: {e}"),
                    );
                    final_output = Some("ERROR: AI service failure.".into());
                    aborted = true;
                    break;
                }
            };
            last_gen = generation.clone();

            if !generation.success {
                self.emit(
                    &session_id,
                    &event_tx,
                    AgentPhase::Error,
                    generation.text.clone(),
                );
                final_output = Some(format!("ERROR: {}", generation.text));
                aborted = true;
                break;
            }

            self.emit(
                &session_id,
                &event_tx,
                AgentPhase::Thought,
                format!("Step {step}"),
            );

            let extracted = extract_json(&generation.text);
            match parse_action(&extracted, &generation.text) {
                AgentAction::Final { answer } => {
                    final_output = Some(answer);
                    break;
                }
                AgentAction::Invalid => {
                    monologue.push_str("\n[SYSTEM: Invalid JSON. Retry.]");
                }
                AgentAction::ToolCall { name, mut params } => {
                    let signature = action_signature(&name, &params);
                    if !seen_actions.insert(signature) {
                        monologue
                            .push_str("\n[SYSTEM: Loop detected. Try a different approach.]");
                        continue;
                    }

                    // Tools resolve paths against the right project without
                    // trusting the model to name it.
                    if let Some(obj) = params.as_object_mut() {
                        obj.insert(
                            "project_id".into(),
                            serde_json::Value::String(request.project_id.clone()),
                        );
                    }

                    let observation = self.tools.dispatch(&name, params.clone()).await;

                    monologue.push_str(&format!(
                        "\n[STEP {step} RESULT FROM {name}]\n{observation}"
                    ));

                    if name == "read_file" && !observation.starts_with("ERROR") {
                        let path = params
                            .get("path")
                            .and_then(|p| p.as_str())
                            .unwrap_or_default();
                        focal_code.push_str(&format!("\nFile: {path}\n{observation}"));
                        let symbols = ast::extract_symbols(path, &observation);
                        monologue.push_str(&format!("\n[AST DATA: {} symbols]", symbols.len()));
                        if !symbols.is_empty() {
                            self.emit(
                                &session_id,
                                &event_tx,
                                AgentPhase::AstScan,
                                format!("{} symbols in {path}", symbols.len()),
                            );
                        }
                    }

                    self.emit(
                        &session_id,
                        &event_tx,
                        AgentPhase::ToolExec,
                        format!("Used {name}"),
                    );
                }
            }
        }

        let final_output = final_output.unwrap_or_else(|| TIMEOUT_ANSWER.to_string());
        if !aborted {
            self.emit(
                &session_id,
                &event_tx,
                AgentPhase::Final,
                final_output.clone(),
            );
        }

        let duration_ms = mission_start.elapsed().as_secs_f64() * 1000.0;
        self.missions.push(MissionRecord {
            timestamp: Utc::now(),
            project_id: request.project_id,
            kind: MissionKind::Agent,
            user_query: request.prompt,
            full_prompt: format!("### HISTORY\n{monologue}\n### FOCAL CODE\n{focal_code}"),
            ai_response: final_output.clone(),
            duration_ms,
            prompt_tokens: last_gen.prompt_tokens,
            completion_tokens: last_gen.completion_tokens,
            total_tokens: last_gen.total_tokens,
            vector_snapshot: None,
        });

        final_output
    }
}
