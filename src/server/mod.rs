//! Thin HTTP dispatch layer: axum handlers over the shared application
//! state. Handlers stay small; every decision of substance lives in the
//! core modules.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};

use crate::agent::{AgentLoop, MissionRequest};
use crate::cache::CacheManager;
use crate::config::{ProjectConfig, ServerConfig};
use crate::credentials::CredentialPool;
use crate::error::{SynapseError, SynapseResult};
use crate::graph::GraphStore;
use crate::index::VectorIndex;
use crate::llm::LlmClient;
use crate::retrieval::{
    build_hierarchical_context, build_topology_map, candidate_summary, RetrievalEngine,
};
use crate::sync::SyncService;
use crate::telemetry::{MissionLogBuffer, TelemetryCollector, TraceBuffer, LOG_BUFFER_CAPACITY};
use crate::tool::fs_tools::{ListDirTool, ReadFileTool};
use crate::tool::surgery::ApplyEditTool;
use crate::tool::web::WebSearchTool;
use crate::tool::ToolRegistry;
use crate::types::AgentEvent;

const CONTEXT_CHAR_BUDGET: usize = 120_000;
const RETRIEVE_MAX_NODES: usize = 80;

/// One project's in-memory index and graph. Handler-level locking of this
/// pair serializes index operations per project.
pub struct ProjectStore {
    pub index: VectorIndex,
    pub graph: GraphStore,
}

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub pool: Arc<CredentialPool>,
    pub llm: Arc<LlmClient>,
    pub cache: Arc<CacheManager>,
    pub sync_service: Arc<SyncService>,
    pub stores: Arc<DashMap<String, Arc<Mutex<ProjectStore>>>>,
    pub tools: Arc<ToolRegistry>,
    pub missions: Arc<MissionLogBuffer>,
    pub traces: Arc<TraceBuffer>,
    pub telemetry: Arc<TelemetryCollector>,
    pub sync_workers: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: ServerConfig, pool: Arc<CredentialPool>) -> Self {
        let cache = Arc::new(CacheManager::new());
        let llm = Arc::new(LlmClient::new(Arc::clone(&pool), Arc::clone(&cache)));
        Self::with_llm(config, pool, cache, llm)
    }

    /// Test seam: point the LLM client at a local mock endpoint.
    pub fn with_llm_base_url(
        config: ServerConfig,
        pool: Arc<CredentialPool>,
        base_url: impl Into<String>,
    ) -> Self {
        let cache = Arc::new(CacheManager::new());
        let llm = Arc::new(LlmClient::with_base_url(
            Arc::clone(&pool),
            Arc::clone(&cache),
            base_url,
        ));
        Self::with_llm(config, pool, cache, llm)
    }

    fn with_llm(
        config: ServerConfig,
        pool: Arc<CredentialPool>,
        cache: Arc<CacheManager>,
        llm: Arc<LlmClient>,
    ) -> Self {
        let traces = Arc::new(TraceBuffer::new(LOG_BUFFER_CAPACITY));
        let missions = Arc::new(MissionLogBuffer::new(LOG_BUFFER_CAPACITY));

        let mut tools = ToolRegistry::new(Arc::clone(&traces));
        let data_dir = config.data_dir.clone();
        tools.register(Box::new(ListDirTool::new(data_dir.clone())));
        tools.register(Box::new(ReadFileTool::new(data_dir.clone())));
        tools.register(Box::new(ApplyEditTool::new(data_dir)));
        tools.register(Box::new(WebSearchTool::new(Arc::clone(&pool))));

        Self {
            sync_workers: Arc::new(Semaphore::new(config.worker_pool_size)),
            sync_service: Arc::new(SyncService::new(Arc::clone(&llm))),
            stores: Arc::new(DashMap::new()),
            tools: Arc::new(tools),
            telemetry: Arc::new(TelemetryCollector::new()),
            missions,
            traces,
            cache,
            llm,
            pool,
            config,
        }
    }

    fn storage_dir(&self, project_id: &str) -> PathBuf {
        self.config.project_dir(project_id)
    }

    fn config_path(&self, project_id: &str) -> PathBuf {
        self.storage_dir(project_id).join("config.json")
    }

    /// In-memory store for a project, loading the persisted index on first
    /// use.
    pub fn load_store(&self, project_id: &str) -> SynapseResult<Arc<Mutex<ProjectStore>>> {
        if let Some(store) = self.stores.get(project_id) {
            return Ok(Arc::clone(store.value()));
        }

        let vector_dir = self.storage_dir(project_id).join("vector_store");
        let index = VectorIndex::load(&vector_dir).map_err(|_| SynapseError::MissingIndex {
            project_id: project_id.to_string(),
        })?;
        let graph = GraphStore::from_nodes(index.all_nodes().iter().cloned());

        let store = Arc::new(Mutex::new(ProjectStore { index, graph }));
        self.stores
            .insert(project_id.to_string(), Arc::clone(&store));
        Ok(store)
    }
}

type ApiError = (StatusCode, Json<Value>);

fn internal_error(err: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/hello", get(hello))
        .route("/sync/register/{project_id}", post(register_project))
        .route("/sync/run/{project_id}", post(run_sync))
        .route("/sync/file/{project_id}", post(sync_file))
        .route("/retrieve-context-candidates", post(retrieve_candidates))
        .route("/generate-code-suggestion", post(generate_suggestion))
        .route("/complete", post(complete))
        .route("/agent/run", post(run_agent))
        .route("/agent/stream", post(stream_agent))
        .route("/get-dependency-subgraph", post(dependency_subgraph))
        .route("/api/admin/telemetry", get(admin_telemetry))
        .route("/api/admin/agent_trace", get(admin_trace))
        .route("/admin/refresh-keys", post(refresh_keys))
        .with_state(state)
}

async fn hello() -> Json<Value> {
    Json(json!({"message": "Synapse backend online."}))
}

// ─── Sync surface ────────────────────────────────────────────────────────────

async fn register_project(
    State(state): State<AppState>,
    AxumPath(project_id): AxumPath<String>,
    Json(config): Json<ProjectConfig>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!(%project_id, path = %config.local_path, "registering project");
    config
        .save(&state.config_path(&project_id))
        .map_err(internal_error)?;
    Ok(Json(json!({"success": true, "project_id": project_id})))
}

/// Run the sync pipeline for one project and refresh its in-memory store.
async fn sync_project_blocking(state: &AppState, project_id: &str) -> SynapseResult<usize> {
    let config = ProjectConfig::load(&state.config_path(project_id))?;
    let storage_dir = config
        .storage_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| state.storage_dir(project_id));

    // Serialize syncs for the same project on the store lock. The shard
    // guard is released before awaiting.
    let store_slot = {
        let entry = state.stores.entry(project_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ProjectStore {
                index: VectorIndex::with_default_dimension(),
                graph: GraphStore::new(),
            }))
        });
        Arc::clone(entry.value())
    };
    let mut store = store_slot.lock().await;

    let result = state
        .sync_service
        .perform_sync(
            project_id,
            std::path::Path::new(&config.local_path),
            &storage_dir,
            &config.allowed_extensions,
            &config.ignored_paths,
            &config.included_paths,
        )
        .await;

    let dimension = result
        .nodes
        .iter()
        .find(|n| !n.embedding.is_empty())
        .map(|n| n.embedding.len())
        .unwrap_or(crate::types::EMBEDDING_DIM);
    let mut index = VectorIndex::new(dimension);
    let arcs = index.add_nodes(result.nodes);
    index.save(&storage_dir.join("vector_store"))?;

    let node_count = arcs.len();
    store.graph = GraphStore::from_nodes(arcs);
    store.index = index;
    Ok(node_count)
}

async fn run_sync(
    State(state): State<AppState>,
    AxumPath(project_id): AxumPath<String>,
) -> Result<Json<Value>, ApiError> {
    // Fail fast on an unregistered project; the heavy work goes to the
    // worker pool.
    ProjectConfig::load(&state.config_path(&project_id)).map_err(internal_error)?;

    let task_state = state.clone();
    tokio::spawn(async move {
        let _permit = task_state.sync_workers.acquire().await;
        match sync_project_blocking(&task_state, &project_id).await {
            Ok(nodes) => tracing::info!(%project_id, nodes, "background sync finished"),
            Err(e) => tracing::error!(project_id, error = %e, "background sync failed"),
        }
    });

    Ok(Json(json!({
        "success": true,
        "message": "Background sync started."
    })))
}

#[derive(Deserialize)]
struct SyncFileRequest {
    file_path: String,
}

async fn sync_file(
    State(state): State<AppState>,
    AxumPath(project_id): AxumPath<String>,
    Json(request): Json<SyncFileRequest>,
) -> Result<Json<Value>, ApiError> {
    let config = ProjectConfig::load(&state.config_path(&project_id)).map_err(internal_error)?;
    let storage_dir = state.storage_dir(&project_id);

    let result = state
        .sync_service
        .sync_single_file(
            &project_id,
            std::path::Path::new(&config.local_path),
            &storage_dir,
            &request.file_path,
        )
        .await;

    // Hot-add into the live index, then persist.
    let store_slot = state.load_store(&project_id).map_err(internal_error)?;
    let mut store = store_slot.lock().await;
    let arcs = store.index.add_nodes(result.nodes);
    for node in &arcs {
        store.graph.add_node(Arc::clone(node));
    }
    store
        .index
        .save(&storage_dir.join("vector_store"))
        .map_err(internal_error)?;

    Ok(Json(json!({
        "success": true,
        "updated": result.updated_count,
        "nodes": arcs.len(),
    })))
}

// ─── Retrieval surface ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RetrieveRequest {
    project_id: String,
    prompt: String,
}

async fn retrieve_candidates(
    State(state): State<AppState>,
    Json(request): Json<RetrieveRequest>,
) -> Result<Json<Value>, ApiError> {
    let embedding = state
        .llm
        .generate_embedding(&request.prompt)
        .await
        .map_err(internal_error)?;

    let store_slot = state.load_store(&request.project_id).map_err(internal_error)?;
    let store = store_slot.lock().await;
    let engine = RetrievalEngine::new(&store.index, &store.graph);
    let results = engine.retrieve(&embedding, RETRIEVE_MAX_NODES, true);

    let candidates: Vec<Value> = results.iter().map(candidate_summary).collect();
    Ok(Json(json!({"candidates": candidates})))
}

#[derive(Deserialize)]
struct SuggestionRequest {
    project_id: String,
    prompt: String,
    #[serde(default)]
    active_file_path: Option<String>,
    #[serde(default)]
    active_file_content: Option<String>,
}

async fn generate_suggestion(
    State(state): State<AppState>,
    Json(request): Json<SuggestionRequest>,
) -> Result<Json<Value>, ApiError> {
    let started = std::time::Instant::now();
    if let Some(cached) = state.cache.get_result(&request.prompt) {
        return Ok(Json(json!({"suggestion": cached, "cached": true})));
    }

    let hyde = state.llm.generate_hyde(&request.prompt).await;
    let search_query = if hyde.is_empty() {
        request.prompt.clone()
    } else {
        format!("{}\n{hyde}", request.prompt)
    };
    let embedding = state
        .llm
        .generate_embedding(&search_query)
        .await
        .map_err(internal_error)?;

    let (context, candidate_ids) = {
        let store_slot = state.load_store(&request.project_id).map_err(internal_error)?;
        let store = store_slot.lock().await;
        let engine = RetrievalEngine::new(&store.index, &store.graph);
        let results = engine.retrieve(&embedding, RETRIEVE_MAX_NODES, true);
        let ids: Vec<String> = results.iter().map(|r| r.node.id.clone()).collect();
        (build_hierarchical_context(&results, CONTEXT_CHAR_BUDGET), ids)
    };

    let mut prompt = format!(
        "### ROLE\nYou are a Senior Software Architect.\n\n### CONTEXT\n{context}\n"
    );
    if let (Some(path), Some(content)) =
        (&request.active_file_path, &request.active_file_content)
    {
        prompt.push_str(&format!("\n### ACTIVE FILE: {path}\n{content}\n"));
    }
    prompt.push_str(&format!(
        "\n### USER QUESTION\n{}\n\n### INSTRUCTIONS\nAnswer based ONLY on the code context. Cite filenames.\n\n### ANSWER\n",
        request.prompt
    ));

    let generation = state
        .llm
        .generate_text_elite(&prompt)
        .await
        .map_err(internal_error)?;
    if !generation.success {
        return Err(internal_error(generation.text));
    }

    state.cache.set_result(&request.prompt, generation.text.clone());
    state.missions.push(crate::types::MissionRecord {
        timestamp: chrono::Utc::now(),
        project_id: request.project_id,
        kind: crate::types::MissionKind::Ghost,
        user_query: request.prompt,
        full_prompt: prompt,
        ai_response: generation.text.clone(),
        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        prompt_tokens: generation.prompt_tokens,
        completion_tokens: generation.completion_tokens,
        total_tokens: generation.total_tokens,
        vector_snapshot: Some(candidate_ids),
    });

    Ok(Json(json!({"suggestion": generation.text})))
}

#[derive(Deserialize)]
struct CompleteRequest {
    prefix: String,
}

async fn complete(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<Value>, ApiError> {
    let completion = state
        .llm
        .generate_autocomplete(&request.prefix)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({"completion": completion})))
}

// ─── Agent surface ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AgentRequest {
    project_id: String,
    prompt: String,
}

/// Context strategy: when the project has an index, hand the mission a
/// rank-tiered topology map of the most relevant nodes.
async fn build_mission(state: &AppState, project_id: String, prompt: String) -> MissionRequest {
    let request = MissionRequest::new(project_id, prompt);

    let Ok(embedding) = state.llm.generate_embedding(&request.prompt).await else {
        return request;
    };
    let Ok(store_slot) = state.load_store(&request.project_id) else {
        return request;
    };
    let store = store_slot.lock().await;
    let engine = RetrievalEngine::new(&store.index, &store.graph);
    let results = engine.retrieve(&embedding, RETRIEVE_MAX_NODES, true);
    if results.is_empty() {
        return request;
    }
    request.with_topology(build_topology_map(&results))
}

fn mission_agent(state: &AppState) -> AgentLoop {
    AgentLoop::new(
        Arc::clone(&state.llm),
        Arc::clone(&state.tools),
        Arc::clone(&state.missions),
        Arc::clone(&state.traces),
    )
}

async fn run_agent(
    State(state): State<AppState>,
    Json(request): Json<AgentRequest>,
) -> Result<Json<Value>, ApiError> {
    let mission = build_mission(&state, request.project_id, request.prompt).await;
    let agent = mission_agent(&state);

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let answer = agent.run(mission, event_tx).await;

    let mut events: Vec<AgentEvent> = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        events.push(event);
    }

    Ok(Json(json!({"answer": answer, "events": events})))
}

/// Streaming variant: one SSE frame per agent phase, closed by a `done`
/// event once the mission returns.
async fn stream_agent(
    State(state): State<AppState>,
    Json(request): Json<AgentRequest>,
) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>> {
    let mission = build_mission(&state, request.project_id, request.prompt).await;
    let agent = mission_agent(&state);

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        agent.run(mission, event_tx).await;
    });

    let phase_stream = futures_util::stream::unfold(event_rx, |mut event_rx| async move {
        let event = event_rx.recv().await?;
        let frame: Result<SseEvent, Infallible> = Ok(SseEvent::default()
            .event("phase")
            .json_data(&event)
            .expect("agent events serialize"));
        Some((frame, event_rx))
    });
    let done = futures_util::stream::once(async {
        Ok(SseEvent::default().event("done").data("{}"))
    });

    Sse::new(phase_stream.chain(done))
}

#[derive(Deserialize)]
struct SubgraphRequest {
    project_id: String,
    node_id: String,
}

async fn dependency_subgraph(
    State(state): State<AppState>,
    Json(request): Json<SubgraphRequest>,
) -> Result<Json<Value>, ApiError> {
    let store_slot = state.load_store(&request.project_id).map_err(internal_error)?;
    let store = store_slot.lock().await;

    let Some(node) = store.graph.get(&request.node_id) else {
        return Err(internal_error(format!(
            "node not found: {}",
            request.node_id
        )));
    };

    let mut nodes = vec![candidate_node_json(&node)];
    let mut edges = Vec::new();
    for dep in &node.dependencies {
        if let Some(target) = store.graph.resolve(dep) {
            edges.push(json!({"from": node.id, "to": target.id, "label": dep}));
            nodes.push(candidate_node_json(&target));
        }
    }

    Ok(Json(json!({
        "nodes": nodes,
        "edges": edges,
        "raw_dependencies": node.dependencies,
    })))
}

fn candidate_node_json(node: &crate::types::CodeNode) -> Value {
    json!({
        "id": node.id,
        "name": node.name,
        "file_path": node.file_path,
        "type": node.kind,
    })
}

// ─── Admin surface ───────────────────────────────────────────────────────────

async fn admin_telemetry(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "metrics": state.telemetry.snapshot(),
        "logs": state.missions.snapshot_newest_first(),
    }))
}

async fn admin_trace(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"traces": state.traces.snapshot_newest_first()}))
}

async fn refresh_keys(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.pool.refresh().map_err(internal_error)?;
    Ok(Json(json!({
        "success": true,
        "active_keys": state.pool.active_key_count()
    })))
}
