//! Remote generation and embedding client.
//!
//! Speaks the `generateContent`/`embedContent` REST dialect, with the
//! credential pool supplying the (key, model) pair for every attempt and
//! the standard retry policy wrapped around each call. The base URL is
//! overridable so tests can point the client at a local mock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::cache::CacheManager;
use crate::credentials::{with_retry, CredentialPair, CredentialPool};
use crate::error::{SynapseError, SynapseResult};
use crate::telemetry;
use crate::types::GenerationResult;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const EMBEDDING_MODEL: &str = "text-embedding-004";
const AUTOCOMPLETE_TIMEOUT: Duration = Duration::from_millis(3500);

pub struct LlmClient {
    http: reqwest::Client,
    pool: Arc<CredentialPool>,
    cache: Arc<CacheManager>,
    base_url: String,
}

impl LlmClient {
    pub fn new(pool: Arc<CredentialPool>, cache: Arc<CacheManager>) -> Self {
        Self {
            http: reqwest::Client::new(),
            pool,
            cache,
            base_url: DEFAULT_BASE_URL.into(),
        }
    }

    pub fn with_base_url(
        pool: Arc<CredentialPool>,
        cache: Arc<CacheManager>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            pool,
            cache,
            base_url: base_url.into(),
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: String, key_idx: usize) -> SynapseError {
        match status.as_u16() {
            429 => SynapseError::RateLimited { key_index: key_idx },
            s if s >= 500 => SynapseError::RemoteUnavailable { status: s },
            s => SynapseError::RemoteProtocol { status: s, body },
        }
    }

    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
        key_idx: usize,
        timeout: Option<Duration>,
    ) -> SynapseResult<serde_json::Value> {
        let mut request = self.http.post(url).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, body, key_idx));
        }

        let raw = response.text().await?;
        serde_json::from_str(&raw)
            .map_err(|e| SynapseError::MalformedResponse(format!("invalid JSON body: {e}")))
    }

    // ─── Text generation ─────────────────────────────────────────────────

    /// Generate text under the full retry policy; a malformed body earns one
    /// extra try on a rotated key before becoming fatal.
    pub async fn generate_text_elite(&self, prompt: &str) -> SynapseResult<GenerationResult> {
        let started = Instant::now();
        let result = match self.generate_with_rotation(prompt).await {
            Err(SynapseError::MalformedResponse(reason)) => {
                tracing::warn!(%reason, "malformed generation body; retrying once on a rotated key");
                self.pool.rotate_key();
                self.generate_with_rotation(prompt).await
            }
            other => other,
        }?;

        telemetry::store_ms(
            &telemetry::LLM_GENERATION_MS,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        telemetry::OUTPUT_TOKENS.store(
            result.completion_tokens,
            std::sync::atomic::Ordering::Relaxed,
        );
        Ok(result)
    }

    async fn generate_with_rotation(&self, prompt: &str) -> SynapseResult<GenerationResult> {
        with_retry(&self.pool, |pair| {
            let body = json!({
                "contents": [{"parts": [{"text": prompt}]}]
            });
            let url = format!(
                "{}/{}:generateContent?key={}",
                self.base_url, pair.model, pair.key
            );
            async move {
                let raw = self.post_json(&url, body, pair.key_idx, None).await?;
                Ok(parse_generation_response(&raw))
            }
        })
        .await
    }

    // ─── Embeddings ──────────────────────────────────────────────────────

    /// Embed one text, via the cache when possible.
    pub async fn generate_embedding(&self, text: &str) -> SynapseResult<Vec<f32>> {
        if let Some(cached) = self.cache.get_embedding(text) {
            return Ok(cached);
        }

        let started = Instant::now();
        let embedding = with_retry(&self.pool, |pair| {
            let body = json!({
                "model": format!("models/{EMBEDDING_MODEL}"),
                "content": {"parts": [{"text": text}]}
            });
            let url = format!(
                "{}/{}:embedContent?key={}",
                self.base_url, EMBEDDING_MODEL, pair.key
            );
            async move {
                let raw = self.post_json(&url, body, pair.key_idx, None).await?;
                parse_embedding_values(raw.get("embedding"))
            }
        })
        .await?;

        telemetry::store_ms(
            &telemetry::EMBEDDING_LATENCY_MS,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        self.cache.set_embedding(text, embedding.clone());
        Ok(embedding)
    }

    /// Embed a batch of texts in one request.
    pub async fn generate_embeddings_batch(
        &self,
        texts: &[String],
    ) -> SynapseResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        with_retry(&self.pool, |pair| {
            let requests: Vec<serde_json::Value> = texts
                .iter()
                .map(|text| {
                    json!({
                        "model": format!("models/{EMBEDDING_MODEL}"),
                        "content": {"parts": [{"text": text}]}
                    })
                })
                .collect();
            let body = json!({ "requests": requests });
            let url = format!(
                "{}/{}:batchEmbedContents?key={}",
                self.base_url, EMBEDDING_MODEL, pair.key
            );
            async move {
                let raw = self.post_json(&url, body, pair.key_idx, None).await?;
                let embeddings = raw
                    .get("embeddings")
                    .and_then(|e| e.as_array())
                    .ok_or_else(|| {
                        SynapseError::MalformedResponse("no embeddings array".into())
                    })?;
                embeddings
                    .iter()
                    .map(|e| parse_embedding_values(Some(e)))
                    .collect()
            }
        })
        .await
    }

    // ─── Autocomplete ────────────────────────────────────────────────────

    /// Low-latency completion: 3.5 s budget per attempt, walking every
    /// (model, key) pair once before giving up. Fenced or `main()`-shaped
    /// hallucinations collapse to an empty suggestion.
    pub async fn generate_autocomplete(&self, prefix: &str) -> SynapseResult<String> {
        let attempts = (self.pool.model_count() * self.pool.key_count()).max(1);
        let prompt = format!(
            "Continue this code. Reply with the continuation only, no prose, no code fences.\n\n{prefix}"
        );

        let mut last_error = String::from("no credentials");
        for _ in 0..attempts {
            let Some(pair) = self.pool.current_pair() else {
                break;
            };
            match self.autocomplete_once(&pair, &prompt).await {
                Ok(raw) => return Ok(clean_completion(&raw)),
                Err(err) => {
                    last_error = err.to_string();
                    tracing::debug!(error = %last_error, "autocomplete attempt failed");
                    self.pool.rotate_key();
                    if self.pool.current_pair().map(|p| p.key_idx) == Some(pair.key_idx) {
                        // Every key tried for this model; move on.
                        self.pool.rotate_model();
                    }
                }
            }
        }

        Err(SynapseError::RetriesExhausted {
            attempts: attempts as u32,
            last_error,
        })
    }

    async fn autocomplete_once(
        &self,
        pair: &CredentialPair,
        prompt: &str,
    ) -> SynapseResult<String> {
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}]
        });
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, pair.model, pair.key
        );
        let raw = self
            .post_json(&url, body, pair.key_idx, Some(AUTOCOMPLETE_TIMEOUT))
            .await?;
        let result = parse_generation_response(&raw);
        if !result.success {
            return Err(SynapseError::MalformedResponse(result.text));
        }
        Ok(result.text)
    }

    /// Hypothetical-document expansion: draft an implementation of the
    /// query so the embedding lands nearer real code. Best effort; failures
    /// fall back to the bare query.
    pub async fn generate_hyde(&self, query: &str) -> String {
        let prompt = format!("Write code that would implement the following request. Code only.\n\n{query}");
        match self.generate_text_elite(&prompt).await {
            Ok(result) if result.success => result.text,
            Ok(result) => {
                tracing::warn!(reason = %result.text, "hyde generation rejected");
                String::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "hyde generation failed");
                String::new()
            }
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }
}

/// Interpret a `generateContent` body. Protocol-level success with an
/// unusable payload (no candidates, safety block, no text parts) becomes
/// `success = false` with the reason in `text`.
pub fn parse_generation_response(raw: &serde_json::Value) -> GenerationResult {
    let candidates = match raw.get("candidates").and_then(|c| c.as_array()) {
        Some(c) if !c.is_empty() => c,
        _ => return GenerationResult::failure("Error: AI response was empty or blocked."),
    };
    let candidate = &candidates[0];

    if candidate.get("finishReason").and_then(|r| r.as_str()) == Some("SAFETY") {
        return GenerationResult::failure("Error: response blocked by safety filter.");
    }

    let text = candidate
        .pointer("/content/parts")
        .and_then(|parts| parts.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.is_empty() {
        return GenerationResult::failure("Error: no text parts in response.");
    }

    let usage = raw.get("usageMetadata");
    let token = |field: &str| -> u64 {
        usage
            .and_then(|u| u.get(field))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };

    GenerationResult {
        text,
        prompt_tokens: token("promptTokenCount"),
        completion_tokens: token("candidatesTokenCount"),
        total_tokens: token("totalTokenCount"),
        success: true,
    }
}

fn parse_embedding_values(value: Option<&serde_json::Value>) -> SynapseResult<Vec<f32>> {
    let values = value
        .and_then(|e| e.get("values"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| SynapseError::MalformedResponse("no embedding values".into()))?;
    Ok(values
        .iter()
        .filter_map(|v| v.as_f64())
        .map(|v| v as f32)
        .collect())
}

/// Strip Markdown fences and reject whole-program hallucinations.
pub fn clean_completion(raw: &str) -> String {
    let mut text = raw.trim();

    if text.starts_with("```") {
        // Drop the opening fence line and any closing fence.
        text = text
            .split_once('\n')
            .map(|(_, rest)| rest)
            .unwrap_or("")
            .trim_end();
        if let Some(stripped) = text.strip_suffix("```") {
            text = stripped.trim_end();
        }
    }

    // A completion that invents a main() wrote a fresh program instead of
    // continuing ours; the caller falls through to no suggestion.
    if text.contains("main(") {
        return String::new();
    }

    text.to_string()
}
