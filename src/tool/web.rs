//! Live web search through the Serper API, using the side-channel key from
//! the credentials file.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::credentials::CredentialPool;

use super::{Tool, ToolDefinition};

const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";
const RESULT_COUNT: u32 = 4;

pub struct WebSearchTool {
    http: reqwest::Client,
    pool: Arc<CredentialPool>,
    endpoint: String,
}

impl WebSearchTool {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self {
            http: reqwest::Client::new(),
            pool,
            endpoint: SERPER_ENDPOINT.into(),
        }
    }

    pub fn with_endpoint(pool: Arc<CredentialPool>, endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            pool,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "web_search".into(),
            description: "Search the live web and return titles, snippets and links for the top results.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, args: serde_json::Value) -> String {
        let Some(api_key) = self.pool.serper_key() else {
            return "ERROR: Web search key not configured.".into();
        };
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
        if query.is_empty() {
            return "ERROR: Search query is empty.".into();
        }

        tracing::info!(query, "web search");

        let response = self
            .http
            .post(&self.endpoint)
            .header("X-API-KEY", api_key)
            .json(&json!({"q": query, "num": RESULT_COUNT}))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return format!("ERROR: Web provider unreachable: {e}"),
        };
        if !response.status().is_success() {
            return format!(
                "ERROR: Web provider unreachable. Status: {}",
                response.status().as_u16()
            );
        }

        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return format!("ERROR: Web response unreadable: {e}"),
        };

        let mut compiled = format!("### WEB SEARCH RESULTS FOR: {query}\n");
        if let Some(organic) = body.get("organic").and_then(|o| o.as_array()) {
            for item in organic {
                let field = |key: &str| item.get(key).and_then(|v| v.as_str()).unwrap_or("");
                compiled.push_str(&format!(
                    "- **{}**\n  Snippet: {}\n  Link: {}\n\n",
                    if field("title").is_empty() { "No Title" } else { field("title") },
                    field("snippet"),
                    field("link"),
                ));
            }
        }
        compiled
    }
}
