use thiserror::Error;

#[derive(Error, Debug)]
pub enum SynapseError {
    #[error("Config missing: {0}")]
    ConfigMissing(String),

    #[error("Rate limited (429) on key #{key_index}")]
    RateLimited { key_index: usize },

    #[error("Remote unavailable: HTTP {status}")]
    RemoteUnavailable { status: u16 },

    #[error("Remote protocol error: HTTP {status}: {body}")]
    RemoteProtocol { status: u16, body: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Path violation: {path} escapes the project root")]
    PathViolation { path: String },

    #[error("Syntax rejected for {path}: {reason}")]
    SyntaxRejection { path: String, reason: String },

    #[error("File too large: {path} ({size} bytes)")]
    FileTooLarge { path: String, size: u64 },

    #[error("No index for project {project_id}; run a sync first")]
    MissingIndex { project_id: String },

    #[error("Sync failure: {0}")]
    Sync(String),

    #[error("Embedding dimension mismatch: got {got}, expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type SynapseResult<T> = Result<T, SynapseError>;

impl SynapseError {
    /// Whether the retry wrapper should rotate credentials and try again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SynapseError::RateLimited { .. }
                | SynapseError::RemoteUnavailable { .. }
                | SynapseError::Http(_)
        )
    }
}
