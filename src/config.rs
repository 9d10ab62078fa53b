use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SynapseError, SynapseResult};

/// Process-level configuration for the server binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address.
    pub bind_addr: String,
    /// Root under which per-project storage lives (`<data_dir>/<project_id>/`).
    pub data_dir: PathBuf,
    /// Size of the background worker pool for long-running jobs.
    pub worker_pool_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5002".to_string(),
            data_dir: PathBuf::from("data"),
            worker_pool_size: 4,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SYNAPSE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(dir) = std::env::var("SYNAPSE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(val) = std::env::var("SYNAPSE_WORKER_POOL_SIZE") {
            if let Ok(v) = val.parse() {
                config.worker_pool_size = v;
            }
        }

        config
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.data_dir.join(project_id)
    }
}

/// Per-project configuration, persisted as `data/<project_id>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Absolute path of the source tree to index.
    pub local_path: String,
    /// Storage override; defaults to `data/<project_id>/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub ignored_paths: Vec<String>,
    #[serde(default)]
    pub included_paths: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_true() -> bool {
    true
}

fn default_status() -> String {
    "idle".to_string()
}

impl ProjectConfig {
    pub fn load(path: &Path) -> SynapseResult<Self> {
        if !path.exists() {
            return Err(SynapseError::ConfigMissing(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> SynapseResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Shape of the credentials file `keys.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysFile {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub secondary: Option<String>,
    #[serde(default)]
    pub serper: Option<String>,
}

impl KeysFile {
    /// Model rotation order: the `models` list, falling back to
    /// primary/secondary when the list is absent.
    pub fn model_order(&self) -> Vec<String> {
        if !self.models.is_empty() {
            return self.models.clone();
        }
        self.primary
            .iter()
            .chain(self.secondary.iter())
            .cloned()
            .collect()
    }
}

/// Locate `keys.json` in `start` or up to two parent directories.
pub fn find_keys_file(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    for _ in 0..3 {
        let candidate = dir.join("keys.json");
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?.to_path_buf();
    }
    None
}

pub fn load_keys_file(path: &Path) -> SynapseResult<KeysFile> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.project_dir("p1"), PathBuf::from("data/p1"));
    }

    #[test]
    fn project_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = ProjectConfig {
            local_path: "/repo".into(),
            storage_path: None,
            allowed_extensions: vec!["ts".into(), "py".into()],
            ignored_paths: vec!["node_modules".into()],
            included_paths: vec!["node_modules/zod".into()],
            is_active: true,
            status: "idle".into(),
        };
        config.save(&path).unwrap();

        let back = ProjectConfig::load(&path).unwrap();
        assert_eq!(back.local_path, "/repo");
        assert_eq!(back.allowed_extensions.len(), 2);
        assert!(back.is_active);
    }

    #[test]
    fn project_config_missing_is_config_error() {
        let err = ProjectConfig::load(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, SynapseError::ConfigMissing(_)));
    }

    #[test]
    fn project_config_tolerates_sparse_json() {
        let config: ProjectConfig = serde_json::from_str(r#"{"local_path": "/repo"}"#).unwrap();
        assert!(config.is_active);
        assert_eq!(config.status, "idle");
        assert!(config.allowed_extensions.is_empty());
    }

    #[test]
    fn keys_file_model_order_prefers_list() {
        let keys: KeysFile = serde_json::from_str(
            r#"{"keys": ["k1"], "models": ["m1", "m2"], "primary": "p"}"#,
        )
        .unwrap();
        assert_eq!(keys.model_order(), vec!["m1", "m2"]);

        let keys: KeysFile =
            serde_json::from_str(r#"{"keys": ["k1"], "primary": "p", "secondary": "s"}"#).unwrap();
        assert_eq!(keys.model_order(), vec!["p", "s"]);
    }

    #[test]
    fn find_keys_file_walks_parents() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("keys.json"), "{}").unwrap();

        let found = find_keys_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("keys.json"));
    }

    #[test]
    fn find_keys_file_gives_up_beyond_two_parents() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c/d");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("keys.json"), "{}").unwrap();

        assert!(find_keys_file(&nested).is_none());
    }
}
