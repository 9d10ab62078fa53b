//! Filesystem tools: depth-limited directory listing and bounded file reads,
//! both geofenced to the project source root.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use walkdir::WalkDir;

use crate::config::ProjectConfig;
use crate::pathfilter::PathFilter;

use super::{Tool, ToolDefinition};

pub const READ_SIZE_CAP: u64 = 512 * 1024;

/// Resolve the project's source root from the injected `project_id`.
pub fn project_root(data_dir: &Path, args: &serde_json::Value) -> Result<(PathBuf, ProjectConfig), String> {
    let project_id = args
        .get("project_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "ERROR: missing project_id".to_string())?;
    let config_path = data_dir.join(project_id).join("config.json");
    let config = ProjectConfig::load(&config_path)
        .map_err(|e| format!("ERROR: project config unavailable: {e}"))?;
    Ok((PathBuf::from(&config.local_path), config))
}

/// Join `rel` onto `root` lexically, rejecting any traversal that would
/// escape the root.
pub fn resolve_inside_root(root: &Path, rel: &str) -> Result<PathBuf, String> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err("ERROR: Security Violation - absolute paths are not allowed.".into());
    }

    let mut stack: Vec<std::ffi::OsString> = Vec::new();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => stack.push(part.to_os_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err("ERROR: Security Violation - path escapes project root.".into());
                }
            }
            _ => return Err("ERROR: Security Violation - invalid path component.".into()),
        }
    }

    let mut resolved = root.to_path_buf();
    for part in stack {
        resolved.push(part);
    }
    Ok(resolved)
}

// ─── list_dir ────────────────────────────────────────────────────────────────

pub struct ListDirTool {
    data_dir: PathBuf,
}

impl ListDirTool {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_dir".into(),
            description: "List files and directories under a path, recursively to the given depth. Respects the project's ignore rules.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "depth": {"type": "number"}
                }
            }),
        }
    }

    async fn execute(&self, args: serde_json::Value) -> String {
        let (root, config) = match project_root(&self.data_dir, &args) {
            Ok(pair) => pair,
            Err(e) => return e,
        };
        let sub = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let depth = args
            .get("depth")
            .and_then(|v| v.as_u64())
            .unwrap_or(2)
            .clamp(1, 8) as usize;

        let target = match resolve_inside_root(&root, sub) {
            Ok(path) => path,
            Err(e) => return e,
        };
        if !target.exists() {
            return format!("ERROR: Path not found: {sub}");
        }

        let filter = PathFilter::from_rules(&config.ignored_paths, &config.included_paths);
        let mut out = String::new();

        let walker = WalkDir::new(&target)
            .max_depth(depth)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                if !entry.file_type().is_dir() {
                    return true;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                rel.is_empty() || filter.should_descend(&rel)
            });

        for entry in walker.flatten() {
            if entry.path() == target {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            if entry.file_type().is_dir() {
                out.push_str(&format!("[DIR]  {rel}\n"));
            } else {
                if !filter.should_index_file(&rel, true) {
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                out.push_str(&format!("[FILE] {rel} ({size} bytes)\n"));
            }
        }

        if out.is_empty() {
            "(empty)".into()
        } else {
            out
        }
    }
}

// ─── read_file ───────────────────────────────────────────────────────────────

pub struct ReadFileTool {
    data_dir: PathBuf,
}

impl ReadFileTool {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".into(),
            description: "Read a file's content relative to the project root. Files over 512 KiB are rejected.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, args: serde_json::Value) -> String {
        let (root, _config) = match project_root(&self.data_dir, &args) {
            Ok(pair) => pair,
            Err(e) => return e,
        };
        let Some(rel) = args.get("path").and_then(|v| v.as_str()) else {
            return "ERROR: missing path argument".into();
        };

        let target = match resolve_inside_root(&root, rel) {
            Ok(path) => path,
            Err(e) => return e,
        };
        if !target.exists() {
            return format!("ERROR: File not found at {rel}");
        }
        match std::fs::metadata(&target) {
            Ok(meta) if meta.len() > READ_SIZE_CAP => {
                return format!("ERROR: File too large for direct read (>512KB): {rel}");
            }
            Err(e) => return format!("ERROR: {e}"),
            _ => {}
        }

        match std::fs::read(&target) {
            Ok(bytes) => crate::parser::sanitize_utf8(&bytes),
            Err(e) => format!("ERROR: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_project(src_content: &[(&str, &str)]) -> (tempfile::TempDir, tempfile::TempDir) {
        let data = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();

        for (rel, content) in src_content {
            let path = src.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }

        let config = ProjectConfig {
            local_path: src.path().to_string_lossy().into_owned(),
            storage_path: None,
            allowed_extensions: vec![],
            ignored_paths: vec!["secrets".into()],
            included_paths: vec![],
            is_active: true,
            status: "idle".into(),
        };
        config
            .save(&data.path().join("p1").join("config.json"))
            .unwrap();

        (data, src)
    }

    #[test]
    fn resolution_blocks_escapes() {
        let root = Path::new("/project");
        assert!(resolve_inside_root(root, "src/main.rs").is_ok());
        assert!(resolve_inside_root(root, "a/../b.txt").is_ok());
        assert!(resolve_inside_root(root, "../outside").is_err());
        assert!(resolve_inside_root(root, "a/../../outside").is_err());
        assert!(resolve_inside_root(root, "/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn read_file_returns_content() {
        let (data, _src) = setup_project(&[("hello.txt", "hello world")]);
        let tool = ReadFileTool::new(data.path().to_path_buf());

        let out = tool
            .execute(json!({"path": "hello.txt", "project_id": "p1"}))
            .await;
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn read_file_rejects_escape() {
        let (data, _src) = setup_project(&[("hello.txt", "hi")]);
        let tool = ReadFileTool::new(data.path().to_path_buf());

        let out = tool
            .execute(json!({"path": "../../etc/passwd", "project_id": "p1"}))
            .await;
        assert!(out.starts_with("ERROR: Security Violation"));
    }

    #[tokio::test]
    async fn read_file_caps_size() {
        let big = "x".repeat((READ_SIZE_CAP + 1) as usize);
        let (data, _src) = setup_project(&[("big.txt", &big)]);
        let tool = ReadFileTool::new(data.path().to_path_buf());

        let out = tool
            .execute(json!({"path": "big.txt", "project_id": "p1"}))
            .await;
        assert!(out.starts_with("ERROR: File too large"));
    }

    #[tokio::test]
    async fn read_file_missing_is_error_string() {
        let (data, _src) = setup_project(&[]);
        let tool = ReadFileTool::new(data.path().to_path_buf());

        let out = tool
            .execute(json!({"path": "nope.txt", "project_id": "p1"}))
            .await;
        assert!(out.starts_with("ERROR: File not found"));
    }

    #[tokio::test]
    async fn list_dir_marks_dirs_and_files() {
        let (data, _src) = setup_project(&[
            ("src/main.ts", "const x = 1;"),
            ("README.md", "# readme"),
            ("secrets/key.pem", "private"),
        ]);
        let tool = ListDirTool::new(data.path().to_path_buf());

        let out = tool
            .execute(json!({"path": ".", "depth": 3, "project_id": "p1"}))
            .await;
        assert!(out.contains("[DIR]  src"));
        assert!(out.contains("[FILE] src/main.ts"));
        assert!(out.contains("README.md"));
        assert!(out.contains("bytes)"));
        // Ignored directory is pruned from the listing.
        assert!(!out.contains("key.pem"));
    }

    #[tokio::test]
    async fn list_dir_requires_valid_project() {
        let data = tempfile::tempdir().unwrap();
        let tool = ListDirTool::new(data.path().to_path_buf());
        let out = tool.execute(json!({"path": ".", "project_id": "ghost"})).await;
        assert!(out.starts_with("ERROR:"));
    }
}
