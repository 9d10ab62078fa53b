//! File surgery: full-content writes protected by syntax validation and a
//! backup-then-write-then-commit journal.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use crate::parser::ast;

use super::fs_tools::{project_root, resolve_inside_root};
use super::{Tool, ToolDefinition};

pub const JOURNAL_SUFFIX: &str = ".synapse_journal";
const MIN_CONTENT_LEN: usize = 10;

fn journal_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(JOURNAL_SUFFIX);
    PathBuf::from(os)
}

/// Backup/commit/rollback discipline around a destructive write. A missing
/// source file counts as backed up; rollback then removes whatever the
/// write created.
pub struct AtomicJournal;

impl AtomicJournal {
    /// Copy the current file aside. Returns whether a backup copy exists.
    pub fn backup(target: &Path) -> std::io::Result<bool> {
        if !target.exists() {
            return Ok(false);
        }
        std::fs::copy(target, journal_path(target))?;
        Ok(true)
    }

    /// Success: the journal is no longer needed.
    pub fn commit(target: &Path) {
        let _ = std::fs::remove_file(journal_path(target));
    }

    /// Failure: restore the backup (or delete the partial write when the
    /// file never existed) and drop the journal.
    pub fn rollback(target: &Path, had_backup: bool) {
        let journal = journal_path(target);
        if had_backup && journal.exists() {
            let _ = std::fs::copy(&journal, target);
        } else if !had_backup {
            let _ = std::fs::remove_file(target);
        }
        let _ = std::fs::remove_file(journal);
    }
}

pub struct ApplyEditTool {
    data_dir: PathBuf,
}

impl ApplyEditTool {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }
}

#[async_trait]
impl Tool for ApplyEditTool {
    fn name(&self) -> &str {
        "apply_edit"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "apply_edit".into(),
            description: "Surgically overwrite a file with new content. The content must parse cleanly for its language; the write is journaled and rolled back on failure.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
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
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");

        let target = match resolve_inside_root(&root, rel) {
            Ok(path) => path,
            Err(e) => return e,
        };

        // Pre-write validation, before any journal exists.
        let extension = target
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        if extension != "txt" && content.len() < MIN_CONTENT_LEN {
            return "ERROR: Surgery failed (content suspiciously short).".into();
        }
        if !ast::validate_syntax(content, &extension) {
            tracing::warn!(file = rel, "surgery rejected by syntax validation");
            return format!("ERROR: Surgery failed (AST REJECTION for .{extension}).");
        }

        let had_backup = match AtomicJournal::backup(&target) {
            Ok(flag) => flag,
            Err(e) => return format!("ERROR: Failed to create safety journal: {e}"),
        };

        if let Some(parent) = target.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                AtomicJournal::rollback(&target, had_backup);
                return format!("ERROR: Surgery failed: {e}");
            }
        }
        match std::fs::write(&target, content) {
            Ok(()) => {
                AtomicJournal::commit(&target);
                tracing::info!(file = rel, bytes = content.len(), "surgery committed");
                format!("SUCCESS: File updated ({rel}). Atomic journal cleared.")
            }
            Err(e) => {
                AtomicJournal::rollback(&target, had_backup);
                format!("ERROR: Surgery failed: {e}")
            }
        }
    }
}
