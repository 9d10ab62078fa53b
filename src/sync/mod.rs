//! Incremental repository sync: scan → hash → parse → embed → weight.
//!
//! The manifest (`rel_path → "<size>-<mtime>"`) decides which files are
//! reparsed and re-embedded; unchanged files reuse their persisted nodes.
//! Every kept file is mirrored under `converted_files/` and concatenated
//! into `_full_context.txt`, and the final file set is rendered as an ASCII
//! tree.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use crate::graph::calculate_static_weights;
use crate::index::METADATA_FILE;
use crate::llm::LlmClient;
use crate::parser::{self, utf8_safe_truncate};
use crate::pathfilter::PathFilter;
use crate::types::CodeNode;

const EMBED_BATCH_SIZE: usize = 50;
const EMBED_CONTENT_BYTES: usize = 800;

pub type Manifest = BTreeMap<String, String>;

#[derive(Debug, Default)]
pub struct SyncResult {
    pub updated_count: usize,
    pub deleted_count: usize,
    pub nodes: Vec<CodeNode>,
    pub logs: Vec<String>,
}

pub struct SyncService {
    llm: Arc<LlmClient>,
}

/// Case- and separator-insensitive path equality, trailing slashes ignored.
fn paths_equivalent(a: &Path, b: &Path) -> bool {
    normalize_for_compare(a) == normalize_for_compare(b)
}

fn path_contains(parent: &Path, child: &Path) -> bool {
    let p = normalize_for_compare(parent);
    let c = normalize_for_compare(child);
    c == p || (c.len() > p.len() && c.starts_with(&p) && c.as_bytes()[p.len()] == b'/')
}

fn normalize_for_compare(path: &Path) -> String {
    let mut s = path.to_string_lossy().to_lowercase().replace('\\', "/");
    while s.ends_with('/') {
        s.pop();
    }
    s
}

/// Relative path with `/` separators, the form every node id uses.
fn relative_slash_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

pub fn calculate_file_hash(path: &Path) -> String {
    let Ok(meta) = std::fs::metadata(path) else {
        return "err".into();
    };
    let size = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{size}-{mtime}")
}

pub fn load_manifest(storage_dir: &Path) -> Manifest {
    let path = storage_dir.join("manifest.json");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn save_manifest(storage_dir: &Path, manifest: &Manifest) -> std::io::Result<()> {
    std::fs::create_dir_all(storage_dir)?;
    let raw = serde_json::to_string_pretty(manifest).expect("manifest serializes");
    std::fs::write(storage_dir.join("manifest.json"), raw)
}

/// Previously persisted nodes, grouped by file path for reuse.
fn load_existing_nodes(storage_dir: &Path) -> HashMap<String, Vec<CodeNode>> {
    let path = storage_dir.join("vector_store").join(METADATA_FILE);
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    let Ok(nodes) = serde_json::from_str::<Vec<CodeNode>>(&raw) else {
        return HashMap::new();
    };
    let mut map: HashMap<String, Vec<CodeNode>> = HashMap::new();
    for node in nodes {
        map.entry(node.file_path.clone()).or_default().push(node);
    }
    map
}

fn normalize_extensions(allowed: &[String]) -> HashSet<String> {
    allowed
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn extension_allowed(path: &Path, ext_set: &HashSet<String>) -> bool {
    if ext_set.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ext_set.contains(&e.to_lowercase()))
        .unwrap_or(false)
}

const HARD_IGNORES: &[&str] = &[".git", ".vscode", ".idea", "__pycache__"];

/// Walk `source_dir`, pruning ignored directories (unless they bridge to an
/// include rule) and the storage directory itself.
pub fn scan_source_files(
    source_dir: &Path,
    storage_dir: &Path,
    filter: &PathFilter,
    ext_set: &HashSet<String>,
) -> Vec<PathBuf> {
    let source_dir = source_dir.to_path_buf();
    let storage_owned = storage_dir.to_path_buf();
    let filter_root = source_dir.clone();

    let walker = WalkDir::new(&source_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |entry| {
            let name = entry.file_name().to_string_lossy();
            if HARD_IGNORES.contains(&name.as_ref()) {
                return false;
            }
            if paths_equivalent(entry.path(), &storage_owned)
                || path_contains(&storage_owned, entry.path())
            {
                return false;
            }
            if entry.file_type().is_dir() {
                let rel = relative_slash_path(entry.path(), &filter_root);
                if rel.is_empty() {
                    return true;
                }
                return filter.should_descend(&rel);
            }
            true
        });

    let mut files = Vec::new();
    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative_slash_path(entry.path(), &source_dir);
        let ext_ok = extension_allowed(entry.path(), ext_set);
        if filter.should_index_file(&rel, ext_ok) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    files
}

/// Render the indexed file set as an ASCII tree.
pub fn render_tree(root_name: &str, files: &[String]) -> String {
    #[derive(Default)]
    struct Dir {
        dirs: BTreeMap<String, Dir>,
        files: BTreeSet<String>,
    }

    let mut root = Dir::default();
    for file in files {
        let mut cursor = &mut root;
        let segments: Vec<&str> = file.split('/').collect();
        for segment in &segments[..segments.len() - 1] {
            cursor = cursor.dirs.entry(segment.to_string()).or_default();
        }
        cursor.files.insert(segments[segments.len() - 1].to_string());
    }

    fn render(dir: &Dir, prefix: &str, out: &mut String) {
        let total = dir.dirs.len() + dir.files.len();
        let mut i = 0;
        for (name, child) in &dir.dirs {
            i += 1;
            let last = i == total;
            let connector = if last { "└── " } else { "├── " };
            out.push_str(&format!("{prefix}{connector}{name}/\n"));
            let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
            render(child, &child_prefix, out);
        }
        for name in &dir.files {
            i += 1;
            let connector = if i == total { "└── " } else { "├── " };
            out.push_str(&format!("{prefix}{connector}{name}\n"));
        }
    }

    let mut out = format!("{root_name}/\n");
    render(&root, "", &mut out);
    out
}

impl SyncService {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// Full incremental sync for a project. Returns the surviving node set
    /// (weights computed, embeddings filled where possible) ready for
    /// indexing; one file's failure never aborts the scan.
    pub async fn perform_sync(
        &self,
        project_id: &str,
        source_dir: &Path,
        storage_dir: &Path,
        allowed_extensions: &[String],
        ignored_paths: &[String],
        included_paths: &[String],
    ) -> SyncResult {
        let mut result = SyncResult::default();

        let manifest = load_manifest(storage_dir);
        let mut existing_nodes = load_existing_nodes(storage_dir);

        let filter = PathFilter::from_rules(ignored_paths, included_paths);
        let ext_set = normalize_extensions(allowed_extensions);

        let converted_dir = storage_dir.join("converted_files");
        if let Err(e) = std::fs::create_dir_all(&converted_dir) {
            tracing::warn!(error = %e, "cannot create converted_files dir");
        }

        tracing::info!(
            project_id,
            source = %source_dir.display(),
            ignores = ignored_paths.len(),
            includes = included_paths.len(),
            "scanning source tree"
        );

        let files = if source_dir.exists() {
            scan_source_files(source_dir, storage_dir, &filter, &ext_set)
        } else {
            Vec::new()
        };

        let mut new_manifest = Manifest::new();
        let mut processed: HashSet<String> = HashSet::new();
        let mut embed_indices: Vec<usize> = Vec::new();
        let mut full_context = String::new();
        let mut rel_paths: Vec<String> = Vec::new();

        for file_path in &files {
            let rel = relative_slash_path(file_path, source_dir);
            processed.insert(rel.clone());
            rel_paths.push(rel.clone());

            let current_hash = calculate_file_hash(file_path);
            let old_hash = manifest.get(&rel).cloned().unwrap_or_default();
            let changed = current_hash != old_hash;

            let content = match std::fs::read(file_path) {
                Ok(bytes) => parser::sanitize_utf8(&bytes),
                Err(e) => {
                    tracing::warn!(file = %rel, error = %e, "unreadable file skipped");
                    result.logs.push(format!("SKIP: {rel}"));
                    continue;
                }
            };

            // Mirror copy for the in-context snapshot.
            let mirror = converted_dir.join(format!("{rel}.txt"));
            if let Some(parent) = mirror.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(&mirror, &content) {
                tracing::warn!(file = %rel, error = %e, "failed to write mirror copy");
            }
            full_context.push_str(&format!("\n\n--- FILE: {rel} ---\n{content}\n"));

            if changed {
                tracing::info!(file = %rel, "UPDATE");
                result.logs.push(format!("UPDATE: {rel}"));
                for node in parser::extract_nodes_from_file(&rel, &content) {
                    embed_indices.push(result.nodes.len());
                    result.nodes.push(node);
                }
                result.updated_count += 1;
            } else if let Some(previous) = existing_nodes.remove(&rel) {
                for node in previous {
                    if node.embedding.is_empty() {
                        embed_indices.push(result.nodes.len());
                    }
                    result.nodes.push(node);
                }
            } else {
                // Manifest said unchanged but we hold no nodes for it
                // (lost state, e.g. a crash between manifest and metadata).
                tracing::warn!(file = %rel, "restoring missing nodes");
                for node in parser::extract_nodes_from_file(&rel, &content) {
                    embed_indices.push(result.nodes.len());
                    result.nodes.push(node);
                }
            }

            new_manifest.insert(rel, current_hash);
        }

        for gone in manifest.keys().filter(|k| !processed.contains(*k)) {
            tracing::info!(file = %gone, "DELETE");
            result.logs.push(format!("DELETE: {gone}"));
            result.deleted_count += 1;
        }

        if let Err(e) = std::fs::write(storage_dir.join("_full_context.txt"), &full_context) {
            tracing::warn!(error = %e, "failed to write full context snapshot");
        }

        let root_name = source_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".into());
        if let Err(e) = std::fs::write(
            storage_dir.join("tree.txt"),
            render_tree(&root_name, &rel_paths),
        ) {
            tracing::warn!(error = %e, "failed to write tree file");
        }

        self.embed_pending(&mut result.nodes, &embed_indices).await;
        calculate_static_weights(&mut result.nodes);

        if let Err(e) = save_manifest(storage_dir, &new_manifest) {
            tracing::warn!(error = %e, "failed to save manifest");
        }

        tracing::info!(
            project_id,
            files = rel_paths.len(),
            updated = result.updated_count,
            deleted = result.deleted_count,
            nodes = result.nodes.len(),
            "sync complete"
        );
        result
    }

    /// One-file variant of the pipeline; returns the file's fresh nodes for
    /// hot-adding into the in-memory index.
    pub async fn sync_single_file(
        &self,
        project_id: &str,
        local_root: &Path,
        storage_dir: &Path,
        rel_path: &str,
    ) -> SyncResult {
        let mut result = SyncResult::default();
        let abs = local_root.join(rel_path);
        let rel = rel_path.replace('\\', "/");

        let content = match std::fs::read(&abs) {
            Ok(bytes) => parser::sanitize_utf8(&bytes),
            Err(e) => {
                tracing::warn!(project_id, file = %rel, error = %e, "single-file sync failed");
                result.logs.push(format!("ERROR: {rel}: {e}"));
                return result;
            }
        };

        let mirror = storage_dir.join("converted_files").join(format!("{rel}.txt"));
        if let Some(parent) = mirror.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&mirror, &content);

        result.nodes = parser::extract_nodes_from_file(&rel, &content);
        let embed_indices: Vec<usize> = (0..result.nodes.len()).collect();
        self.embed_pending(&mut result.nodes, &embed_indices).await;
        calculate_static_weights(&mut result.nodes);
        result.updated_count = 1;
        result.logs.push(format!("UPDATE: {rel}"));

        let mut manifest = load_manifest(storage_dir);
        manifest.insert(rel, calculate_file_hash(&abs));
        if let Err(e) = save_manifest(storage_dir, &manifest) {
            tracing::warn!(error = %e, "failed to save manifest");
        }

        result
    }

    /// Batch-embed the marked nodes. A failed batch is skipped with a
    /// warning; its nodes keep empty embeddings and stay out of the index.
    async fn embed_pending(&self, nodes: &mut [CodeNode], indices: &[usize]) {
        if indices.is_empty() {
            return;
        }
        tracing::info!(count = indices.len(), "generating embeddings");

        for (batch_no, batch) in indices.chunks(EMBED_BATCH_SIZE).enumerate() {
            let texts: Vec<String> = batch
                .iter()
                .map(|&i| {
                    let node = &nodes[i];
                    format!(
                        "Name: {} Code: {}",
                        node.name,
                        utf8_safe_truncate(&node.content, EMBED_CONTENT_BYTES)
                    )
                })
                .collect();

            match self.llm.generate_embeddings_batch(&texts).await {
                Ok(embeddings) => {
                    for (&i, embedding) in batch.iter().zip(embeddings) {
                        nodes[i].embedding = embedding;
                    }
                }
                Err(e) => {
                    tracing::warn!(batch = batch_no, error = %e, "embedding batch failed; skipping");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManager;
    use crate::config::KeysFile;
    use crate::credentials::CredentialPool;

    /// A client with no credentials: every embedding batch fails fast,
    /// which the sync pipeline must tolerate.
    fn offline_service() -> SyncService {
        let pool = Arc::new(CredentialPool::from_keys_file(KeysFile::default(), None));
        let cache = Arc::new(CacheManager::new());
        SyncService::new(Arc::new(LlmClient::new(pool, cache)))
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn sync_builds_manifest_and_artifacts() {
        let src = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write(src.path(), "a.ts", "function foo() { return bar(); }\n");
        write(src.path(), "lib/b.ts", "function bar() { return 1; }\n");

        let service = offline_service();
        let result = service
            .perform_sync("p1", src.path(), storage.path(), &["ts".into()], &[], &[])
            .await;

        assert_eq!(result.updated_count, 2);
        // Two code blocks + two file nodes.
        assert_eq!(result.nodes.len(), 4);

        let manifest = load_manifest(storage.path());
        assert_eq!(manifest.len(), 2);
        assert!(manifest.contains_key("a.ts"));
        assert!(manifest.contains_key("lib/b.ts"));

        assert!(storage.path().join("converted_files/a.ts.txt").exists());
        assert!(storage.path().join("converted_files/lib/b.ts.txt").exists());

        let full = std::fs::read_to_string(storage.path().join("_full_context.txt")).unwrap();
        assert!(full.contains("--- FILE: a.ts ---"));
        assert!(full.contains("--- FILE: lib/b.ts ---"));

        let tree = std::fs::read_to_string(storage.path().join("tree.txt")).unwrap();
        assert!(tree.contains("├── ") || tree.contains("└── "));
        assert!(tree.contains("b.ts"));
    }

    #[tokio::test]
    async fn unchanged_files_reuse_persisted_nodes() {
        let src = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write(src.path(), "a.ts", "function foo() { return 1; }\n");

        let service = offline_service();
        let first = service
            .perform_sync("p1", src.path(), storage.path(), &["ts".into()], &[], &[])
            .await;
        assert_eq!(first.updated_count, 1);

        // Persist metadata the way the handler layer does after indexing.
        let vector_dir = storage.path().join("vector_store");
        std::fs::create_dir_all(&vector_dir).unwrap();
        let mut persisted = first.nodes.clone();
        for node in &mut persisted {
            node.embedding = vec![0.1; 4];
        }
        std::fs::write(
            vector_dir.join(METADATA_FILE),
            serde_json::to_string(&persisted).unwrap(),
        )
        .unwrap();

        let second = service
            .perform_sync("p1", src.path(), storage.path(), &["ts".into()], &[], &[])
            .await;
        assert_eq!(second.updated_count, 0);
        assert_eq!(second.nodes.len(), first.nodes.len());
        // Reused nodes kept their embeddings.
        assert!(second.nodes.iter().all(|n| !n.embedding.is_empty()));
    }

    #[tokio::test]
    async fn deleted_files_are_logged_and_dropped() {
        let src = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write(src.path(), "a.ts", "const a = 1;\n");
        write(src.path(), "b.ts", "const b = 2;\n");

        let service = offline_service();
        service
            .perform_sync("p1", src.path(), storage.path(), &["ts".into()], &[], &[])
            .await;

        std::fs::remove_file(src.path().join("b.ts")).unwrap();
        let second = service
            .perform_sync("p1", src.path(), storage.path(), &["ts".into()], &[], &[])
            .await;

        assert_eq!(second.deleted_count, 1);
        assert!(second.logs.iter().any(|l| l == "DELETE: b.ts"));
        assert!(!load_manifest(storage.path()).contains_key("b.ts"));
    }

    #[tokio::test]
    async fn ignored_dirs_are_pruned_and_includes_bridge() {
        let src = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write(src.path(), "src/app.ts", "const a = 1;\n");
        write(src.path(), "node_modules/react/index.js", "module.exports = {};\n");
        write(src.path(), "node_modules/zod/index.ts", "export const z = 1;\n");

        let service = offline_service();
        let result = service
            .perform_sync(
                "p1",
                src.path(),
                storage.path(),
                &["ts".into(), "js".into()],
                &["node_modules".into()],
                &["node_modules/zod".into()],
            )
            .await;

        let manifest = load_manifest(storage.path());
        assert!(manifest.contains_key("src/app.ts"));
        assert!(manifest.contains_key("node_modules/zod/index.ts"));
        assert!(!manifest.contains_key("node_modules/react/index.js"));
        assert_eq!(result.updated_count, 2);
    }

    #[tokio::test]
    async fn storage_dir_inside_source_is_excluded() {
        let src = tempfile::tempdir().unwrap();
        let storage = src.path().join("data");
        std::fs::create_dir_all(&storage).unwrap();
        write(src.path(), "a.ts", "const a = 1;\n");
        write(&storage, "trap.ts", "const t = 1;\n");

        let service = offline_service();
        service
            .perform_sync("p1", src.path(), &storage, &["ts".into()], &[], &[])
            .await;

        let manifest = load_manifest(&storage);
        assert!(manifest.contains_key("a.ts"));
        assert!(!manifest.keys().any(|k| k.contains("trap")));
    }

    #[tokio::test]
    async fn single_file_sync_updates_manifest_entry() {
        let src = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write(src.path(), "a.ts", "function foo() { return 1; }\n");

        let service = offline_service();
        let result = service
            .sync_single_file("p1", src.path(), storage.path(), "a.ts")
            .await;

        assert_eq!(result.updated_count, 1);
        assert!(result.nodes.iter().any(|n| n.name == "foo"));
        assert!(load_manifest(storage.path()).contains_key("a.ts"));
    }

    #[test]
    fn extension_normalization() {
        let set = normalize_extensions(&[".TS".into(), "py".into(), "".into()]);
        assert!(set.contains("ts"));
        assert!(set.contains("py"));
        assert_eq!(set.len(), 2);

        assert!(extension_allowed(Path::new("x.ts"), &set));
        assert!(extension_allowed(Path::new("x.PY"), &set));
        assert!(!extension_allowed(Path::new("x.rs"), &set));
        assert!(extension_allowed(Path::new("anything"), &HashSet::new()));
    }

    #[test]
    fn hash_combines_size_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "hello").unwrap();

        let hash = calculate_file_hash(&path);
        let parts: Vec<&str> = hash.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "5");

        assert_eq!(calculate_file_hash(Path::new("/no/such/file")), "err");
    }

    #[test]
    fn tree_renderer_uses_box_drawing() {
        let files = vec![
            "src/a.ts".to_string(),
            "src/lib/b.ts".to_string(),
            "README.md".to_string(),
        ];
        let tree = render_tree("demo", &files);
        assert!(tree.starts_with("demo/\n"));
        assert!(tree.contains("├── src/"));
        assert!(tree.contains("└── README.md"));
        assert!(tree.contains("│   └── b.ts") || tree.contains("    └── b.ts"));
    }
}
