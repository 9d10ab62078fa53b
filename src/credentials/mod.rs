//! Rotating API credentials: an ordered key pool and an ordered model list,
//! each with a rotation cursor, plus the retry policy every remote call
//! goes through.
//!
//! Readers never block each other: the cursors are atomics and
//! `current_pair` only takes the shared lock. Rotation is a cursor bump;
//! deactivation and `refresh` take the write lock.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::{find_keys_file, load_keys_file, KeysFile};
use crate::error::{SynapseError, SynapseResult};
use crate::telemetry::smart_sleep;

pub const MAX_ATTEMPTS: u32 = 5;
const FAILURES_TO_DEACTIVATE: u32 = 3;

#[derive(Debug, Clone)]
struct ApiKey {
    key: String,
    active: bool,
    fail_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Quota,
    ServerError,
}

/// The outbound API identity for one attempt.
#[derive(Debug, Clone)]
pub struct CredentialPair {
    pub key: String,
    pub model: String,
    pub key_idx: usize,
    pub model_idx: usize,
}

struct PoolState {
    keys: Vec<ApiKey>,
    models: Vec<String>,
    serper: Option<String>,
}

pub struct CredentialPool {
    state: RwLock<PoolState>,
    key_cursor: AtomicUsize,
    model_cursor: AtomicUsize,
    keys_path: Option<PathBuf>,
}

/// Index of the active key the cursor currently lands on: the cursor
/// position modulo pool size, advanced past deactivated keys.
fn resolve_active_idx(keys: &[ApiKey], cursor: usize) -> Option<usize> {
    if keys.is_empty() {
        return None;
    }
    let start = cursor % keys.len();
    (0..keys.len())
        .map(|offset| (start + offset) % keys.len())
        .find(|&idx| keys[idx].active)
}

impl CredentialPool {
    pub fn from_keys_file(file: KeysFile, keys_path: Option<PathBuf>) -> Self {
        let keys = file
            .keys
            .iter()
            .map(|k| ApiKey {
                key: k.clone(),
                active: true,
                fail_count: 0,
            })
            .collect();
        Self {
            state: RwLock::new(PoolState {
                keys,
                models: file.model_order(),
                serper: file.serper.clone(),
            }),
            key_cursor: AtomicUsize::new(0),
            model_cursor: AtomicUsize::new(0),
            keys_path,
        }
    }

    /// Load from `keys.json`, searching `start_dir` and up to two parents.
    pub fn discover(start_dir: &Path) -> SynapseResult<Self> {
        let path = find_keys_file(start_dir)
            .ok_or_else(|| SynapseError::ConfigMissing("keys.json".into()))?;
        let file = load_keys_file(&path)?;
        tracing::info!(keys = file.keys.len(), models = file.model_order().len(), "credential vault loaded");
        Ok(Self::from_keys_file(file, Some(path)))
    }

    /// Current (key, model) identity. `None` when no active key remains.
    pub fn current_pair(&self) -> Option<CredentialPair> {
        let state = self.state.read();
        let key_idx = resolve_active_idx(&state.keys, self.key_cursor.load(Ordering::Relaxed))?;
        if state.models.is_empty() {
            return None;
        }
        let model_idx = self.model_cursor.load(Ordering::Relaxed) % state.models.len();
        Some(CredentialPair {
            key: state.keys[key_idx].key.clone(),
            model: state.models[model_idx].clone(),
            key_idx,
            model_idx,
        })
    }

    pub fn rotate_key(&self) {
        self.key_cursor.fetch_add(1, Ordering::Relaxed);
    }

    /// Advance to the next model and restart the key rotation for it.
    pub fn rotate_model(&self) {
        self.model_cursor.fetch_add(1, Ordering::Relaxed);
        self.key_cursor.store(0, Ordering::Relaxed);
    }

    /// Record a quota/server failure on the current key and rotate. Three
    /// consecutive failures deactivate the key.
    pub fn report_failure(&self, kind: FailureKind) {
        let mut state = self.state.write();
        let cursor = self.key_cursor.load(Ordering::Relaxed);
        if let Some(idx) = resolve_active_idx(&state.keys, cursor) {
            let key = &mut state.keys[idx];
            key.fail_count += 1;
            if key.fail_count >= FAILURES_TO_DEACTIVATE {
                key.active = false;
                tracing::warn!(key_index = idx, ?kind, "key decommissioned after repeated failures");
            }
        }
        drop(state);
        self.rotate_key();
    }

    /// Reread the credentials file. Heavy (file I/O under the write lock);
    /// call on startup or admin command only.
    pub fn refresh(&self) -> SynapseResult<()> {
        let path = self
            .keys_path
            .clone()
            .ok_or_else(|| SynapseError::ConfigMissing("keys.json".into()))?;
        let file = load_keys_file(&path)?;

        let mut state = self.state.write();
        state.keys = file
            .keys
            .iter()
            .map(|k| ApiKey {
                key: k.clone(),
                active: true,
                fail_count: 0,
            })
            .collect();
        state.models = file.model_order();
        state.serper = file.serper.clone();
        self.key_cursor.store(0, Ordering::Relaxed);
        self.model_cursor.store(0, Ordering::Relaxed);
        tracing::info!(keys = state.keys.len(), "credential vault refreshed");
        Ok(())
    }

    pub fn active_key_count(&self) -> usize {
        self.state.read().keys.iter().filter(|k| k.active).count()
    }

    pub fn key_count(&self) -> usize {
        self.state.read().keys.len()
    }

    pub fn model_count(&self) -> usize {
        self.state.read().models.len()
    }

    pub fn serper_key(&self) -> Option<String> {
        self.state.read().serper.clone()
    }

    /// Failure count for one key slot, for diagnostics.
    pub fn fail_count(&self, idx: usize) -> u32 {
        self.state
            .read()
            .keys
            .get(idx)
            .map(|k| k.fail_count)
            .unwrap_or(0)
    }
}

/// Run `op` under the standard retry policy: at most [`MAX_ATTEMPTS`]
/// attempts; recoverable failures (429/5xx) report to the pool and rotate;
/// backoff stays near-zero while unused keys remain, then grows `1s · 2ⁿ`
/// once the rotation has traversed every active key. Non-recoverable errors
/// surface immediately.
pub async fn with_retry<T, F, Fut>(pool: &CredentialPool, mut op: F) -> SynapseResult<T>
where
    F: FnMut(CredentialPair) -> Fut,
    Fut: Future<Output = SynapseResult<T>>,
{
    let mut rotations: u32 = 0;
    let mut last_error = String::new();

    for _attempt in 0..MAX_ATTEMPTS {
        let pair = pool
            .current_pair()
            .ok_or_else(|| SynapseError::ConfigMissing("no active API keys".into()))?;

        match op(pair).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_recoverable() => {
                last_error = err.to_string();
                let kind = match &err {
                    SynapseError::RateLimited { .. } => FailureKind::Quota,
                    _ => FailureKind::ServerError,
                };
                pool.report_failure(kind);
                rotations += 1;

                // Active count is re-read each attempt; mid-flight
                // deactivations tighten the threshold immediately.
                let active = pool.active_key_count() as u32;
                let backoff = if rotations < active.max(1) {
                    Duration::from_millis(10)
                } else {
                    let exp = rotations.saturating_sub(active.max(1)).min(6);
                    Duration::from_secs(1 << exp)
                };
                tracing::warn!(error = %last_error, ?backoff, "remote call failed; rotating");
                smart_sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }

    Err(SynapseError::RetriesExhausted {
        attempts: MAX_ATTEMPTS,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn pool(keys: &[&str], models: &[&str]) -> CredentialPool {
        CredentialPool::from_keys_file(
            KeysFile {
                keys: keys.iter().map(|s| s.to_string()).collect(),
                models: models.iter().map(|s| s.to_string()).collect(),
                primary: None,
                secondary: None,
                serper: None,
            },
            None,
        )
    }

    #[test]
    fn current_pair_reads_cursors() {
        let p = pool(&["k1", "k2"], &["m1", "m2"]);
        let pair = p.current_pair().unwrap();
        assert_eq!(pair.key, "k1");
        assert_eq!(pair.model, "m1");
        assert_eq!((pair.key_idx, pair.model_idx), (0, 0));
    }

    #[test]
    fn rotation_wraps() {
        let p = pool(&["k1", "k2"], &["m1"]);
        p.rotate_key();
        assert_eq!(p.current_pair().unwrap().key, "k2");
        p.rotate_key();
        assert_eq!(p.current_pair().unwrap().key, "k1");
    }

    #[test]
    fn rotate_model_resets_key_cursor() {
        let p = pool(&["k1", "k2"], &["m1", "m2"]);
        p.rotate_key();
        p.rotate_model();
        let pair = p.current_pair().unwrap();
        assert_eq!(pair.model, "m2");
        assert_eq!(pair.key, "k1");
    }

    #[test]
    fn three_failures_deactivate_and_skip() {
        let p = pool(&["k1", "k2"], &["m1"]);
        for _ in 0..3 {
            p.report_failure(FailureKind::Quota);
            // Pull the cursor back so the failures land on k1 each time.
            p.key_cursor.store(0, Ordering::Relaxed);
        }
        assert_eq!(p.active_key_count(), 1);
        // Cursor points at slot 0 but k1 is dead; resolution skips to k2.
        assert_eq!(p.current_pair().unwrap().key, "k2");
    }

    #[test]
    fn single_failure_rotates_and_counts() {
        let p = pool(&["k1", "k2"], &["m1"]);
        p.report_failure(FailureKind::Quota);
        assert_eq!(p.fail_count(0), 1);
        assert_eq!(p.current_pair().unwrap().key, "k2");
        assert_eq!(p.active_key_count(), 2);
    }

    #[test]
    fn empty_pool_yields_none() {
        let p = pool(&[], &["m1"]);
        assert!(p.current_pair().is_none());
    }

    #[test]
    fn refresh_rereads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, r#"{"keys": ["old"], "models": ["m"]}"#).unwrap();

        let p = CredentialPool::from_keys_file(load_keys_file(&path).unwrap(), Some(path.clone()));
        p.report_failure(FailureKind::ServerError);

        std::fs::write(&path, r#"{"keys": ["new1", "new2"], "models": ["m"]}"#).unwrap();
        p.refresh().unwrap();

        assert_eq!(p.key_count(), 2);
        assert_eq!(p.current_pair().unwrap().key, "new1");
        assert_eq!(p.fail_count(0), 0);
    }

    #[tokio::test]
    async fn retry_rotates_on_quota_then_succeeds() {
        let p = pool(&["k1", "k2"], &["m1"]);
        let calls = AtomicU32::new(0);

        let result = with_retry(&p, |pair| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    assert_eq!(pair.key, "k1");
                    Err(SynapseError::RateLimited {
                        key_index: pair.key_idx,
                    })
                } else {
                    assert_eq!(pair.key, "k2");
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(p.fail_count(0), 1);
    }

    #[tokio::test]
    async fn retry_fatal_on_protocol_error() {
        let p = pool(&["k1", "k2"], &["m1"]);
        let calls = AtomicU32::new(0);

        let result: SynapseResult<()> = with_retry(&p, |_pair| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(SynapseError::RemoteProtocol {
                    status: 400,
                    body: "bad".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(SynapseError::RemoteProtocol { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_after_max_attempts() {
        let p = pool(&["k1", "k2", "k3"], &["m1"]);
        let calls = AtomicU32::new(0);

        let result: SynapseResult<()> = with_retry(&p, |_pair| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SynapseError::RemoteUnavailable { status: 503 }) }
        })
        .await;

        assert!(matches!(
            result,
            Err(SynapseError::RetriesExhausted { attempts: 5, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
