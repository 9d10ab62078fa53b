//! Process telemetry: global metric atomics, the 2 Hz collector task, and
//! the bounded mission/trace ring buffers.
//!
//! The atomics are the inter-thread contract. Each has one documented
//! writer (retrieval writes `VECTOR_LATENCY_MS` and `GRAPH_NODES_SCANNED`;
//! the LLM client writes `EMBEDDING_LATENCY_MS`, `LLM_GENERATION_MS` and
//! `OUTPUT_TOKENS`), and the collector snapshots all of them every 500 ms.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{MissionRecord, TraceEntry};

// ─── Global metric atomics ───────────────────────────────────────────────────

/// Latency of the last retrieval pipeline run. Writer: RetrievalEngine.
pub static VECTOR_LATENCY_MS: AtomicU64 = AtomicU64::new(0);
/// Latency of the last embedding call. Writer: LLM client.
pub static EMBEDDING_LATENCY_MS: AtomicU64 = AtomicU64::new(0);
/// Latency of the last text generation. Writer: LLM client.
pub static LLM_GENERATION_MS: AtomicU64 = AtomicU64::new(0);
/// Completion tokens of the last generation. Writer: LLM client.
pub static OUTPUT_TOKENS: AtomicU64 = AtomicU64::new(0);
/// Nodes touched by the last graph expansion. Writer: RetrievalEngine.
pub static GRAPH_NODES_SCANNED: AtomicU64 = AtomicU64::new(0);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub fn store_ms(metric: &AtomicU64, ms: f64) {
    metric.store(ms.to_bits(), Ordering::Relaxed);
}

pub fn load_ms(metric: &AtomicU64) -> f64 {
    f64::from_bits(metric.load(Ordering::Relaxed))
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Sleep in 100 ms slices so a shutdown request is observed promptly even
/// mid-backoff.
pub async fn smart_sleep(duration: Duration) {
    let slice = Duration::from_millis(100);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if shutdown_requested() {
            return;
        }
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub cpu_usage: f64,
    pub ram_usage_mb: u64,
    pub ram_total_mb: u64,
    pub vector_latency_ms: f64,
    pub embedding_latency_ms: f64,
    pub llm_generation_ms: f64,
    pub output_tokens: u64,
    pub tokens_per_second: f64,
    pub graph_nodes_scanned: u64,
}

#[derive(Default)]
struct CpuState {
    prev_idle: u64,
    prev_total: u64,
}

impl CpuState {
    /// CPU% since the previous sample, from /proc/stat aggregates.
    fn sample(&mut self) -> f64 {
        let Some((idle, total)) = read_proc_stat() else {
            return 0.0;
        };
        let total_diff = total.saturating_sub(self.prev_total);
        let idle_diff = idle.saturating_sub(self.prev_idle);
        self.prev_idle = idle;
        self.prev_total = total;

        if total_diff == 0 {
            return 0.0;
        }
        (total_diff - idle_diff) as f64 / total_diff as f64 * 100.0
    }
}

#[cfg(target_os = "linux")]
fn read_proc_stat() -> Option<(u64, u64)> {
    let raw = std::fs::read_to_string("/proc/stat").ok()?;
    let line = raw.lines().next()?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 8 {
        return None;
    }
    let idle = fields[3] + fields[4];
    let total: u64 = fields.iter().take(8).sum();
    Some((idle, total))
}

#[cfg(not(target_os = "linux"))]
fn read_proc_stat() -> Option<(u64, u64)> {
    None
}

#[cfg(target_os = "linux")]
fn read_memory_mb() -> (u64, u64) {
    let page_kb = 4; // page size / 1024 on every supported target
    let rss_mb = std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
        })
        .map(|pages| pages * page_kb / 1024)
        .unwrap_or(0);
    let total_mb = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("MemTotal:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok())
        })
        .map(|kb| kb / 1024)
        .unwrap_or(0);
    (rss_mb, total_mb)
}

#[cfg(not(target_os = "linux"))]
fn read_memory_mb() -> (u64, u64) {
    (0, 0)
}

/// Polls OS counters and the metric atomics on an owned task, twice a second.
pub struct TelemetryCollector {
    latest: Arc<Mutex<TelemetrySnapshot>>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self {
            latest: Arc::new(Mutex::new(TelemetrySnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.latest.lock().clone()
    }

    /// Spawn the poll loop. The task exits when shutdown is requested.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let latest = Arc::clone(&self.latest);
        tokio::spawn(async move {
            let mut cpu = CpuState::default();
            while !shutdown_requested() {
                let snapshot = collect(&mut cpu);
                *latest.lock() = snapshot;
                smart_sleep(Duration::from_millis(500)).await;
            }
        })
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn collect(cpu: &mut CpuState) -> TelemetrySnapshot {
    let (ram_usage_mb, ram_total_mb) = read_memory_mb();
    let llm_generation_ms = load_ms(&LLM_GENERATION_MS);
    let output_tokens = OUTPUT_TOKENS.load(Ordering::Relaxed);

    let tokens_per_second = if llm_generation_ms > 0.0 {
        output_tokens as f64 / llm_generation_ms * 1000.0
    } else {
        0.0
    };

    TelemetrySnapshot {
        cpu_usage: cpu.sample(),
        ram_usage_mb,
        ram_total_mb,
        vector_latency_ms: load_ms(&VECTOR_LATENCY_MS),
        embedding_latency_ms: load_ms(&EMBEDDING_LATENCY_MS),
        llm_generation_ms,
        output_tokens,
        tokens_per_second,
        graph_nodes_scanned: GRAPH_NODES_SCANNED.load(Ordering::Relaxed),
    }
}

// ─── Ring buffers ────────────────────────────────────────────────────────────

/// Append-only deque capped at `capacity`; oldest entries drop first.
/// Reads are newest-first snapshots under the buffer's lock.
pub struct RingBuffer<T: Clone> {
    entries: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn push(&self, entry: T) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn snapshot_newest_first(&self) -> Vec<T> {
        self.entries.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type MissionLogBuffer = RingBuffer<MissionRecord>;
pub type TraceBuffer = RingBuffer<TraceEntry>;

pub const LOG_BUFFER_CAPACITY: usize = 100;
