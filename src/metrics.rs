//! Lightweight request metrics, ported from the teacher's `rfdb::metrics`
//! and retargeted from graph queries to the core's own operations
//! (`metadata_add`, `metadata_scan`, engine `add`/`scan`). Ambient —
//! carried regardless of spec.md's Non-goals (§9 "CARRY AN AMBIENT STACK").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

const LATENCY_WINDOW_SIZE: usize = 1000;
const MAX_SLOW_OPERATIONS: usize = 10;

/// Operations taking longer than this are tracked separately for
/// debugging. Catalog1's `slow_sign` over a large function body is the
/// operation most likely to cross this line.
pub const SLOW_OPERATION_THRESHOLD_MS: u64 = 100;

/// The operation kinds this collector distinguishes. `Other` absorbs
/// anything not named here so a caller can't panic the collector by
/// passing an unrecognized label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    MetadataAdd,
    MetadataScan,
    MetadataGet,
    MetadataCreated,
    Checkin,
    EngineAdd,
    EngineScan,
    Other,
}

impl Operation {
    fn label(self) -> &'static str {
        match self {
            Operation::MetadataAdd => "metadata_add",
            Operation::MetadataScan => "metadata_scan",
            Operation::MetadataGet => "metadata_get",
            Operation::MetadataCreated => "metadata_created",
            Operation::Checkin => "checkin",
            Operation::EngineAdd => "engine_add",
            Operation::EngineScan => "engine_scan",
            Operation::Other => "other",
        }
    }

    fn all() -> [Operation; 8] {
        [
            Operation::MetadataAdd,
            Operation::MetadataScan,
            Operation::MetadataGet,
            Operation::MetadataCreated,
            Operation::Checkin,
            Operation::EngineAdd,
            Operation::EngineScan,
            Operation::Other,
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlowOperation {
    pub operation: &'static str,
    pub duration_ms: u64,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationStat {
    pub operation: &'static str,
    pub count: u64,
    pub avg_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub slow_operation_count: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub latency_avg_ms: u64,
    pub top_slow_operations: Vec<SlowOperation>,
    pub uptime_secs: u64,
    pub op_stats: Vec<OperationStat>,
    #[serde(rename = "memoryPercent")]
    pub memory_percent: f32,
}

/// System memory usage percentage, queried fresh on every call. Returns
/// `0.0` if the host's memory counters aren't readable rather than erroring
/// `/stats` out over an ambient reporting concern.
fn check_memory_usage() -> f32 {
    use sysinfo::System;
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    let used = sys.used_memory();
    (used as f64 / total as f64 * 100.0) as f32
}

struct Counter {
    count: AtomicU64,
    latency_sum_ms: AtomicU64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            latency_sum_ms: AtomicU64::new(0),
        }
    }
}

/// Thread-safe request metrics collector. One instance per server,
/// wrapped in `Arc` and shared across every request handler.
pub struct Metrics {
    request_count: AtomicU64,
    slow_operation_count: AtomicU64,
    latencies_ms: Mutex<VecDeque<u64>>,
    latency_sum_ms: AtomicU64,
    counters: [Counter; 8],
    slow_operations: Mutex<VecDeque<SlowOperation>>,
    started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn index_of(op: Operation) -> usize {
    Operation::all().iter().position(|&o| o == op).unwrap()
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            slow_operation_count: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            latency_sum_ms: AtomicU64::new(0),
            counters: Default::default(),
            slow_operations: Mutex::new(VecDeque::with_capacity(MAX_SLOW_OPERATIONS)),
            started_at: Instant::now(),
        }
    }

    /// Record one completed operation. Call this after the operation
    /// finishes, successful or not — metrics track volume and latency, not
    /// outcome (spec.md §7 error kinds are a separate concern).
    pub fn record(&self, operation: Operation, duration_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let counter = &self.counters[index_of(operation)];
        counter.count.fetch_add(1, Ordering::Relaxed);
        counter.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);

        {
            let mut latencies = self.latencies_ms.lock().unwrap();
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                if let Some(old) = latencies.pop_front() {
                    self.latency_sum_ms.fetch_sub(old, Ordering::Relaxed);
                }
            }
            latencies.push_back(duration_ms);
            self.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        }

        if duration_ms >= SLOW_OPERATION_THRESHOLD_MS {
            self.slow_operation_count.fetch_add(1, Ordering::Relaxed);
            let entry = SlowOperation {
                operation: operation.label(),
                duration_ms,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            };
            let mut slow = self.slow_operations.lock().unwrap();
            if slow.len() >= MAX_SLOW_OPERATIONS {
                slow.pop_front();
            }
            slow.push_back(entry);
        }
    }

    /// Time `f` and record it under `operation`, returning `f`'s result.
    pub fn time<T>(&self, operation: Operation, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.record(operation, start.elapsed().as_millis() as u64);
        result
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let latencies = self.latencies_ms.lock().unwrap();
            if latencies.is_empty() {
                (0, 0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();
                let len = sorted.len();
                let p50 = sorted[len * 50 / 100];
                let p95 = sorted[len * 95 / 100];
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                let avg = self.latency_sum_ms.load(Ordering::Relaxed) / len as u64;
                (p50, p95, p99, avg)
            }
        };

        let mut op_stats: Vec<OperationStat> = Operation::all()
            .into_iter()
            .map(|op| {
                let counter = &self.counters[index_of(op)];
                let count = counter.count.load(Ordering::Relaxed);
                let sum = counter.latency_sum_ms.load(Ordering::Relaxed);
                OperationStat {
                    operation: op.label(),
                    count,
                    avg_ms: if count > 0 { sum / count } else { 0 },
                }
            })
            .filter(|s| s.count > 0)
            .collect();
        op_stats.sort_by(|a, b| b.count.cmp(&a.count));

        MetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            slow_operation_count: self.slow_operation_count.load(Ordering::Relaxed),
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            latency_avg_ms: avg,
            top_slow_operations: self.slow_operations.lock().unwrap().iter().cloned().collect(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            op_stats,
            memory_percent: check_memory_usage(),
        }
    }
}
