use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Back-pressure counters shared by the fanout channels.
#[derive(Debug, Default)]
pub struct FanoutMetrics {
    pub droppable_skip_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub overflow_count: AtomicU64,
}

impl FanoutMetrics {
    pub fn snapshot(&self) -> FanoutMetricsSnapshot {
        FanoutMetricsSnapshot {
            droppable_skip_total: self.droppable_skip_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FanoutMetricsSnapshot {
    pub droppable_skip_total: u64,
    pub dropped_total: u64,
    pub overflow_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RingEvent {
    pub id: u64,
    pub method: String,
    pub payload: Value,
    pub ts: u64,
}

#[derive(Debug, Clone)]
pub struct DebugRingConfig {
    pub capacity: usize,
    /// 1-in-N ingress sampling for high-frequency methods.
    pub sample_every: u64,
    /// Overflow log sampling for high-frequency methods after the first.
    pub overflow_log_every: u64,
    pub high_freq_markers: Vec<String>,
}

impl Default for DebugRingConfig {
    fn default() -> Self {
        Self {
            capacity: 2048,
            sample_every: 5,
            overflow_log_every: 1000,
            high_freq_markers: vec![
                "delta".to_string(),
                "output".to_string(),
                "rateLimits/updated".to_string(),
                "ui/state/changed".to_string(),
            ],
        }
    }
}

/// Fixed-capacity ring of recent normalized events for long-poll debugging.
/// Disabled by default; when disabled every publish is a no-op. High
/// frequency methods are sampled on ingress so a delta storm cannot evict
/// the interesting events.
pub struct DebugRing {
    config: DebugRingConfig,
    enabled: AtomicBool,
    next_id: AtomicU64,
    events: RwLock<VecDeque<RingEvent>>,
    ingress_counters: Mutex<HashMap<String, u64>>,
    overflow_logged: AtomicBool,
    metrics: FanoutMetrics,
}

impl DebugRing {
    pub fn new(config: DebugRingConfig) -> Self {
        Self {
            config,
            enabled: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            events: RwLock::new(VecDeque::new()),
            ingress_counters: Mutex::new(HashMap::new()),
            overflow_logged: AtomicBool::new(false),
            metrics: FanoutMetrics::default(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> &FanoutMetrics {
        &self.metrics
    }

    pub fn max_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    fn is_high_freq(&self, method: &str) -> bool {
        self.config
            .high_freq_markers
            .iter()
            .any(|marker| method.contains(marker.as_str()))
    }

    pub fn publish(&self, method: &str, payload: Value, ts: u64) {
        if !self.enabled() {
            return;
        }

        let high_freq = self.is_high_freq(method);
        if high_freq {
            let n = {
                let mut counters = self.ingress_counters.lock().unwrap();
                let counter = counters.entry(method.to_string()).or_insert(0);
                *counter += 1;
                *counter
            };
            if n % self.config.sample_every != 0 {
                self.metrics
                    .droppable_skip_total
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut events = self.events.write().unwrap();
        events.push_back(RingEvent {
            id,
            method: method.to_string(),
            payload,
            ts,
        });
        while events.len() > self.config.capacity {
            events.pop_front();
            let overflowed = self.metrics.overflow_count.fetch_add(1, Ordering::Relaxed) + 1;
            if !self.overflow_logged.swap(true, Ordering::Relaxed) {
                tracing::warn!(method, overflowed, "debug ring overflow, dropping oldest");
            } else if !high_freq || overflowed % self.config.overflow_log_every == 0 {
                tracing::warn!(method, overflowed, "debug ring overflow (sampled)");
            }
        }
    }

    /// Long-poll read. A first poll (`after == 0`) returns no events and the
    /// current max id so the client learns its starting position without
    /// missing anything published afterwards.
    pub fn poll(&self, after: u64, limit: usize) -> (Vec<RingEvent>, u64) {
        let max_id = self.max_id();
        if after == 0 {
            return (Vec::new(), max_id);
        }
        let events = self.events.read().unwrap();
        let out = events
            .iter()
            .filter(|e| e.id > after)
            .take(limit.max(1))
            .cloned()
            .collect();
        (out, max_id)
    }
}
