//! Atomic duplication statistics and the named provider registry.
//!
//! Counters use `Relaxed` ordering — they are monotonic display counters
//! with no synchronization requirements, incremented from any worker and
//! read concurrently by the reporting path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

#[derive(Default)]
struct StatsInner {
    duplicated: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    sampled_out: AtomicU64,
    unmatched: AtomicU64,
}

/// Thread-safe duplication statistics. Cheap to clone (Arc).
#[derive(Clone, Default)]
pub struct DispatchStats {
    inner: Arc<StatsInner>,
}

/// Snapshot of current stats values, serializable to JSON.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub duplicated: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub dropped: u64,
    pub sampled_out: u64,
    pub unmatched: u64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_duplicated(&self) {
        self.inner.duplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, n: u64) {
        self.inner.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_sampled_out(&self) {
        self.inner.sampled_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unmatched(&self) {
        self.inner.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicated(&self) -> u64 {
        self.inner.duplicated.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.inner.timeouts.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            duplicated: self.inner.duplicated.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            sampled_out: self.inner.sampled_out.load(Ordering::Relaxed),
            unmatched: self.inner.unmatched.load(Ordering::Relaxed),
        }
    }
}

/// A named zero-argument string-producing callback.
pub type StatProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Registry of named stat providers, polled by the host's reporting path.
#[derive(Clone, Default)]
pub struct StatsRegistry {
    providers: Arc<Mutex<Vec<(String, StatProvider)>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named provider. Later registrations with the same name are
    /// kept alongside earlier ones; names are conventionally unique.
    pub fn register(&self, name: &str, provider: StatProvider) {
        self.providers
            .lock()
            .expect("stats registry poisoned")
            .push((name.to_string(), provider));
    }

    /// Poll every provider once.
    pub fn poll(&self) -> Vec<(String, String)> {
        self.providers
            .lock()
            .expect("stats registry poisoned")
            .iter()
            .map(|(name, provider)| (name.clone(), provider()))
            .collect()
    }

    /// One report line in `name: value` pairs, for the periodic stats log.
    pub fn report_line(&self) -> String {
        self.poll()
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Register the engine's default providers: outbound timeout count and
/// duplicated request count.
pub fn register_default_providers(registry: &StatsRegistry, stats: &DispatchStats) {
    let s = stats.clone();
    registry.register("#TmOut", Arc::new(move || s.timeouts().to_string()));
    let s = stats.clone();
    registry.register("#DupReq", Arc::new(move || s.duplicated().to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_the_snapshot() {
        let stats = DispatchStats::new();
        stats.inc_duplicated();
        stats.inc_duplicated();
        stats.inc_timeouts();
        stats.add_dropped(3);
        stats.inc_sampled_out();
        stats.inc_unmatched();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                duplicated: 2,
                timeouts: 1,
                errors: 0,
                dropped: 3,
                sampled_out: 1,
                unmatched: 1,
            }
        );
    }

    #[test]
    fn registry_polls_named_providers() {
        let registry = StatsRegistry::new();
        let stats = DispatchStats::new();
        register_default_providers(&registry, &stats);

        stats.inc_duplicated();
        stats.inc_timeouts();
        stats.inc_timeouts();

        let polled = registry.poll();
        assert!(polled.contains(&("#TmOut".to_string(), "2".to_string())));
        assert!(polled.contains(&("#DupReq".to_string(), "1".to_string())));

        let line = registry.report_line();
        assert!(line.contains("#TmOut: 2"));
        assert!(line.contains("#DupReq: 1"));
    }
}
