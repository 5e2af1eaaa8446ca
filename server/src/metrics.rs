//! Process metrics.
//!
//! Plain atomic counters, rendered in the Prometheus text exposition
//! format on `GET /metrics`. These counters are the only shared
//! mutable state in the server.

use std::sync::atomic::{AtomicU64, Ordering};

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from a configured store tier.
    Hit,

    /// Served from an upstream cache.
    Remote,

    /// Nobody had it.
    Miss,
}

impl CacheStatus {
    /// The `X-Cache` header value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Remote => "REMOTE",
            Self::Miss => "MISS",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Remote => "remote",
            Self::Miss => "miss",
        }
    }
}

/// Global counters.
#[derive(Debug, Default)]
pub struct Metrics {
    narinfo_hits: AtomicU64,
    narinfo_remote: AtomicU64,
    narinfo_misses: AtomicU64,

    nar_hits: AtomicU64,
    nar_remote: AtomicU64,
    nar_misses: AtomicU64,

    pub ingested_chunks: AtomicU64,
    pub ingested_bytes: AtomicU64,
    pub deduplicated_chunks: AtomicU64,
    pub ingest_failures: AtomicU64,

    pub copy_successes: AtomicU64,
    pub copy_failures: AtomicU64,

    pub gc_chunks_removed: AtomicU64,
    pub gc_indices_removed: AtomicU64,
    pub corrupt_chunks: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of a narinfo or NAR request.
    pub fn record_request(&self, is_nar: bool, status: CacheStatus) {
        let counter = match (is_nar, status) {
            (false, CacheStatus::Hit) => &self.narinfo_hits,
            (false, CacheStatus::Remote) => &self.narinfo_remote,
            (false, CacheStatus::Miss) => &self.narinfo_misses,
            (true, CacheStatus::Hit) => &self.nar_hits,
            (true, CacheStatus::Remote) => &self.nar_remote,
            (true, CacheStatus::Miss) => &self.nar_misses,
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders all counters in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        let requests: [(&str, &str, &AtomicU64); 6] = [
            ("narinfo", CacheStatus::Hit.label(), &self.narinfo_hits),
            ("narinfo", CacheStatus::Remote.label(), &self.narinfo_remote),
            ("narinfo", CacheStatus::Miss.label(), &self.narinfo_misses),
            ("nar", CacheStatus::Hit.label(), &self.nar_hits),
            ("nar", CacheStatus::Remote.label(), &self.nar_remote),
            ("nar", CacheStatus::Miss.label(), &self.nar_misses),
        ];

        out.push_str("# TYPE granary_requests_total counter\n");
        for (kind, status, counter) in requests {
            out.push_str(&format!(
                "granary_requests_total{{kind=\"{}\",status=\"{}\"}} {}\n",
                kind,
                status,
                counter.load(Ordering::Relaxed)
            ));
        }

        let counters: [(&str, &AtomicU64); 9] = [
            ("granary_ingested_chunks_total", &self.ingested_chunks),
            ("granary_ingested_bytes_total", &self.ingested_bytes),
            ("granary_deduplicated_chunks_total", &self.deduplicated_chunks),
            ("granary_ingest_failures_total", &self.ingest_failures),
            ("granary_copy_successes_total", &self.copy_successes),
            ("granary_copy_failures_total", &self.copy_failures),
            ("granary_gc_chunks_removed_total", &self.gc_chunks_removed),
            ("granary_gc_indices_removed_total", &self.gc_indices_removed),
            ("granary_corrupt_chunks_total", &self.corrupt_chunks),
        ];

        for (name, counter) in counters {
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, counter.load(Ordering::Relaxed)));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let metrics = Metrics::new();
        metrics.record_request(false, CacheStatus::Hit);
        metrics.record_request(true, CacheStatus::Remote);
        metrics.ingested_chunks.fetch_add(7, Ordering::Relaxed);

        let rendered = metrics.render();

        assert!(rendered
            .contains("granary_requests_total{kind=\"narinfo\",status=\"hit\"} 1"));
        assert!(rendered.contains("granary_requests_total{kind=\"nar\",status=\"remote\"} 1"));
        assert!(rendered.contains("granary_requests_total{kind=\"nar\",status=\"miss\"} 0"));
        assert!(rendered.contains("granary_ingested_chunks_total 7"));
    }
}
