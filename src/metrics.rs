//! Gateway Metrics
//!
//! Counters and latency histograms recorded at the gateway boundaries and
//! exported in Prometheus text format on `/metrics`. Plain atomics keep the
//! hot path allocation-free; rendering walks the registry once per scrape.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket upper bounds in seconds (Prometheus defaults).
const BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct Histogram {
    counts: [AtomicU64; BUCKETS.len()],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        for (i, bound) in BUCKETS.iter().enumerate() {
            if secs <= *bound {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String, name: &str, op: &str) {
        let mut cumulative = 0u64;
        for (i, bound) in BUCKETS.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "{}_bucket{{type=\"{}\",le=\"{}\"}} {}",
                name, op, bound, cumulative
            );
        }
        let total = self.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "{}_bucket{{type=\"{}\",le=\"+Inf\"}} {}", name, op, total);
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "{}_sum{{type=\"{}\"}} {}", name, op, sum);
        let _ = writeln!(out, "{}_count{{type=\"{}\"}} {}", name, op, total);
    }
}

/// Registry of cache operation counters and latencies.
#[derive(Debug, Default)]
pub struct Metrics {
    get_hit: AtomicU64,
    get_miss: AtomicU64,
    get_error: AtomicU64,
    set_success: AtomicU64,
    set_error: AtomicU64,
    delete_success: AtomicU64,
    delete_error: AtomicU64,

    pub get_latency: Histogram,
    pub set_latency: Histogram,
    pub delete_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_get_hit(&self) {
        self.get_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_miss(&self) {
        self.get_miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_error(&self) {
        self.get_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self, success: bool) {
        let counter = if success { &self.set_success } else { &self.set_error };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self, success: bool) {
        let counter = if success {
            &self.delete_success
        } else {
            &self.delete_error
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.get_hit.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.get_miss.load(Ordering::Relaxed)
    }

    /// Exports the registry in Prometheus text format.
    pub fn to_prometheus_text(&self) -> String {
        let mut out = String::new();

        macro_rules! counter {
            ($name:expr, $help:expr, $($op:expr, $status:expr => $field:ident),+) => {
                let _ = writeln!(out, "# HELP {} {}", $name, $help);
                let _ = writeln!(out, "# TYPE {} counter", $name);
                $(
                    let _ = writeln!(
                        out,
                        "{}{{type=\"{}\",status=\"{}\"}} {}",
                        $name, $op, $status, self.$field.load(Ordering::Relaxed)
                    );
                )+
            };
        }

        counter!(
            "cache_operations_total", "The total number of cache operations",
            "get", "hit" => get_hit,
            "get", "miss" => get_miss,
            "get", "error" => get_error,
            "set", "success" => set_success,
            "set", "error" => set_error,
            "delete", "success" => delete_success,
            "delete", "error" => delete_error
        );

        let _ = writeln!(out, "# HELP cache_hits_total The total number of cache hits");
        let _ = writeln!(out, "# TYPE cache_hits_total counter");
        let _ = writeln!(out, "cache_hits_total {}", self.hits());
        let _ = writeln!(out, "# HELP cache_misses_total The total number of cache misses");
        let _ = writeln!(out, "# TYPE cache_misses_total counter");
        let _ = writeln!(out, "cache_misses_total {}", self.misses());

        let _ = writeln!(
            out,
            "# HELP cache_duration_seconds The latency of cache operations"
        );
        let _ = writeln!(out, "# TYPE cache_duration_seconds histogram");
        self.get_latency.render(&mut out, "cache_duration_seconds", "get");
        self.set_latency.render(&mut out, "cache_duration_seconds", "set");
        self.delete_latency
            .render(&mut out, "cache_duration_seconds", "delete");

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_get_hit();
        metrics.record_get_hit();
        metrics.record_get_miss();
        metrics.record_set(true);
        metrics.record_set(false);
        metrics.record_delete(true);

        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.misses(), 1);

        let text = metrics.to_prometheus_text();
        assert!(text.contains("cache_operations_total{type=\"get\",status=\"hit\"} 2"));
        assert!(text.contains("cache_operations_total{type=\"set\",status=\"error\"} 1"));
        assert!(text.contains("cache_hits_total 2"));
        assert!(text.contains("cache_misses_total 1"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = Metrics::new();
        metrics.get_latency.observe(Duration::from_millis(1));
        metrics.get_latency.observe(Duration::from_millis(30));
        metrics.get_latency.observe(Duration::from_secs(20));

        assert_eq!(metrics.get_latency.count(), 3);
        let text = metrics.to_prometheus_text();
        assert!(text.contains("cache_duration_seconds_bucket{type=\"get\",le=\"0.005\"} 1"));
        assert!(text.contains("cache_duration_seconds_bucket{type=\"get\",le=\"0.05\"} 2"));
        assert!(text.contains("cache_duration_seconds_bucket{type=\"get\",le=\"+Inf\"} 3"));
        assert!(text.contains("cache_duration_seconds_count{type=\"get\"} 3"));
    }
}
