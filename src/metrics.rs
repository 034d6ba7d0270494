#![forbid(unsafe_code)]

// Server metrics — lock-free AtomicU64 counters and Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (in microseconds for internal storage).
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,      // 1ms
    5_000,      // 5ms
    10_000,     // 10ms
    25_000,     // 25ms
    50_000,     // 50ms
    100_000,    // 100ms
    250_000,    // 250ms
    500_000,    // 500ms
    1_000_000,  // 1s
    5_000_000,  // 5s
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// Cumulative bucket counters — bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 10],
    /// +Inf bucket (total count)
    count: AtomicU64,
    /// Sum of all observations in microseconds
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    /// Record a duration observation.
    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    /// Render in Prometheus text exposition format.
    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        let labels = [
            "0.001", "0.005", "0.01", "0.025", "0.05",
            "0.1", "0.25", "0.5", "1", "5",
        ];
        for (i, label) in labels.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        // Convert microseconds to seconds with 6 decimal places
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    // Monotonic counters
    connections_total: AtomicU64,
    frames_received_total: AtomicU64,
    frames_sent_total: AtomicU64,
    acks_total: AtomicU64,
    nacks_total: AtomicU64,
    errors_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    chat_messages_total: AtomicU64,
    chat_duplicates_total: AtomicU64,
    call_relays_total: AtomicU64,
    evictions_total: AtomicU64,

    // Gauge
    connections_active: AtomicU64,

    // Histogram
    event_handling: Histogram,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                frames_received_total: AtomicU64::new(0),
                frames_sent_total: AtomicU64::new(0),
                acks_total: AtomicU64::new(0),
                nacks_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                chat_messages_total: AtomicU64::new(0),
                chat_duplicates_total: AtomicU64::new(0),
                call_relays_total: AtomicU64::new(0),
                evictions_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                event_handling: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_frames_received(&self) {
        self.inner.frames_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_frames_sent(&self) {
        self.inner.frames_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_acks(&self) {
        self.inner.acks_total.fetch_add(1, Relaxed);
    }

    pub fn inc_nacks(&self) {
        self.inner.nacks_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_chat_messages(&self) {
        self.inner.chat_messages_total.fetch_add(1, Relaxed);
    }

    pub fn inc_chat_duplicates(&self) {
        self.inner.chat_duplicates_total.fetch_add(1, Relaxed);
    }

    pub fn inc_call_relays(&self) {
        self.inner.call_relays_total.fetch_add(1, Relaxed);
    }

    pub fn inc_evictions(&self) {
        self.inner.evictions_total.fetch_add(1, Relaxed);
    }

    // --- Gauge ---

    /// Increments connections_active and returns an RAII guard that decrements on drop.
    /// This guarantees the gauge is decremented even if the connection task panics.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    // --- Histogram ---

    pub fn observe_event_handling(&self, duration: Duration) {
        self.inner.event_handling.observe(duration);
    }

    // --- Prometheus rendering ---

    /// Render all metrics in Prometheus text exposition format.
    /// `rooms_active` and `users_active` are read from the registry on demand.
    pub fn render_prometheus(&self, rooms_active: usize, users_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        let i = &self.inner;

        // Counters
        render_counter(&mut out, "roomwire_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "roomwire_frames_received_total", "Total frames received from clients", i.frames_received_total.load(Relaxed));
        render_counter(&mut out, "roomwire_frames_sent_total", "Total frames sent to clients", i.frames_sent_total.load(Relaxed));
        render_counter(&mut out, "roomwire_acks_total", "Total acknowledgements sent", i.acks_total.load(Relaxed));
        render_counter(&mut out, "roomwire_nacks_total", "Total negative acknowledgements sent", i.nacks_total.load(Relaxed));
        render_counter(&mut out, "roomwire_errors_total", "Total errors", i.errors_total.load(Relaxed));
        render_counter(&mut out, "roomwire_joins_total", "Total room joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "roomwire_leaves_total", "Total room leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "roomwire_chat_messages_total", "Total chat messages delivered", i.chat_messages_total.load(Relaxed));
        render_counter(&mut out, "roomwire_chat_duplicates_total", "Total duplicate chat sends replayed", i.chat_duplicates_total.load(Relaxed));
        render_counter(&mut out, "roomwire_call_relays_total", "Total call signals relayed", i.call_relays_total.load(Relaxed));
        render_counter(&mut out, "roomwire_evictions_total", "Total voice connections evicted", i.evictions_total.load(Relaxed));

        // Gauges
        render_gauge(&mut out, "roomwire_connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "roomwire_rooms_active", "Rooms with at least one attached connection", rooms_active as u64);
        render_gauge(&mut out, "roomwire_users_active", "Distinct connected users", users_active as u64);

        // Histogram
        i.event_handling.render(
            "roomwire_event_handling_seconds",
            "Event handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// RAII guard that decrements `connections_active` on drop.
/// Prevents gauge underflow/drift if the connection handler panics.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_guard_decrements_on_drop() {
        let metrics = ServerMetrics::new();
        {
            let _a = metrics.connection_active_guard();
            let _b = metrics.connection_active_guard();
            assert_eq!(metrics.inner.connections_active.load(Relaxed), 2);
        }
        assert_eq!(metrics.inner.connections_active.load(Relaxed), 0);
    }

    #[test]
    fn render_includes_all_series() {
        let metrics = ServerMetrics::new();
        metrics.inc_chat_messages();
        metrics.observe_event_handling(Duration::from_millis(2));
        let out = metrics.render_prometheus(3, 5);
        assert!(out.contains("roomwire_chat_messages_total 1"));
        assert!(out.contains("roomwire_rooms_active 3"));
        assert!(out.contains("roomwire_users_active 5"));
        assert!(out.contains("roomwire_event_handling_seconds_bucket{le=\"0.005\"} 1"));
    }
}
