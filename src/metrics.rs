#![forbid(unsafe_code)]

// Server metrics - lock-free counters and a Prometheus-compatible latency histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Bucket upper bounds in microseconds, paired with their `le` label
const BUCKETS: [(u64, &str); 8] = [
    (500, "0.0005"),
    (1_000, "0.001"),
    (5_000, "0.005"),
    (25_000, "0.025"),
    (100_000, "0.1"),
    (500_000, "0.5"),
    (2_500_000, "2.5"),
    (10_000_000, "10"),
];

/// Cumulative histogram with fixed buckets
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
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

    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    errors: AtomicU64,
    sessions_created: AtomicU64,
    sessions_destroyed: AtomicU64,
    host_elections: AtomicU64,
    offers_created: AtomicU64,
    broadcast_failures: AtomicU64,
}

struct Inner {
    counters: Counters,
    connections_active: AtomicU64,
    message_handling: Histogram,
}

/// Server-wide metrics. Cloning shares the same counters.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time registry figures rendered as gauges
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrySnapshot {
    pub sessions: usize,
    pub members: usize,
    pub has_host: bool,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: Counters::default(),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.counters.connections.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.counters.messages_received.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.counters.messages_sent.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.counters.errors.fetch_add(1, Relaxed);
    }

    pub fn inc_sessions_created(&self) {
        self.inner.counters.sessions_created.fetch_add(1, Relaxed);
    }

    pub fn inc_sessions_destroyed(&self) {
        self.inner.counters.sessions_destroyed.fetch_add(1, Relaxed);
    }

    pub fn inc_host_elections(&self) {
        self.inner.counters.host_elections.fetch_add(1, Relaxed);
    }

    pub fn inc_offers_created(&self) {
        self.inner.counters.offers_created.fetch_add(1, Relaxed);
    }

    pub fn add_broadcast_failures(&self, n: usize) {
        self.inner.counters.broadcast_failures.fetch_add(n as u64, Relaxed);
    }

    /// Increments connections_active and returns a guard that decrements on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self, registry: RegistrySnapshot) -> String {
        let mut out = String::with_capacity(4096);
        let c = &self.inner.counters;

        let counters: [(&str, &str, &AtomicU64); 9] = [
            ("deskshare_connections_total", "Total WebSocket connections", &c.connections),
            ("deskshare_messages_received_total", "Total messages received from clients", &c.messages_received),
            ("deskshare_messages_sent_total", "Total messages sent to clients", &c.messages_sent),
            ("deskshare_errors_total", "Total message handling errors", &c.errors),
            ("deskshare_sessions_created_total", "Total sessions created", &c.sessions_created),
            ("deskshare_sessions_destroyed_total", "Total sessions destroyed", &c.sessions_destroyed),
            ("deskshare_host_elections_total", "Total host elections", &c.host_elections),
            ("deskshare_offers_created_total", "Total WebRTC offers created", &c.offers_created),
            ("deskshare_broadcast_failures_total", "Total failed broadcast deliveries", &c.broadcast_failures),
        ];
        for (name, help, value) in counters {
            render_metric(&mut out, "counter", name, help, value.load(Relaxed));
        }

        render_metric(
            &mut out,
            "gauge",
            "deskshare_connections_active",
            "Currently active WebSocket connections",
            self.inner.connections_active.load(Relaxed),
        );
        render_metric(&mut out, "gauge", "deskshare_sessions_active", "Registered sessions", registry.sessions as u64);
        render_metric(&mut out, "gauge", "deskshare_members_connected", "Connected members", registry.members as u64);
        render_metric(&mut out, "gauge", "deskshare_has_host", "Whether a host is elected", registry.has_host as u64);

        self.inner.message_handling.render(
            "deskshare_message_handling_seconds",
            "Message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop, including on panic.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, kind: &str, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
