//! Metrics Collection
//!
//! Atomic counters and a latency ring buffer, exposed in Prometheus text
//! format at /metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Server-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Total HTTP requests proxied
    total_requests: AtomicU64,
    /// Active tunnel count
    active_tunnels: AtomicU64,
    /// Status code counts
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    /// Total bytes in/out
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// Public L4 traffic
    tcp_conns: AtomicU64,
    udp_datagrams: AtomicU64,
    /// Rate-limit checks that failed open on a backend error
    ratelimit_failopen: AtomicU64,
    /// Latency tracking
    latencies: Mutex<LatencyHistogram>,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    /// Write position
    pos: usize,
    /// Total count
    count: u64,
    /// Sum for average
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum += latency_us;
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted: Vec<u64> = if self.count < self.values.len() as u64 {
            self.values[..count].to_vec()
        } else {
            self.values.clone()
        };
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_requests: AtomicU64::new(0),
                active_tunnels: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                tcp_conns: AtomicU64::new(0),
                udp_datagrams: AtomicU64::new(0),
                ratelimit_failopen: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
            }),
        }
    }

    /// Record a completed HTTP request
    pub async fn record_request(&self, status: u16, latency_us: u64, bytes_in: u64, bytes_out: u64) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);

        match status / 100 {
            2 => { self.inner.status_2xx.fetch_add(1, Ordering::Relaxed); }
            3 => { self.inner.status_3xx.fetch_add(1, Ordering::Relaxed); }
            4 => { self.inner.status_4xx.fetch_add(1, Ordering::Relaxed); }
            5 => { self.inner.status_5xx.fetch_add(1, Ordering::Relaxed); }
            _ => {}
        }

        self.inner.latencies.lock().await.record(latency_us);
    }

    /// Increment active tunnel count
    pub fn tunnel_opened(&self) {
        self.inner.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active tunnel count
    pub fn tunnel_closed(&self) {
        self.inner.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn tcp_conn_accepted(&self) {
        self.inner.tcp_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_datagram(&self, bytes: u64) {
        self.inner.udp_datagrams.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A rate-limit check errored and was allowed through
    pub fn ratelimit_failopen(&self) {
        self.inner.ratelimit_failopen.fetch_add(1, Ordering::Relaxed);
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        format!(
r#"# HELP tunlink_requests_total Total number of HTTP requests proxied
# TYPE tunlink_requests_total counter
tunlink_requests_total {}

# HELP tunlink_active_tunnels Number of active tunnel connections
# TYPE tunlink_active_tunnels gauge
tunlink_active_tunnels {}

# HELP tunlink_requests_by_status Requests by HTTP status class
# TYPE tunlink_requests_by_status counter
tunlink_requests_by_status{{status="2xx"}} {}
tunlink_requests_by_status{{status="3xx"}} {}
tunlink_requests_by_status{{status="4xx"}} {}
tunlink_requests_by_status{{status="5xx"}} {}

# HELP tunlink_bytes_total Total bytes transferred
# TYPE tunlink_bytes_total counter
tunlink_bytes_total{{direction="in"}} {}
tunlink_bytes_total{{direction="out"}} {}

# HELP tunlink_tcp_connections_total Public TCP/TLS connections accepted
# TYPE tunlink_tcp_connections_total counter
tunlink_tcp_connections_total {}

# HELP tunlink_udp_datagrams_total Public UDP datagrams relayed
# TYPE tunlink_udp_datagrams_total counter
tunlink_udp_datagrams_total {}

# HELP tunlink_ratelimit_failopen_total Rate-limit checks allowed through on backend error
# TYPE tunlink_ratelimit_failopen_total counter
tunlink_ratelimit_failopen_total {}

# HELP tunlink_latency_us Request latency in microseconds
# TYPE tunlink_latency_us summary
tunlink_latency_us{{quantile="0.5"}} {}
tunlink_latency_us{{quantile="0.95"}} {}
tunlink_latency_us{{quantile="0.99"}} {}
tunlink_latency_us_avg {}
"#,
            self.inner.total_requests.load(Ordering::Relaxed),
            self.inner.active_tunnels.load(Ordering::Relaxed),
            self.inner.status_2xx.load(Ordering::Relaxed),
            self.inner.status_3xx.load(Ordering::Relaxed),
            self.inner.status_4xx.load(Ordering::Relaxed),
            self.inner.status_5xx.load(Ordering::Relaxed),
            self.inner.bytes_in.load(Ordering::Relaxed),
            self.inner.bytes_out.load(Ordering::Relaxed),
            self.inner.tcp_conns.load(Ordering::Relaxed),
            self.inner.udp_datagrams.load(Ordering::Relaxed),
            self.inner.ratelimit_failopen.load(Ordering::Relaxed),
            p50, p95, p99, avg,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_classes_and_failopen() {
        let metrics = Metrics::new();
        metrics.record_request(200, 1500, 10, 20).await;
        metrics.record_request(502, 900, 0, 0).await;
        metrics.ratelimit_failopen();

        let text = metrics.to_prometheus().await;
        assert!(text.contains(r#"tunlink_requests_by_status{status="2xx"} 1"#));
        assert!(text.contains(r#"tunlink_requests_by_status{status="5xx"} 1"#));
        assert!(text.contains("tunlink_ratelimit_failopen_total 1"));
    }
}
