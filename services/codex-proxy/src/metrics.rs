//! Prometheus metrics exposition
//!
//! - `codex_proxy_requests_total` (counter): labels `status`, `stream`
//! - `codex_proxy_request_duration_seconds` (histogram): label `status`
//! - `codex_proxy_upstream_errors_total` (counter): label `error_type`
//! - `codex_proxy_token_refresh_total` (counter, recorded by codex-auth): label `outcome`

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "codex_proxy_request_duration_seconds";

/// Streamed completions can run for minutes, hence the long tail.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    Ok(PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)?)
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// A handle backed by a recorder that is never installed. Metrics recorded
/// through the global macros do not reach it.
#[cfg(test)]
pub fn test_handle() -> PrometheusHandle {
    builder().unwrap().build_recorder().handle()
}

/// Record a finished chat completion request.
pub fn record_request(status: u16, stream: bool, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "codex_proxy_requests_total",
        "status" => status_str.clone(),
        "stream" => if stream { "true" } else { "false" }
    )
    .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Record a backend failure with its classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("codex_proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// In-process counters reported by `/health`.
#[derive(Clone)]
pub struct ServiceStats {
    inner: Arc<StatsInner>,
}

struct StatsInner {
    started_at: Instant,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    in_flight: AtomicU64,
}

/// Decrements `in_flight` when dropped, including when a stream is abandoned.
pub struct InFlightGuard {
    stats: ServiceStats,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.stats.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ServiceStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatsInner {
                started_at: Instant::now(),
                requests_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                in_flight: AtomicU64::new(0),
            }),
        }
    }

    pub fn begin(&self) -> InFlightGuard {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            stats: self.clone(),
        }
    }

    pub fn record_error(&self) {
        self.inner.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    pub fn requests_total(&self) -> u64 {
        self.inner.requests_total.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self) -> u64 {
        self.inner.errors_total.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self::new()
    }
}
