//! Prometheus metrics for usage accounting.
//!
//! This module provides metric collection for:
//! - Compare-and-swap transactions (attempts, conflicts, outcomes)
//! - Usage updates per usage type (applied, rejected)
//! - Administrative authentication
//!
//! # Example
//!
//! ```rust,no_run
//! use prepaid_usage_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use prepaid_usage_core::channel::UsageType;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The exporter or its listener could not be built.
    #[error("cannot build the Prometheus exporter: {0}")]
    Build(String),
}

/// Serves usage and transaction metrics to Prometheus.
///
/// [`MetricsServer::start`] installs the global recorder and spawns the HTTP
/// scrape endpoint on the runtime it is called from.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will listen on `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every metric, install the recorder and start serving.
    ///
    /// Must be called from within a Tokio runtime. When another recorder is
    /// already installed (another server, or another test in the same
    /// process) nothing is served and [`MetricsServer::render`] stays `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built, for
    /// instance because `addr` cannot be bound.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already installed, not serving metrics");
            return Ok(());
        }

        // The exporter's error type implements neither Debug nor Display.
        let addr = self.addr;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(%addr, "Prometheus exporter stopped");
            }
        });
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Serving Prometheus metrics");
        Ok(())
    }

    /// Address the scrape endpoint listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current metrics in the Prometheus text format, if this server
    /// installed the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "cas_attempts_total",
        "Total number of compare-and-swap attempts"
    );
    describe_counter!(
        "cas_conflicts_total",
        "Total number of swaps lost to a concurrent writer"
    );
    describe_counter!(
        "cas_applied_total",
        "Total number of transactions applied"
    );
    describe_counter!(
        "cas_aborted_total",
        "Total number of transactions aborted by their update function"
    );
    describe_counter!(
        "cas_exhausted_total",
        "Total number of transactions that ran out of attempts"
    );
    describe_histogram!(
        "cas_transaction_duration_seconds",
        "Time from first read to applied swap"
    );
    describe_histogram!(
        "cas_transaction_attempts",
        "Attempts needed per applied transaction"
    );

    describe_counter!(
        "usage_updates_total",
        "Total number of usage updates applied, by usage type"
    );
    describe_counter!(
        "usage_rejections_total",
        "Total number of usage updates rejected, by usage type"
    );

    describe_counter!(
        "admin_auth_failures_total",
        "Total number of administrative calls refused"
    );
}

/// Transaction engine metrics recorder.
pub struct TransactionMetrics;

impl TransactionMetrics {
    /// Record an attempt (read + swap).
    pub fn record_attempt() {
        counter!("cas_attempts_total").increment(1);
    }

    /// Record a lost race.
    pub fn record_conflict() {
        counter!("cas_conflicts_total").increment(1);
    }

    /// Record an applied transaction.
    pub fn record_applied(attempts: u32, duration: Duration) {
        counter!("cas_applied_total").increment(1);
        histogram!("cas_transaction_duration_seconds").record(duration.as_secs_f64());
        histogram!("cas_transaction_attempts").record(f64::from(attempts));
    }

    /// Record a transaction aborted by its update function.
    pub fn record_aborted() {
        counter!("cas_aborted_total").increment(1);
    }

    /// Record a transaction that ran out of attempts.
    pub fn record_exhausted() {
        counter!("cas_exhausted_total").increment(1);
    }
}

/// Usage update metrics recorder.
pub struct UsageMetrics;

impl UsageMetrics {
    /// Record an applied update.
    pub fn record_update(usage_type: UsageType) {
        counter!("usage_updates_total", "usage_type" => usage_type.as_str()).increment(1);
    }

    /// Record a rejected update.
    pub fn record_rejection(usage_type: UsageType) {
        counter!("usage_rejections_total", "usage_type" => usage_type.as_str()).increment(1);
    }

    /// Record a refused administrative call.
    pub fn record_auth_failure() {
        counter!("admin_auth_failures_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unstarted_server_renders_nothing() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.render().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn started_server_renders_recorded_metrics() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        TransactionMetrics::record_attempt();
        TransactionMetrics::record_applied(2, Duration::from_millis(3));
        UsageMetrics::record_update(UsageType::Used);

        let rendered = server.render().unwrap();
        assert!(rendered.contains("cas_attempts_total"));
        assert!(rendered.contains("usage_updates_total{usage_type=\"USED\"}"));
    }
}
