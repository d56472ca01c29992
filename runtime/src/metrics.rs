//! Prometheus metrics for the processor, outbox, pumps and dispatcher.
//!
//! Components record through the `metrics` facade, so nothing is exported
//! until a recorder is installed. [`MetricsServer`] installs the Prometheus
//! recorder and registers descriptions for every metric emitted here.
//!
//! # Example
//!
//! ```rust,no_run
//! use herald_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! let exposition = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder holder.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server for `addr` (for example `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register descriptions and install the Prometheus recorder.
    ///
    /// A recorder that is already installed (common in tests) is tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("metrics recorder already initialized, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// Handle for rendering, once started.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "processor_requests_total",
        "Requests dispatched by the command processor, by operation"
    );
    describe_counter!(
        "processor_failures_total",
        "Processor calls that returned an error, by operation"
    );
    describe_counter!(
        "pipeline_shape_cache_misses_total",
        "Pipeline shapes computed because the cache had no entry"
    );

    describe_counter!("outbox_messages_deposited_total", "Messages written to the outbox");
    describe_counter!("outbox_messages_dispatched_total", "Outbox messages handed to producers");
    describe_counter!("outbox_send_failures_total", "Outbox sends that failed after retries");
    describe_counter!("outbox_messages_archived_total", "Dispatched messages moved to the archive");
    describe_counter!(
        "outbox_inline_clears_total",
        "Messages cleared inline because the outstanding ceiling was exceeded"
    );
    describe_histogram!("outbox_send_duration_seconds", "Time to hand one message to a producer");

    describe_counter!("pump_messages_received_total", "Messages read by pumps");
    describe_counter!("pump_messages_acknowledged_total", "Messages acknowledged after handling");
    describe_counter!("pump_messages_requeued_total", "Messages requeued for another attempt");
    describe_counter!("pump_messages_rejected_total", "Messages rejected, by reason");
    describe_counter!("pump_unacceptable_messages_total", "Messages that could not be translated");
    describe_counter!("pump_channel_failures_total", "Failed channel reads");
    describe_counter!("pump_quarantines_total", "Performers stopped by the unacceptable limit");
    describe_histogram!("pump_dispatch_duration_seconds", "Time to dispatch one message");

    describe_gauge!("dispatcher_performers_running", "Performers currently running");
}

/// Command processor metrics recorder.
pub struct ProcessorMetrics;

impl ProcessorMetrics {
    /// Record a processor call.
    pub fn record_request(operation: &'static str) {
        counter!("processor_requests_total", "operation" => operation).increment(1);
    }

    /// Record a failed processor call.
    pub fn record_failure(operation: &'static str) {
        counter!("processor_failures_total", "operation" => operation).increment(1);
    }

    /// Record a pipeline shape computation.
    pub fn record_shape_miss(request_type: &'static str) {
        counter!("pipeline_shape_cache_misses_total", "request_type" => request_type).increment(1);
    }
}

/// Outbox metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record deposited messages.
    pub fn record_deposit(count: usize) {
        counter!("outbox_messages_deposited_total").increment(count as u64);
    }

    /// Record a dispatched message.
    pub fn record_dispatch(topic: &str, duration: Duration) {
        counter!("outbox_messages_dispatched_total", "topic" => topic.to_string()).increment(1);
        histogram!("outbox_send_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed send.
    pub fn record_send_failure(topic: &str) {
        counter!("outbox_send_failures_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record archived messages.
    pub fn record_archived(count: usize) {
        counter!("outbox_messages_archived_total").increment(count as u64);
    }

    /// Record messages cleared because of back-pressure.
    pub fn record_inline_clear(count: usize) {
        counter!("outbox_inline_clears_total").increment(count as u64);
    }
}

/// Message pump metrics recorder.
pub struct PumpMetrics;

impl PumpMetrics {
    /// Record a received message.
    pub fn record_received(subscription: &str) {
        counter!("pump_messages_received_total", "subscription" => subscription.to_string())
            .increment(1);
    }

    /// Record an acknowledgement.
    pub fn record_acknowledged(subscription: &str, duration: Duration) {
        counter!("pump_messages_acknowledged_total", "subscription" => subscription.to_string())
            .increment(1);
        histogram!("pump_dispatch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a requeue.
    pub fn record_requeued(subscription: &str) {
        counter!("pump_messages_requeued_total", "subscription" => subscription.to_string())
            .increment(1);
    }

    /// Record a rejection.
    pub fn record_rejected(subscription: &str, reason: &'static str) {
        counter!(
            "pump_messages_rejected_total",
            "subscription" => subscription.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record an untranslatable message.
    pub fn record_unacceptable(subscription: &str) {
        counter!("pump_unacceptable_messages_total", "subscription" => subscription.to_string())
            .increment(1);
    }

    /// Record a failed channel read.
    pub fn record_channel_failure(subscription: &str) {
        counter!("pump_channel_failures_total", "subscription" => subscription.to_string())
            .increment(1);
    }

    /// Record a quarantined performer.
    pub fn record_quarantine(subscription: &str) {
        counter!("pump_quarantines_total", "subscription" => subscription.to_string())
            .increment(1);
    }
}

/// Dispatcher metrics recorder.
pub struct DispatcherMetrics;

impl DispatcherMetrics {
    /// Record the number of running performers.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_running(performers: usize) {
        gauge!("dispatcher_performers_running").set(performers as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_has_no_handle_before_start() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn recorders_are_safe_without_an_installed_recorder() {
        OutboxMetrics::record_deposit(3);
        OutboxMetrics::record_dispatch("orders", Duration::from_millis(2));
        PumpMetrics::record_rejected("orders", "handler_failed");
        DispatcherMetrics::record_running(0);
    }

    #[test]
    fn start_tolerates_repeated_installation() {
        let mut first = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        let mut second = MetricsServer::new("127.0.0.1:0".parse().unwrap());

        assert!(first.start().is_ok());
        assert!(second.start().is_ok());
    }
}
