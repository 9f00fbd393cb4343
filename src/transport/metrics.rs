//! Prometheus metrics served at `/metrics` on the shared router.
//!
//! The recorder is process-global; every booted service in the process
//! renders the same registry.

use std::sync::OnceLock;

use ::metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{debug, warn};

use super::HandlerInstaller;
use crate::boot::LifecycleState;
use crate::context::BoxError;

/// Path the scrape endpoint is mounted on.
pub const METRICS_PATH: &str = "/metrics";

pub const LIFECYCLE_STATE: &str = "service_lifecycle_state";
pub const BOOT_FAILURES_TOTAL: &str = "service_boot_failures_total";
pub const BROKER_PUBLISH_TOTAL: &str = "broker_publish_total";

static HANDLE: OnceLock<Result<PrometheusHandle, String>> = OnceLock::new();

/// Install the global Prometheus recorder once and return its handle.
pub fn prometheus_handle() -> Result<PrometheusHandle, BoxError> {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            ::metrics::set_global_recorder(recorder).map_err(|e| {
                warn!(error = %e, "Metrics recorder already installed");
                e.to_string()
            })?;
            describe_metrics();
            debug!("Prometheus recorder installed");
            Ok(handle)
        })
        .clone()
        .map_err(Into::into)
}

/// Installer mounting [`METRICS_PATH`] on the shared router.
pub fn metrics_installer() -> HandlerInstaller {
    HandlerInstaller::new("metrics", |router, _ctx| {
        router.add_metrics(prometheus_handle()?)?;
        Ok(())
    })
}

fn describe_metrics() {
    describe_gauge!(
        LIFECYCLE_STATE,
        "Lifecycle state: 0 not started, 1 connecting broker, 2 starting transport, 3 running, 4 shutting down, 5 stopped"
    );
    describe_counter!(BOOT_FAILURES_TOTAL, "Fatal failures by phase");
    describe_counter!(BROKER_PUBLISH_TOTAL, "Broker publishes by outcome");
}

pub(crate) fn record_state(service: &str, state: LifecycleState) {
    let value = match state {
        LifecycleState::NotStarted => 0.0,
        LifecycleState::ConnectingBroker => 1.0,
        LifecycleState::StartingTransport => 2.0,
        LifecycleState::Running => 3.0,
        LifecycleState::ShuttingDown => 4.0,
        LifecycleState::Stopped => 5.0,
    };
    gauge!(LIFECYCLE_STATE, "service" => service.to_string()).set(value);
}

pub(crate) fn record_failure(service: &str, phase: &'static str) {
    counter!(BOOT_FAILURES_TOTAL, "service" => service.to_string(), "phase" => phase).increment(1);
}

pub(crate) fn record_publish(exchange: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!(BROKER_PUBLISH_TOTAL, "exchange" => exchange.to_string(), "outcome" => outcome)
        .increment(1);
}
