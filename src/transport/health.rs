//! `grpc.health.v1.Health` installer.

use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::debug;

use super::HandlerInstaller;

/// Installer name used in logs and errors.
pub const HEALTH_INSTALLER: &str = "health";

/// Installer registering the standard health service, plus the reporter
/// that drives it.
///
/// The overall (`""`) status starts as `SERVING` in tonic-health; callers
/// flip it with [`set_status`] as the service comes up and goes down.
pub fn health_installer() -> (HandlerInstaller, HealthReporter) {
    let (reporter, service) = tonic_health::server::health_reporter();
    let installer = HandlerInstaller::new(HEALTH_INSTALLER, move |router, _ctx| {
        router.add_service(service.clone())?;
        Ok(())
    });
    (installer, reporter)
}

/// Set the overall service status.
pub async fn set_status(reporter: &HealthReporter, status: ServingStatus) {
    let mut reporter = reporter.clone();
    reporter.set_service_status("", status).await;
    debug!(status = ?status, "Health status updated");
}
