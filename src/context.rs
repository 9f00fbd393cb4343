//! Read-only service context handed to installers and boot callbacks.

use std::sync::Arc;

use crate::broker::{BrokerController, BrokerError};
use crate::resource::{LocalResource, Resources};

/// Error type returned by caller-supplied hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Snapshot of what the orchestrator has brought up so far.
///
/// Cheap to clone; the controller and resources are shared handles.
#[derive(Clone, Debug)]
pub struct BootContext {
    service_name: Arc<str>,
    controller: Option<BrokerController>,
    resources: Resources,
}

impl BootContext {
    pub fn new(
        service_name: impl Into<Arc<str>>,
        controller: Option<BrokerController>,
        resources: Resources,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            controller,
            resources,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The broker controller, if the service was configured with a broker.
    pub fn controller(&self) -> Option<&BrokerController> {
        self.controller.as_ref()
    }

    /// The broker controller, provided it is live right now.
    ///
    /// Installers whose handlers depend on the broker call this and fail fast
    /// instead of registering a handler that cannot work.
    pub fn require_broker(&self) -> Result<&BrokerController, BrokerError> {
        match &self.controller {
            Some(controller) if controller.is_connected() => Ok(controller),
            _ => Err(BrokerError::NotConnected),
        }
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Opaque resource lookup by concrete type.
    pub fn resource<T: LocalResource>(&self) -> Option<&T> {
        self.resources.get::<T>()
    }

    /// Span tagged with the service name, for hooks that log.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("service", service = %self.service_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;

    #[test]
    fn test_require_broker_without_controller() {
        let ctx = BootContext::new("svc", None, Resources::default());
        assert!(matches!(
            ctx.require_broker(),
            Err(BrokerError::NotConnected)
        ));
        assert_eq!(ctx.service_name(), "svc");
    }

    #[test]
    fn test_require_broker_tracks_live_state() {
        let broker = Arc::new(MockBroker::new());
        let controller = BrokerController::new(broker.clone());
        let ctx = BootContext::new("svc", Some(controller), Resources::default());

        assert!(ctx.require_broker().is_ok());

        broker.sever();
        assert!(matches!(
            ctx.require_broker(),
            Err(BrokerError::NotConnected)
        ));
    }
}
