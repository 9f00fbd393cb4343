//! Caller-supplied hooks run by the orchestrator.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::broker::BrokerController;
use crate::context::{BootContext, BoxError};

/// Future returned by every hook.
pub type HookFuture = BoxFuture<'static, Result<(), BoxError>>;

/// Hook receiving the broker controller.
///
/// Used both for the on-connected callback (typically topology declaration)
/// and for long-running broker handlers such as consumers.
#[derive(Clone)]
pub struct BrokerCallback {
    hook: Arc<dyn Fn(BrokerController) -> HookFuture + Send + Sync>,
}

impl BrokerCallback {
    pub fn new<F, Fut>(hook: F) -> Self
    where
        F: Fn(BrokerController) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            hook: Arc::new(move |controller| Box::pin(hook(controller))),
        }
    }

    pub(crate) fn call(&self, controller: BrokerController) -> HookFuture {
        (self.hook)(controller)
    }
}

impl std::fmt::Debug for BrokerCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BrokerCallback")
    }
}

/// Hook run once after broker and transport are live.
#[derive(Clone)]
pub struct BootCallback {
    hook: Arc<dyn Fn(BootContext) -> HookFuture + Send + Sync>,
}

impl BootCallback {
    pub fn new<F, Fut>(hook: F) -> Self
    where
        F: Fn(BootContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            hook: Arc::new(move |ctx| Box::pin(hook(ctx))),
        }
    }

    pub(crate) fn call(&self, ctx: BootContext) -> HookFuture {
        (self.hook)(ctx)
    }
}

impl std::fmt::Debug for BootCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BootCallback")
    }
}
