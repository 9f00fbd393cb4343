//! Local resources owned by a booted service.
//!
//! A local resource is any handle (database pool, cache client, file lock)
//! that the orchestrator opens before transport starts and closes during
//! teardown. Installers and boot callbacks see resources as opaque handles
//! and downcast to the concrete type they expect.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::BoxError;

/// A handle opened at boot and closed at shutdown.
#[async_trait]
pub trait LocalResource: Send + Sync + 'static {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Open the resource. Called once, after the broker phase.
    async fn open(&self) -> Result<(), BoxError>;

    /// Close the resource. Called once during teardown, even if `open` never ran.
    async fn close(&self) -> Result<(), BoxError>;

    /// Concrete type access for [`Resources::get`].
    fn as_any(&self) -> &dyn Any;
}

/// Ordered, shared set of local resources.
#[derive(Clone, Default)]
pub struct Resources {
    items: Arc<[Arc<dyn LocalResource>]>,
}

impl Resources {
    pub fn new(items: Vec<Arc<dyn LocalResource>>) -> Self {
        Self {
            items: items.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate in registration order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<dyn LocalResource>> {
        self.items.iter()
    }

    /// First resource of concrete type `T`.
    pub fn get<T: LocalResource>(&self) -> Option<&T> {
        self.items
            .iter()
            .find_map(|item| item.as_any().downcast_ref::<T>())
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.items.iter().map(|item| item.name()))
            .finish()
    }
}
