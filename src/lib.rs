//! Service bootstrap and AMQP broker orchestration.
//!
//! A service describes its broker connection, topology, gRPC handler
//! installers, local resources and boot callbacks on a
//! [`BootServiceBuilder`](boot::BootServiceBuilder); [`BootService::start`](boot::BootService::start)
//! then brings them up in a fixed order and runs until shutdown.

pub mod boot;
pub mod broker;
pub mod config;
pub mod context;
#[cfg(feature = "postgres")]
pub mod db;
pub mod resource;
pub mod transport;
pub mod utils;

pub use boot::{BootError, BootService, BootServiceBuilder, BrokerOptions, LifecycleState};
pub use broker::{BrokerController, BrokerError};
pub use context::{BootContext, BoxError};
