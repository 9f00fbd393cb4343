//! Service lifecycle orchestration.
//!
//! [`BootService`] sequences a service's startup:
//!
//! 1. Connect the broker (optional) and run the on-connected callback
//! 2. Spawn broker handlers
//! 3. Open local resources
//! 4. Run handler installers and bind every listener
//! 5. Run boot callbacks in order
//! 6. Run until a termination signal, [`BootService::stop`], or a fatal
//!    listener / broker handler failure
//!
//! Every exit path converges on [`BootService::close`], which runs exactly once.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::{debug, error, info, warn};

use crate::broker::{
    establish, AmqpDialer, BrokerConnectionOptions, BrokerController, BrokerError, Dialer,
};
use crate::context::{BootContext, BoxError};
use crate::resource::{LocalResource, Resources};
use crate::transport::{
    health, HandlerInstaller, ServiceRouter, TransportBootstrap, TransportError, TransportOptions,
};

mod callbacks;
mod signal;

pub use callbacks::{BootCallback, BrokerCallback, HookFuture};
pub use signal::ShutdownSignals;

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a [`BootService`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    NotStarted,
    ConnectingBroker,
    StartingTransport,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::ConnectingBroker => "connecting_broker",
            LifecycleState::StartingTransport => "starting_transport",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What triggered shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    Stop,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "signal {}", name),
            ShutdownReason::Stop => f.write_str("stop requested"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Fatal boot failures. Each maps to the phase it happened in.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("Service already started")]
    AlreadyStarted,

    #[error("Service already stopped")]
    AlreadyStopped,

    #[error("Failed to register signal handlers: {0}")]
    Signal(#[source] std::io::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("On-connected callback failed: {0}")]
    OnConnected(#[source] BoxError),

    #[error("Resource {name} failed to open: {source}")]
    Resource { name: String, source: BoxError },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Boot callback {index} failed: {source}")]
    Callback { index: usize, source: BoxError },

    #[error("Broker handler failed: {0}")]
    BrokerHandler(#[source] BoxError),
}

impl BootError {
    /// Boot phase the error belongs to, for the fatal log line.
    pub fn phase(&self) -> &'static str {
        match self {
            BootError::AlreadyStarted | BootError::AlreadyStopped => "lifecycle",
            BootError::Signal(_) => "signal",
            BootError::Broker(_) => "broker-connect",
            BootError::OnConnected(_) => "topology",
            BootError::Resource { .. } => "resource",
            BootError::Transport(
                TransportError::Installer { .. }
                | TransportError::DuplicateRoute(_)
                | TransportError::NoListeners,
            ) => "transport",
            BootError::Transport(_) => "listener",
            BootError::Callback { .. } => "callback",
            BootError::BrokerHandler(_) => "broker-handler",
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Broker settings for a service.
#[derive(Debug, Clone, Default)]
pub struct BrokerOptions {
    pub connection: BrokerConnectionOptions,
    /// Runs once, right after connecting. Typically declares topology.
    pub on_connected: Option<BrokerCallback>,
    /// Long-running tasks spawned after `on_connected` succeeds.
    pub handlers: Vec<BrokerCallback>,
}

impl BrokerOptions {
    pub fn new(connection: BrokerConnectionOptions) -> Self {
        Self {
            connection,
            ..Default::default()
        }
    }

    pub fn on_connected(mut self, callback: BrokerCallback) -> Self {
        self.on_connected = Some(callback);
        self
    }

    pub fn handler(mut self, handler: BrokerCallback) -> Self {
        self.handlers.push(handler);
        self
    }

    /// No URI and nothing to run against a broker.
    pub fn is_zero(&self) -> bool {
        self.connection.uri.is_empty() && self.on_connected.is_none() && self.handlers.is_empty()
    }
}

/// Builder for [`BootService`].
pub struct BootServiceBuilder {
    name: String,
    broker: Option<BrokerOptions>,
    dialer: Arc<dyn Dialer>,
    transport: TransportOptions,
    boot_callbacks: Vec<BootCallback>,
    resources: Vec<Arc<dyn LocalResource>>,
    handle_signals: bool,
    health: Option<HealthReporter>,
}

impl BootServiceBuilder {
    pub fn broker(mut self, options: BrokerOptions) -> Self {
        self.broker = Some(options);
        self
    }

    /// Replace the AMQP dialer.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Replace the transport options. Installers added earlier are kept.
    pub fn transport(mut self, options: TransportOptions) -> Self {
        let mut installers = std::mem::take(&mut self.transport.installers);
        installers.extend(options.installers);
        self.transport = TransportOptions {
            listeners: options.listeners,
            installers,
        };
        self
    }

    pub fn listen(mut self, address: impl Into<String>) -> Self {
        self.transport.listeners.push(address.into());
        self
    }

    pub fn installer(mut self, installer: HandlerInstaller) -> Self {
        self.transport.installers.push(installer);
        self
    }

    /// Serve `grpc.health.v1.Health`, reporting `SERVING` only while running.
    pub fn with_health_service(mut self) -> Self {
        let (installer, reporter) = crate::transport::health_installer();
        self.transport.installers.push(installer);
        self.health = Some(reporter);
        self
    }

    /// Serve Prometheus metrics at `/metrics` on the shared router.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self) -> Self {
        self.transport
            .installers
            .push(crate::transport::metrics::metrics_installer());
        self
    }

    pub fn resource(mut self, resource: Arc<dyn LocalResource>) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn boot_callback(mut self, callback: BootCallback) -> Self {
        self.boot_callbacks.push(callback);
        self
    }

    /// Shut down on SIGINT/SIGTERM. Enabled by default.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn build(self) -> BootService {
        let (state, _) = watch::channel(LifecycleState::NotStarted);
        let (shutdown, _) = watch::channel(None);

        BootService {
            inner: Arc::new(Inner {
                name: self.name.into(),
                broker: self.broker,
                dialer: self.dialer,
                transport: self.transport,
                boot_callbacks: self.boot_callbacks,
                resources: Resources::new(self.resources),
                handle_signals: self.handle_signals,
                health: self.health,
                controller: OnceLock::new(),
                local_addrs: OnceLock::new(),
                state,
                shutdown,
                started: AtomicBool::new(false),
                teardown: tokio::sync::OnceCell::new(),
            }),
        }
    }
}

// ============================================================================
// Service
// ============================================================================

/// Boots and runs one service.
///
/// Cheap to clone; clones share the same lifecycle.
#[derive(Clone)]
pub struct BootService {
    inner: Arc<Inner>,
}

struct Inner {
    name: Arc<str>,
    broker: Option<BrokerOptions>,
    dialer: Arc<dyn Dialer>,
    transport: TransportOptions,
    boot_callbacks: Vec<BootCallback>,
    resources: Resources,
    handle_signals: bool,
    health: Option<HealthReporter>,
    controller: OnceLock<BrokerController>,
    local_addrs: OnceLock<Vec<SocketAddr>>,
    state: watch::Sender<LifecycleState>,
    shutdown: watch::Sender<Option<ShutdownReason>>,
    started: AtomicBool,
    teardown: tokio::sync::OnceCell<()>,
}

impl BootService {
    pub fn builder(name: impl Into<String>) -> BootServiceBuilder {
        BootServiceBuilder {
            name: name.into(),
            broker: None,
            dialer: Arc::new(AmqpDialer),
            transport: TransportOptions::default(),
            boot_callbacks: Vec::new(),
            resources: Vec::new(),
            handle_signals: true,
            health: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// The broker controller, once connected.
    pub fn controller(&self) -> Option<&BrokerController> {
        self.inner.controller.get()
    }

    /// Addresses the listeners are bound to, once transport has started.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        self.inner
            .local_addrs
            .get()
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Context handed to installers and boot callbacks.
    pub fn context(&self) -> BootContext {
        BootContext::new(
            self.inner.name.clone(),
            self.inner.controller.get().cloned(),
            self.inner.resources.clone(),
        )
    }

    /// Boot the service and run it until shutdown.
    ///
    /// Returns `Ok` after a signal- or stop-driven shutdown and `Err` on any
    /// fatal failure. Teardown has completed either way.
    pub async fn start(&self) -> Result<(), BootError> {
        if self.state() == LifecycleState::Stopped {
            return Err(BootError::AlreadyStopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(BootError::AlreadyStarted);
        }

        let signal_task = match self.watch_signals() {
            Ok(task) => task,
            Err(e) => return self.finish(Err(e)).await,
        };

        let result = self.run().await;

        if let Some(task) = signal_task {
            task.abort();
        }
        self.finish(result).await
    }

    /// Request shutdown and wait for teardown to finish.
    ///
    /// A stop issued during boot is held until the service reaches `Running`.
    /// Safe to call any number of times from outside the boot path. Awaiting
    /// it inside an on-connected callback, a handler installer or a boot
    /// callback of the same service never returns, because boot is waiting
    /// on that hook; use [`request_stop`](Self::request_stop) there.
    pub async fn stop(&self) {
        self.request_stop();

        if self.inner.started.load(Ordering::SeqCst) {
            let mut state = self.inner.state.subscribe();
            let _ = state
                .wait_for(|state| *state == LifecycleState::Stopped)
                .await;
        } else {
            self.close().await;
        }
    }

    /// Request shutdown without waiting for it.
    ///
    /// Usable from any hook. During boot the request is held until the
    /// service reaches `Running`, which then shuts down straight away.
    pub fn request_stop(&self) {
        self.trigger(ShutdownReason::Stop);
    }

    /// Close the broker controller and local resources.
    ///
    /// Runs once; later calls wait for the first to finish. Failures are
    /// logged as warnings.
    pub async fn close(&self) {
        self.inner.teardown.get_or_init(|| self.teardown()).await;
    }

    async fn run(&self) -> Result<(), BootError> {
        let inner = &self.inner;

        // Broker
        self.advance(LifecycleState::ConnectingBroker);
        let mut broker_handlers: JoinSet<Result<(), BoxError>> = JoinSet::new();

        match inner.broker.as_ref().filter(|options| !options.is_zero()) {
            None => warn!(
                service = %inner.name,
                "No broker configured, skipping broker connection"
            ),
            Some(options) => {
                let controller = establish(&options.connection, inner.dialer.as_ref()).await?;
                let _ = inner.controller.set(controller.clone());

                if let Some(on_connected) = &options.on_connected {
                    on_connected
                        .call(controller.clone())
                        .await
                        .map_err(BootError::OnConnected)?;
                }

                for handler in &options.handlers {
                    broker_handlers.spawn(handler.call(controller.clone()));
                }
                if !options.handlers.is_empty() {
                    info!(handlers = options.handlers.len(), "Broker handlers started");
                }
            }
        }

        // Local resources
        for resource in inner.resources.iter() {
            resource
                .open()
                .await
                .map_err(|source| BootError::Resource {
                    name: resource.name().to_string(),
                    source,
                })?;
            info!(resource = %resource.name(), "Opened resource");
        }

        // Transport
        self.advance(LifecycleState::StartingTransport);
        if let Some(reporter) = &inner.health {
            health::set_status(reporter, ServingStatus::NotServing).await;
        }

        let ctx = self.context();
        let mut transport =
            TransportBootstrap::start(ServiceRouter::new(), &inner.transport, &ctx).await?;
        let _ = inner.local_addrs.set(transport.local_addrs().to_vec());

        // Boot callbacks
        for (index, callback) in inner.boot_callbacks.iter().enumerate() {
            callback
                .call(ctx.clone())
                .await
                .map_err(|source| BootError::Callback { index, source })?;
            debug!(index, "Boot callback complete");
        }

        // Running
        self.advance(LifecycleState::Running);
        if let Some(reporter) = &inner.health {
            health::set_status(reporter, ServingStatus::Serving).await;
        }
        info!(
            service = %inner.name,
            listeners = ?transport.local_addrs(),
            "Service running"
        );

        let mut shutdown = inner.shutdown.subscribe();
        let outcome = tokio::select! {
            reason = shutdown_requested(&mut shutdown) => {
                info!(service = %inner.name, reason = %reason, "Shutting down");
                Ok(())
            }
            failure = transport.next_failure() => Err(BootError::Transport(failure)),
            failure = next_handler_failure(&mut broker_handlers) => {
                Err(BootError::BrokerHandler(failure))
            }
        };

        self.advance(LifecycleState::ShuttingDown);
        transport.shutdown();
        broker_handlers.abort_all();
        outcome
    }

    async fn finish(&self, result: Result<(), BootError>) -> Result<(), BootError> {
        if let Err(e) = &result {
            error!(
                service = %self.inner.name,
                phase = e.phase(),
                error = %e,
                "Service failed"
            );
            #[cfg(feature = "metrics")]
            crate::transport::metrics::record_failure(&self.inner.name, e.phase());
        }
        self.close().await;
        result
    }

    async fn teardown(&self) {
        let inner = &self.inner;
        self.advance(LifecycleState::ShuttingDown);

        if let Some(reporter) = &inner.health {
            health::set_status(reporter, ServingStatus::NotServing).await;
        }

        if let Some(controller) = inner.controller.get() {
            if let Err(e) = controller.close().await {
                warn!(error = %e, "Failed to close broker connection");
            }
        }

        for resource in inner.resources.iter().rev() {
            if let Err(e) = resource.close().await {
                warn!(resource = %resource.name(), error = %e, "Failed to close resource");
            }
        }

        info!(service = %inner.name, "Service stopped");
        self.advance(LifecycleState::Stopped);
    }

    fn watch_signals(&self) -> Result<Option<JoinHandle<()>>, BootError> {
        if !self.inner.handle_signals {
            return Ok(None);
        }

        let mut signals = ShutdownSignals::register().map_err(BootError::Signal)?;
        let service = self.clone();
        Ok(Some(tokio::spawn(async move {
            let name = signals.recv().await;
            service.trigger(ShutdownReason::Signal(name));
        })))
    }

    /// Latch the first shutdown reason.
    fn trigger(&self, reason: ShutdownReason) {
        self.inner.shutdown.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    fn advance(&self, next: LifecycleState) {
        self.inner.state.send_if_modified(|state| {
            if next <= *state {
                return false;
            }
            debug!(service = %self.inner.name, from = %state, to = %next, "Lifecycle transition");
            *state = next;
            #[cfg(feature = "metrics")]
            crate::transport::metrics::record_state(&self.inner.name, next);
            true
        });
    }
}

impl fmt::Debug for BootService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootService")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

async fn shutdown_requested(
    receiver: &mut watch::Receiver<Option<ShutdownReason>>,
) -> ShutdownReason {
    let reason = receiver
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|reason| *reason);
    match reason {
        Some(reason) => reason,
        None => std::future::pending().await,
    }
}

/// First broker handler error. Handlers that finish cleanly are skipped.
async fn next_handler_failure(handlers: &mut JoinSet<Result<(), BoxError>>) -> BoxError {
    loop {
        match handlers.join_next().await {
            None => std::future::pending::<()>().await,
            Some(Ok(Ok(()))) => info!("Broker handler finished"),
            Some(Ok(Err(e))) => return e,
            Some(Err(e)) if e.is_cancelled() => {}
            Some(Err(e)) => return Box::new(e),
        }
    }
}
