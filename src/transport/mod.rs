//! Transport bootstrap: shared gRPC router, handler installers and listeners.
//!
//! Installers run once, in registration order, against one [`ServiceRouter`].
//! The router is then frozen and served on every configured listener
//! concurrently. A listener that exits for any reason is reported through
//! [`RunningTransport::next_failure`] and treated as fatal by the caller.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::BoxBody;
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tonic::transport::Server;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::context::{BootContext, BoxError};

pub mod health;
#[cfg(feature = "metrics")]
pub mod metrics;

pub use health::health_installer;
#[cfg(feature = "metrics")]
pub use metrics::metrics_installer;

/// Default listener port.
const DEFAULT_PORT: u16 = 3000;

// ============================================================================
// Configuration
// ============================================================================

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Host to bind the primary listener to.
    pub host: String,
    /// Port of the primary listener.
    pub port: u16,
    /// Serve `grpc.health.v1.Health`.
    pub health: bool,
    /// Serve Prometheus metrics at `/metrics` (with the `metrics` feature).
    pub metrics: bool,
    /// Environment-specific secondary listener.
    pub secondary: Option<SecondaryListenerConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            health: true,
            metrics: true,
            secondary: None,
        }
    }
}

/// A second listener that only runs in some environments (e.g., a private
/// network address in production).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SecondaryListenerConfig {
    pub address: String,
    #[serde(default = "default_secondary_environments")]
    pub environments: Vec<String>,
}

fn default_secondary_environments() -> Vec<String> {
    vec!["production".to_string(), "prod".to_string()]
}

impl TransportConfig {
    /// Primary listener address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Every listener address to bind in `environment`.
    pub fn listener_addresses(&self, environment: &str) -> Vec<String> {
        let mut addresses = vec![self.addr()];
        if let Some(secondary) = &self.secondary {
            if secondary
                .environments
                .iter()
                .any(|env| env.eq_ignore_ascii_case(environment))
            {
                addresses.push(secondary.address.clone());
            }
        }
        addresses
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from installing handlers or running listeners.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Route prefix {0} is already registered")]
    DuplicateRoute(String),

    #[error("Handler installer {name} failed: {source}")]
    Installer { name: String, source: BoxError },

    #[error("Handlers installed but no listener address configured")]
    NoListeners,

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Listener on {address} failed: {source}")]
    Serve {
        address: SocketAddr,
        source: tonic::transport::Error,
    },

    #[error("Listener on {address} exited")]
    ListenerExited { address: SocketAddr },

    #[error("Listener task panicked: {0}")]
    ListenerPanicked(String),
}

// ============================================================================
// Router
// ============================================================================

/// Router shared by all installers.
///
/// Each gRPC service owns the `/<package.Service>/` prefix; registering a
/// second service with the same prefix is rejected.
#[derive(Default)]
pub struct ServiceRouter {
    routes: RoutesBuilder,
    prefixes: Vec<String>,
    #[cfg(feature = "metrics")]
    metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gRPC service under its own prefix.
    pub fn add_service<S>(&mut self, service: S) -> Result<&mut Self, TransportError>
    where
        S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let prefix = format!("/{}/", S::NAME);
        if self.prefixes.contains(&prefix) {
            return Err(TransportError::DuplicateRoute(prefix));
        }
        debug!(prefix = %prefix, "Registered route");
        self.routes.add_service(service);
        self.prefixes.push(prefix);
        Ok(self)
    }

    /// Mount the Prometheus scrape endpoint at `/metrics`.
    #[cfg(feature = "metrics")]
    pub fn add_metrics(
        &mut self,
        handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Result<&mut Self, TransportError> {
        let path = metrics::METRICS_PATH.to_string();
        if self.prefixes.contains(&path) {
            return Err(TransportError::DuplicateRoute(path));
        }
        debug!(path = %path, "Registered route");
        self.metrics = Some(handle);
        self.prefixes.push(path);
        Ok(self)
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Whether plain HTTP/1.1 routes are mounted alongside gRPC.
    pub fn serves_http1(&self) -> bool {
        #[cfg(feature = "metrics")]
        if self.metrics.is_some() {
            return true;
        }
        false
    }

    /// Freeze the router for serving.
    #[cfg(not(feature = "metrics"))]
    pub fn into_routes(self) -> Routes {
        self.routes.routes()
    }

    /// Freeze the router for serving.
    #[cfg(feature = "metrics")]
    pub fn into_routes(self) -> Routes {
        let routes = self.routes.routes();
        let Some(handle) = self.metrics else {
            return routes;
        };
        let router = routes.into_axum_router().route(
            metrics::METRICS_PATH,
            axum::routing::get(move || {
                let handle = handle.clone();
                async move {
                    handle.run_upkeep();
                    handle.render()
                }
            }),
        );
        Routes::from(router)
    }
}

impl std::fmt::Debug for ServiceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRouter")
            .field("prefixes", &self.prefixes)
            .finish()
    }
}

// ============================================================================
// Installers
// ============================================================================

type InstallFn = dyn Fn(&mut ServiceRouter, &BootContext) -> Result<(), BoxError> + Send + Sync;

/// Registers one or more handlers on the shared router.
///
/// Installers that need the broker should call
/// [`BootContext::require_broker`] and fail instead of registering a handler
/// that cannot work.
#[derive(Clone)]
pub struct HandlerInstaller {
    name: String,
    install: Arc<InstallFn>,
}

impl HandlerInstaller {
    pub fn new<F>(name: impl Into<String>, install: F) -> Self
    where
        F: Fn(&mut ServiceRouter, &BootContext) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            install: Arc::new(install),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn install(&self, router: &mut ServiceRouter, ctx: &BootContext) -> Result<(), BoxError> {
        (self.install)(router, ctx)
    }
}

impl std::fmt::Debug for HandlerInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerInstaller")
            .field("name", &self.name)
            .finish()
    }
}

/// Installers plus the addresses their router is served on.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub listeners: Vec<String>,
    pub installers: Vec<HandlerInstaller>,
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options listening on every address `config` enables in `environment`.
    pub fn from_config(config: &TransportConfig, environment: &str) -> Self {
        Self {
            listeners: config.listener_addresses(environment),
            installers: Vec::new(),
        }
    }

    pub fn listen(mut self, address: impl Into<String>) -> Self {
        self.listeners.push(address.into());
        self
    }

    pub fn installer(mut self, installer: HandlerInstaller) -> Self {
        self.installers.push(installer);
        self
    }
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Runs installers and starts listeners.
pub struct TransportBootstrap;

impl TransportBootstrap {
    /// Install every handler on `router`, then bind and serve every listener.
    ///
    /// With no installers nothing is bound and an idle transport is returned.
    /// Returns once every listener is bound; serving continues in background
    /// tasks owned by the returned [`RunningTransport`].
    pub async fn start(
        mut router: ServiceRouter,
        options: &TransportOptions,
        ctx: &BootContext,
    ) -> Result<RunningTransport, TransportError> {
        if options.installers.is_empty() {
            info!("No handler installers, transport not started");
            return Ok(RunningTransport::idle());
        }

        for installer in &options.installers {
            installer
                .install(&mut router, ctx)
                .map_err(|source| TransportError::Installer {
                    name: installer.name.clone(),
                    source,
                })?;
            debug!(installer = %installer.name, "Installed handlers");
        }

        if options.listeners.is_empty() {
            return Err(TransportError::NoListeners);
        }

        let listeners = futures::future::try_join_all(options.listeners.iter().map(|address| {
            let address = address.clone();
            async move {
                TcpListener::bind(&address)
                    .await
                    .map_err(|source| TransportError::Bind { address, source })
            }
        }))
        .await?;

        let accept_http1 = router.serves_http1();
        let routes = router.into_routes();
        let mut running = RunningTransport::idle();

        for (listener, address) in listeners.into_iter().zip(&options.listeners) {
            let local_addr = listener
                .local_addr()
                .map_err(|source| TransportError::Bind {
                    address: address.clone(),
                    source,
                })?;

            info!(
                service = %ctx.service_name(),
                address = %local_addr,
                "Server listening"
            );

            let routes = routes.clone();
            running.tasks.spawn(async move {
                let result = Server::builder()
                    .accept_http1(accept_http1)
                    .layer(trace_layer(local_addr))
                    .add_routes(routes)
                    .serve_with_incoming(TcpListenerStream::new(listener))
                    .await;

                match result {
                    Ok(()) => TransportError::ListenerExited {
                        address: local_addr,
                    },
                    Err(source) => TransportError::Serve {
                        address: local_addr,
                        source,
                    },
                }
            });
            running.local_addrs.push(local_addr);
        }

        Ok(running)
    }
}

/// Listener tasks started by [`TransportBootstrap::start`].
#[derive(Debug, Default)]
pub struct RunningTransport {
    tasks: JoinSet<TransportError>,
    local_addrs: Vec<SocketAddr>,
}

impl RunningTransport {
    fn idle() -> Self {
        Self::default()
    }

    /// Bound addresses, in listener order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn is_idle(&self) -> bool {
        self.local_addrs.is_empty()
    }

    /// Wait for the first listener to stop.
    ///
    /// Pending forever when no listener is running.
    pub async fn next_failure(&mut self) -> TransportError {
        loop {
            match self.tasks.join_next().await {
                None => std::future::pending::<()>().await,
                Some(Ok(e)) => {
                    warn!(error = %e, "Listener stopped");
                    return e;
                }
                Some(Err(e)) if e.is_cancelled() => continue,
                Some(Err(e)) => return TransportError::ListenerPanicked(e.to_string()),
            }
        }
    }

    /// Stop every listener without draining in-flight requests.
    pub fn shutdown(&mut self) {
        if !self.tasks.is_empty() {
            info!(listeners = self.tasks.len(), "Stopping listeners");
        }
        self.tasks.abort_all();
    }
}

/// Per-request span carrying the listener, path and correlation id.
fn trace_layer(
    listener: SocketAddr,
) -> TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::GrpcErrorsAsFailures>,
    impl Fn(&http::Request<BoxBody>) -> tracing::Span + Clone,
> {
    TraceLayer::new_for_grpc().make_span_with(move |request: &http::Request<BoxBody>| {
        let correlation_id = request
            .headers()
            .get("x-correlation-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let path = request.uri().path();
        tracing::info_span!("grpc", %listener, %correlation_id, %path)
    })
}

#[cfg(test)]
mod tests;
