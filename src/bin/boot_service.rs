//! boot-service: reference service built on the boot orchestrator.
//!
//! Connects to the broker, declares the configured topology, consumes every
//! configured queue (logging and acking each delivery), serves the gRPC
//! health service (and `/metrics` with the `metrics` feature) and runs until
//! SIGINT/SIGTERM.
//!
//! Configuration comes from `config.yaml`, `--config <path>`, `BOOT_CONFIG`,
//! `BOOT__*` variables and the plain service variables:
//! - AMQP_CONNECTION_URI: broker URI
//! - PORT: primary listener port
//! - DATABASE_URL: PostgreSQL URL (with the `postgres` feature)
//! - SERVICE_NAME / ENV: service identity

use std::sync::Arc;

use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions};
use lapin::types::FieldTable;
use tracing::{debug, error, info, warn};

use service_boot::boot::{BootCallback, BootService, BrokerCallback, BrokerOptions};
use service_boot::broker::{Consumer, TopologyEventSet};
use service_boot::config::Config;
use service_boot::transport::TransportOptions;
use service_boot::{BoxError, BrokerController};

#[tokio::main]
async fn main() {
    service_boot::utils::bootstrap::init_tracing();

    let config_path = service_boot::utils::bootstrap::parse_config_path();
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(phase = "config", error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        service = %config.service.name,
        environment = %config.service.environment,
        "Starting service"
    );

    // Failures are logged with their phase by `start`.
    if build_service(&config).start().await.is_err() {
        std::process::exit(1);
    }
}

fn build_service(config: &Config) -> BootService {
    let mut builder = BootService::builder(config.service.name.clone());

    if let Some(connection) = &config.broker {
        let mut broker = BrokerOptions::new(connection.clone());
        if let Some(topology) = &config.topology {
            let topology = Arc::new(topology.clone());
            broker = broker.on_connected(declare_topology(topology.clone()));
            for queue in &topology.queues {
                broker = broker.handler(consume_queue(queue.clone(), config.service.name.clone()));
            }
        }
        builder = builder.broker(broker);
    }

    builder = builder.transport(TransportOptions::from_config(
        &config.transport,
        &config.service.environment,
    ));
    if config.transport.health {
        builder = builder.with_health_service();
    }
    #[cfg(feature = "metrics")]
    if config.transport.metrics {
        builder = builder.with_metrics();
    }

    #[cfg(feature = "postgres")]
    if let Some(database) = &config.database {
        if !database.url.is_empty() {
            builder = builder.resource(Arc::new(service_boot::db::Database::new(
                database.clone(),
            )));
        }
    }

    builder
        .boot_callback(BootCallback::new(|ctx| async move {
            info!(
                service = %ctx.service_name(),
                broker = ctx.controller().is_some(),
                "Service booted"
            );
            Ok(())
        }))
        .build()
}

fn declare_topology(topology: Arc<TopologyEventSet>) -> BrokerCallback {
    BrokerCallback::new(move |controller: BrokerController| {
        let topology = topology.clone();
        async move {
            let declared = topology.declare(controller.registerer()).await?;
            info!(
                exchange = %declared.exchange,
                queues = declared.queues.len(),
                bindings = declared.bindings.len(),
                "Topology declared"
            );
            Ok::<(), BoxError>(())
        }
    })
}

fn consume_queue(queue: String, service: String) -> BrokerCallback {
    BrokerCallback::new(move |controller: BrokerController| {
        let queue = queue.clone();
        let tag = format!("{service}-{queue}");
        async move {
            let mut deliveries = controller
                .consumer()
                .consume(
                    &queue,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            info!(queue = %queue, "Consuming");

            while let Some(delivery) = deliveries.next().await {
                let delivery = delivery?;
                debug!(
                    queue = %queue,
                    routing_key = delivery.routing_key.as_str(),
                    bytes = delivery.data.len(),
                    "Delivery received"
                );
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!(queue = %queue, error = %e, "Failed to ack delivery");
                }
            }

            Err::<(), BoxError>(format!("consumer on {queue} ended").into())
        }
    })
}
