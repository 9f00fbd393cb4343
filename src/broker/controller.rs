//! Capability-scoped controller over one broker session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    ExchangeKind,
};
use tracing::{debug, info, warn};

use super::{
    BrokerSession, Consumer, DeliveryStream, Publisher, Publishing, Registerer, Result,
};

/// Thin wrapper over one broker session.
///
/// Handler code asks for the narrowest capability it needs through
/// [`publisher`](Self::publisher), [`consumer`](Self::consumer) or
/// [`registerer`](Self::registerer). Those views share the session; none of
/// them can close it. No buffering, batching or retry happens here.
#[derive(Clone)]
pub struct BrokerController {
    session: Arc<dyn BrokerSession>,
    closed: Arc<AtomicBool>,
}

impl BrokerController {
    pub fn new(session: Arc<dyn BrokerSession>) -> Self {
        Self {
            session,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn publisher(&self) -> Arc<dyn Publisher> {
        Arc::new(self.clone())
    }

    pub fn consumer(&self) -> Arc<dyn Consumer> {
        Arc::new(self.clone())
    }

    pub fn registerer(&self) -> Arc<dyn Registerer> {
        Arc::new(self.clone())
    }

    /// Live connection state, read from the session on every call.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Close the session.
    ///
    /// Reaches the session once per controller, shared by clones. A session
    /// that is already partly down (a channel closed by a server error, or a
    /// broker-initiated disconnect) is still closed, so whatever remains open
    /// is released. A second close logs a warning and succeeds.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!("Broker connection already closed");
            return Ok(());
        }
        if !self.session.is_connected() {
            debug!("Broker session partly down, releasing what remains");
        }
        self.session.close().await?;
        info!("Broker connection closed");
        Ok(())
    }
}

impl std::fmt::Debug for BrokerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerController")
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Publisher for BrokerController {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        message: Publishing,
    ) -> Result<()> {
        let result = self
            .session
            .publish(exchange, routing_key, options, message)
            .await;
        #[cfg(feature = "metrics")]
        crate::transport::metrics::record_publish(exchange, result.is_ok());
        result
    }

    async fn publish_with_deadline(
        &self,
        deadline: Duration,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        message: Publishing,
    ) -> Result<()> {
        let result = self
            .session
            .publish_with_deadline(deadline, exchange, routing_key, options, message)
            .await;
        #[cfg(feature = "metrics")]
        crate::transport::metrics::record_publish(exchange, result.is_ok());
        result
    }
}

#[async_trait]
impl Consumer for BrokerController {
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        args: FieldTable,
    ) -> Result<DeliveryStream> {
        self.session
            .consume(queue, consumer_tag, options, args)
            .await
    }
}

#[async_trait]
impl Registerer for BrokerController {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.session
            .exchange_declare(name, kind, options, args)
            .await
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        routing_key: &str,
        source: &str,
        options: ExchangeBindOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.session
            .exchange_bind(destination, routing_key, source, options, args)
            .await
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.session.queue_declare(name, options, args).await
    }

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        options: QueueBindOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.session
            .queue_bind(queue, routing_key, exchange, options, args)
            .await
    }
}
