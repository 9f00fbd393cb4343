//! Mock broker session for testing.
//!
//! Records every declaration, binding and publish so tests can assert on the
//! resulting topology without a running RabbitMQ.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    ExchangeKind,
};

use super::{
    BrokerError, BrokerSession, Consumer, DeliveryStream, Dialer, Publisher, Publishing,
    Registerer, Result,
};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOperation {
    Publish,
    Consume,
    ExchangeDeclare,
    ExchangeBind,
    QueueDeclare,
    QueueBind,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRecord {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub name: String,
    pub durable: bool,
    pub args: FieldTable,
}

impl QueueRecord {
    /// String value of a queue argument such as `x-dead-letter-exchange`.
    pub fn arg(&self, key: &str) -> Option<String> {
        self.args
            .inner()
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .and_then(|(_, value)| match value {
                AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
                AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
                _ => None,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRecord {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct Recorded {
    exchanges: Vec<ExchangeRecord>,
    queues: Vec<QueueRecord>,
    bindings: Vec<BindingRecord>,
    published: Vec<PublishRecord>,
    consumers: Vec<String>,
    failures: Vec<MockOperation>,
}

/// In-memory broker session.
pub struct MockBroker {
    recorded: Mutex<Recorded>,
    connection_open: AtomicBool,
    channel_open: AtomicBool,
    close_calls: AtomicUsize,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            recorded: Mutex::new(Recorded::default()),
            connection_open: AtomicBool::new(true),
            channel_open: AtomicBool::new(true),
            close_calls: AtomicUsize::new(0),
        }
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every later call of `operation` fail.
    pub fn fail_on(&self, operation: MockOperation) {
        self.recorded().failures.push(operation);
    }

    /// Simulate a broker-initiated disconnect.
    pub fn sever(&self) {
        self.channel_open.store(false, Ordering::SeqCst);
        self.connection_open.store(false, Ordering::SeqCst);
    }

    /// Simulate a channel-level error: the channel closes, the connection stays up.
    pub fn sever_channel(&self) {
        self.channel_open.store(false, Ordering::SeqCst);
    }

    /// Whether the underlying connection is still open.
    pub fn connection_open(&self) -> bool {
        self.connection_open.load(Ordering::SeqCst)
    }

    /// Number of times `close` reached the session.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn exchanges(&self) -> Vec<ExchangeRecord> {
        self.recorded().exchanges.clone()
    }

    pub fn queues(&self) -> Vec<QueueRecord> {
        self.recorded().queues.clone()
    }

    pub fn queue(&self, name: &str) -> Option<QueueRecord> {
        self.recorded().queues.iter().find(|q| q.name == name).cloned()
    }

    pub fn bindings(&self) -> Vec<BindingRecord> {
        self.recorded().bindings.clone()
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.recorded().published.clone()
    }

    /// Queues a consumer has been opened on.
    pub fn consumers(&self) -> Vec<String> {
        self.recorded().consumers.clone()
    }

    fn check(&self, operation: MockOperation) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.injected(operation)
    }

    fn injected(&self, operation: MockOperation) -> Result<()> {
        if !self.recorded().failures.contains(&operation) {
            return Ok(());
        }
        let message = format!("Mock {:?} failure", operation);
        Err(match operation {
            MockOperation::Publish => BrokerError::Publish(message),
            MockOperation::Consume => BrokerError::Consume(message),
            MockOperation::Close => BrokerError::Close(message),
            _ => BrokerError::Declare(message),
        })
    }
}

#[async_trait]
impl Publisher for MockBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        message: Publishing,
    ) -> Result<()> {
        self.check(MockOperation::Publish)?;
        self.recorded().published.push(PublishRecord {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: message.body,
        });
        Ok(())
    }
}

#[async_trait]
impl Consumer for MockBroker {
    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _options: BasicConsumeOptions,
        _args: FieldTable,
    ) -> Result<DeliveryStream> {
        self.check(MockOperation::Consume)?;
        self.recorded().consumers.push(queue.to_string());
        Ok(futures::stream::empty().boxed())
    }
}

#[async_trait]
impl Registerer for MockBroker {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _args: FieldTable,
    ) -> Result<()> {
        self.check(MockOperation::ExchangeDeclare)?;
        self.recorded().exchanges.push(ExchangeRecord {
            name: name.to_string(),
            kind,
            durable: options.durable,
        });
        Ok(())
    }

    async fn exchange_bind(
        &self,
        _destination: &str,
        _routing_key: &str,
        _source: &str,
        _options: ExchangeBindOptions,
        _args: FieldTable,
    ) -> Result<()> {
        self.check(MockOperation::ExchangeBind)
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<()> {
        self.check(MockOperation::QueueDeclare)?;
        self.recorded().queues.push(QueueRecord {
            name: name.to_string(),
            durable: options.durable,
            args,
        });
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        _options: QueueBindOptions,
        _args: FieldTable,
    ) -> Result<()> {
        self.check(MockOperation::QueueBind)?;
        self.recorded().bindings.push(BindingRecord {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for MockBroker {
    fn is_connected(&self) -> bool {
        self.connection_open.load(Ordering::SeqCst) && self.channel_open.load(Ordering::SeqCst)
    }

    /// Closes whatever is still open, like the AMQP session.
    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.connection_open() {
            self.injected(MockOperation::Close)?;
        }
        self.channel_open.store(false, Ordering::SeqCst);
        self.connection_open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

enum DialBehavior {
    Connect(Arc<MockBroker>),
    Fail,
    Hang,
}

/// Dialer that hands out a [`MockBroker`] and counts dial attempts.
pub struct MockDialer {
    behavior: DialBehavior,
    dials: AtomicUsize,
    last_uri: Mutex<Option<String>>,
}

impl MockDialer {
    /// Every dial succeeds with `broker`.
    pub fn new(broker: Arc<MockBroker>) -> Self {
        Self::with_behavior(DialBehavior::Connect(broker))
    }

    /// Every dial fails with a connection error.
    pub fn failing() -> Self {
        Self::with_behavior(DialBehavior::Fail)
    }

    /// Every dial blocks forever.
    pub fn hanging() -> Self {
        Self::with_behavior(DialBehavior::Hang)
    }

    fn with_behavior(behavior: DialBehavior) -> Self {
        Self {
            behavior,
            dials: AtomicUsize::new(0),
            last_uri: Mutex::new(None),
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// URI passed to the most recent dial.
    pub fn last_uri(&self) -> Option<String> {
        self.last_uri
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerSession>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        *self.last_uri.lock().unwrap_or_else(|e| e.into_inner()) = Some(uri.to_string());

        match &self.behavior {
            DialBehavior::Connect(broker) => Ok(broker.clone() as Arc<dyn BrokerSession>),
            DialBehavior::Fail => Err(BrokerError::Connection(
                "Mock connection refused".to_string(),
            )),
            DialBehavior::Hang => futures::future::pending().await,
        }
    }
}
