//! Broker topology declaration.
//!
//! [`TopologyRegistrar`] is a fluent chain over a [`Registerer`]:
//!
//! ```text
//! create_exchange -> create_deadletter -> create_queue* -> bind_queues -> complete
//! ```
//!
//! The first failing step is recorded and every later step is skipped, so a
//! partially declared topology is always reported by `complete()`. Calling a
//! step out of that order is recorded the same way.

use std::fmt;
use std::sync::Arc;

use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    ExchangeKind,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{BrokerError, Registerer};

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

fn default_dead_letter_routing_key() -> String {
    "dead-letter".to_string()
}

/// Dead-letter exchange, queue and the routing key joining them.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DeadLetterConfig {
    pub exchange: String,
    pub queue: String,
    #[serde(default = "default_dead_letter_routing_key")]
    pub routing_key: String,
}

impl DeadLetterConfig {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: default_dead_letter_routing_key(),
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Queue arguments routing rejected messages to this dead-letter exchange.
    fn queue_args(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(self.exchange.as_str().into()),
        );
        args.insert(
            DEAD_LETTER_ROUTING_KEY_ARG.into(),
            AMQPValue::LongString(self.routing_key.as_str().into()),
        );
        args
    }
}

/// A service's event topology, as configured.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TopologyEventSet {
    /// Main topic exchange.
    pub exchange: String,
    pub dead_letter: Option<DeadLetterConfig>,
    /// Service-owned queues.
    pub queues: Vec<String>,
    /// Keys each queue is bound to on the main exchange.
    pub routing_keys: Vec<String>,
}

impl TopologyEventSet {
    /// Run the registrar chain in canonical order.
    pub async fn declare(
        &self,
        registerer: Arc<dyn Registerer>,
    ) -> Result<DeclaredTopology, TopologyError> {
        let mut registrar = TopologyRegistrar::new(registerer, &self.exchange)
            .create_exchange()
            .await;

        if let Some(dead_letter) = &self.dead_letter {
            registrar = registrar
                .with_dead_letter(dead_letter.clone())
                .create_deadletter()
                .await;
        }

        for queue in &self.queues {
            registrar = registrar.create_queue(queue).await;
        }

        registrar.bind_queues(&self.routing_keys).await.complete()
    }
}

/// Position in the declaration chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    New,
    Exchange,
    DeadLetter,
    Queues,
    Bound,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::New => "new",
            Stage::Exchange => "exchange",
            Stage::DeadLetter => "deadletter",
            Stage::Queues => "queues",
            Stage::Bound => "bindings",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by [`TopologyRegistrar::complete`].
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Topology step {step} failed for {target}: {source}")]
    Declare {
        step: &'static str,
        target: String,
        source: BrokerError,
    },

    #[error("Topology step {step} called out of order (after {stage})")]
    OutOfOrder { step: &'static str, stage: Stage },
}

/// What a successful chain declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredTopology {
    pub exchange: String,
    pub dead_letter: Option<DeadLetterConfig>,
    pub queues: Vec<String>,
    /// (queue, routing key) pairs bound to the main exchange.
    pub bindings: Vec<(String, String)>,
}

/// Fluent topology declaration over a [`Registerer`].
pub struct TopologyRegistrar {
    registerer: Arc<dyn Registerer>,
    exchange: String,
    dead_letter: Option<DeadLetterConfig>,
    dead_letter_declared: bool,
    queues: Vec<String>,
    bindings: Vec<(String, String)>,
    stage: Stage,
    error: Option<TopologyError>,
}

impl TopologyRegistrar {
    pub fn new(registerer: Arc<dyn Registerer>, exchange: impl Into<String>) -> Self {
        Self {
            registerer,
            exchange: exchange.into(),
            dead_letter: None,
            dead_letter_declared: false,
            queues: Vec::new(),
            bindings: Vec::new(),
            stage: Stage::New,
            error: None,
        }
    }

    /// Dead-letter infrastructure used by [`create_deadletter`](Self::create_deadletter).
    pub fn with_dead_letter(mut self, dead_letter: DeadLetterConfig) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Queue names declared so far.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Declare the main exchange as a durable topic exchange.
    pub async fn create_exchange(mut self) -> Self {
        const STEP: &str = "create_exchange";
        if !self.enter(STEP, |stage| stage == Stage::New) {
            return self;
        }

        let exchange = self.exchange.clone();
        if exchange.is_empty() {
            self.fail(
                STEP,
                exchange,
                BrokerError::Configuration("exchange name is empty".to_string()),
            );
            return self;
        }

        match self
            .registerer
            .exchange_declare(
                &exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(()) => {
                info!(exchange = %exchange, "Declared exchange");
                self.stage = Stage::Exchange;
            }
            Err(e) => self.fail(STEP, exchange, e),
        }
        self
    }

    /// Declare the dead-letter exchange and queue and bind them.
    ///
    /// Without a dead-letter config this logs a warning and does nothing.
    pub async fn create_deadletter(mut self) -> Self {
        const STEP: &str = "create_deadletter";
        let Some(dead_letter) = self.dead_letter.clone() else {
            warn!("No dead-letter config, skipping dead-letter declaration");
            return self;
        };
        if !self.enter(STEP, |stage| stage == Stage::Exchange) {
            return self;
        }

        if let Err(e) = self
            .registerer
            .exchange_declare(
                &dead_letter.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            self.fail(STEP, dead_letter.exchange, e);
            return self;
        }

        if let Err(e) = self
            .registerer
            .queue_declare(
                &dead_letter.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            self.fail(STEP, dead_letter.queue, e);
            return self;
        }

        if let Err(e) = self
            .registerer
            .queue_bind(
                &dead_letter.queue,
                &dead_letter.routing_key,
                &dead_letter.exchange,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            self.fail(STEP, dead_letter.queue, e);
            return self;
        }

        info!(
            exchange = %dead_letter.exchange,
            queue = %dead_letter.queue,
            routing_key = %dead_letter.routing_key,
            "Declared dead-letter queue"
        );
        self.dead_letter_declared = true;
        self.stage = Stage::DeadLetter;
        self
    }

    /// Declare a durable service queue.
    ///
    /// An empty name logs a warning and leaves the chain untouched. When the
    /// dead-letter infrastructure has been declared, the queue routes rejected
    /// messages to it.
    pub async fn create_queue(mut self, name: &str) -> Self {
        const STEP: &str = "create_queue";
        if name.is_empty() {
            warn!("Empty queue name, skipping queue declaration");
            return self;
        }
        if !self.enter(STEP, |stage| {
            (Stage::Exchange..=Stage::Queues).contains(&stage)
        }) {
            return self;
        }

        let args = match (&self.dead_letter, self.dead_letter_declared) {
            (Some(dead_letter), true) => dead_letter.queue_args(),
            _ => FieldTable::default(),
        };

        match self
            .registerer
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
        {
            Ok(()) => {
                info!(
                    queue = %name,
                    dead_lettered = self.dead_letter_declared,
                    "Declared queue"
                );
                self.queues.push(name.to_string());
                self.stage = Stage::Queues;
            }
            Err(e) => self.fail(STEP, name.to_string(), e),
        }
        self
    }

    /// Bind every declared queue to the main exchange with every routing key.
    pub async fn bind_queues<S: AsRef<str>>(mut self, routing_keys: &[S]) -> Self {
        const STEP: &str = "bind_queues";
        if !self.enter(STEP, |stage| {
            (Stage::Exchange..=Stage::Queues).contains(&stage)
        }) {
            return self;
        }

        if self.queues.is_empty() || routing_keys.is_empty() {
            warn!(
                queues = self.queues.len(),
                routing_keys = routing_keys.len(),
                "Nothing to bind"
            );
        }

        for queue in self.queues.clone() {
            for routing_key in routing_keys.iter().map(|key| key.as_ref()) {
                if let Err(e) = self
                    .registerer
                    .queue_bind(
                        &queue,
                        routing_key,
                        &self.exchange,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                {
                    self.fail(STEP, format!("{} <- {}", queue, routing_key), e);
                    return self;
                }

                info!(
                    queue = %queue,
                    exchange = %self.exchange,
                    routing_key = %routing_key,
                    "Bound queue to exchange"
                );
                self.bindings.push((queue.clone(), routing_key.to_string()));
            }
        }

        self.stage = Stage::Bound;
        self
    }

    /// Finish the chain, surfacing the first recorded failure.
    pub fn complete(self) -> Result<DeclaredTopology, TopologyError> {
        if let Some(e) = self.error {
            debug!(exchange = %self.exchange, error = %e, "Topology setup failed");
            return Err(e);
        }
        if self.stage == Stage::New {
            return Err(TopologyError::OutOfOrder {
                step: "complete",
                stage: self.stage,
            });
        }

        info!(
            exchange = %self.exchange,
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "Topology setup complete"
        );

        let dead_letter = if self.dead_letter_declared {
            self.dead_letter
        } else {
            None
        };

        Ok(DeclaredTopology {
            exchange: self.exchange,
            dead_letter,
            queues: self.queues,
            bindings: self.bindings,
        })
    }

    /// Whether `step` should run. Records an ordering error when `allowed`
    /// rejects the current stage.
    fn enter(&mut self, step: &'static str, allowed: impl Fn(Stage) -> bool) -> bool {
        if self.error.is_some() {
            debug!(step, "Skipping topology step after earlier failure");
            return false;
        }
        if !allowed(self.stage) {
            warn!(step, stage = %self.stage, "Topology step called out of order");
            self.error = Some(TopologyError::OutOfOrder {
                step,
                stage: self.stage,
            });
            return false;
        }
        true
    }

    fn fail(&mut self, step: &'static str, target: String, source: BrokerError) {
        warn!(step, target = %target, error = %source, "Topology step failed");
        self.error = Some(TopologyError::Declare {
            step,
            target,
            source,
        });
    }
}
