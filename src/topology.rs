// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and creating RabbitMQ topology components.
//! The topology includes exchanges, queues, and the bindings between them.
//!
//! The main components are:
//! - `Topology`: a batch of exchanges, queues and bindings installed in one go
//! - `register_*` functions: the per-queue topology of the message server
//!
//! Registration is idempotent. A redeclaration that the broker rejects with
//! `PRECONDITION_FAILED` means the queue already exists with other arguments and is
//! left as it is.

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, EXCHANGE_DIRECT, EXCHANGE_DLQ, EXCHANGE_TOPIC},
    queue::{QueueBinding, QueueDefinition, QueueNames, SUFFIX_DLQ, SUFFIX_OUT},
};
use tracing::{debug, warn};

/// A batch of exchanges, queues and bindings.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            already_exists(channel.exchange_declare(exch).await)?;
        }

        for queue in &self.queues {
            already_exists(channel.queue_declare(queue).await)?;
        }

        for binding in &self.queues_binding {
            channel.queue_bind(binding).await?;
        }

        debug!("topology installed");

        Ok(())
    }
}

fn already_exists(result: Result<(), AmqpError>) -> Result<(), AmqpError> {
    match result {
        Err(AmqpError::PreconditionFailed(name)) => {
            warn!(name = name.as_str(), "already declared with different arguments, skipping");
            Ok(())
        }
        other => other,
    }
}

/// Durable queue bound to the direct exchange, dead-lettering into its `.dlq`.
///
/// Temp queues are declared by their creator and produce an empty topology.
pub fn queue_topology(queue_name: &str) -> Topology {
    if QueueNames::is_temp_queue(queue_name) {
        return Topology::new();
    }

    Topology::new()
        .queue(
            QueueDefinition::new(queue_name)
                .durable()
                .with_dead_letter(EXCHANGE_DLQ, &QueueNames::dlq_for(queue_name)),
        )
        .queue_binding(
            QueueBinding::new(queue_name)
                .exchange(EXCHANGE_DIRECT)
                .routing_key(queue_name),
        )
}

/// Durable dead-letter queue bound to the DLQ exchange.
pub fn dlq_topology(queue_name: &str) -> Topology {
    Topology::new()
        .queue(QueueDefinition::new(queue_name).durable())
        .queue_binding(
            QueueBinding::new(queue_name)
                .exchange(EXCHANGE_DLQ)
                .routing_key(queue_name),
        )
}

/// Durable out queue bound to the topic exchange.
pub fn topic_topology(queue_name: &str) -> Topology {
    Topology::new()
        .queue(QueueDefinition::new(queue_name).durable())
        .queue_binding(
            QueueBinding::new(queue_name)
                .exchange(EXCHANGE_TOPIC)
                .routing_key(queue_name),
        )
}

pub async fn register_queue(channel: &dyn BrokerChannel, queue_name: &str) -> Result<(), AmqpError> {
    queue_topology(queue_name).install(channel).await
}

pub async fn register_dlq(channel: &dyn BrokerChannel, queue_name: &str) -> Result<(), AmqpError> {
    dlq_topology(queue_name).install(channel).await
}

pub async fn register_topic(channel: &dyn BrokerChannel, queue_name: &str) -> Result<(), AmqpError> {
    topic_topology(queue_name).install(channel).await
}

/// Registers a queue according to its suffix: `.dlq`, `.outq`, anything else.
pub async fn register_queue_by_name(
    channel: &dyn BrokerChannel,
    queue_name: &str,
) -> Result<(), AmqpError> {
    if queue_name.ends_with(SUFFIX_DLQ) {
        register_dlq(channel, queue_name).await
    } else if queue_name.ends_with(SUFFIX_OUT) {
        register_topic(channel, queue_name).await
    } else {
        register_queue(channel, queue_name).await
    }
}

/// Registers the four queues of a message type.
pub async fn register_queues(channel: &dyn BrokerChannel, names: &QueueNames) -> Result<(), AmqpError> {
    register_queue(channel, &names.inq).await?;
    register_queue(channel, &names.priorityq).await?;
    register_topic(channel, &names.outq).await?;
    register_dlq(channel, &names.dlq).await
}
