// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ queues and their bindings,
//! together with the queue naming convention of the message server. Every message
//! type `T` owns four queues:
//!
//! - `{T}.inq` - default queue, bound to the direct exchange
//! - `{T}.priorityq` - processed by dedicated priority workers
//! - `{T}.outq` - topic queue receiving notifications of processed messages
//! - `{T}.dlq` - dead letters of the `in` and `priority` queues
//!
//! External tooling depends on this naming scheme.

use crate::envelope::MessageBody;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

pub const SUFFIX_IN: &str = ".inq";
pub const SUFFIX_PRIORITY: &str = ".priorityq";
pub const SUFFIX_OUT: &str = ".outq";
pub const SUFFIX_DLQ: &str = ".dlq";

/// Prefix of the exclusive reply queues created by `QueueClient::get_temp_queue_name`
pub const TEMP_QUEUE_PREFIX: &str = "mq:tmp:";
/// Prefix of the queue names generated by the broker itself
pub const BROKER_GENERATED_PREFIX: &str = "amq.";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions,
/// including the dead-letter routing applied to nacked messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is non-durable, non-exclusive and never auto-deleted.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Routes messages rejected without requeue to `exchange` with `routing_key`.
    pub fn with_dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.dead_letter_routing_key.as_deref()
    }

    /// The `x-*` declaration arguments for this queue.
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        FieldTable::from(args)
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// The four queue names owned by a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub inq: String,
    pub priorityq: String,
    pub outq: String,
    pub dlq: String,
}

impl QueueNames {
    pub fn new(type_name: &str) -> QueueNames {
        QueueNames {
            inq: format!("{type_name}{SUFFIX_IN}"),
            priorityq: format!("{type_name}{SUFFIX_PRIORITY}"),
            outq: format!("{type_name}{SUFFIX_OUT}"),
            dlq: format!("{type_name}{SUFFIX_DLQ}"),
        }
    }

    pub fn of<T: MessageBody>() -> QueueNames {
        QueueNames::new(&T::type_name())
    }

    /// Exclusive reply queues and broker-generated queues are declared by whoever
    /// created them and must never be redeclared.
    pub fn is_temp_queue(queue_name: &str) -> bool {
        queue_name.starts_with(TEMP_QUEUE_PREFIX) || queue_name.starts_with(BROKER_GENERATED_PREFIX)
    }

    pub fn is_priority_queue(queue_name: &str) -> bool {
        queue_name.ends_with(SUFFIX_PRIORITY)
    }

    /// Dead-letter queue receiving the messages rejected from `queue_name`.
    pub fn dlq_for(queue_name: &str) -> String {
        if queue_name.ends_with(SUFFIX_DLQ) {
            return queue_name.to_owned();
        }

        let base = queue_name
            .strip_suffix(SUFFIX_IN)
            .or_else(|| queue_name.strip_suffix(SUFFIX_PRIORITY))
            .unwrap_or(queue_name);

        format!("{base}{SUFFIX_DLQ}")
    }

    pub fn temp_queue_name() -> String {
        format!("{TEMP_QUEUE_PREFIX}{}", Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names_follow_convention() {
        let names = QueueNames::new("OrderPlaced");

        assert_eq!(names.inq, "OrderPlaced.inq");
        assert_eq!(names.priorityq, "OrderPlaced.priorityq");
        assert_eq!(names.outq, "OrderPlaced.outq");
        assert_eq!(names.dlq, "OrderPlaced.dlq");
    }

    #[test]
    fn test_dlq_for_strips_known_suffixes() {
        assert_eq!(QueueNames::dlq_for("OrderPlaced.inq"), "OrderPlaced.dlq");
        assert_eq!(QueueNames::dlq_for("OrderPlaced.priorityq"), "OrderPlaced.dlq");
        assert_eq!(QueueNames::dlq_for("OrderPlaced.dlq"), "OrderPlaced.dlq");
        assert_eq!(QueueNames::dlq_for("replies"), "replies.dlq");
    }

    #[test]
    fn test_temp_queue_detection() {
        assert!(QueueNames::is_temp_queue(&QueueNames::temp_queue_name()));
        assert!(QueueNames::is_temp_queue("amq.gen-JzTY20BRgKO-HjmUJj0wLg"));
        assert!(!QueueNames::is_temp_queue("OrderPlaced.inq"));
    }

    #[test]
    fn test_dead_letter_arguments() {
        let def = QueueDefinition::new("OrderPlaced.inq")
            .durable()
            .with_dead_letter("mx.dlq", "OrderPlaced.dlq");

        let args = def.arguments();
        let exchange = args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE);
        let key = args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY);

        assert_eq!(
            exchange,
            Some(&AMQPValue::LongString(LongString::from("mx.dlq")))
        );
        assert_eq!(
            key,
            Some(&AMQPValue::LongString(LongString::from("OrderPlaced.dlq")))
        );
        assert!(QueueDefinition::new("plain").arguments().inner().is_empty());
    }
}
