// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides types for defining the exchanges used by the message server.
//! Every message type is routed through three exchanges: a direct exchange for
//! point-to-point delivery into `.inq`/`.priorityq` queues, a topic exchange for
//! fan-out of `.outq` notifications, and a direct exchange dedicated to dead letters.

/// Direct exchange used for point-to-point publishing
pub const EXCHANGE_DIRECT: &str = "mx.direct";
/// Topic exchange used for fan-out notifications
pub const EXCHANGE_TOPIC: &str = "mx.topic";
/// Direct exchange receiving dead-lettered messages
pub const EXCHANGE_DLQ: &str = "mx.dlq";

/// Represents the types of exchanges used by the server.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure exchange definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a non-durable Direct exchange.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }
}

/// The three exchanges every channel declares before use.
pub fn server_exchanges() -> [ExchangeDefinition; 3] {
    [
        ExchangeDefinition::new(EXCHANGE_DIRECT).direct().durable(),
        ExchangeDefinition::new(EXCHANGE_DLQ).direct().durable(),
        ExchangeDefinition::new(EXCHANGE_TOPIC).topic().durable(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_exchanges_are_durable() {
        let exchanges = server_exchanges();

        assert!(exchanges.iter().all(|e| e.is_durable() && !e.is_auto_delete()));
        assert_eq!(exchanges[0].exchange_kind(), &ExchangeKind::Direct);
        assert_eq!(exchanges[1].name(), EXCHANGE_DLQ);
        assert_eq!(exchanges[2].exchange_kind(), &ExchangeKind::Topic);
    }

    #[test]
    fn test_kind_converts_to_lapin() {
        let kind: lapin::ExchangeKind = ExchangeKind::Topic.into();
        assert!(matches!(kind, lapin::ExchangeKind::Topic));
    }
}
