// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! This module provides functionality for publishing envelopes to the server queues.
//! A producer lazily opens its own channel, declares each destination queue the first
//! time it publishes to it, and propagates OpenTelemetry context in the message headers.

use crate::{
    channel::{open_channel, BrokerChannel},
    codec::{to_wire_body, to_wire_properties, DELIVERY_MODE_TRANSIENT},
    envelope::{Envelope, MessageBody},
    errors::AmqpError,
    exchange::{EXCHANGE_DIRECT, EXCHANGE_TOPIC},
    factory::MessageFactory,
    otel,
    queue::QueueNames,
    topology::register_queue_by_name,
};
use lapin::BasicProperties;
use opentelemetry::Context;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, warn};

/// Publishes envelopes through a channel it owns.
///
/// A producer is not meant to be shared between tasks; every worker and client owns one.
pub struct Producer {
    pub(crate) factory: MessageFactory,
    channel: Option<Arc<dyn BrokerChannel>>,
    declared: HashSet<String>,
    disposed: bool,
}

impl Producer {
    pub(crate) fn new(factory: MessageFactory) -> Producer {
        Producer {
            factory,
            channel: None,
            declared: HashSet::default(),
            disposed: false,
        }
    }

    /// Publishes a persistent message to `queue_name` through the direct exchange.
    pub async fn publish<T: MessageBody>(
        &mut self,
        queue_name: &str,
        env: &Envelope<T>,
    ) -> Result<(), AmqpError> {
        let props = to_wire_properties(env)?;
        let body = to_wire_body(env)?;

        self.publish_to(EXCHANGE_DIRECT, queue_name, props, &body).await
    }

    /// Publishes to the priority queue of the body type when the envelope has a priority,
    /// otherwise to its in queue.
    pub async fn publish_message<T: MessageBody>(&mut self, env: &Envelope<T>) -> Result<(), AmqpError> {
        let names = QueueNames::new(&env.body.kind());
        let queue_name = if env.priority > 0 {
            names.priorityq
        } else {
            names.inq
        };

        self.publish(&queue_name, env).await
    }

    /// Publishes a transient message to `queue_name` through the topic exchange.
    pub async fn notify<T: MessageBody>(
        &mut self,
        queue_name: &str,
        env: &Envelope<T>,
    ) -> Result<(), AmqpError> {
        let props = to_wire_properties(env)?.with_delivery_mode(DELIVERY_MODE_TRANSIENT);
        let body = to_wire_body(env)?;

        self.publish_to(EXCHANGE_TOPIC, queue_name, props, &body).await
    }

    pub(crate) async fn publish_to(
        &mut self,
        exchange: &str,
        queue_name: &str,
        props: BasicProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        self.declare_once(channel.as_ref(), queue_name).await?;

        let mut props = otel::inject_context(&Context::current(), props);
        if let Some(filter) = &self.factory.publish_filter {
            props = filter(queue_name, props);
        }

        debug!(exchange = exchange, queue = queue_name, "publishing message");
        channel.basic_publish(exchange, queue_name, body, props).await?;

        if let Some(callback) = &self.factory.on_published {
            callback(queue_name);
        }

        Ok(())
    }

    pub(crate) async fn declare_once(
        &mut self,
        channel: &dyn BrokerChannel,
        queue_name: &str,
    ) -> Result<(), AmqpError> {
        if self.declared.contains(queue_name) {
            return Ok(());
        }

        register_queue_by_name(channel, queue_name).await?;
        self.declared.insert(queue_name.to_owned());

        Ok(())
    }

    /// The open channel of this producer, opening a new one when there is none or the
    /// broker closed the previous one.
    pub(crate) async fn channel(&mut self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.disposed {
            return Err(AmqpError::Disposed("producer".to_owned()));
        }

        if let Some(channel) = &self.channel {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            debug!("channel was closed, reopening");
            self.reset_channel();
        }

        let channel = open_channel(self.factory.provider.as_ref()).await?;
        channel.basic_qos(self.factory.prefetch_count).await?;
        self.channel = Some(channel.clone());

        Ok(channel)
    }

    /// Forgets the current channel and the queues declared through it.
    pub(crate) fn reset_channel(&mut self) {
        self.channel = None;
        self.declared.clear();
    }

    /// Closes the channel, returning its unacked messages to their queues.
    ///
    /// The shared connection stays open. Calling it twice is a no-op.
    pub async fn dispose(&mut self) {
        self.disposed = true;

        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "error to close the producer channel");
            }
        }
        self.declared.clear();
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = channel.close().await;
            });
        }
    }
}
