// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Queue Client
//!
//! A `QueueClient` is a `Producer` that can also pull messages from queues and
//! acknowledge them. Messages are never lost on a negative acknowledgement: a message
//! that is not requeued is first republished to the dead-letter queue of its type and
//! only then acknowledged.

use crate::{
    codec::{from_wire_message, to_wire_body, to_wire_properties, with_error_header, WireMessage},
    envelope::{Envelope, MessageBody, ResponseStatus},
    errors::AmqpError,
    exchange::{EXCHANGE_DIRECT, EXCHANGE_DLQ},
    factory::MessageFactory,
    producer::Producer,
    queue::{QueueBinding, QueueDefinition, QueueNames},
    topology::{register_queue_by_name, Topology},
};
use lapin::BasicProperties;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

/// Interval between two polls of `QueueClient::get`
pub const GET_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct QueueClient {
    producer: Producer,
}

impl QueueClient {
    pub(crate) fn new(factory: MessageFactory) -> QueueClient {
        QueueClient {
            producer: Producer::new(factory),
        }
    }

    pub async fn publish<T: MessageBody>(
        &mut self,
        queue_name: &str,
        env: &Envelope<T>,
    ) -> Result<(), AmqpError> {
        self.producer.publish(queue_name, env).await
    }

    pub async fn publish_message<T: MessageBody>(&mut self, env: &Envelope<T>) -> Result<(), AmqpError> {
        self.producer.publish_message(env).await
    }

    pub async fn notify<T: MessageBody>(
        &mut self,
        queue_name: &str,
        env: &Envelope<T>,
    ) -> Result<(), AmqpError> {
        self.producer.notify(queue_name, env).await
    }

    /// Pulls one raw message without waiting.
    ///
    /// A queue the broker does not know is registered and read once more.
    pub async fn get_message(&mut self, queue_name: &str) -> Result<Option<WireMessage>, AmqpError> {
        let channel = self.producer.channel().await?;

        let msg = match channel.basic_get(queue_name).await {
            Err(AmqpError::NotFound(_)) => {
                warn!(queue = queue_name, "queue not found, registering it");
                // a 404 closes the channel on the broker side
                self.producer.reset_channel();
                let channel = self.producer.channel().await?;
                self.producer
                    .declare_once(channel.as_ref(), queue_name)
                    .await?;
                channel.basic_get(queue_name).await?
            }
            other => other?,
        };

        if let (Some(msg), Some(filter)) = (&msg, &self.producer.factory.get_filter) {
            filter(queue_name, msg);
        }

        Ok(msg)
    }

    /// Pulls one message without waiting.
    pub async fn get_async<T: DeserializeOwned>(
        &mut self,
        queue_name: &str,
    ) -> Result<Option<Envelope<T>>, AmqpError> {
        match self.get_message(queue_name).await? {
            Some(msg) => Ok(Some(from_wire_message(&msg)?)),
            None => Ok(None),
        }
    }

    /// Polls `queue_name` until a message arrives or `timeout` elapses.
    ///
    /// With no timeout, waits until a message arrives. An elapsed timeout is `Ok(None)`.
    pub async fn get<T: DeserializeOwned>(
        &mut self,
        queue_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope<T>>, AmqpError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(env) = self.get_async(queue_name).await? {
                return Ok(Some(env));
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    GET_POLL_INTERVAL.min(deadline - now)
                }
                None => GET_POLL_INTERVAL,
            };

            sleep(pause).await;
        }
    }

    pub async fn ack<T>(&mut self, env: &Envelope<T>) -> Result<(), AmqpError> {
        let tag = delivery_tag(env)?;
        self.ack_tag(tag).await
    }

    pub async fn ack_tag(&mut self, delivery_tag: u64) -> Result<(), AmqpError> {
        let channel = self.producer.channel().await?;
        channel.basic_ack(delivery_tag).await
    }

    pub async fn nack_tag(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let channel = self.producer.channel().await?;
        channel.basic_nack(delivery_tag, requeue).await
    }

    /// Negatively acknowledges a received message.
    ///
    /// With `requeue` the broker puts the message back in its queue. Otherwise the
    /// envelope is published to the `.dlq` of its body type with `error` attached and the
    /// original delivery is acked. If that publish fails the delivery is requeued instead
    /// and `PublishingToDLQError` is returned.
    pub async fn nak<T: MessageBody>(
        &mut self,
        env: &Envelope<T>,
        requeue: bool,
        error: Option<ResponseStatus>,
    ) -> Result<(), AmqpError> {
        let tag = delivery_tag(env)?;

        if requeue {
            return self.nack_tag(tag, true).await;
        }

        let mut props = to_wire_properties(env)?;
        if let Some(error) = &error {
            props = with_error_header(props, error)?;
        }
        let body = to_wire_body(env)?;
        let dlq = QueueNames::new(&env.body.kind()).dlq;

        self.dead_letter(tag, &dlq, props, &body).await
    }

    /// Moves a message that could not be decoded to `dlq`, attaching `error`.
    pub async fn dead_letter_raw(
        &mut self,
        dlq: &str,
        msg: &WireMessage,
        error: ResponseStatus,
    ) -> Result<(), AmqpError> {
        let props = with_error_header(msg.properties.clone(), &error)?;
        self.dead_letter(msg.delivery_tag, dlq, props, &msg.data).await
    }

    async fn dead_letter(
        &mut self,
        delivery_tag: u64,
        dlq: &str,
        props: BasicProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        match self.producer.publish_to(EXCHANGE_DLQ, dlq, props, body).await {
            Ok(()) => {
                debug!(queue = dlq, "message sent to dlq");
                self.ack_tag(delivery_tag).await
            }
            Err(err) => {
                error!(error = err.to_string(), queue = dlq, "error whiling sending to dlq");

                if let Err(err) = self.nack_tag(delivery_tag, true).await {
                    error!(error = err.to_string(), "error whiling requeuing");
                }

                Err(AmqpError::PublishingToDLQError(dlq.to_owned()))
            }
        }
    }

    /// Declares an exclusive, auto-deleted queue bound to the direct exchange and
    /// returns its name, for use as a `reply_to` address.
    pub async fn get_temp_queue_name(&mut self) -> Result<String, AmqpError> {
        let channel = self.producer.channel().await?;
        let name = QueueNames::temp_queue_name();

        Topology::new()
            .queue(QueueDefinition::new(&name).exclusive().delete())
            .queue_binding(
                QueueBinding::new(&name)
                    .exchange(EXCHANGE_DIRECT)
                    .routing_key(&name),
            )
            .install(channel.as_ref())
            .await?;

        Ok(name)
    }

    /// Registers `queue_name` according to its suffix on this client's channel.
    pub async fn register_queue(&mut self, queue_name: &str) -> Result<(), AmqpError> {
        let channel = self.producer.channel().await?;
        register_queue_by_name(channel.as_ref(), queue_name).await
    }

    pub async fn dispose(&mut self) {
        self.producer.dispose().await
    }
}

fn delivery_tag<T>(env: &Envelope<T>) -> Result<u64, AmqpError> {
    env.tag
        .ok_or_else(|| AmqpError::MissingDeliveryTag(env.id.to_string()))
}
