// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and management of AMQP connections and channels.
//! The rest of the crate talks to the broker only through the `BrokerChannel` and
//! `ChannelProvider` traits, which are implemented here on top of `lapin`.
//!
//! A single connection is shared by every producer, queue client and worker of a
//! process; each of them opens its own channel over it.

use crate::{
    codec::WireMessage,
    errors::AmqpError,
    exchange::{server_exchanges, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Channel-level operations used by producers, queue clients and the topology installer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Pulls a single message, `None` when the queue is empty.
    async fn basic_get(&self, queue: &str) -> Result<Option<WireMessage>, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    /// Closes the channel. Unacked messages are returned to their queues by the broker.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Source of broker channels sharing one underlying connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Creates a channel with the three server exchanges declared.
pub async fn open_channel(
    provider: &dyn ChannelProvider,
) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
    let channel = provider.create_channel().await?;

    for exchange in server_exchanges() {
        channel.exchange_declare(&exchange).await?;
    }

    Ok(channel)
}

/// Maps a `lapin` failure onto `AmqpError`, keeping 404 and 406 replies distinguishable.
pub(crate) fn classify(err: &lapin::Error, name: &str, fallback: AmqpError) -> AmqpError {
    if let lapin::Error::ProtocolError(amqp) = err {
        match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                return AmqpError::NotFound(name.to_owned())
            }
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                return AmqpError::PreconditionFailed(name.to_owned())
            }
            _ => {}
        }
    }

    fallback
}

/// `BrokerChannel` backed by a `lapin` channel.
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> LapinChannel {
        LapinChannel { channel }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(classify(
                    &err,
                    &def.name,
                    AmqpError::DeclareExchangeError(def.name.clone()),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = def.name.as_str(), "error to declare the queue");
                Err(classify(
                    &err,
                    &def.name,
                    AmqpError::DeclareQueueError(def.name.clone()),
                ))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(classify(
                    &err,
                    &binding.queue_name,
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = exchange,
                    routing_key = routing_key,
                    "error publishing message"
                );
                Err(classify(
                    &err,
                    routing_key,
                    AmqpError::PublishingError(routing_key.to_owned()),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<WireMessage>, AmqpError> {
        match self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Ok(Some(msg)) => {
                let delivery = msg.delivery;
                Ok(Some(WireMessage {
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    properties: delivery.properties,
                    data: delivery.data,
                }))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "error to get message");
                Err(classify(
                    &err,
                    queue,
                    AmqpError::GetMessageError(queue.to_owned()),
                ))
            }
        }
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        match self.channel.close(200, "OK").await {
            Err(err) => {
                warn!(error = err.to_string(), "error to close the channel");
                Err(AmqpError::CloseError("channel".to_owned()))
            }
            _ => Ok(()),
        }
    }
}

/// `ChannelProvider` over a lazily opened `lapin` connection.
///
/// The connection is created on the first channel request and recreated whenever
/// the cached one is no longer connected.
pub struct AmqpConnection {
    uri: String,
    name: String,
    conn: Mutex<Option<Arc<Connection>>>,
    closed: AtomicBool,
}

impl AmqpConnection {
    /// Creates a provider for the given `amqp://` URI.
    ///
    /// # Parameters
    /// * `uri` - Connection URI, see `RabbitMqConfigs::uri`
    /// * `name` - Connection name reported to the broker
    pub fn new(uri: &str, name: &str) -> AmqpConnection {
        AmqpConnection {
            uri: uri.to_owned(),
            name: name.to_owned(),
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        let mut guard = self.conn.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
            warn!("amqp connection lost, reconnecting...");
        }

        debug!("creating amqp connection...");
        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(self.name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(Arc::new(c)),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl ChannelProvider for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::Disposed("connection".to_owned()));
        }

        let conn = self.connection().await?;

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel::new(c)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let Some(conn) = self.conn.lock().await.take() else {
            return Ok(());
        };

        if !conn.status().connected() {
            return Ok(());
        }

        match conn.close(200, "OK").await {
            Err(err) => {
                warn!(error = err.to_string(), "error to close the connection");
                Err(AmqpError::CloseError("connection".to_owned()))
            }
            _ => {
                debug!("amqp connection closed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{EXCHANGE_DIRECT, EXCHANGE_DLQ, EXCHANGE_TOPIC};
    use mockall::predicate::always;

    #[tokio::test]
    async fn test_open_channel_declares_server_exchanges() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_exchange_declare()
            .withf(|def| {
                [EXCHANGE_DIRECT, EXCHANGE_DLQ, EXCHANGE_TOPIC].contains(&def.name()) && def.is_durable()
            })
            .times(3)
            .returning(|_| Ok(()));

        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
        let mut provider = MockChannelProvider::new();
        provider
            .expect_create_channel()
            .times(1)
            .returning(move || Ok(channel.clone()));

        assert!(open_channel(&provider).await.is_ok());
    }

    #[tokio::test]
    async fn test_open_channel_propagates_declare_errors() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_exchange_declare()
            .with(always())
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));

        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
        let mut provider = MockChannelProvider::new();
        provider
            .expect_create_channel()
            .returning(move || Ok(channel.clone()));

        let err = open_channel(&provider).await.err();
        assert_eq!(
            err,
            Some(AmqpError::DeclareExchangeError(EXCHANGE_DIRECT.to_owned()))
        );
    }

    #[test]
    fn test_classify_keeps_fallback_for_other_errors() {
        let err = lapin::Error::ChannelsLimitReached;
        assert_eq!(
            classify(&err, "q", AmqpError::GetMessageError("q".to_owned())),
            AmqpError::GetMessageError("q".to_owned())
        );
    }
}
