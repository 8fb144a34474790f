// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Factory
//!
//! Creates producers and queue clients over a shared `ChannelProvider`, carrying the
//! settings every channel they open must honour: the QoS prefetch count and the
//! optional publish/get filters.

use crate::{
    channel::{AmqpConnection, ChannelProvider},
    client::QueueClient,
    codec::WireMessage,
    configs::RabbitMqConfigs,
    errors::AmqpError,
    producer::Producer,
};
use lapin::BasicProperties;
use std::sync::Arc;

/// Default number of unacked messages a channel may hold
pub const DEFAULT_PREFETCH_COUNT: u16 = 20;

/// Rewrites the properties of every message before it is published to the given queue.
pub type PublishFilter = Arc<dyn Fn(&str, BasicProperties) -> BasicProperties + Send + Sync>;
/// Observes every message pulled from the given queue.
pub type GetFilter = Arc<dyn Fn(&str, &WireMessage) + Send + Sync>;
/// Invoked with the routing key of every published message.
pub type PublishedCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct MessageFactory {
    pub(crate) provider: Arc<dyn ChannelProvider>,
    pub(crate) prefetch_count: u16,
    pub(crate) publish_filter: Option<PublishFilter>,
    pub(crate) get_filter: Option<GetFilter>,
    pub(crate) on_published: Option<PublishedCallback>,
}

impl MessageFactory {
    pub fn new(provider: Arc<dyn ChannelProvider>) -> MessageFactory {
        MessageFactory {
            provider,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            publish_filter: None,
            get_filter: None,
            on_published: None,
        }
    }

    /// Factory over a `lapin` connection to the configured broker.
    pub fn connect(cfg: &RabbitMqConfigs) -> MessageFactory {
        MessageFactory::new(Arc::new(AmqpConnection::new(&cfg.uri(), &cfg.app_name)))
    }

    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn publish_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, BasicProperties) -> BasicProperties + Send + Sync + 'static,
    {
        self.publish_filter = Some(Arc::new(filter));
        self
    }

    pub fn get_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &WireMessage) + Send + Sync + 'static,
    {
        self.get_filter = Some(Arc::new(filter));
        self
    }

    pub fn on_published<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_published = Some(Arc::new(callback));
        self
    }

    pub fn create_producer(&self) -> Producer {
        Producer::new(self.clone())
    }

    pub fn create_message_queue_client(&self) -> QueueClient {
        QueueClient::new(self.clone())
    }

    /// Closes the shared connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.provider.close().await
    }
}
