// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Message Server
//!
//! This module provides the error type shared by every layer of the crate.
//! The `AmqpError` enum covers broker failures (connection, channel, declaration,
//! publishing, acknowledgement), payload encoding failures, configuration errors
//! raised at registration time, and lifecycle errors raised on disposed objects.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker or supervising workers.
///
/// Broker-side variants carry the name of the exchange or queue involved where one
/// exists. Configuration variants (`HandlerAlreadyRegistered`, `InvalidRetryCount`,
/// `InvalidThreadCount`, `RegistrationClosed`) fail fast at registration time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error closing a channel or a connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// The broker answered 404 for the given queue or exchange
    #[error("`{0}` was not found")]
    NotFound(String),

    /// The broker answered 406, usually a redeclaration with different arguments
    #[error("precondition failed for `{0}`")]
    PreconditionFailed(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error reading a message from a queue
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),

    /// Error parsing a message payload or header
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error serializing a message payload or header
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Ack or nack attempted on a message that was never delivered by the broker
    #[error("message `{0}` has no delivery tag")]
    MissingDeliveryTag(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq `{0}`")]
    PublishingToDLQError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// A handler was already registered for the message type
    #[error("message handler has already been registered for type `{0}`")]
    HandlerAlreadyRegistered(String),

    /// Retry count outside of the supported range
    #[error("invalid retry count `{0}`, must be 0 or 1")]
    InvalidRetryCount(u32),

    /// A handler was registered with zero threads
    #[error("invalid thread count for type `{0}`, must be at least 1")]
    InvalidThreadCount(String),

    /// Handlers can't be registered once the server built its workers
    #[error("handlers can't be registered after init, type `{0}`")]
    RegistrationClosed(String),

    /// The consumer loop of a worker panicked
    #[error("worker on `{0}` panicked: {1}")]
    WorkerPanicked(String, String),

    /// Operation attempted on a disposed object
    #[error("`{0}` has been disposed")]
    Disposed(String),
}
