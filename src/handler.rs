// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! This module provides the per-message processing pipeline of the server. A handler
//! pulls messages from its queue, decodes them into the registered body type, invokes
//! the user function and then:
//!
//! 1. on success, publishes the response (reply queue, response type `.inq`, or the
//!    request notified to `.outq`) and acks the message
//! 2. on failure, requeues the message while retries remain, otherwise dead-letters it
//!    with the error attached
//!
//! Payloads that can't be decoded are dead-lettered straight away. The handler also
//! supports OpenTelemetry: every message is processed under a consumer span.

use crate::{
    client::QueueClient,
    codec::{from_wire_message, WireMessage},
    envelope::{Envelope, HandlerError, MessageBody, Reply, ResponseStatus},
    errors::AmqpError,
    otel::{self, TRACER_NAME},
    queue::QueueNames,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{future::BoxFuture, FutureExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::{
    any::Any,
    borrow::Cow,
    fmt,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};

/// Error code of the `ResponseStatus` attached to messages whose handler failed
pub const HANDLER_ERROR_CODE: &str = "HandlerError";
/// Error code of the `ResponseStatus` attached to messages that could not be decoded
pub const PARSE_ERROR_CODE: &str = "ParsePayloadError";

/// Text carried by a panic payload, when it is a string.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Outcome of a handler: an optional response, or the reason it failed.
pub type HandlerResult = Result<Option<Reply>, HandlerError>;
pub type HandlerFn<T> = Arc<dyn Fn(Envelope<T>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
/// Observes handler failures. The retry and dead-letter policy applies regardless.
pub type ErrorCallback<T> = Arc<dyn Fn(&Envelope<T>, &HandlerError) + Send + Sync>;
/// Runs before decoding; returning `false` acks the message and skips it.
pub type RequestFilter = Arc<dyn Fn(&mut WireMessage) -> bool + Send + Sync>;
/// Transforms every response before it is published.
pub type ResponseFilter = Arc<dyn Fn(Reply) -> Reply + Send + Sync>;

/// Settings captured by a handler when it is registered.
#[derive(Clone)]
pub struct HandlerDefaults {
    pub retry_count: u32,
    pub request_filter: Option<RequestFilter>,
    pub response_filter: Option<ResponseFilter>,
    /// Response types allowed to be published to their `.inq`; `None` allows all
    pub publish_responses_whitelist: Option<Vec<String>>,
    pub publish_to_outq: bool,
}

impl Default for HandlerDefaults {
    fn default() -> Self {
        HandlerDefaults {
            retry_count: 1,
            request_filter: None,
            response_filter: None,
            publish_responses_whitelist: None,
            publish_to_outq: true,
        }
    }
}

impl HandlerDefaults {
    fn publish_allowed(&self, response_type: &str) -> bool {
        match &self.publish_responses_whitelist {
            Some(whitelist) => whitelist.iter().any(|t| t == response_type),
            None => true,
        }
    }
}

/// Snapshot of the counters of one or more handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub name: String,
    pub total_messages_processed: u64,
    pub total_messages_failed: u64,
    pub total_retries: u64,
    pub total_normal_messages_received: u64,
    pub total_priority_messages_received: u64,
    pub last_message_processed: Option<DateTime<Utc>>,
}

impl HandlerStats {
    pub fn new(name: &str) -> HandlerStats {
        HandlerStats {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Adds the counters of `other`, keeping the most recent processing date.
    pub fn add(&mut self, other: &HandlerStats) {
        self.total_messages_processed += other.total_messages_processed;
        self.total_messages_failed += other.total_messages_failed;
        self.total_retries += other.total_retries;
        self.total_normal_messages_received += other.total_normal_messages_received;
        self.total_priority_messages_received += other.total_priority_messages_received;
        self.last_message_processed = self.last_message_processed.max(other.last_message_processed);
    }
}

impl fmt::Display for HandlerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "STATS for {}:", self.name)?;
        writeln!(f)?;
        writeln!(f, "  TotalNormalMessagesReceived:    {}", self.total_normal_messages_received)?;
        writeln!(f, "  TotalPriorityMessagesReceived:  {}", self.total_priority_messages_received)?;
        writeln!(f, "  TotalProcessed:                 {}", self.total_messages_processed)?;
        writeln!(f, "  TotalRetries:                   {}", self.total_retries)?;
        writeln!(f, "  TotalFailed:                    {}", self.total_messages_failed)?;
        match self.last_message_processed {
            Some(date) => write!(f, "  LastMessageProcessed:           {}", date.to_rfc3339()),
            None => write!(f, "  LastMessageProcessed:           "),
        }
    }
}

#[derive(Default)]
struct HandlerCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    normal_received: AtomicU64,
    priority_received: AtomicU64,
    last_processed: Mutex<Option<DateTime<Utc>>>,
}

impl HandlerCounters {
    fn snapshot(&self, name: &str) -> HandlerStats {
        HandlerStats {
            name: name.to_owned(),
            total_messages_processed: self.processed.load(Ordering::Relaxed),
            total_messages_failed: self.failed.load(Ordering::Relaxed),
            total_retries: self.retries.load(Ordering::Relaxed),
            total_normal_messages_received: self.normal_received.load(Ordering::Relaxed),
            total_priority_messages_received: self.priority_received.load(Ordering::Relaxed),
            last_message_processed: *self.last_processed.lock(),
        }
    }
}

/// Processes the messages of one queue for one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn message_type(&self) -> &str;

    /// Processes messages until the queue is empty or `keep_going` returns `false`.
    ///
    /// # Returns
    /// The number of messages pulled from the queue
    async fn process_queue(
        &self,
        client: &mut QueueClient,
        queue_name: &str,
        keep_going: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<u64, AmqpError> {
        let mut received = 0;

        while keep_going() {
            let Some(msg) = client.get_message(queue_name).await? else {
                break;
            };
            received += 1;
            self.process_message(client, queue_name, msg).await?;
        }

        Ok(received)
    }

    /// Processes a single message. Handler failures are settled here; only broker
    /// failures are returned.
    async fn process_message(
        &self,
        client: &mut QueueClient,
        queue_name: &str,
        msg: WireMessage,
    ) -> Result<(), AmqpError>;

    fn stats(&self) -> HandlerStats;
}

/// Creates a fresh handler, with its own counters, for every worker.
pub trait MessageHandlerFactory: Send + Sync {
    fn message_type(&self) -> &str;

    fn create_message_handler(&self) -> Arc<dyn MessageHandler>;
}

/// `MessageHandler` decoding messages into `T`.
pub struct TypedMessageHandler<T> {
    names: QueueNames,
    name: String,
    handler: HandlerFn<T>,
    error_callback: Option<ErrorCallback<T>>,
    defaults: HandlerDefaults,
    counters: HandlerCounters,
}

impl<T> TypedMessageHandler<T>
where
    T: MessageBody + DeserializeOwned + Clone,
{
    pub fn new(
        handler: HandlerFn<T>,
        error_callback: Option<ErrorCallback<T>>,
        defaults: HandlerDefaults,
    ) -> TypedMessageHandler<T> {
        let name = T::type_name();

        TypedMessageHandler {
            names: QueueNames::new(&name),
            name,
            handler,
            error_callback,
            defaults,
            counters: HandlerCounters::default(),
        }
    }

    async fn publish_response(
        &self,
        client: &mut QueueClient,
        env: &Envelope<T>,
        response: Option<Reply>,
    ) -> Result<(), AmqpError> {
        if let Some(reply_to) = &env.reply_to {
            debug!(queue = reply_to.as_str(), "publishing reply");
            return match response {
                Some(reply) => {
                    client
                        .publish(reply_to, &Envelope::new(reply).with_reply_id(env.id))
                        .await
                }
                None => {
                    client
                        .publish(reply_to, &Envelope::new(env.body.clone()).with_reply_id(env.id))
                        .await
                }
            };
        }

        match response {
            Some(reply) => {
                let kind = reply.kind();
                if self.defaults.publish_allowed(&kind) {
                    client
                        .publish(&QueueNames::new(&kind).inq, &Envelope::new(reply))
                        .await?;
                }
                Ok(())
            }
            None if self.defaults.publish_to_outq => client.notify(&self.names.outq, env).await,
            None => Ok(()),
        }
    }

    async fn on_failure(
        &self,
        client: &mut QueueClient,
        env: &Envelope<T>,
        err: HandlerError,
    ) -> Result<(), AmqpError> {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        if let Some(callback) = &self.error_callback {
            callback(env, &err);
        }

        let status = ResponseStatus::from_error(HANDLER_ERROR_CODE, err.as_ref());

        if env.retry_attempts < self.defaults.retry_count {
            warn!(
                error = err.to_string(),
                msg_type = self.name.as_str(),
                "error whiling handling msg, requeuing for latter"
            );
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            return client.nak(env, true, Some(status)).await;
        }

        error!(
            error = err.to_string(),
            msg_type = self.name.as_str(),
            "too many attempts, sending to dlq"
        );
        client.nak(env, false, Some(status.clone())).await?;

        if let Some(reply_to) = &env.reply_to {
            let failed = env.clone().with_error(status).with_reply_id(env.id);
            if let Err(err) = client.publish(reply_to, &failed).await {
                error!(error = err.to_string(), "error to publish the error reply");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<T> MessageHandler for TypedMessageHandler<T>
where
    T: MessageBody + DeserializeOwned + Clone,
{
    fn message_type(&self) -> &str {
        &self.name
    }

    async fn process_message(
        &self,
        client: &mut QueueClient,
        queue_name: &str,
        mut msg: WireMessage,
    ) -> Result<(), AmqpError> {
        if QueueNames::is_priority_queue(queue_name) {
            self.counters.priority_received.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.normal_received.fetch_add(1, Ordering::Relaxed);
        }

        let tracer = global::tracer(TRACER_NAME);
        let (_ctx, mut span) = otel::new_span(&msg.properties, &tracer, &self.name);

        if let Some(filter) = &self.defaults.request_filter {
            if !filter(&mut msg) {
                debug!(queue = queue_name, "message skipped by the request filter");
                return client.ack_tag(msg.delivery_tag).await;
            }
        }

        let env = match from_wire_message::<T>(&msg) {
            Ok(env) => env,
            Err(err) => {
                error!(error = err.to_string(), queue = queue_name, "removing undecodable message");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to parse payload"),
                });

                let status = ResponseStatus::from_error(PARSE_ERROR_CODE, &err);
                return client.dead_letter_raw(&self.names.dlq, &msg, status).await;
            }
        };

        let outcome = AssertUnwindSafe(async { (self.handler)(env.clone()).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(panic = message.as_str(), msg_type = self.name.as_str(), "handler panicked");
                Err(format!("handler panicked: {message}").into())
            });

        let result = match outcome {
            Ok(response) => {
                let response = match (&self.defaults.response_filter, response) {
                    (Some(filter), Some(reply)) => Some(filter(reply)),
                    (_, response) => response,
                };

                self.publish_response(client, &env, response)
                    .await
                    .map_err(|err| Box::new(err) as HandlerError)
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                client.ack(&env).await?;
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                *self.counters.last_processed.lock() = Some(Utc::now());
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                span.record_error(err.as_ref());
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                self.on_failure(client, &env, err).await
            }
        }
    }

    fn stats(&self) -> HandlerStats {
        self.counters.snapshot(&self.name)
    }
}

/// Builds `TypedMessageHandler`s sharing the same function, callback and defaults.
pub struct TypedHandlerFactory<T> {
    name: String,
    handler: HandlerFn<T>,
    error_callback: Option<ErrorCallback<T>>,
    defaults: HandlerDefaults,
    _body: PhantomData<fn() -> T>,
}

impl<T> TypedHandlerFactory<T>
where
    T: MessageBody + DeserializeOwned + Clone,
{
    pub fn new(
        handler: HandlerFn<T>,
        error_callback: Option<ErrorCallback<T>>,
        defaults: HandlerDefaults,
    ) -> TypedHandlerFactory<T> {
        TypedHandlerFactory {
            name: T::type_name(),
            handler,
            error_callback,
            defaults,
            _body: PhantomData,
        }
    }
}

impl<T> MessageHandlerFactory for TypedHandlerFactory<T>
where
    T: MessageBody + DeserializeOwned + Clone,
{
    fn message_type(&self) -> &str {
        &self.name
    }

    fn create_message_handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(TypedMessageHandler::new(
            self.handler.clone(),
            self.error_callback.clone(),
            self.defaults.clone(),
        ))
    }
}
