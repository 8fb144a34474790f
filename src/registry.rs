// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry
//!
//! Maps each message body type to the factory of its handlers and the number of
//! workers consuming each of its queues. A type can be registered once, and only
//! until the server builds its workers.

use crate::{
    envelope::{Envelope, MessageBody},
    errors::AmqpError,
    handler::{
        ErrorCallback, HandlerDefaults, HandlerFn, HandlerResult, MessageHandlerFactory,
        TypedHandlerFactory,
    },
};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::{future::Future, sync::Arc};
use tracing::debug;

#[derive(Clone)]
pub struct HandlerRegistration {
    pub message_type: String,
    pub factory: Arc<dyn MessageHandlerFactory>,
    pub thread_count: usize,
}

#[derive(Default)]
pub struct HandlerRegistry {
    registrations: Vec<HandlerRegistration>,
    closed: bool,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers `handler` for messages of type `T`, with `defaults` captured as they are now.
    ///
    /// Fails without modifying the registry when `T` is already registered, when
    /// `thread_count` is zero, or once the registry is closed.
    pub fn register<T, F, Fut>(
        &mut self,
        defaults: &HandlerDefaults,
        handler: F,
        error_callback: Option<ErrorCallback<T>>,
        thread_count: usize,
    ) -> Result<(), AmqpError>
    where
        T: MessageBody + DeserializeOwned + Clone,
        F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let message_type = T::type_name();

        if self.closed {
            return Err(AmqpError::RegistrationClosed(message_type));
        }

        if self.get(&message_type).is_some() {
            return Err(AmqpError::HandlerAlreadyRegistered(message_type));
        }

        if thread_count == 0 {
            return Err(AmqpError::InvalidThreadCount(message_type));
        }

        let handler: HandlerFn<T> = Arc::new(move |env| handler(env).boxed());
        let factory = TypedHandlerFactory::new(handler, error_callback, defaults.clone());

        debug!(msg_type = message_type.as_str(), threads = thread_count, "handler registered");

        self.registrations.push(HandlerRegistration {
            message_type,
            factory: Arc::new(factory),
            thread_count,
        });

        Ok(())
    }

    pub fn get(&self, message_type: &str) -> Option<&HandlerRegistration> {
        self.registrations
            .iter()
            .find(|r| r.message_type == message_type)
    }

    /// Registered type names, in registration order.
    pub fn registered_types(&self) -> Vec<String> {
        self.registrations
            .iter()
            .map(|r| r.message_type.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerRegistration> {
        self.registrations.iter()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Rejects every later registration.
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }
}
