// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod client;
pub mod codec;
pub mod configs;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod factory;
pub mod handler;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod server;
pub mod status;
pub mod topology;
pub mod worker;

pub use client::QueueClient;
pub use envelope::{Envelope, MessageBody, Reply, ResponseStatus};
pub use errors::AmqpError;
pub use factory::MessageFactory;
pub use producer::Producer;
pub use server::{MqServer, ServerOptions};
pub use status::Status;
