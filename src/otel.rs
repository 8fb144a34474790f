// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in the AMQP headers of every published message. Producers
//! inject the current context and message handlers open a consumer span under the
//! extracted one.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Name of the tracer used for message processing spans
pub const TRACER_NAME: &str = "amqp consumer";

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
///
/// It implements the OpenTelemetry `Injector` and `Extractor` traits over the header
/// table of a message, so producers and handlers share one header layout.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    /// Wraps the header table of a message.
    ///
    /// # Parameters
    /// * `headers` - The AMQP headers to read the trace context from or write it into
    ///
    /// # Returns
    /// A propagator borrowing `headers` for its lifetime
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Stores one trace context entry as a long string header.
    ///
    /// Keys are lowercased, so `traceparent` is found again whatever casing the
    /// propagator used when injecting.
    ///
    /// # Parameters
    /// * `key` - The trace context field name
    /// * `value` - The encoded field value
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Reads one trace context entry from the headers of a received message.
    ///
    /// # Parameters
    /// * `key` - The trace context field name
    ///
    /// # Returns
    /// The header value when it is a UTF-8 long string, `None` otherwise
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    /// Lists every header name of the message.
    ///
    /// # Returns
    /// The header names, trace context fields and application headers alike
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Adds the trace context of `ctx` to the headers of `props`.
///
/// Headers already present are kept. When no propagator is installed nothing is added.
///
/// # Parameters
/// * `ctx` - The context whose span the consumer should continue
/// * `props` - Properties of the message about to be published
///
/// # Returns
/// `props`, with the trace context headers added when there were any
pub fn inject_context(ctx: &Context, props: BasicProperties) -> BasicProperties {
    let mut btree = props.headers().clone().unwrap_or_default().inner().clone();
    let before = btree.len();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut btree))
    });

    if btree.len() == before {
        return props;
    }

    props.with_headers(FieldTable::from(btree))
}

/// Creates a new OpenTelemetry span for message processing.
///
/// The trace context is extracted from the message headers and the span is started
/// as a consumer span named after the message type.
///
/// # Parameters
/// * `props` - Properties of the received message, headers included
/// * `tracer` - The tracer that starts the span
/// * `name` - Span name, the message type name
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(
            &mut props.headers().clone().unwrap_or_default().inner().clone(),
        ))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn test_propagator_lowercases_injected_keys() {
        let mut headers = BTreeMap::new();
        let mut propagator = RabbitMQTracePropagator::new(&mut headers);

        propagator.set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.keys(), vec!["traceparent"]);
    }

    #[test]
    fn test_propagator_ignores_non_string_values() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("count"), AMQPValue::LongUInt(3));
        headers.insert(
            ShortString::from("tracestate"),
            AMQPValue::LongString(LongString::from("k=v")),
        );
        let propagator = RabbitMQTracePropagator::new(&mut headers);

        assert_eq!(propagator.get("count"), None);
        assert_eq!(propagator.get("tracestate"), Some("k=v"));
    }

    #[test]
    fn test_inject_without_propagator_keeps_properties() {
        let props = BasicProperties::default().with_priority(2);
        let injected = inject_context(&Context::current(), props.clone());

        assert!(injected.headers().is_none());
        assert_eq!(*injected.priority(), Some(2));
    }
}
