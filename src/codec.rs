// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Codec
//!
//! Converts between `Envelope<T>` and the broker's wire message. The wire contract is:
//!
//! - `message_id`: envelope id (uuid string)
//! - `timestamp`: creation date in unix seconds
//! - `priority`, `reply_to`, `correlation_id` (reply id, uuid string)
//! - `content_type`: `application/json`, `type`: body type name
//! - header `Error`: JSON-serialized `ResponseStatus`, only when present
//! - header `x-retry-attempts`: retry counter, only when non-zero
//!
//! The body is UTF-8 JSON.

use crate::{
    envelope::{Envelope, MessageBody, ResponseStatus},
    errors::AmqpError,
};
use chrono::{DateTime, SubsecRound, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, LongUInt, ShortString},
    BasicProperties,
};
use serde::de::DeserializeOwned;
use tracing::warn;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the JSON-serialized `ResponseStatus` of a failed message
pub const AMQP_HEADERS_ERROR: &str = "Error";
/// Header carrying the number of times a message was already retried
pub const AMQP_HEADERS_RETRY_ATTEMPTS: &str = "x-retry-attempts";

pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// A message as pulled from a queue.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Builds the AMQP properties of an envelope. Messages are persistent by default.
pub fn to_wire_properties<T: MessageBody>(env: &Envelope<T>) -> Result<BasicProperties, AmqpError> {
    let mut props = BasicProperties::default()
        .with_message_id(ShortString::from(env.id.to_string()))
        .with_timestamp(env.created_date.timestamp().max(0) as u64)
        .with_priority(env.priority)
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_type(ShortString::from(env.body.kind()))
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

    if let Some(reply_to) = &env.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.clone()));
    }

    if let Some(reply_id) = &env.reply_id {
        props = props.with_correlation_id(ShortString::from(reply_id.to_string()));
    }

    let mut headers = FieldTable::default();

    if let Some(error) = &env.error {
        headers.insert(ShortString::from(AMQP_HEADERS_ERROR), error_header(error)?);
    }

    if env.retry_attempts > 0 {
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_ATTEMPTS),
            AMQPValue::LongUInt(LongUInt::from(env.retry_attempts)),
        );
    }

    if !headers.inner().is_empty() {
        props = props.with_headers(headers);
    }

    Ok(props)
}

/// Serializes the envelope body.
pub fn to_wire_body<T: MessageBody>(env: &Envelope<T>) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(&env.body).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
}

/// Rebuilds an envelope from a received message.
///
/// `retry_attempts` is the retry header plus one when the broker flagged the delivery
/// as redelivered.
pub fn from_wire_message<T: DeserializeOwned>(msg: &WireMessage) -> Result<Envelope<T>, AmqpError> {
    let body = serde_json::from_slice::<T>(&msg.data)
        .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

    let props = &msg.properties;

    let id = match props.message_id() {
        Some(id) => Uuid::parse_str(id.as_str())
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?,
        None => Uuid::new_v4(),
    };

    let created_date = props
        .timestamp()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
        .unwrap_or_else(|| Utc::now().trunc_subsecs(0));

    let reply_id = props
        .correlation_id()
        .as_ref()
        .and_then(|id| Uuid::parse_str(id.as_str()).ok());

    let retry_attempts = retry_attempts_header(props) + u32::from(msg.redelivered);

    let error = match header_string(props, AMQP_HEADERS_ERROR) {
        Some(raw) => Some(
            serde_json::from_str::<ResponseStatus>(&raw)
                .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?,
        ),
        None => None,
    };

    Ok(Envelope {
        id,
        body,
        created_date,
        priority: props.priority().unwrap_or_default(),
        reply_to: props.reply_to().as_ref().map(|q| q.to_string()),
        reply_id,
        tag: Some(msg.delivery_tag),
        retry_attempts,
        error,
    })
}

/// Returns `props` with the `Error` header set, keeping every other header.
pub fn with_error_header(
    props: BasicProperties,
    error: &ResponseStatus,
) -> Result<BasicProperties, AmqpError> {
    let mut headers = props.headers().clone().unwrap_or_default();
    headers.insert(ShortString::from(AMQP_HEADERS_ERROR), error_header(error)?);
    Ok(props.with_headers(headers))
}

/// The `type` property of a message, empty when unset.
pub fn message_type(props: &BasicProperties) -> String {
    match props.kind() {
        Some(value) => value.to_string(),
        _ => "".to_owned(),
    }
}

fn error_header(error: &ResponseStatus) -> Result<AMQPValue, AmqpError> {
    let raw =
        serde_json::to_string(error).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;
    Ok(AMQPValue::LongString(LongString::from(raw)))
}

fn header_string(props: &BasicProperties, key: &str) -> Option<String> {
    let headers = props.headers().as_ref()?;

    match headers.inner().get(key)? {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        AMQPValue::ShortString(value) => Some(value.to_string()),
        other => {
            warn!(header = key, "unexpected header value {:?}", other);
            None
        }
    }
}

fn retry_attempts_header(props: &BasicProperties) -> u32 {
    let Some(headers) = props.headers() else {
        return 0;
    };

    match headers.inner().get(AMQP_HEADERS_RETRY_ATTEMPTS) {
        Some(AMQPValue::LongUInt(v)) => *v,
        Some(AMQPValue::LongInt(v)) => (*v).max(0) as u32,
        Some(AMQPValue::LongLongInt(v)) => (*v).clamp(0, u32::MAX as i64) as u32,
        Some(AMQPValue::ShortUInt(v)) => u32::from(*v),
        Some(AMQPValue::ShortInt(v)) => (*v).max(0) as u32,
        Some(AMQPValue::ShortShortUInt(v)) => u32::from(*v),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        id: String,
    }

    impl MessageBody for OrderPlaced {}

    fn received(env: &Envelope<OrderPlaced>, tag: u64, redelivered: bool) -> WireMessage {
        WireMessage {
            delivery_tag: tag,
            redelivered,
            properties: to_wire_properties(env).unwrap(),
            data: to_wire_body(env).unwrap(),
        }
    }

    #[test]
    fn test_wire_properties() {
        let env = Envelope::new(OrderPlaced { id: "A1".to_owned() }).with_priority(4);
        let props = to_wire_properties(&env).unwrap();

        assert_eq!(props.message_id().as_ref().map(|v| v.to_string()), Some(env.id.to_string()));
        assert_eq!(props.content_type().as_ref().map(|v| v.to_string()), Some(JSON_CONTENT_TYPE.to_owned()));
        assert_eq!(message_type(&props), "OrderPlaced");
        assert_eq!(*props.priority(), Some(4));
        assert_eq!(*props.delivery_mode(), Some(DELIVERY_MODE_PERSISTENT));
        assert_eq!(*props.timestamp(), Some(env.created_date.timestamp() as u64));
        assert!(props.headers().is_none());
    }

    #[test]
    fn test_received_message_matches_the_published_envelope() {
        let env = Envelope::new(OrderPlaced { id: "A1".to_owned() })
            .with_priority(1)
            .with_reply_to("mq:tmp:replies")
            .with_reply_id(Uuid::new_v4())
            .with_error(ResponseStatus::new("ArgumentException", "bad order"));

        let decoded = from_wire_message::<OrderPlaced>(&received(&env, 9, false)).unwrap();

        assert_eq!(decoded.tag, Some(9));
        assert_eq!(Envelope { tag: None, ..decoded }, env);
    }

    #[test]
    fn test_redelivery_increments_retry_attempts() {
        let mut env = Envelope::new(OrderPlaced { id: "A1".to_owned() });

        let first = from_wire_message::<OrderPlaced>(&received(&env, 1, false)).unwrap();
        assert_eq!(first.retry_attempts, 0);

        let redelivered = from_wire_message::<OrderPlaced>(&received(&env, 2, true)).unwrap();
        assert_eq!(redelivered.retry_attempts, 1);

        env.retry_attempts = 2;
        let props = to_wire_properties(&env).unwrap();
        assert_eq!(retry_attempts_header(&props), 2);
    }

    #[test]
    fn test_invalid_payload_is_a_parse_error() {
        let msg = WireMessage {
            delivery_tag: 1,
            redelivered: false,
            properties: BasicProperties::default(),
            data: b"not json".to_vec(),
        };

        let result = from_wire_message::<OrderPlaced>(&msg);
        assert!(matches!(result, Err(AmqpError::ParsePayloadError(_))));
    }

    #[test]
    fn test_with_error_header_keeps_other_headers() {
        let mut env = Envelope::new(OrderPlaced { id: "A1".to_owned() });
        env.retry_attempts = 1;
        let status = ResponseStatus::new("SerializationException", "bad payload");

        let props = with_error_header(to_wire_properties(&env).unwrap(), &status).unwrap();

        assert_eq!(retry_attempts_header(&props), 1);
        assert_eq!(
            header_string(&props, AMQP_HEADERS_ERROR),
            Some(serde_json::to_string(&status).unwrap())
        );
    }
}
