// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Typed in-memory representation of a message travelling through the broker.
//! An `Envelope<T>` wraps a `MessageBody` with the metadata carried in the AMQP
//! properties: id, creation date, priority, reply routing, the broker delivery tag,
//! the retry counter and an optional structured error.

use crate::errors::AmqpError;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::error::Error;
use uuid::Uuid;

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Payload carried by an envelope.
///
/// The type name selects the queues a message is routed to (`{TypeName}.inq`,
/// `{TypeName}.priorityq`, ...) and is written to the AMQP `type` property.
pub trait MessageBody: Serialize + Send + Sync + Sized + 'static {
    /// Short name of the body type: the last path segment, without generic arguments.
    fn type_name() -> String {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Runtime type name of this body.
    fn kind(&self) -> String {
        Self::type_name()
    }
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_owned()
}

/// Structured error attached to a failed message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseStatus {
    pub error_code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ResponseStatus {
    pub fn new(error_code: &str, message: &str) -> ResponseStatus {
        ResponseStatus {
            error_code: error_code.to_owned(),
            message: message.to_owned(),
            stack_trace: None,
        }
    }

    /// Captures an error and its chain of sources.
    pub fn from_error(error_code: &str, err: &(dyn Error + 'static)) -> ResponseStatus {
        let mut causes = vec![];
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        ResponseStatus {
            error_code: error_code.to_owned(),
            message: err.to_string(),
            stack_trace: if causes.is_empty() {
                None
            } else {
                Some(causes.join("\n"))
            },
        }
    }
}

/// Type-erased response returned by a handler.
///
/// Serializes as its inner body; its kind is the type name of the value it was built from,
/// so a `Reply` built from `HelloResponse` is routed to `HelloResponse.inq`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    kind: String,
    body: serde_json::Value,
}

impl Reply {
    pub fn new<R: MessageBody>(response: &R) -> Result<Reply, AmqpError> {
        let body = serde_json::to_value(response)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;

        Ok(Reply {
            kind: response.kind(),
            body,
        })
    }

    /// Builds a reply from an already serialized body.
    pub fn from_value(kind: &str, body: serde_json::Value) -> Reply {
        Reply {
            kind: kind.to_owned(),
            body,
        }
    }

    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    pub fn into_body(self) -> serde_json::Value {
        self.body
    }
}

impl Serialize for Reply {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.body.serialize(serializer)
    }
}

impl MessageBody for Reply {
    fn kind(&self) -> String {
        self.kind.clone()
    }
}

/// A message with its delivery metadata.
///
/// `tag` is only set on envelopes received from the broker and identifies the
/// delivery to acknowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub id: Uuid,
    pub body: T,
    pub created_date: DateTime<Utc>,
    pub priority: u8,
    pub reply_to: Option<String>,
    pub reply_id: Option<Uuid>,
    pub tag: Option<u64>,
    pub retry_attempts: u32,
    pub error: Option<ResponseStatus>,
}

impl<T> Envelope<T> {
    pub fn new(body: T) -> Envelope<T> {
        Envelope {
            id: Uuid::new_v4(),
            body,
            // the wire timestamp only has second precision
            created_date: Utc::now().trunc_subsecs(0),
            priority: 0,
            reply_to: None,
            reply_id: None,
            tag: None,
            retry_attempts: 0,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn with_reply_id(mut self, id: Uuid) -> Self {
        self.reply_id = Some(id);
        self
    }

    pub fn with_error(mut self, error: ResponseStatus) -> Self {
        self.error = Some(error);
        self
    }

    /// Replaces the body, keeping id, dates, routing and delivery metadata.
    pub fn map<U>(self, body: U) -> Envelope<U> {
        Envelope {
            id: self.id,
            body,
            created_date: self.created_date,
            priority: self.priority,
            reply_to: self.reply_to,
            reply_id: self.reply_id,
            tag: self.tag,
            retry_attempts: self.retry_attempts,
            error: self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fmt;

    #[derive(Serialize)]
    struct HelloResponse {
        result: String,
    }

    impl MessageBody for HelloResponse {}

    #[derive(Serialize)]
    struct Wrapper<T> {
        inner: T,
    }

    impl<T: Serialize + Send + Sync + 'static> MessageBody for Wrapper<T> {}

    #[derive(Debug)]
    struct Outer(Inner);

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "outer failed")
        }
    }

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "disk full")
        }
    }

    impl Error for Inner {}

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_type_name_is_the_short_name() {
        assert_eq!(HelloResponse::type_name(), "HelloResponse");
        assert_eq!(Wrapper::<HelloResponse>::type_name(), "Wrapper");
    }

    #[test]
    fn test_reply_keeps_the_response_kind() {
        let reply = Reply::new(&HelloResponse {
            result: "Hello, World".to_owned(),
        })
        .unwrap();

        assert_eq!(reply.kind(), "HelloResponse");
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"result": "Hello, World"})
        );
    }

    #[test]
    fn test_response_status_captures_sources() {
        let status = ResponseStatus::from_error("Outer", &Outer(Inner));

        assert_eq!(status.message, "outer failed");
        assert_eq!(status.stack_trace.as_deref(), Some("caused by: disk full"));
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"ErrorCode": "Outer", "Message": "outer failed", "StackTrace": "caused by: disk full"})
        );
    }

    #[test]
    fn test_new_envelope_has_whole_second_date() {
        let env = Envelope::new(1u8).with_priority(3);

        assert_eq!(env.created_date.timestamp_subsec_nanos(), 0);
        assert_eq!(env.priority, 3);
        assert_eq!(env.tag, None);
        assert_eq!(env.map("x").body, "x");
    }
}
