// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliable Messaging Subsystem
//!
//! `AmqpError` covers every failure the subsystem can observe while talking to the broker,
//! plus the configuration errors that must abort startup. `HandlerError` is what message
//! handlers return; the dispatcher turns it into a retry or a dead-letter decision and never
//! propagates it further.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants are split in two classes. Transport failures (connection, channel, declare, publish,
/// ack) are transient: the supervisor tears the session down and reconnects. Configuration
/// failures (see [`AmqpError::is_fatal`]) stop the supervisor and must be fixed by an operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// The connection was not established within the configured timeout
    #[error("connection attempt timed out after {0}ms")]
    ConnectionTimeout(u64),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel or connection was closed
    #[error("channel is closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// The broker refused to redeclare a queue because its arguments differ
    #[error("queue `{0}` already exists with different arguments")]
    QueueArgumentConflict(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Two handlers were registered for the same queue
    #[error("2 or more handlers present for queue `{queue}`: `{existing}` and `{duplicate}`")]
    DuplicateRoute {
        queue: String,
        existing: String,
        duplicate: String,
    },

    /// Invalid or missing configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing an outbound payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The supervisor was shut down or stopped by a configuration error
    #[error("supervisor is stopped")]
    SupervisorStopped,
}

impl AmqpError {
    /// Returns `true` for errors that retrying cannot fix.
    ///
    /// Duplicate routes, conflicting queue arguments and invalid configuration stop the
    /// supervisor; every other error re-enters the reconnect path.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::DuplicateRoute { .. }
                | AmqpError::QueueArgumentConflict(_)
                | AmqpError::InvalidConfig(_)
        )
    }
}

/// Error returned by a message handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler ran and failed
    #[error("handler failure: {0}")]
    Failed(String),

    /// The delivery body is not valid UTF-8 JSON
    #[error("failure to parse payload: {0}")]
    InvalidPayload(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_fatal() {
        let dup = AmqpError::DuplicateRoute {
            queue: "on_search".to_owned(),
            existing: "SearchConsumer:on_search".to_owned(),
            duplicate: "OtherConsumer:on_search".to_owned(),
        };

        assert!(dup.is_fatal());
        assert!(AmqpError::QueueArgumentConflict("on_init".to_owned()).is_fatal());
        assert!(AmqpError::InvalidConfig("RABBITMQ_URL".to_owned()).is_fatal());
    }

    #[test]
    fn transport_errors_are_transient() {
        assert!(!AmqpError::ConnectionError.is_fatal());
        assert!(!AmqpError::ChannelClosed.is_fatal());
        assert!(!AmqpError::DeclareQueueError("on_init".to_owned()).is_fatal());
        assert!(!AmqpError::PublishingError.is_fatal());
    }

    #[test]
    fn duplicate_route_message_names_both_handlers() {
        let err = AmqpError::DuplicateRoute {
            queue: "on_select".to_owned(),
            existing: "A:select".to_owned(),
            duplicate: "B:select".to_owned(),
        };

        let msg = err.to_string();
        assert!(msg.contains("on_select"));
        assert!(msg.contains("A:select"));
        assert!(msg.contains("B:select"));
    }
}
