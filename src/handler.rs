// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The interface application code implements to receive messages from a queue.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;

/// A message delivered to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    /// Queue the message was consumed from
    pub queue: String,
    /// JSON body of the delivery
    pub body: Value,
    /// Attempt number of this delivery, starting at 1
    pub retry_count: i64,
    /// Attempts allowed before the message is dead-lettered
    pub max_retries: i64,
}

impl ConsumerMessage {
    /// `true` when a failure on this attempt sends the message to its DLQ.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Handles the messages of one queue.
///
/// Delivery is at-least-once: a message may be seen again after a crash between the
/// handler returning and the acknowledgement reaching the broker, so handlers must be
/// idempotent. Returning an error triggers a requeue or, on the last attempt,
/// dead-lettering.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`ConsumerHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        FnHandler { f }
    }
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.f)(msg.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(retry_count: i64) -> ConsumerMessage {
        ConsumerMessage {
            queue: "on_search".to_owned(),
            body: json!({"x": 1}),
            retry_count,
            max_retries: 3,
        }
    }

    #[test]
    fn last_attempt() {
        assert!(!message(1).is_last_attempt());
        assert!(!message(2).is_last_attempt());
        assert!(message(3).is_last_attempt());
        assert!(message(4).is_last_attempt());
    }

    #[tokio::test]
    async fn fn_handler_forwards_message() {
        let handler = FnHandler::new(|msg: ConsumerMessage| async move {
            if msg.body["x"] == 1 {
                Ok(())
            } else {
                Err(HandlerError::failed("unexpected body"))
            }
        });

        assert!(handler.exec(&Context::new(), &message(1)).await.is_ok());
    }
}
