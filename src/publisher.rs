// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishing never waits for the broker. While the supervisor has not reached
//! `ConsumersReady`, messages are appended to an in-memory FIFO buffer and the call reports
//! success; the buffer is redriven, in order, once the channel is ready again.
//!
//! The buffer lives in process memory only: messages still pending when the process exits
//! are lost.

use crate::{errors::AmqpError, otel, transport::AmqpChannel};
use lapin::types::{AMQPValue, LongInt, ShortString};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, PoisonError, RwLock},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the number of attempts allowed before dead-lettering
pub const AMQP_HEADERS_MAX_RETRIES: &str = "x-max-retries";
/// Attempts allowed when the publisher does not say otherwise
pub const DEFAULT_MAX_RETRIES: i32 = 3;
/// The default exchange routes by queue name
pub const DEFAULT_EXCHANGE: &str = "";

/// A message accepted for publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPublish {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) body: Vec<u8>,
    pub(crate) headers: BTreeMap<ShortString, AMQPValue>,
    pub(crate) content_type: String,
    pub(crate) message_id: String,
    pub(crate) persistent: bool,
}

impl PendingPublish {
    /// A persistent JSON message with a fresh message id.
    pub fn new(exchange: &str, routing_key: &str, body: Vec<u8>) -> Self {
        PendingPublish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body,
            headers: BTreeMap::new(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            persistent: true,
        }
    }

    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.headers
    }
}

/// Per-message options of [`RabbitMQPublisher::publish_json`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Attempts allowed before the message is dead-lettered; `None` or zero means 3
    pub max_retries: Option<i32>,
}

impl PublishOptions {
    pub fn max_retries(max_retries: i32) -> Self {
        PublishOptions {
            max_retries: Some(max_retries),
        }
    }

    fn resolved_max_retries(&self) -> i32 {
        self.max_retries
            .filter(|max| *max > 0)
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }
}

/// Shared state between publish callers and the supervisor.
///
/// `ready` holds the channel only while the supervisor is in `ConsumersReady`.
#[derive(Default)]
pub(crate) struct Outbound {
    ready: RwLock<Option<Arc<dyn AmqpChannel>>>,
    pending: Mutex<VecDeque<PendingPublish>>,
    redrive: tokio::sync::Mutex<()>,
}

impl Outbound {
    /// Lock order is `pending` then `ready`: a publisher that found no channel has already
    /// enqueued before the channel is stored, so the following redrive sees its message.
    pub(crate) fn set_ready(&self, channel: Arc<dyn AmqpChannel>) {
        let _pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *self.ready.write().unwrap_or_else(PoisonError::into_inner) = Some(channel);
    }

    pub(crate) fn clear_ready(&self) {
        *self.ready.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn ready_channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        self.ready
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the ready channel, or buffers `msg` and returns the buffer length.
    ///
    /// Both happen under the `pending` lock so a concurrent `set_ready` cannot slip in
    /// between the readiness check and the enqueue.
    fn channel_or_enqueue(
        &self,
        msg: PendingPublish,
    ) -> Result<(Arc<dyn AmqpChannel>, PendingPublish), usize> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match self.ready_channel() {
            Some(channel) => Ok((channel, msg)),
            None => {
                pending.push_back(msg);
                Err(pending.len())
            }
        }
    }

    fn dequeue(&self) -> Option<PendingPublish> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn requeue_front(&self, msg: PendingPublish) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(msg);
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) async fn publish(&self, msg: PendingPublish) -> bool {
        let (channel, msg) = match self.channel_or_enqueue(msg) {
            Ok(ready) => ready,
            Err(buffered) => {
                debug!(buffered, "channel not ready, message buffered");
                return true;
            }
        };

        match channel.publish(&msg).await {
            Ok(_) => true,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    routing_key = %msg.routing_key,
                    "error publishing message"
                );
                false
            }
        }
    }

    /// Drains the buffer in FIFO order, one message at a time.
    ///
    /// Stops at the first failure; the failed message goes back to the head of the buffer
    /// and waits for the next redrive. Returns the number of messages handed to the channel.
    pub(crate) async fn redrive(&self) -> usize {
        let _guard = self.redrive.lock().await;
        let mut sent = 0;

        while let Some(channel) = self.ready_channel() {
            let Some(msg) = self.dequeue() else {
                break;
            };

            if let Err(err) = channel.publish(&msg).await {
                warn!(
                    error = err.to_string(),
                    remaining = self.pending_len() + 1,
                    "failure to redrive pending message, will retry when ready"
                );
                self.requeue_front(msg);
                break;
            }

            sent += 1;
        }

        if sent > 0 {
            debug!(sent, "pending messages redriven");
        }

        sent
    }
}

/// Publishes messages through the supervised channel.
///
/// Cheap to clone; every clone shares the same buffer.
#[derive(Clone)]
pub struct RabbitMQPublisher {
    outbound: Arc<Outbound>,
}

impl RabbitMQPublisher {
    pub(crate) fn new(outbound: Arc<Outbound>) -> RabbitMQPublisher {
        RabbitMQPublisher { outbound }
    }

    /// Publishes `body` to `exchange` with `routing_key`.
    ///
    /// Returns `true` when the message was handed to the channel or buffered for later
    /// delivery, `false` when the channel refused it. The trace context of `ctx` is written
    /// into the headers before buffering.
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: BTreeMap<ShortString, AMQPValue>,
    ) -> bool {
        let mut msg = PendingPublish::new(exchange, routing_key, body);
        msg.headers.extend(headers);
        otel::inject(ctx, &mut msg.headers);

        self.outbound.publish(msg).await
    }

    /// Serializes `message` as JSON and publishes it to `queue` through the default exchange.
    pub async fn publish_json<T>(
        &self,
        ctx: &Context,
        queue: &str,
        message: &T,
        options: PublishOptions,
    ) -> bool
    where
        T: Serialize + ?Sized,
    {
        let body = match serde_json::to_vec(message) {
            Ok(body) => body,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue,
                    "{}",
                    AmqpError::SerializePayloadError
                );
                return false;
            }
        };

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_MAX_RETRIES),
            AMQPValue::LongInt(LongInt::from(options.resolved_max_retries())),
        );

        self.publish(ctx, DEFAULT_EXCHANGE, queue, body, headers).await
    }

    /// Messages waiting for the channel to become ready.
    pub fn pending(&self) -> usize {
        self.outbound.pending_len()
    }
}
