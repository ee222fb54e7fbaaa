// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Interface
//!
//! The supervisor, topology builder, dispatcher and publisher only see the broker through
//! these traits. `channel` implements them on top of lapin.

use crate::{
    errors::AmqpError, exchange::ExchangeDefinition, publisher::PendingPublish,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::types::FieldTable;
use std::sync::Arc;

/// Callback fired by the transport when a connection or channel fails asynchronously.
pub type ErrorListener = Arc<dyn Fn(AmqpError) + Send + Sync>;

/// Push-based stream of deliveries for one consumer. The stream ends when the broker
/// cancels the consumer or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    /// Opens a connection; `on_error` is invoked if it later fails.
    async fn connect(&self, on_error: ErrorListener) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Opens a channel; `on_error` is invoked if it later fails.
    async fn create_channel(&self, on_error: ErrorListener)
        -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed over a connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Starts a manual-ack subscription on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn publish(&self, msg: &PendingPublish) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles a single delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Removes the message from its queue.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Negative acknowledgement; with `requeue` the broker redelivers the message.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;

    /// Rejects the message; without `requeue` it is dead-lettered.
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message pushed by the broker to one of the consumers.
pub struct InboundDelivery {
    pub data: Vec<u8>,
    pub headers: FieldTable,
    pub acker: Box<dyn DeliveryAcker>,
}
