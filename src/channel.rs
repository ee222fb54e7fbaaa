// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! lapin-backed implementation of the transport traits. Connections are opened with a bounded
//! timeout and a heartbeat, and both connections and channels report asynchronous failures
//! through the supervisor's error listener.

use crate::{
    configs::AmqpConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    publisher::PendingPublish,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        AmqpChannel, AmqpConnection, AmqpConnector, DeliveryAcker, DeliveryStream, ErrorListener,
        InboundDelivery,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections from [`AmqpConfigs`].
pub struct LapinConnector {
    configs: AmqpConfigs,
}

impl LapinConnector {
    pub fn new(configs: AmqpConfigs) -> Arc<LapinConnector> {
        Arc::new(LapinConnector { configs })
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    /// Opens a connection with keep-alive enabled, failing after the configured timeout.
    async fn connect(
        &self,
        on_error: ErrorListener,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.configs.connection_name.clone()));

        let conn = match tokio::time::timeout(
            self.configs.connect_timeout(),
            Connection::connect(&self.configs.uri(), options),
        )
        .await
        {
            Err(_) => {
                error!(
                    timeout_ms = self.configs.connect_timeout_ms,
                    "connection attempt timed out"
                );
                Err(AmqpError::ConnectionTimeout(self.configs.connect_timeout_ms))
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
            Ok(Ok(c)) => Ok(c),
        }?;

        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failure");
            on_error(AmqpError::ConnectionError);
        });

        debug!("amqp connected");
        Ok(Arc::new(LapinConnection { conn }))
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(
        &self,
        on_error: ErrorListener,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                channel.on_error(move |err| {
                    error!(error = err.to_string(), "amqp channel failure");
                    on_error(AmqpError::ChannelClosed);
                });

                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            warn!(error = err.to_string(), "failure to close connection");
            AmqpError::ConnectionError
        })
    }
}

pub struct LapinChannel {
    channel: Channel,
}

/// The broker answers PRECONDITION_FAILED when a queue is redeclared with other arguments.
fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(e)
            if matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) if is_precondition_failed(&err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "queue exists with incompatible arguments"
                );
                Err(AmqpError::QueueArgumentConflict(def.name.clone()))
            }
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(into_inbound(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn publish(&self, msg: &PendingPublish) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(msg.content_type.clone()))
            .with_message_id(ShortString::from(msg.message_id.clone()))
            .with_headers(FieldTable::from(msg.headers.clone()));

        if msg.persistent {
            props = props.with_delivery_mode(2);
        }

        match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.body,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            warn!(error = err.to_string(), "failure to close channel");
            AmqpError::ChannelError
        })
    }
}

fn into_inbound(delivery: Delivery) -> InboundDelivery {
    let Delivery {
        data,
        properties,
        acker,
        ..
    } = delivery;

    InboundDelivery {
        data,
        headers: properties.headers().clone().unwrap_or_default(),
        acker: Box::new(LapinAcker { acker }),
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while reject msg");
                AmqpError::RejectMessageError
            })
    }
}
