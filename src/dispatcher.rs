// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Starts one subscription per routed queue. Each subscription runs on its own tokio task
//! and processes its deliveries one after the other; different queues are processed
//! concurrently. Prefetch is left at the broker default.

use crate::{
    consumer::consume, errors::AmqpError, routes::RouteTable, transport::AmqpChannel,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Subscribes the route table handlers to their queues.
pub struct RabbitMQDispatcher {
    channel: Arc<dyn AmqpChannel>,
    routes: Arc<RouteTable>,
}

impl RabbitMQDispatcher {
    pub fn new(channel: Arc<dyn AmqpChannel>, routes: Arc<RouteTable>) -> Self {
        RabbitMQDispatcher { channel, routes }
    }

    /// Starts a consumer for every queue in the route table.
    ///
    /// Either every subscription is started or none is: on failure the tasks already
    /// spawned are aborted and the error is returned.
    pub async fn consume(&self) -> Result<Vec<JoinHandle<()>>, AmqpError> {
        let mut spawns = vec![];

        for queue in self.routes.queues() {
            let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

            let mut deliveries = match self.channel.consume(queue, &consumer_tag).await {
                Ok(stream) => stream,
                Err(err) => {
                    error!(error = err.to_string(), queue, "failure to create the consumer");
                    spawns.iter().for_each(|handle: &JoinHandle<()>| handle.abort());
                    return Err(err);
                }
            };

            debug!(queue, consumer_tag, "consumer started");

            let queue = queue.to_owned();
            let routes = self.routes.clone();

            spawns.push(tokio::spawn(async move {
                let tracer = global::tracer("amqp consumer");

                while let Some(result) = deliveries.next().await {
                    match result {
                        Ok(delivery) => {
                            if let Err(err) = consume(&tracer, &queue, delivery, &routes).await {
                                error!(error = err.to_string(), queue, "error consume msg");
                            }
                        }
                        Err(err) => error!(error = err.to_string(), queue, "errors consume msg"),
                    }
                }

                debug!(queue, "consumer cancelled");
            }));
        }

        Ok(spawns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::HandlerError,
        handler::{ConsumerMessage, FnHandler},
        routes::HandlerRegistration,
        transport::{InboundDelivery, MockAmqpChannel, MockDeliveryAcker},
    };
    use futures_util::stream;
    use lapin::types::FieldTable;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn routes(queues: &[&str], calls: Arc<AtomicUsize>) -> Arc<RouteTable> {
        Arc::new(
            RouteTable::build(queues.iter().map(|queue| {
                let calls = calls.clone();
                HandlerRegistration::new(
                    queue,
                    &format!("Consumer:{}", queue),
                    Arc::new(FnHandler::new(move |_: ConsumerMessage| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<(), HandlerError>(())
                        }
                    })),
                )
            }))
            .unwrap(),
        )
    }

    fn acked_delivery() -> InboundDelivery {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        InboundDelivery {
            data: b"{}".to_vec(),
            headers: FieldTable::default(),
            acker: Box::new(acker),
        }
    }

    #[tokio::test]
    async fn subscribes_every_queue() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_consume()
            .times(2)
            .returning(|_, _| Ok(stream::iter(vec![Ok(acked_delivery())]).boxed()));

        let dispatcher = RabbitMQDispatcher::new(
            Arc::new(channel),
            routes(&["on_init", "on_search"], calls.clone()),
        );

        for handle in dispatcher.consume().await.unwrap() {
            handle.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn consume_failure_is_all_or_nothing() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_consume().returning(|queue, _| {
            if queue == "on_search" {
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            } else {
                Ok(stream::pending().boxed())
            }
        });

        let dispatcher = RabbitMQDispatcher::new(
            Arc::new(channel),
            routes(&["on_init", "on_search"], Arc::new(AtomicUsize::new(0))),
        );

        let err = dispatcher.consume().await.unwrap_err();
        assert_eq!(err, AmqpError::BindingConsumerError("on_search".to_owned()));
    }

    #[tokio::test]
    async fn stream_errors_do_not_stop_the_consumer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut channel = MockAmqpChannel::new();
        channel.expect_consume().returning(|_, _| {
            Ok(stream::iter(vec![
                Err(AmqpError::ConsumerError("frame error".to_owned())),
                Ok(acked_delivery()),
            ])
            .boxed())
        });

        let dispatcher =
            RabbitMQDispatcher::new(Arc::new(channel), routes(&["on_init"], calls.clone()));

        for handle in dispatcher.consume().await.unwrap() {
            handle.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
