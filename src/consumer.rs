// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processes a single delivery: finds the queue handler, runs it on the JSON body and
//! settles the delivery with the broker.
//!
//! Retries rely on the broker. A failed attempt is nacked with requeue, and quorum queues
//! redeliver it with `x-delivery-count` incremented. Once the attempt number reaches
//! `x-max-retries` the delivery is rejected without requeue and the queue's dead-letter
//! arguments route it to `<queue>.dlq`.

use crate::{
    errors::{AmqpError, HandlerError},
    handler::ConsumerMessage,
    otel,
    publisher::{AMQP_HEADERS_MAX_RETRIES, DEFAULT_MAX_RETRIES},
    routes::RouteTable,
    transport::InboundDelivery,
};
use lapin::types::{AMQPValue, FieldTable};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Header maintained by quorum queues with the number of previous delivery attempts
pub const AMQP_HEADERS_DELIVERY_COUNT: &str = "x-delivery-count";

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Handler succeeded; the message is removed
    Acked,
    /// Handler failed with attempts left; the broker redelivers
    Requeued,
    /// Handler failed on its last attempt; the message goes to the DLQ
    DeadLettered,
    /// No handler is routed for the queue; the message is removed unprocessed
    Dropped,
}

/// Attempt counters read from the delivery headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Attempt {
    pub(crate) retry_count: i64,
    pub(crate) max_retries: i64,
}

impl Attempt {
    /// `retry_count` is the broker delivery count plus one for the current attempt.
    pub(crate) fn from_headers(headers: &FieldTable) -> Attempt {
        let delivered = header_as_i64(headers, AMQP_HEADERS_DELIVERY_COUNT).unwrap_or(0);
        let max_retries =
            header_as_i64(headers, AMQP_HEADERS_MAX_RETRIES).unwrap_or(DEFAULT_MAX_RETRIES as i64);

        Attempt {
            retry_count: delivered.saturating_add(1),
            max_retries,
        }
    }

    fn exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Reads an integer header, whatever integer width the publisher used.
fn header_as_i64(headers: &FieldTable, key: &str) -> Option<i64> {
    match headers.inner().get(key)? {
        AMQPValue::ShortShortInt(v) => Some(*v as i64),
        AMQPValue::ShortShortUInt(v) => Some(*v as i64),
        AMQPValue::ShortInt(v) => Some(*v as i64),
        AMQPValue::ShortUInt(v) => Some(*v as i64),
        AMQPValue::LongInt(v) => Some(*v as i64),
        AMQPValue::LongUInt(v) => Some(*v as i64),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        AMQPValue::ShortString(v) => v.as_str().trim().parse().ok(),
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.trim().parse().ok(),
        _ => None,
    }
}

/// Consumes and settles one delivery received on `queue`.
///
/// Handler failures never surface as errors; only a failure to settle the delivery
/// with the broker does.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    queue: &str,
    delivery: InboundDelivery,
    routes: &RouteTable,
) -> Result<Settlement, AmqpError> {
    let attempt = Attempt::from_headers(&delivery.headers);
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, queue);

    debug!(
        queue,
        retry_count = attempt.retry_count,
        max_retries = attempt.max_retries,
        "received message"
    );

    let Some(route) = routes.get(queue) else {
        let msg = "removing message from queue - reason: no handler registered";
        error!(queue, "{}", msg);
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });

        delivery.acker.ack().await?;
        return Ok(Settlement::Dropped);
    };

    let result = match serde_json::from_slice(&delivery.data) {
        Ok(body) => {
            let msg = ConsumerMessage {
                queue: queue.to_owned(),
                body,
                retry_count: attempt.retry_count,
                max_retries: attempt.max_retries,
            };
            route.handler.exec(&ctx, &msg).await
        }
        Err(err) => Err(HandlerError::InvalidPayload(err.to_string())),
    };

    let Err(err) = result else {
        debug!(queue, handler = %route.handler_id, "message successfully processed");
        delivery.acker.ack().await.inspect_err(|e| span.record_error(e))?;
        span.set_status(Status::Ok);
        return Ok(Settlement::Acked);
    };

    span.record_error(&err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });

    if attempt.exhausted() {
        error!(
            error = err.to_string(),
            queue,
            handler = %route.handler_id,
            retry_count = attempt.retry_count,
            max_retries = attempt.max_retries,
            "too many attempts, sending to dlq"
        );
        delivery.acker.reject(false).await?;
        return Ok(Settlement::DeadLettered);
    }

    warn!(
        error = err.to_string(),
        queue,
        handler = %route.handler_id,
        retry_count = attempt.retry_count,
        max_retries = attempt.max_retries,
        "error while handling msg, requeuing for later"
    );
    delivery.acker.nack(true).await?;
    Ok(Settlement::Requeued)
}
