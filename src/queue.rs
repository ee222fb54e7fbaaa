// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Every application queue is a durable quorum queue paired with a dead-letter queue
//! named `<queue>.dlq`. The main queue carries the dead-letter exchange and routing key
//! as arguments, so a rejected delivery lands on its DLQ through the exchange binding.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue argument selecting the queue implementation
pub const AMQP_ARGS_QUEUE_TYPE: &str = "x-queue-type";
/// Queue argument naming the dead letter exchange
pub const AMQP_ARGS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the dead letter routing key
pub const AMQP_ARGS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Suffix appended to an application queue name to form its DLQ name
pub const DLQ_SUFFIX: &str = ".dlq";

/// Returns the name of the dead-letter queue paired with `queue`.
pub fn dlq_name(queue: &str) -> String {
    format!("{}{}", queue, DLQ_SUFFIX)
}

/// Queue implementations selectable through `x-queue-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Classic,
    Quorum,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Classic => "classic",
            QueueType::Quorum => "quorum",
        }
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) queue_type: Option<QueueType>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// An application queue: durable quorum queue dead-lettering into `<name>.dlq`
    /// through the exchange `dlx`.
    pub fn application(name: &str, dlx: &str) -> QueueDefinition {
        QueueDefinition::new(name)
            .durable()
            .quorum()
            .with_dlq(dlx)
    }

    /// The DLQ paired with the application queue `name`.
    pub fn dead_letter(name: &str) -> QueueDefinition {
        QueueDefinition::new(&dlq_name(name)).durable().quorum()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Declares the queue as a replicated quorum queue.
    pub fn quorum(mut self) -> Self {
        self.queue_type = Some(QueueType::Quorum);
        self
    }

    /// Routes rejected messages to `<name>.dlq` through the exchange `dlx`.
    pub fn with_dlq(mut self, dlx: &str) -> Self {
        self.dead_letter_exchange = Some(dlx.to_owned());
        self.dead_letter_routing_key = Some(dlq_name(&self.name));
        self
    }

    /// Declaration arguments, as sent on `queue.declare`.
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(kind) = self.queue_type {
            args.insert(
                ShortString::from(AMQP_ARGS_QUEUE_TYPE),
                AMQPValue::LongString(LongString::from(kind.as_str())),
            );
        }

        if let Some(dlx) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_ARGS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_ARGS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }

        FieldTable::from(args)
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue` with an empty exchange and routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Binds the DLQ of `queue` to the dead-letter exchange under `<queue>.dlq`.
    pub fn dead_letter(queue: &str, dlx: &str) -> QueueBinding {
        let dlq = dlq_name(queue);
        QueueBinding::new(&dlq).exchange(dlx).routing_key(&dlq)
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
        table.inner().get(key)
    }

    #[test]
    fn application_queue_arguments() {
        let def = QueueDefinition::application("on_search", "DeadLetterExchange");
        let args = def.arguments();

        assert!(def.durable);
        assert!(!def.delete);
        assert_eq!(
            arg(&args, AMQP_ARGS_QUEUE_TYPE),
            Some(&AMQPValue::LongString("quorum".into()))
        );
        assert_eq!(
            arg(&args, AMQP_ARGS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString("DeadLetterExchange".into()))
        );
        assert_eq!(
            arg(&args, AMQP_ARGS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString("on_search.dlq".into()))
        );
    }

    #[test]
    fn dead_letter_queue_has_no_dead_letter_args() {
        let def = QueueDefinition::dead_letter("on_search");
        let args = def.arguments();

        assert_eq!(def.name(), "on_search.dlq");
        assert!(def.durable);
        assert_eq!(args.inner().len(), 1);
        assert_eq!(
            arg(&args, AMQP_ARGS_QUEUE_TYPE),
            Some(&AMQPValue::LongString("quorum".into()))
        );
    }

    #[test]
    fn dead_letter_binding() {
        let binding = QueueBinding::dead_letter("on_init", "DeadLetterExchange");

        assert_eq!(binding.queue_name, "on_init.dlq");
        assert_eq!(binding.exchange_name, "DeadLetterExchange");
        assert_eq!(binding.routing_key, "on_init.dlq");
    }
}
