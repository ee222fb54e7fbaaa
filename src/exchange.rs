// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing mechanism in RabbitMQ that determine how messages are
//! distributed to queues. The subsystem declares a single exchange of its own, the
//! dead-letter exchange, which receives every message rejected by a consumer.

use lapin::types::{AMQPValue, ShortString};
use std::collections::BTreeMap;

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Built with chained setters, starting from a non-durable direct exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition with default parameters.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    /// The dead-letter exchange: direct, durable, never auto-deleted and internal only.
    pub fn dead_letter(name: &str) -> ExchangeDefinition {
        ExchangeDefinition::new(name).direct().durable().internal()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_exchange_flags() {
        let dlx = ExchangeDefinition::dead_letter("DeadLetterExchange");

        assert_eq!(dlx.name(), "DeadLetterExchange");
        assert_eq!(dlx.kind, ExchangeKind::Direct);
        assert!(dlx.durable);
        assert!(dlx.internal);
        assert!(!dlx.delete);
        assert!(!dlx.passive);
    }

    #[test]
    fn converts_to_lapin_kind() {
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        );
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::default()),
            lapin::ExchangeKind::Direct
        );
    }
}
