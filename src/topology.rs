// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the broker objects the subsystem relies on. Installation happens in two phases
//! on every (re)connect cycle:
//! - the dead-letter exchange, alone, so it exists before any queue refers to it
//! - for every routed queue, the main queue, its DLQ and the DLQ binding to the exchange
//!
//! Declarations are idempotent: identical names and arguments are accepted by the broker on
//! every cycle. A queue that already exists with other arguments fails the install with
//! [`AmqpError::QueueArgumentConflict`].

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    routes::RouteTable,
    transport::AmqpChannel,
};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::sync::Arc;
use tracing::debug;

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Topology made of the dead-letter exchange only.
    pub fn dead_letter(channel: Arc<dyn AmqpChannel>, dlx: &str) -> AmqpTopology {
        AmqpTopology::new(channel).exchange(ExchangeDefinition::dead_letter(dlx))
    }

    /// Main queue, DLQ and DLQ binding for every queue of `routes`.
    pub fn routed_queues(channel: Arc<dyn AmqpChannel>, routes: &RouteTable, dlx: &str) -> AmqpTopology {
        routes.queues().fold(AmqpTopology::new(channel), |topology, queue| {
            topology
                .queue(QueueDefinition::application(queue, dlx))
                .queue(QueueDefinition::dead_letter(queue))
                .queue_binding(QueueBinding::dead_letter(queue, dlx))
        })
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Exchanges are declared first and in order. Queues are then declared concurrently and
    /// must all succeed before the bindings, also concurrent, are issued.
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.channel.declare_exchange(exch).await?;
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        try_join_all(self.queues.iter().map(|def| self.channel.declare_queue(def))).await?;
        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        try_join_all(
            self.queues_binding
                .iter()
                .map(|binding| self.channel.bind_queue(binding)),
        )
        .await?;

        if !self.queues_binding.is_empty() {
            debug!("queues were bound");
        }

        Ok(())
    }
}
