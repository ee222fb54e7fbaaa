// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Route Table
//!
//! Maps each queue name to exactly one handler. The table is built once from an explicit
//! registration list, before any connection is attempted, and never changes afterwards.

use crate::{errors::AmqpError, handler::ConsumerHandler};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// A `(queue, handler)` pair supplied by the application at startup.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub(crate) queue: String,
    pub(crate) handler_id: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

impl HandlerRegistration {
    /// Registers `handler` for `queue`; `handler_id` only shows up in logs and errors.
    pub fn new(queue: &str, handler_id: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        HandlerRegistration {
            queue: queue.to_owned(),
            handler_id: handler_id.to_owned(),
            handler,
        }
    }
}

/// A resolved route for one queue.
#[derive(Clone)]
pub struct RouteEntry {
    pub(crate) queue: String,
    pub(crate) handler_id: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

impl RouteEntry {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    pub fn handler(&self) -> Arc<dyn ConsumerHandler> {
        self.handler.clone()
    }
}

/// Immutable queue name to handler map.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: BTreeMap<String, RouteEntry>,
}

impl RouteTable {
    /// Builds the table, failing with [`AmqpError::DuplicateRoute`] as soon as two
    /// registrations target the same queue. No partial table is returned.
    pub fn build<I>(registrations: I) -> Result<RouteTable, AmqpError>
    where
        I: IntoIterator<Item = HandlerRegistration>,
    {
        let mut routes = BTreeMap::<String, RouteEntry>::new();

        for reg in registrations {
            if let Some(existing) = routes.get(&reg.queue) {
                error!(
                    queue = %reg.queue,
                    existing = %existing.handler_id,
                    duplicate = %reg.handler_id,
                    "2 or more handlers present for same queue"
                );

                return Err(AmqpError::DuplicateRoute {
                    queue: reg.queue,
                    existing: existing.handler_id.clone(),
                    duplicate: reg.handler_id,
                });
            }

            debug!(queue = %reg.queue, handler = %reg.handler_id, "route registered");

            routes.insert(
                reg.queue.clone(),
                RouteEntry {
                    queue: reg.queue,
                    handler_id: reg.handler_id,
                    handler: reg.handler,
                },
            );
        }

        Ok(RouteTable { routes })
    }

    pub fn get(&self, queue: &str) -> Option<&RouteEntry> {
        self.routes.get(queue)
    }

    /// Queue names in a stable order.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
