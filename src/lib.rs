// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod channel;
pub mod configs;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod routes;
pub mod supervisor;
pub mod topology;
pub mod transport;

pub use consumer::{Settlement, AMQP_HEADERS_DELIVERY_COUNT};

#[cfg(test)]
mod tests;
