// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Owns the single broker connection and channel and drives every dependent setup step
//! through one reconciliation routine:
//!
//! `Disconnected → Connecting → Connected → ChannelOpen → TopologyReady → RoutesBuilt →
//! QueuesReady → ConsumersReady`
//!
//! Reconciliation only performs the steps missing from the current state, so calling it
//! again in `ConsumersReady` touches the broker only to redrive buffered publishes.
//! A failure reported by the transport demotes the state to `Disconnected` and wakes the
//! supervisor loop, which reconnects after the reconnect policy delay. Only configuration
//! errors stop the loop.

use crate::{
    channel::LapinConnector,
    configs::AmqpConfigs,
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::{Outbound, RabbitMQPublisher},
    routes::{HandlerRegistration, RouteTable},
    topology::{AmqpTopology, Topology},
    transport::{AmqpChannel, AmqpConnection, AmqpConnector, ErrorListener},
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex, Notify},
    task::JoinHandle,
    time::{interval_at, sleep, sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

/// Setup progress of the supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ChannelOpen,
    TopologyReady,
    RoutesBuilt,
    QueuesReady,
    ConsumersReady,
}

/// Collects the handler registrations and settings of a supervisor.
pub struct AmqpSupervisorBuilder {
    configs: AmqpConfigs,
    connector: Option<Arc<dyn AmqpConnector>>,
    registrations: Vec<HandlerRegistration>,
}

impl AmqpSupervisorBuilder {
    /// Routes the messages of `queue` to `handler`.
    pub fn handler(mut self, queue: &str, handler_id: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.registrations
            .push(HandlerRegistration::new(queue, handler_id, handler));
        self
    }

    pub fn registrations<I>(mut self, registrations: I) -> Self
    where
        I: IntoIterator<Item = HandlerRegistration>,
    {
        self.registrations.extend(registrations);
        self
    }

    /// Replaces the lapin connector.
    pub fn connector(mut self, connector: Arc<dyn AmqpConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Validates the configuration and builds the route table.
    ///
    /// Runs before any network activity: a duplicate route or an invalid configuration
    /// fails here and no connection is ever attempted.
    pub fn build(self) -> Result<AmqpSupervisor, AmqpError> {
        self.configs.validate()?;
        let routes = RouteTable::build(self.registrations)?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => LapinConnector::new(self.configs.clone()),
        };

        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(AmqpSupervisor {
            inner: Arc::new(Inner {
                configs: self.configs,
                connector,
                routes: Arc::new(routes),
                state,
                session: Mutex::new(Session::default()),
                outbound: Arc::new(Outbound::default()),
                generation: AtomicU64::new(0),
                attempted: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                stopped_by: std::sync::Mutex::new(None),
                wake: Notify::new(),
            }),
        })
    }
}

#[derive(Default)]
struct Session {
    connection: Option<Arc<dyn AmqpConnection>>,
    channel: Option<Arc<dyn AmqpChannel>>,
}

struct Inner {
    configs: AmqpConfigs,
    connector: Arc<dyn AmqpConnector>,
    routes: Arc<RouteTable>,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
    outbound: Arc<Outbound>,
    /// Identifies the live connection; error events carrying another value are stale.
    generation: AtomicU64,
    /// Set once the first connection attempt was made.
    attempted: AtomicBool,
    shutdown: AtomicBool,
    /// Error that stopped the supervisor loop, if any.
    stopped_by: std::sync::Mutex<Option<AmqpError>>,
    wake: Notify,
}

/// Handle to the supervised connection. Clones share the same connection.
#[derive(Clone)]
pub struct AmqpSupervisor {
    inner: Arc<Inner>,
}

impl AmqpSupervisor {
    pub fn builder(configs: AmqpConfigs) -> AmqpSupervisorBuilder {
        AmqpSupervisorBuilder {
            configs,
            connector: None,
            registrations: vec![],
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.inner.routes.clone()
    }

    /// A publisher sharing this supervisor's channel and pending buffer.
    pub fn publisher(&self) -> RabbitMQPublisher {
        RabbitMQPublisher::new(self.inner.outbound.clone())
    }

    /// Runs the supervisor loop on a tokio task.
    pub fn start(&self) -> JoinHandle<Result<(), AmqpError>> {
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.run().await })
    }

    /// Waits until every consumer is subscribed.
    ///
    /// Fails once the supervisor is stopped: with the configuration error that stopped
    /// `run()`, or [`AmqpError::SupervisorStopped`] after [`AmqpSupervisor::shutdown`].
    pub async fn ready(&self) -> Result<(), AmqpError> {
        let mut rx = self.inner.state.subscribe();
        let ready = rx
            .wait_for(|state| {
                *state == ConnectionState::ConsumersReady
                    || self.inner.shutdown.load(Ordering::SeqCst)
            })
            .await
            .map(|state| *state == ConnectionState::ConsumersReady)
            .map_err(|_| AmqpError::InternalError)?;

        if ready && !self.inner.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        Err(self
            .inner
            .stopped_by
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(AmqpError::SupervisorStopped))
    }

    /// Reconciles until shutdown.
    ///
    /// Transient failures are retried forever; returns the error when it is a configuration
    /// error, after closing the connection.
    pub async fn run(&self) -> Result<(), AmqpError> {
        while !self.inner.shutdown.load(Ordering::SeqCst) {
            match self.reconcile().await {
                Ok(_) => self.inner.wake.notified().await,
                Err(err) if err.is_fatal() => {
                    error!(error = err.to_string(), "unrecoverable amqp configuration error");
                    *self
                        .inner
                        .stopped_by
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
                    self.shutdown().await;
                    return Err(err);
                }
                Err(err) => warn!(error = err.to_string(), "amqp setup failed, retrying"),
            }
        }

        debug!("supervisor stopped");
        Ok(())
    }

    /// Performs the setup steps missing from the current state, then redrives the pending
    /// publishes once `ConsumersReady` is reached.
    ///
    /// Safe to call concurrently: calls are serialized and each one resumes from the state
    /// left by the previous one. On failure the session is torn down to `Disconnected`.
    pub async fn reconcile(&self) -> Result<ConnectionState, AmqpError> {
        let mut session = self.inner.session.lock().await;

        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return Ok(self.state());
            }

            let state = self.state();
            if state == ConnectionState::ConsumersReady {
                break;
            }

            // The connect step publishes `Connecting` itself before suspending.
            let from = match state {
                ConnectionState::Disconnected => ConnectionState::Connecting,
                other => other,
            };

            match self.step(&mut session, state).await {
                Ok(next) => {
                    if self.advance(from, next) {
                        debug!(from = ?state, to = ?next, "amqp state transition");
                    }
                }
                Err(err) => {
                    self.teardown(&mut session).await;
                    return Err(err);
                }
            }
        }

        drop(session);
        self.inner.outbound.redrive().await;

        Ok(ConnectionState::ConsumersReady)
    }

    /// Closes the channel then the connection and stops reconnecting.
    pub async fn shutdown(&self) {
        info!("shutting down amqp supervisor");
        self.inner.shutdown.store(true, Ordering::SeqCst);
        // Wakes `ready()` waiters without waiting for the session lock.
        self.inner.state.send_modify(|_| ());
        self.inner.outbound.clear_ready();
        self.inner.wake.notify_one();

        let mut session = self.inner.session.lock().await;
        self.teardown(&mut session).await;
    }

    async fn step(
        &self,
        session: &mut Session,
        state: ConnectionState,
    ) -> Result<ConnectionState, AmqpError> {
        match state {
            // A reconcile dropped mid-connect leaves `Connecting` behind; start over.
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                if session.connection.is_some() || session.channel.is_some() {
                    self.teardown(session).await;
                }

                self.backoff().await;
                if self.inner.shutdown.load(Ordering::SeqCst) {
                    return Ok(ConnectionState::Disconnected);
                }

                self.inner.state.send_replace(ConnectionState::Connecting);
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

                let connection = self.inner.connector.connect(self.listener(generation)).await?;
                session.connection = Some(connection);
                info!("RabbitMQ connection established");

                Ok(ConnectionState::Connected)
            }
            ConnectionState::Connected => {
                let connection = session.connection.clone().ok_or(AmqpError::ConnectionError)?;
                let generation = self.inner.generation.load(Ordering::SeqCst);

                let channel = connection.create_channel(self.listener(generation)).await?;
                session.channel = Some(channel);
                info!("RabbitMQ channel created");

                Ok(ConnectionState::ChannelOpen)
            }
            ConnectionState::ChannelOpen => {
                let channel = session.channel.clone().ok_or(AmqpError::ChannelClosed)?;

                AmqpTopology::dead_letter(channel, &self.inner.configs.dead_letter_exchange)
                    .install()
                    .await?;

                Ok(ConnectionState::TopologyReady)
            }
            ConnectionState::TopologyReady => {
                debug!(routes = self.inner.routes.len(), "route table activated");
                Ok(ConnectionState::RoutesBuilt)
            }
            ConnectionState::RoutesBuilt => {
                let channel = session.channel.clone().ok_or(AmqpError::ChannelClosed)?;

                AmqpTopology::routed_queues(
                    channel,
                    &self.inner.routes,
                    &self.inner.configs.dead_letter_exchange,
                )
                .install()
                .await?;

                Ok(ConnectionState::QueuesReady)
            }
            ConnectionState::QueuesReady => {
                let channel = session.channel.clone().ok_or(AmqpError::ChannelClosed)?;

                RabbitMQDispatcher::new(channel.clone(), self.inner.routes.clone())
                    .consume()
                    .await?;

                self.inner.outbound.set_ready(channel);
                info!(queues = self.inner.routes.len(), "consumers ready");

                Ok(ConnectionState::ConsumersReady)
            }
            ConnectionState::ConsumersReady => Ok(ConnectionState::ConsumersReady),
        }
    }

    /// Moves from `from` to `to` unless a transport failure changed the state meanwhile.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self.inner.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });

        if !moved || to != ConnectionState::ConsumersReady {
            self.inner.outbound.clear_ready();
        }

        moved
    }

    /// Builds the error listener handed to the transport for the connection `generation`.
    fn listener(&self, generation: u64) -> ErrorListener {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);

        Arc::new(move |err: AmqpError| {
            let Some(inner) = inner.upgrade() else {
                return;
            };

            if inner.shutdown.load(Ordering::SeqCst)
                || inner.generation.load(Ordering::SeqCst) != generation
            {
                debug!(error = err.to_string(), "ignoring error from a replaced connection");
                return;
            }

            error!(error = err.to_string(), "amqp transport failure, reconnecting");
            inner.outbound.clear_ready();
            inner.state.send_replace(ConnectionState::Disconnected);
            inner.wake.notify_one();
        })
    }

    /// Drops the session: best-effort close of the channel then the connection.
    async fn teardown(&self, session: &mut Session) {
        self.inner.outbound.clear_ready();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(channel) = session.channel.take() {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "channel already closed");
            }
        }

        if let Some(connection) = session.connection.take() {
            if let Err(err) = connection.close().await {
                debug!(error = err.to_string(), "connection already closed");
            }
        }

        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    /// Waits before every connection attempt but the first one.
    async fn backoff(&self) {
        if !self.inner.attempted.swap(true, Ordering::SeqCst) {
            return;
        }

        let policy = self.inner.configs.reconnect;
        if policy.countdown_step.is_zero() {
            sleep(policy.delay).await;
            return;
        }

        let deadline = Instant::now() + policy.delay;
        let mut ticker = interval_at(Instant::now() + policy.countdown_step, policy.countdown_step);
        let mut remaining = policy.countdown_start;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    warn!(remaining_secs = ceil_secs(remaining), "retrying connecting to RabbitMQ");
                    remaining = remaining.saturating_sub(policy.countdown_step);
                }
            }
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_millis().div_ceil(1000) as u64
}
