// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Bus
//!
//! `MessageBus` owns the broker connection and drives its lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -(unexpected close)-> Reconnecting
//!                                   ^                                |
//!                                   +---------- Connecting <---------+
//! ```
//!
//! A connected bus holds a `Session`: the connection plus an inbound channel
//! (consumers and topology, prefetch 1) and an outbound channel in confirm
//! mode (publishing). Both channels live and die with the connection.
//!
//! When the transport reports a closure the bus did not ask for, the session
//! and every consumer registration are dropped and a background task retries
//! the connection on a fixed interval until it succeeds, the retry budget is
//! spent, or the caller steps in with `connect` or `disconnect`. Consumers are
//! not restored; callers resubscribe once the bus is `Connected` again.
//!
//! `connect`, `disconnect`, `subscribe`, the `unsubscribe*` family and
//! `delete_queue` run one at a time behind the link mutex.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Transport},
    channel::LapinTransport,
    codec::EnvelopeCodec,
    config::{BusConfig, ReconnectPolicy, SubscriptionMode},
    consumer::{delivery_handler, Listener},
    errors::AmqpError,
    queue::RetryLimit,
    registry::ConsumerRegistry,
};
use futures_util::{
    future::{join_all, BoxFuture},
    FutureExt,
};
use lapin::{options::QueueDeclareOptions, types::FieldTable};
use serde_json::Value;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, Weak,
    },
};
use tokio::{
    runtime::Handle,
    sync::{watch, Mutex},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Unacknowledged deliveries allowed in flight on the inbound channel
pub const CONSUMER_PREFETCH: u16 = 1;

/// Lifecycle state of a `MessageBus`, observable through `watch_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// An open connection together with the two channels it owns.
#[derive(Clone)]
pub(crate) struct Session {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) inbound: Arc<dyn BrokerChannel>,
    pub(crate) outbound: Arc<dyn BrokerChannel>,
}

impl Session {
    /// Runs `op` on a short-lived channel. A channel-level broker error (a
    /// conflicting declaration, a missing queue) closes that channel instead
    /// of the inbound one the consumers live on.
    pub(crate) async fn on_scratch<T, F, Fut>(&self, op: F) -> Result<T, AmqpError>
    where
        F: FnOnce(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let channel = self.connection.open_channel().await?;
        let result = op(channel.clone()).await;
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "scratch channel was already closed");
        }
        result
    }

    /// Fails unless `queue` exists.
    async fn verify_queue(&self, queue: &str) -> Result<(), AmqpError> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        self.on_scratch(|channel| async move {
            channel
                .declare_queue(queue, options, FieldTable::default())
                .await
                .map(|_| ())
        })
        .await
    }
}

/// Armed while a session is live; disarmed by a deliberate disconnect or by
/// the first close notification, whichever comes first.
struct Watchdog {
    armed: AtomicBool,
}

impl Watchdog {
    fn new() -> Arc<Watchdog> {
        Arc::new(Watchdog {
            armed: AtomicBool::new(true),
        })
    }

    /// Returns whether this call did the disarming.
    fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct Link {
    pub(crate) session: Option<Session>,
    watchdog: Option<Arc<Watchdog>>,
    reconnect: Option<watch::Sender<bool>>,
}

impl Link {
    /// Stops a running reconnect loop, if any.
    fn cancel_reconnect(&mut self) {
        if let Some(cancel) = self.reconnect.take() {
            let _ = cancel.send(true);
            debug!("reconnect loop cancelled");
        }
    }
}

pub(crate) struct Shared {
    url: String,
    pub(crate) codec: EnvelopeCodec,
    policy: ReconnectPolicy,
    mode: SubscriptionMode,
    transport: Arc<dyn Transport>,
    pub(crate) link: Mutex<Link>,
    pub(crate) registry: ConsumerRegistry,
    /// Retry caps of the asserted queues that have a retry companion.
    retry_limits: std::sync::Mutex<HashMap<String, RetryLimit>>,
    state: watch::Sender<ConnectionState>,
}

/// Connection-managed publish/subscribe access to an AMQP broker.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct MessageBus {
    pub(crate) shared: Arc<Shared>,
}

/// Handle returned by `subscribe`, cancelling that consumer when used.
#[derive(Debug, Clone)]
pub struct Subscription {
    consumer_tag: String,
    shared: Weak<Shared>,
}

impl Subscription {
    /// The broker consumer tag, a random UUID.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Cancels this consumer.
    ///
    /// # Returns
    /// * `Err(AmqpError::UnknownConsumer)` when it was already cancelled, or
    ///   dropped with a lost connection
    /// * `Err(AmqpError::NotConnected)` when the bus itself is gone
    pub async fn unsubscribe(self) -> Result<(), AmqpError> {
        let shared = self.shared.upgrade().ok_or(AmqpError::NotConnected)?;
        MessageBus { shared }.unsubscribe(&self.consumer_tag).await
    }
}

pub(crate) fn require_name(field: &str, value: &str) -> Result<(), AmqpError> {
    if value.trim().is_empty() {
        return Err(AmqpError::Validation(format!(
            "{field} must be a non-empty string"
        )));
    }
    Ok(())
}

impl MessageBus {
    /// Creates a bus backed by lapin. No connection is opened yet.
    pub fn new(config: BusConfig) -> Result<MessageBus, AmqpError> {
        let transport = Arc::new(LapinTransport::new(config.connection_name.clone()));
        MessageBus::with_transport(config, transport)
    }

    /// Creates a lapin-backed bus from a loosely typed JSON mapping.
    pub fn from_value(value: &Value) -> Result<MessageBus, AmqpError> {
        MessageBus::new(BusConfig::from_value(value)?)
    }

    /// Creates a bus on top of any broker transport.
    pub fn with_transport(
        config: BusConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<MessageBus, AmqpError> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(MessageBus {
            shared: Arc::new(Shared {
                codec: EnvelopeCodec::new(config.encryption_key.as_deref()),
                url: config.url,
                policy: config.reconnect,
                mode: config.subscription_mode,
                transport,
                link: Mutex::new(Link::default()),
                registry: ConsumerRegistry::new(),
                retry_limits: std::sync::Mutex::default(),
                state,
            }),
        })
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver observing every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Shorthand for `state() == ConnectionState::Connected`.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Active `(consumer tag, queue)` registrations.
    pub fn consumers(&self) -> Vec<(String, String)> {
        self.shared.registry.snapshot()
    }

    /// The codec payloads are encoded with.
    pub fn codec(&self) -> &EnvelopeCodec {
        &self.shared.codec
    }

    /// Opens the connection and its channels.
    ///
    /// Does nothing when already connected. While the reconnect loop is
    /// running this makes an immediate attempt of its own: success stops the
    /// loop, failure leaves it running and the bus `Reconnecting`.
    ///
    /// # Returns
    /// * `Ok(())` once the bus is `Connected`
    /// * `Err(AmqpError::ConnectionError)` or `Err(AmqpError::ChannelError)`
    ///   when the broker could not be reached
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let mut link = self.shared.link.lock().await;
        if link.session.is_some() {
            debug!("already connected");
            return Ok(());
        }

        let fallback = if link.reconnect.is_some() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };
        if let Err(err) = self.shared.establish(&mut link, fallback).await {
            if fallback == ConnectionState::Reconnecting {
                warn!(error = err.to_string(), "connect failed, reconnect loop keeps running");
            }
            return Err(err);
        }

        link.cancel_reconnect();
        info!("message bus connected");
        Ok(())
    }

    /// Cancels every consumer and closes the connection. Does nothing when
    /// already disconnected; stops the reconnect loop when one is running.
    pub async fn disconnect(&self) -> Result<(), AmqpError> {
        let mut link = self.shared.link.lock().await;
        link.cancel_reconnect();
        if let Some(watchdog) = link.watchdog.take() {
            watchdog.disarm();
        }

        let Some(session) = link.session.take() else {
            self.shared.set_state(ConnectionState::Disconnected);
            return Ok(());
        };

        if let Err(err) = self
            .shared
            .drain(&session, self.shared.registry.tags())
            .await
        {
            warn!(error = err.to_string(), "failure to cancel consumers on disconnect");
        }
        self.shared.registry.clear();

        let closed = session.connection.close().await;
        self.shared.set_state(ConnectionState::Disconnected);
        info!("message bus disconnected");
        closed
    }

    /// Starts consuming `queue`, handing each decoded message to `listener`.
    ///
    /// Messages are delivered with manual acknowledgement; the listener must
    /// settle every one of them.
    ///
    /// # Parameters
    /// * `queue` - An existing queue
    /// * `listener` - Receives every decoded message
    ///
    /// # Returns
    /// * `Ok(Subscription)` holding the consumer tag
    /// * `Err(AmqpError::SubscriptionActive)` in single mode with a consumer running
    /// * `Err(AmqpError::DeclareQueueError)` when the queue does not exist
    pub async fn subscribe<L: Listener>(
        &self,
        queue: &str,
        listener: L,
    ) -> Result<Subscription, AmqpError> {
        require_name("queue", queue)?;

        let link = self.shared.link.lock().await;
        let session = link.session.as_ref().ok_or(AmqpError::NotConnected)?;

        if self.shared.mode == SubscriptionMode::Single && !self.shared.registry.is_empty() {
            return Err(AmqpError::SubscriptionActive);
        }

        session.verify_queue(queue).await?;

        let consumer_tag = Uuid::new_v4().to_string();
        let handler = delivery_handler(
            queue,
            self.shared.codec.clone(),
            session.inbound.clone(),
            self.shared.retry_limit(queue),
            Arc::new(listener),
        );

        session.inbound.consume(queue, &consumer_tag, handler).await?;
        self.shared.registry.insert(&consumer_tag, queue)?;
        debug!(consumer = %consumer_tag, queue, "subscribed");

        Ok(Subscription {
            consumer_tag,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Cancels the consumer registered under `consumer_tag`.
    ///
    /// # Parameters
    /// * `consumer_tag` - Tag of a `Subscription` from this bus
    ///
    /// # Returns
    /// * `Err(AmqpError::UnknownConsumer)` when no consumer has that tag
    /// * `Err(AmqpError::CancelConsumerError)` when the broker refused the cancel
    pub async fn unsubscribe(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let link = self.shared.link.lock().await;
        if !self.shared.registry.contains(consumer_tag) {
            return Err(AmqpError::UnknownConsumer(consumer_tag.to_owned()));
        }

        let session = link.session.as_ref().ok_or(AmqpError::NotConnected)?;
        self.shared.cancel(session, consumer_tag).await
    }

    /// Cancels every active consumer concurrently.
    pub async fn unsubscribe_all(&self) -> Result<(), AmqpError> {
        let link = self.shared.link.lock().await;
        let Some(session) = link.session.as_ref() else {
            return Ok(());
        };

        self.shared
            .drain(session, self.shared.registry.tags())
            .await
    }

    /// Snapshot of the live session.
    pub(crate) async fn session(&self) -> Result<Session, AmqpError> {
        self.shared
            .link
            .lock()
            .await
            .session
            .clone()
            .ok_or(AmqpError::NotConnected)
    }
}

impl Shared {
    /// Records, or forgets, the retry cap consumers of `queue` enforce.
    pub(crate) fn set_retry_limit(&self, queue: &str, limit: Option<RetryLimit>) {
        let mut limits = self.retry_limits.lock().unwrap_or_else(PoisonError::into_inner);
        match limit {
            Some(limit) => limits.insert(queue.to_owned(), limit),
            None => limits.remove(queue),
        };
    }

    fn retry_limit(&self, queue: &str) -> Option<RetryLimit> {
        self.retry_limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection state changed");
        }
    }

    async fn open_session(&self) -> Result<Session, AmqpError> {
        let connection = self.transport.open(&self.url).await?;

        match Self::open_channels(&connection).await {
            Ok((inbound, outbound)) => Ok(Session {
                connection,
                inbound,
                outbound,
            }),
            Err(err) => {
                if let Err(e) = connection.close().await {
                    warn!(error = e.to_string(), "failure to close half-open connection");
                }
                Err(err)
            }
        }
    }

    async fn open_channels(
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<(Arc<dyn BrokerChannel>, Arc<dyn BrokerChannel>), AmqpError> {
        let inbound = connection.open_channel().await?;
        inbound.prefetch(CONSUMER_PREFETCH).await?;
        let outbound = connection.open_confirm_channel().await?;
        Ok((inbound, outbound))
    }

    /// Opens a session and arms the close observer. On failure the state
    /// falls back to `fallback`.
    async fn establish(
        self: &Arc<Self>,
        link: &mut Link,
        fallback: ConnectionState,
    ) -> Result<(), AmqpError> {
        self.set_state(ConnectionState::Connecting);

        let session = match self.open_session().await {
            Ok(session) => session,
            Err(err) => {
                self.set_state(fallback);
                return Err(err);
            }
        };

        let watchdog = Watchdog::new();
        let observed = watchdog.clone();
        let shared = Arc::downgrade(self);
        let runtime = Handle::current();
        session.connection.on_close(Box::new(move |err| {
            if !observed.disarm() {
                return;
            }
            warn!(error = err.to_string(), "connection closed unexpectedly");
            if let Some(shared) = shared.upgrade() {
                runtime.spawn(Shared::reconnect(shared, observed.clone()));
            }
        }));

        link.session = Some(session);
        link.watchdog = Some(watchdog);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Background loop restoring a connection lost unexpectedly.
    fn reconnect(shared: Arc<Shared>, failed: Arc<Watchdog>) -> BoxFuture<'static, ()> {
        async move {
            let mut cancelled = {
                let mut link = shared.link.lock().await;
                let current = link
                    .watchdog
                    .as_ref()
                    .is_some_and(|watchdog| Arc::ptr_eq(watchdog, &failed));
                if !current {
                    debug!("ignoring close of a superseded connection");
                    return;
                }

                link.session = None;
                link.watchdog = None;
                let abandoned = shared.registry.clear();
                if abandoned > 0 {
                    warn!(abandoned, "consumers dropped with the connection, resubscribe required");
                }

                shared.set_state(ConnectionState::Reconnecting);
                let (cancel, cancelled) = watch::channel(false);
                link.reconnect = Some(cancel);
                cancelled
            };

            let interval = shared.policy.interval();
            let mut attempts = 0u32;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancelled.changed() => return,
                }

                let mut link = shared.link.lock().await;
                if !matches!(cancelled.has_changed(), Ok(false)) || link.session.is_some() {
                    return;
                }

                attempts += 1;
                match shared
                    .establish(&mut link, ConnectionState::Reconnecting)
                    .await
                {
                    Ok(()) => {
                        link.reconnect = None;
                        info!(attempts, "message bus reconnected");
                        return;
                    }
                    Err(err) => {
                        warn!(error = err.to_string(), attempts, "reconnect attempt failed");
                        if shared.policy.exhausted(attempts) {
                            error!(attempts, "reconnect retries exhausted, giving up");
                            link.reconnect = None;
                            shared.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
            }
        }
        .boxed()
    }

    /// Cancels one consumer and forgets its registration.
    pub(crate) async fn cancel(&self, session: &Session, consumer_tag: &str) -> Result<(), AmqpError> {
        session.inbound.cancel(consumer_tag).await?;
        if let Some(queue) = self.registry.remove(consumer_tag) {
            debug!(consumer = consumer_tag, queue = %queue, "unsubscribed");
        }
        Ok(())
    }

    /// Cancels `tags` concurrently, waiting for all of them. Reports the first
    /// failure after every cancellation has finished.
    pub(crate) async fn drain(&self, session: &Session, tags: Vec<String>) -> Result<(), AmqpError> {
        let results = join_all(tags.iter().map(|tag| self.cancel(session, tag))).await;
        results.into_iter().collect()
    }
}
