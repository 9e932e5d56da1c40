// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the capability traits for unit tests.
//!
//! Supports the default, direct, fanout and topic exchanges, manual
//! acknowledgement bookkeeping, publisher confirms and the failure modes the
//! bus has to cope with: refused connections, nacked publishes and the broker
//! dropping every connection at once.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, CloseObserver, Delivery, DeliveryHandler, QueueInfo,
        Transport,
    },
    bus::{ConnectionState, MessageBus},
    config::{BusConfig, ReconnectPolicy},
    consumer::{Listener, Message},
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, ExchangeKind,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    time::{sleep, timeout, Instant},
};

const WAIT_LIMIT: Duration = Duration::from_secs(2);

/// Reconnect policy short enough for tests.
pub(crate) fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        interval_ms: 10,
        max_retries: None,
    }
}

pub(crate) fn bus_on(broker: &MemoryBroker, config: BusConfig) -> MessageBus {
    MessageBus::with_transport(config, broker.transport()).unwrap()
}

/// A bus on `broker` that is already connected.
pub(crate) async fn connected_bus(broker: &MemoryBroker, config: BusConfig) -> MessageBus {
    let bus = bus_on(broker, config);
    bus.connect().await.unwrap();
    bus
}

pub(crate) async fn wait_for_state(bus: &MessageBus, state: ConnectionState) {
    let mut rx = bus.watch_state();
    timeout(WAIT_LIMIT, rx.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("bus never reached {state:?}"))
        .unwrap();
}

/// Listener forwarding every message, unsettled, to the returned receiver.
pub(crate) fn forward() -> (impl Listener, UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = move |message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
        }
    };
    (listener, rx)
}

pub(crate) async fn next_message(rx: &mut UnboundedReceiver<Message>) -> Message {
    timeout(WAIT_LIMIT, rx.recv())
        .await
        .expect("no message delivered")
        .expect("listener dropped")
}

/// Properties carrying the `x-death` record a broker adds when it
/// dead-letters a message out of `queue` `count` times.
pub(crate) fn dead_lettered_from(queue: &str, count: i64) -> BasicProperties {
    let mut death = FieldTable::default();
    death.insert(
        ShortString::from("queue"),
        AMQPValue::LongString(LongString::from(queue)),
    );
    death.insert(ShortString::from("count"), AMQPValue::LongLongInt(count));

    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from("x-death"),
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
    );
    BasicProperties::default().with_headers(headers)
}

/// Polls `condition` until it holds or the wait limit passes.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    core: Arc<Core>,
}

#[derive(Default)]
struct Core {
    state: Mutex<State>,
    opened: AtomicUsize,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    published: AtomicUsize,
    refused: AtomicUsize,
    nack_publishes: AtomicBool,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: Vec<Arc<MemoryConnection>>,
    next_connection: usize,
    next_delivery_tag: u64,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    prefetch: Vec<u16>,
    deleted_with_consumers: Vec<String>,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct Queue {
    arguments: FieldTable,
    pending: VecDeque<Delivery>,
    consumers: Vec<Consumer>,
    next: usize,
}

struct Consumer {
    tag: String,
    connection: usize,
    handler: DeliveryHandler,
}

type Dispatch = Vec<(DeliveryHandler, Delivery)>;

impl Queue {
    /// Hands pending deliveries to consumers round-robin.
    fn dispatch(&mut self) -> Dispatch {
        let mut out = Vec::new();
        while !self.consumers.is_empty() {
            let Some(delivery) = self.pending.pop_front() else {
                break;
            };
            let consumer = &self.consumers[self.next % self.consumers.len()];
            self.next = self.next.wrapping_add(1);
            out.push((consumer.handler.clone(), delivery));
        }
        out
    }
}

fn run(dispatch: Dispatch) {
    for (handler, delivery) in dispatch {
        tokio::spawn(handler(delivery));
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub(crate) fn topic_matches(pattern: &str, key: &str) -> bool {
    fn walk(p: &[&str], k: &[&str]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => walk(&p[1..], k) || (!k.is_empty() && walk(p, &k[1..])),
            (Some(&"*"), Some(_)) => walk(&p[1..], &k[1..]),
            (Some(a), Some(b)) if a == b => walk(&p[1..], &k[1..]),
            _ => false,
        }
    }

    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    walk(&p, &k)
}

impl MemoryBroker {
    pub(crate) fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.core.state.lock().unwrap()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// A channel on a connection the broker does not track.
    pub(crate) fn detached_channel(&self) -> Arc<dyn BrokerChannel> {
        Arc::new(MemoryConnection::new(self.clone(), usize::MAX).channel())
    }

    /// Connections opened so far.
    pub(crate) fn opened(&self) -> usize {
        self.core.opened.load(Ordering::SeqCst)
    }

    /// Channels opened on tracked connections and not closed since, either
    /// by the client or by a channel-level error.
    pub(crate) fn open_channels(&self) -> usize {
        self.core
            .channels_opened
            .load(Ordering::SeqCst)
            .saturating_sub(self.core.channels_closed.load(Ordering::SeqCst))
    }

    /// Messages that reached the broker.
    pub(crate) fn published(&self) -> usize {
        self.core.published.load(Ordering::SeqCst)
    }

    /// Refuses the next `count` connection attempts.
    pub(crate) fn refuse_connections(&self, count: usize) {
        self.core.refused.store(count, Ordering::SeqCst);
    }

    pub(crate) fn nack_publishes(&self, nack: bool) {
        self.core.nack_publishes.store(nack, Ordering::SeqCst);
    }

    pub(crate) fn acked(&self) -> Vec<u64> {
        self.state().acked.clone()
    }

    pub(crate) fn nacked(&self) -> Vec<(u64, bool)> {
        self.state().nacked.clone()
    }

    pub(crate) fn prefetch_requests(&self) -> Vec<u16> {
        self.state().prefetch.clone()
    }

    pub(crate) fn live_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub(crate) fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub(crate) fn queue_arguments(&self, name: &str) -> Option<FieldTable> {
        self.state().queues.get(name).map(|q| q.arguments.clone())
    }

    pub(crate) fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    pub(crate) fn pending(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or_default()
    }

    /// Queues deleted while they still had consumers.
    pub(crate) fn deleted_with_consumers(&self) -> Vec<String> {
        self.state().deleted_with_consumers.clone()
    }

    /// Drops every live connection as if the broker went away.
    pub(crate) fn sever(&self) {
        let connections = std::mem::take(&mut self.state().connections);
        for connection in connections {
            connection.terminate(AmqpError::ConnectionLost("broker went away".to_owned()));
        }
    }

    fn forget(&self, connection: usize) {
        let mut state = self.state();
        state.connections.retain(|c| c.id != connection);
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.connection != connection);
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn open(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let refused = self.core.refused.load(Ordering::SeqCst);
        if refused > 0 {
            self.core.refused.store(refused - 1, Ordering::SeqCst);
            return Err(AmqpError::ConnectionError);
        }

        let mut state = self.state();
        let id = state.next_connection;
        state.next_connection += 1;
        let connection = Arc::new(MemoryConnection::new(self.clone(), id));
        state.connections.push(connection.clone());
        self.core.opened.fetch_add(1, Ordering::SeqCst);
        Ok(connection)
    }
}

pub(crate) struct MemoryConnection {
    id: usize,
    broker: MemoryBroker,
    closed: Arc<AtomicBool>,
    observer: Mutex<Option<CloseObserver>>,
}

impl MemoryConnection {
    fn new(broker: MemoryBroker, id: usize) -> MemoryConnection {
        MemoryConnection {
            id,
            broker,
            closed: Arc::new(AtomicBool::new(false)),
            observer: Mutex::new(None),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the connection and notifies the observer, like a client library
    /// emitting its close event.
    fn terminate(&self, reason: AmqpError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.forget(self.id);
        let observer = self.observer.lock().unwrap().take();
        if let Some(observer) = observer {
            observer(reason);
        }
    }

    fn channel(&self) -> MemoryChannel {
        MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
            closed: self.closed.clone(),
            released: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelError);
        }
        self.broker.core.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.channel()))
    }

    async fn open_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.open_channel().await
    }

    fn on_close(&self, observer: CloseObserver) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::CloseConnectionError);
        }
        self.terminate(AmqpError::ConnectionLost("closed by client".to_owned()));
        Ok(())
    }
}

pub(crate) struct MemoryChannel {
    broker: MemoryBroker,
    connection: usize,
    /// Shared with the owning connection.
    closed: Arc<AtomicBool>,
    released: AtomicBool,
}

impl MemoryChannel {
    fn broker(&self) -> Result<&MemoryBroker, AmqpError> {
        if self.closed.load(Ordering::SeqCst) || self.released.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }
        Ok(&self.broker)
    }

    /// Closes this channel; returns whether it was still open.
    fn release(&self) -> bool {
        let was_open = !self.released.swap(true, Ordering::SeqCst);
        if was_open {
            self.broker.core.channels_closed.fetch_add(1, Ordering::SeqCst);
        }
        was_open
    }

    /// A channel-level error: like a real broker, it closes the channel.
    fn fail(&self, err: AmqpError) -> AmqpError {
        self.release();
        err
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.broker()?.state().prefetch.push(count);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: DeliveryHandler,
    ) -> Result<(), AmqpError> {
        let broker = self.broker()?;
        let dispatch = {
            let mut state = broker.state();
            let Some(target) = state.queues.get_mut(queue) else {
                return Err(self.fail(AmqpError::BindingConsumerError(queue.to_owned())));
            };
            target.consumers.push(Consumer {
                tag: consumer_tag.to_owned(),
                connection: self.connection,
                handler,
            });
            target.dispatch()
        };
        run(dispatch);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker()?.state();
        for queue in state.queues.values_mut() {
            if let Some(pos) = queue.consumers.iter().position(|c| c.tag == consumer_tag) {
                queue.consumers.remove(pos);
                return Ok(());
            }
        }
        Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.broker()
            .map_err(|_| AmqpError::AckMessageError)?
            .state()
            .acked
            .push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.broker()
            .map_err(|_| AmqpError::NackMessageError)?
            .state()
            .nacked
            .push((delivery_tag, requeue));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let broker = self.broker().map_err(|_| AmqpError::PublishingError)?;
        if broker.core.nack_publishes.load(Ordering::SeqCst) {
            return Err(AmqpError::PublishNackedError);
        }

        let dispatch = {
            let mut state = broker.state();
            let targets: Vec<String> = if exchange.is_empty() {
                vec![routing_key.to_owned()]
            } else {
                let Some(ex) = state.exchanges.get(exchange) else {
                    return Err(AmqpError::PublishingError);
                };
                ex.bindings
                    .iter()
                    .filter(|(_, pattern)| match &ex.kind {
                        ExchangeKind::Fanout => true,
                        ExchangeKind::Topic => topic_matches(pattern, routing_key),
                        _ => pattern == routing_key,
                    })
                    .map(|(queue, _)| queue.clone())
                    .collect()
            };

            let mut dispatch = Dispatch::new();
            for name in targets {
                state.next_delivery_tag += 1;
                let delivery_tag = state.next_delivery_tag;
                if let Some(queue) = state.queues.get_mut(&name) {
                    queue.pending.push_back(Delivery {
                        delivery_tag,
                        exchange: exchange.to_owned(),
                        routing_key: routing_key.to_owned(),
                        redelivered: false,
                        properties: properties.clone(),
                        data: payload.to_vec(),
                    });
                    dispatch.extend(queue.dispatch());
                }
            }
            dispatch
        };

        broker.core.published.fetch_add(1, Ordering::SeqCst);
        run(dispatch);
        Ok(())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker()?.state();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => {
                Err(self.fail(AmqpError::DeclareExchangeError(name.to_owned())))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_owned(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        let mut state = self.broker()?.state();
        if options.passive && !state.queues.contains_key(name) {
            return Err(self.fail(AmqpError::DeclareQueueError(name.to_owned())));
        }
        let queue = state.queues.entry(name.to_owned()).or_default();
        if !options.passive {
            queue.arguments = arguments;
        }
        Ok(QueueInfo {
            name: name.to_owned(),
            message_count: queue.pending.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let mut state = self.broker()?.state();
        let Some(queue) = state.queues.remove(name) else {
            return Ok(0);
        };
        if !queue.consumers.is_empty() {
            state.deleted_with_consumers.push(name.to_owned());
        }
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != name);
        }
        Ok(queue.pending.len() as u32)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker()?.state();
        let missing = AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned());
        if !state.queues.contains_key(queue) {
            return Err(self.fail(missing));
        }
        let Some(ex) = state.exchanges.get_mut(exchange) else {
            return Err(self.fail(missing));
        };
        let binding = (queue.to_owned(), routing_key.to_owned());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker()?.state();
        let Some(ex) = state.exchanges.get_mut(exchange) else {
            return Err(self.fail(AmqpError::UnbindingExchangeFromQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            )));
        };
        ex.bindings
            .retain(|(q, key)| !(q == queue && key == routing_key));
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) || !self.release() {
            return Err(AmqpError::ChannelError);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::topic_matches;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("order.created", "order.deleted"));
    }
}
