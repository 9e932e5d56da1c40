// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability Interface
//!
//! The bus never talks to the wire directly. It drives a broker through the
//! three traits of this module: a `Transport` that opens connections, a
//! `BrokerConnection` that opens channels and reports unexpected closure, and
//! a `BrokerChannel` exposing the consume, publish and topology primitives.
//!
//! The production implementation lives in [`crate::channel`] and is backed by
//! lapin. Property and option types are lapin's own so that both sides speak
//! AMQP 0-9-1 vocabulary.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::sync::Arc;

/// Callback invoked for every message delivered to a consumer.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked once when the connection closes or fails.
pub type CloseObserver = Box<dyn Fn(AmqpError) + Send + Sync>;

/// A raw message handed over by the broker, before envelope decoding.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Counters returned by the broker when a queue is declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Opens connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker connection owning its channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a plain channel, used for consuming and topology.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Opens a channel in confirm mode; publishes on it resolve on broker ack.
    async fn open_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Registers the observer notified when the connection closes or errors.
    fn on_close(&self, observer: CloseObserver);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// The per-channel primitives the bus composes.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue` identified by `consumer_tag`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: DeliveryHandler,
    ) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Publishes a message. On a confirm channel this resolves once the broker
    /// has acknowledged it and fails if the broker rejected it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError>;

    /// Deletes a queue, returning the number of messages it held.
    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Closes the channel. Fails when the broker already closed it.
    async fn close(&self) -> Result<(), AmqpError>;
}
