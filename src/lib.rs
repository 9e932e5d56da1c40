// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Connection-managed messaging over AMQP.
//!
//! `MessageBus` hides connection management, reconnection, payload encryption
//! and property validation behind `connect`, `subscribe`, `publish` and a few
//! topology helpers. Delivery is at-least-once: every message handed to a
//! listener must be acknowledged explicitly.

mod consumer;
mod otel;
mod publisher;
mod registry;
mod topology;

#[cfg(test)]
mod testing;

pub mod broker;
pub mod bus;
pub mod channel;
pub mod codec;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod properties;
pub mod queue;

pub use bus::{ConnectionState, MessageBus, Subscription};
pub use config::{BusConfig, ReconnectPolicy, SubscriptionMode};
pub use consumer::{Acker, Listener, Message};
pub use errors::AmqpError;
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use properties::{MessageProperties, PublishOptions};
pub use publisher::DEFAULT_EXCHANGE;
pub use queue::{QueueBinding, QueueDefinition};
pub use topology::{
    AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
    AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MAX_LENGTH_BYTES, AMQP_HEADERS_MESSAGE_TTL,
};
