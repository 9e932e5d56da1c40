// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders for the queues asserted through `MessageBus::assert_queue` and the
//! bindings created with `MessageBus::bind_queue`. A queue may carry two
//! companions: a dead-letter queue (`<name>-dlq`) and a retry queue
//! (`<name>-retry`) that holds rejected messages for a TTL before
//! dead-lettering them back to the main queue.
//!
//! Retries are capped. The broker's `x-death` header counts how often a
//! message was rejected from the main queue; once that count reaches the
//! configured retries, rejecting the message again moves it to the DLQ (or
//! drops it when there is none) instead of sending it around once more.

use lapin::options::QueueDeclareOptions;

/// Queue declared through `MessageBus::assert_queue`, with its optional
/// retry and dead-letter companions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<u32>,
}

/// What happens to a message of a retrying queue once its retries are spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RetryLimit {
    pub(crate) retries: u32,
    pub(crate) dlq: Option<String>,
}

impl QueueDefinition {
    /// A non-durable, non-exclusive queue named `name`.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Survives broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deleted once its last consumer is cancelled.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Private to this connection and deleted with it.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message time-to-live.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue holds. The oldest
    /// messages are discarded, or dead-lettered, past that limit.
    ///
    /// # Parameters
    /// * `max` - Maximum number of messages
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum total size of the queue.
    ///
    /// # Parameters
    /// * `max_bytes` - Maximum size in bytes
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a `<name>-dlq` companion.
    ///
    /// Without a retry queue, rejected and expired messages dead-letter
    /// straight to it. With one, it receives the messages whose retries are
    /// spent.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a `<name>-retry` companion. Rejected messages wait there before
    /// returning to this queue, at most `retries` times.
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds a message waits before its retry
    /// * `retries` - Maximum number of retries per message
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_retry(mut self, ttl: i32, retries: u32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retry_ttl = Some(ttl);
        self.retries = Some(retries);
        self
    }

    /// The retry cap consumers of this queue enforce, if it retries at all.
    pub(crate) fn retry_limit(&self) -> Option<RetryLimit> {
        self.retry_name.as_ref()?;
        Some(RetryLimit {
            retries: self.retries.unwrap_or_default(),
            dlq: self.dlq_name.clone(),
        })
    }

    pub(crate) fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }
}

/// Binds a queue to an exchange under a routing key or pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// A binding for `queue`; set the exchange before using it.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    /// # Parameters
    /// * `exchange` - Name of the exchange the queue is bound to
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Routing key, or pattern for topic exchanges. Empty by default.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
