// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! Tracks which consumer tags are active on the current connection and the
//! queue each one consumes. Entries are added once the broker has accepted a
//! consume request and removed once it has been cancelled.

use crate::errors::AmqpError;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// Consumer tag to queue map of the current connection.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    entries: Mutex<HashMap<String, String>>,
}

impl ConsumerRegistry {
    /// An empty registry.
    pub fn new() -> ConsumerRegistry {
        ConsumerRegistry::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a consumer; a tag can only be registered once.
    pub fn insert(&self, consumer_tag: &str, queue: &str) -> Result<(), AmqpError> {
        let mut entries = self.entries();
        if entries.contains_key(consumer_tag) {
            return Err(AmqpError::DuplicateConsumer(consumer_tag.to_owned()));
        }
        entries.insert(consumer_tag.to_owned(), queue.to_owned());
        Ok(())
    }

    /// Removes a tag, returning the queue it consumed.
    pub fn remove(&self, consumer_tag: &str) -> Option<String> {
        self.entries().remove(consumer_tag)
    }

    #[cfg(test)]
    pub fn queue_of(&self, consumer_tag: &str) -> Option<String> {
        self.entries().get(consumer_tag).cloned()
    }

    pub fn contains(&self, consumer_tag: &str) -> bool {
        self.entries().contains_key(consumer_tag)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// All active tags.
    pub fn tags(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    /// Tags consuming `queue`.
    pub fn tags_for_queue(&self, queue: &str) -> Vec<String> {
        self.entries()
            .iter()
            .filter(|(_, q)| q.as_str() == queue)
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Snapshot of `(tag, queue)` pairs.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.entries()
            .iter()
            .map(|(tag, queue)| (tag.clone(), queue.clone()))
            .collect()
    }

    /// Forgets every registration, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        count
    }
}
