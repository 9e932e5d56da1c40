// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! Turns raw broker deliveries into decoded `Message`s and hands them to the
//! subscribed `Listener`. Every message owns its settlement: the listener must
//! eventually `ack`, `nack` or `done` it, otherwise the queue stays blocked at
//! the channel's prefetch limit.
//!
//! Deliveries whose payload cannot be decoded never reach the listener; they
//! are rejected without requeue so they cannot loop forever.
//!
//! On a queue with a retry companion, `reject` sends the message through the
//! retry queue until the `x-death` count for this queue reaches the retry
//! cap. Past that, `reject` publishes the message to the DLQ and acks it.

use crate::{
    broker::{BrokerChannel, Delivery, DeliveryHandler},
    codec::EnvelopeCodec,
    errors::AmqpError,
    otel,
    properties::MessageProperties,
    publisher::DEFAULT_EXCHANGE,
    queue::RetryLimit,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::BasicProperties;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{borrow::Cow, collections::BTreeMap, future::Future, sync::Arc};
use tracing::{debug, error, warn};

/// Header in which the broker records every dead-lettering of a message
const X_DEATH: &str = "x-death";

/// Receives the messages of a subscription.
///
/// Any `Fn(Message) -> impl Future<Output = ()>` closure is a listener.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Handles one message. The implementation owns its settlement.
    ///
    /// # Parameters
    /// * `message` - The decoded message, to be acked, nacked or rejected
    async fn on_message(&self, message: Message);
}

#[async_trait]
impl<F, Fut> Listener for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_message(&self, message: Message) {
        self(message).await
    }
}

/// Settles a single delivery. Consumed by settling, so a delivery can never be
/// acknowledged twice.
pub struct Acker {
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
    settled: bool,
    spent: Option<Spent>,
}

/// A delivery on its last attempt, kept so a rejection can move it to the DLQ.
struct Spent {
    dlq: Option<String>,
    data: Vec<u8>,
    properties: BasicProperties,
}

impl Acker {
    pub(crate) fn new(channel: Arc<dyn BrokerChannel>, delivery_tag: u64) -> Acker {
        Acker {
            channel,
            delivery_tag,
            settled: false,
            spent: None,
        }
    }

    /// The broker delivery tag being settled.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledges the delivery, removing it from the queue.
    pub async fn ack(mut self) -> Result<(), AmqpError> {
        self.settled = true;
        self.channel.ack(self.delivery_tag).await
    }

    /// Rejects the delivery; the broker requeues it.
    pub async fn nack(mut self) -> Result<(), AmqpError> {
        self.settled = true;
        self.channel.nack(self.delivery_tag, true).await
    }

    /// Rejects the delivery without requeue; it is dropped or dead-lettered.
    ///
    /// A delivery whose retries are spent goes to the DLQ instead, or is
    /// dropped when the queue has none.
    pub async fn reject(mut self) -> Result<(), AmqpError> {
        self.settled = true;
        match self.spent.take() {
            None => self.channel.nack(self.delivery_tag, false).await,
            Some(spent) => self.retire(spent).await,
        }
    }

    async fn retire(&self, spent: Spent) -> Result<(), AmqpError> {
        match &spent.dlq {
            Some(dlq) => {
                warn!(delivery_tag = self.delivery_tag, dlq = %dlq, "too many attempts, sending to dlq");
                self.channel
                    .publish(DEFAULT_EXCHANGE, dlq, &spent.data, spent.properties)
                    .await?;
            }
            None => {
                error!(delivery_tag = self.delivery_tag, "too many attempts and no dlq, dropping message");
            }
        }
        self.channel.ack(self.delivery_tag).await
    }
}

/// How many times the message was dead-lettered out of `queue`.
fn rejections(headers: &BTreeMap<String, Value>, queue: &str) -> u64 {
    let Some(deaths) = headers.get(X_DEATH).and_then(Value::as_array) else {
        return 0;
    };

    deaths
        .iter()
        .filter(|death| death.get("queue").and_then(Value::as_str) == Some(queue))
        .filter_map(|death| death.get("count").and_then(Value::as_u64))
        .sum()
}

impl Drop for Acker {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                delivery_tag = self.delivery_tag,
                "message dropped without ack or nack, its queue stays blocked"
            );
        }
    }
}

/// A decoded message delivered to a listener.
pub struct Message {
    pub payload: Value,
    pub properties: MessageProperties,
    pub queue: String,
    context: Context,
    acker: Acker,
}

impl Message {
    /// Deserializes the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_value(self.payload.clone()).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }

    /// Trace context extracted from the message headers.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// See `Acker::ack`.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// See `Acker::nack`.
    pub async fn nack(self) -> Result<(), AmqpError> {
        self.acker.nack().await
    }

    /// See `Acker::reject`.
    pub async fn reject(self) -> Result<(), AmqpError> {
        self.acker.reject().await
    }

    /// Acks on `Ok`, nacks on `Err`.
    pub fn done<E>(self, result: Result<(), E>) -> impl Future<Output = Result<(), AmqpError>> + Send {
        let succeeded = result.is_ok();
        async move {
            if succeeded {
                self.ack().await
            } else {
                self.nack().await
            }
        }
    }

    /// Splits the message so the payload can be moved while the settlement is
    /// kept for later.
    pub fn into_parts(self) -> (Value, MessageProperties, Acker) {
        (self.payload, self.properties, self.acker)
    }
}

/// Builds the broker-side handler for a subscription.
///
/// # Parameters
/// * `queue` - The consumed queue
/// * `codec` - Decodes the payloads
/// * `channel` - The channel deliveries are settled on
/// * `retry` - Retry cap of the queue, when it has a retry companion
/// * `listener` - Receives the decoded messages
pub(crate) fn delivery_handler(
    queue: &str,
    codec: EnvelopeCodec,
    channel: Arc<dyn BrokerChannel>,
    retry: Option<RetryLimit>,
    listener: Arc<dyn Listener>,
) -> DeliveryHandler {
    let queue = queue.to_owned();
    Arc::new(move |delivery: Delivery| {
        let queue = queue.clone();
        let codec = codec.clone();
        let channel = channel.clone();
        let retry = retry.clone();
        let listener = listener.clone();
        async move {
            let tracer = global::tracer(otel::CONSUMER_TRACER);
            let result = consume(&tracer, delivery, &queue, &codec, channel, retry, listener).await;
            if let Err(err) = result {
                error!(error = err.to_string(), queue = %queue, "error consume msg");
            }
        }
        .boxed()
    })
}

async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    queue: &str,
    codec: &EnvelopeCodec,
    channel: Arc<dyn BrokerChannel>,
    retry: Option<RetryLimit>,
    listener: Arc<dyn Listener>,
) -> Result<(), AmqpError> {
    let properties = MessageProperties::from_amqp(
        &delivery.properties,
        &delivery.exchange,
        &delivery.routing_key,
        delivery.redelivered,
    );
    let name = properties.kind.clone().unwrap_or_default();
    let (context, mut span) = otel::consumer_span(&delivery.properties, tracer, &name);

    debug!(
        queue,
        kind = %name,
        exchange = %delivery.exchange,
        "message received"
    );

    let mut acker = Acker::new(channel, delivery.delivery_tag);
    if let Some(limit) = retry {
        let rejected = rejections(&properties.headers, queue);
        if rejected >= u64::from(limit.retries) {
            debug!(queue, rejected, "message is on its last attempt");
            acker.spent = Some(Spent {
                dlq: limit.dlq,
                data: delivery.data.clone(),
                properties: delivery.properties.clone(),
            });
        }
    }

    let payload = match codec.decrypt::<Value>(&delivery.data) {
        Ok(payload) => payload,
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("undecodable payload"),
            });
            error!(error = err.to_string(), queue, "removing undecodable message from queue");
            if let Err(e) = acker.reject().await {
                span.record_error(&e);
                return Err(e);
            }
            return Err(err);
        }
    };

    listener
        .on_message(Message {
            payload,
            properties,
            queue: queue.to_owned(),
            context,
            acker,
        })
        .await;

    span.set_status(Status::Ok);
    Ok(())
}
