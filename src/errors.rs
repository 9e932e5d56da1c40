// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message Bus
//!
//! Every fallible operation of the bus reports an `AmqpError`. The variants fall
//! in four groups: validation errors raised before the broker is touched, state
//! errors caused by calling operations out of order, broker/transport errors
//! raised by the underlying connection, and codec errors raised while encoding
//! or decoding an envelope.

use thiserror::Error;

/// Represents errors that can occur while operating the message bus.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// A bus configuration was not a key/value mapping
    #[error("configuration must be a plain object, received {0}")]
    InvalidConfig(String),

    /// An argument or message property failed validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operation requires an open connection
    #[error("not connected")]
    NotConnected,

    /// Single subscription mode already has an active consumer
    #[error("subscription already active")]
    SubscriptionActive,

    /// No consumer is registered under the given tag
    #[error("unknown consumer `{0}`")]
    UnknownConsumer(String),

    /// A consumer tag was registered twice
    #[error("consumer `{0}` already registered")]
    DuplicateConsumer(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// The connection was closed without the bus requesting it
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Error closing the connection
    #[error("failure to close the connection")]
    CloseConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting a queue with the given name
    #[error("failure to delete the queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error removing a binding between an exchange and a queue
    #[error("failure to unbind exchange `{0}` from queue `{1}`")]
    UnbindingExchangeFromQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker refused a published message
    #[error("publish was not confirmed by the broker")]
    PublishNackedError,

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error encrypting a message payload
    #[error("failure to encrypt payload")]
    EncryptPayloadError,

    /// Error decrypting a message payload
    #[error("failure to decrypt payload")]
    DecryptPayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),
}
