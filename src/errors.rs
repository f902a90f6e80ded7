// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Bus
//!
//! This module provides a comprehensive set of error types for AMQP operations.
//! The `AmqpError` enum represents all possible error scenarios that can occur during
//! pooling, channel, topology, publishing, consuming and request/response handling.

use thiserror::Error;

/// Represents errors that can occur during AMQP operations.
///
/// This enum covers all error scenarios for broker interactions, including connection
/// pooling, channel creation, exchange and queue declarations, message publishing,
/// and consumer-related errors. Each variant provides specific context about
/// what operation failed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the AMQP server
    #[error("failure to connect")]
    ConnectionError,

    /// No pooled connection became available within the acquire timeout
    #[error("failure to acquire a connection, timeout was reached")]
    AcquireTimeoutError,

    /// The pool was closed while an acquire was pending
    #[error("failure to acquire a connection, pool is closed")]
    PoolClosedError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error putting a channel into publisher-confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker negatively acknowledged a publish on a confirm channel
    #[error("publish was not confirmed by the broker")]
    PublishNotConfirmedError,

    /// Error serializing a payload before publishing
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on the given queue
    #[error("failure to declare a consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error canceling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error consuming a message from the given queue
    #[error("failure to consume a message from the queue `{0}`")]
    ConsumerError(String),

    /// Error fetching a single message from the given queue
    #[error("failure to get a message from queue `{0}`")]
    GetMessageError(String),

    /// Error purging the given queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error deleting the given queue
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error closing a channel
    #[error("failure to close the channel")]
    CloseChannelError,

    /// The response channel ended before a correlated reply arrived
    #[error("response channel closed before a reply was received")]
    ResponseChannelClosedError,

    /// A default-exchange operation was asked to route to a different queue
    #[error("default exchange requires the routing key `{0}` to match the queue `{1}`")]
    DefaultExchangeMismatchError(String, String),
}
