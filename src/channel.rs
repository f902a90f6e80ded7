// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Provider
//!
//! This module multiplexes logical channels over pooled connections. Channels
//! are keyed by their topology identity, the tuple of confirm-mode flag,
//! exchange, routing key and alternate exchange, and reference-counted: the
//! first request for an identity opens a physical channel, later requests
//! share it, and the last release closes it. A [`LogicalChannel`] carries the
//! publish, request/response, consume, purge and delete operations for its
//! destination.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeleteOptions,
        QueuePurgeOptions,
    },
    protocol::basic::AMQPProperties,
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection, Consumer,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    codec::{self, JSON_CONTENT_TYPE},
    consumer::{
        dispatch_deliveries, ConfirmedMessageHandler, ConsumeContext, DeliveryHandler,
        MessageHandler, OnEnded,
    },
    errors::AmqpError,
    otel,
    pool::{ConnectionPool, PooledConnection, Priority},
    topology::{self, Destination},
};

/// Options deciding which physical channel a logical operation runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub(crate) confirmable: bool,
}

impl ChannelOptions {
    pub fn new() -> ChannelOptions {
        ChannelOptions::default()
    }

    /// Publishes on this channel await broker confirmation.
    pub fn confirmable(mut self) -> Self {
        self.confirmable = true;
        self
    }
}

/// Per-message publish options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageOptions {
    pub(crate) priority: Option<u8>,
    pub(crate) persistent: bool,
}

impl MessageOptions {
    pub fn new() -> MessageOptions {
        MessageOptions::default()
    }

    /// Message priority, honored by queues declared with a priority cap.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Marks the message persistent so it survives a broker restart.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// Options of a consume operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub(crate) prefetch: Option<u16>,
    pub(crate) max_priority: Option<u8>,
}

impl ConsumeOptions {
    pub fn new() -> ConsumeOptions {
        ConsumeOptions::default()
    }

    /// Caps the unacknowledged deliveries in flight on the channel.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    /// Declares the queue with the given number of priority levels.
    pub fn max_priority(mut self, limit: u8) -> Self {
        self.max_priority = Some(limit);
        self
    }
}

/// The tuple that decides which physical channel an operation reuses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ChannelIdentity {
    confirmable: bool,
    exchange: String,
    routing_key: String,
    alternate_exchange: Option<String>,
}

impl ChannelIdentity {
    pub(crate) fn new(destination: &Destination, options: &ChannelOptions) -> ChannelIdentity {
        ChannelIdentity {
            confirmable: options.confirmable,
            exchange: destination.exchange.clone(),
            routing_key: destination.routing_key.clone(),
            alternate_exchange: destination.alternate_exchange.clone(),
        }
    }
}

struct ChannelEntry {
    logical: Arc<LogicalChannel>,
    refs: usize,
}

/// Hands out reference-counted logical channels keyed by topology identity.
pub struct ChannelProvider {
    pool: ConnectionPool,
    connection: tokio::sync::Mutex<Option<PooledConnection>>,
    channels: Mutex<HashMap<ChannelIdentity, ChannelEntry>>,
}

impl ChannelProvider {
    pub fn new(pool: ConnectionPool) -> Arc<ChannelProvider> {
        Arc::new(ChannelProvider {
            pool,
            connection: tokio::sync::Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the shared logical channel of the destination's identity,
    /// opening a physical channel on the first request.
    ///
    /// Every `get_channel` must be paired with one
    /// [`ChannelProvider::close_channel`]; the physical channel closes when
    /// the last holder releases it.
    pub async fn get_channel(
        &self,
        destination: &Destination,
        options: &ChannelOptions,
    ) -> Result<Arc<LogicalChannel>, AmqpError> {
        let identity = ChannelIdentity::new(destination, options);

        if let Some(logical) = self.lookup_live(&identity) {
            return Ok(logical);
        }

        let (connection, channel) = self.open_channel().await?;

        if options.confirmable {
            if let Err(err) = channel.confirm_select(ConfirmSelectOptions::default()).await {
                error!(
                    error = err.to_string(),
                    "failure to enable publisher confirms"
                );
                return Err(AmqpError::ConfirmSelectError);
            }
        }

        let logical = Arc::new(LogicalChannel {
            connection,
            channel: Arc::new(channel),
            destination: destination.clone(),
            options: *options,
        });

        // Concurrent creators race; whoever is in the map already wins and
        // the fresh loser channel is closed.
        let winner = {
            let mut channels = self.channels.lock().unwrap();
            match channels.get_mut(&identity) {
                Some(entry) if entry.logical.is_open() => {
                    entry.refs += 1;
                    Some(entry.logical.clone())
                }
                _ => {
                    channels.insert(
                        identity,
                        ChannelEntry {
                            logical: logical.clone(),
                            refs: 1,
                        },
                    );
                    None
                }
            }
        };

        match winner {
            Some(existing) => {
                let _ = logical.close().await;
                Ok(existing)
            }
            None => Ok(logical),
        }
    }

    /// Releases one reference to the destination's channel, closing the
    /// physical channel when this was the last one.
    pub async fn close_channel(
        &self,
        destination: &Destination,
        options: &ChannelOptions,
    ) -> Result<(), AmqpError> {
        let identity = ChannelIdentity::new(destination, options);

        let last_holder = {
            let mut channels = self.channels.lock().unwrap();
            match channels.get_mut(&identity) {
                Some(entry) => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        channels.remove(&identity).map(|entry| entry.logical)
                    } else {
                        None
                    }
                }
                None => {
                    debug!(
                        "releasing an unknown channel for the exchange: {} with the key: {}",
                        identity.exchange, identity.routing_key
                    );
                    None
                }
            }
        };

        match last_holder {
            Some(logical) => logical.close().await,
            None => Ok(()),
        }
    }

    /// Closes every logical channel regardless of holders and releases the
    /// cached pooled connection.
    pub async fn close(&self) {
        let drained: Vec<Arc<LogicalChannel>> = {
            let mut channels = self.channels.lock().unwrap();
            channels.drain().map(|(_, entry)| entry.logical).collect()
        };

        for logical in drained {
            let _ = logical.close().await;
        }

        let cached = self.connection.lock().await.take();
        if let Some(pooled) = cached {
            self.pool.release(pooled).await;
        }
    }

    fn lookup_live(&self, identity: &ChannelIdentity) -> Option<Arc<LogicalChannel>> {
        let mut channels = self.channels.lock().unwrap();

        match channels.get_mut(identity) {
            Some(entry) if entry.logical.is_open() => {
                entry.refs += 1;
                Some(entry.logical.clone())
            }
            Some(_) => {
                debug!(
                    "dropping a dead channel for the exchange: {} with the key: {}",
                    identity.exchange, identity.routing_key
                );
                channels.remove(identity);
                None
            }
            None => None,
        }
    }

    // Opens a physical channel on the provider's cached pooled connection,
    // retiring the connection and dialing a new one when it died.
    async fn open_channel(&self) -> Result<(Arc<Connection>, Channel), AmqpError> {
        let mut slot = self.connection.lock().await;

        loop {
            let pooled = match slot.as_ref() {
                Some(pooled) if pooled.is_open() => pooled,
                _ => {
                    if let Some(dead) = slot.take() {
                        self.pool.destroy(dead).await;
                    }
                    *slot = Some(self.pool.acquire(Priority::Normal).await?);
                    continue;
                }
            };

            match pooled.create_channel().await {
                Ok(channel) => return Ok((pooled.share(), channel)),
                Err(err) => {
                    if pooled.is_open() {
                        return Err(err);
                    }
                }
            }

            // The connection died under the channel creation.
            if let Some(dead) = slot.take() {
                self.pool.destroy(dead).await;
            }
        }
    }
}

/// A shared channel bound to one destination.
pub struct LogicalChannel {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    destination: Destination,
    options: ChannelOptions,
}

impl LogicalChannel {
    pub fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Publishes a message to the channel's destination. On a confirmable
    /// channel the broker's acknowledgment is awaited.
    pub async fn send<T>(&self, message: &T, options: &MessageOptions) -> Result<(), AmqpError>
    where
        T: Serialize,
    {
        let body = codec::encode(message)?;
        self.send_raw(&body, options).await
    }

    pub(crate) async fn send_raw(
        &self,
        body: &[u8],
        options: &MessageOptions,
    ) -> Result<(), AmqpError> {
        let props = build_properties(options, None, None);
        self.publish(body, props).await
    }

    /// Publishes a request and sets up the correlated reply route: a fresh
    /// ephemeral reply queue, a prefetch-one consumer on its own channel, and
    /// a correlation id carried by the request.
    ///
    /// # Returns
    ///
    /// A [`PendingResponse`] that resolves with the first reply carrying the
    /// matching correlation id.
    pub async fn send_expecting_response<T>(
        &self,
        message: &T,
        options: &MessageOptions,
    ) -> Result<PendingResponse, AmqpError>
    where
        T: Serialize,
    {
        let body = codec::encode(message)?;
        self.send_expecting_response_raw(&body, options).await
    }

    pub(crate) async fn send_expecting_response_raw(
        &self,
        body: &[u8],
        options: &MessageOptions,
    ) -> Result<PendingResponse, AmqpError> {
        let reply_queue =
            topology::response_queue_name(&self.destination.exchange, &self.destination.routing_key);
        let correlation_id = Uuid::new_v4().to_string();

        let reply_channel = match self.connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(AmqpError::ChannelError);
            }
        };

        topology::install_response_queue(&reply_channel, &reply_queue).await?;

        if let Err(err) = reply_channel.basic_qos(1, BasicQosOptions::default()).await {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(reply_queue));
        }

        let consumer = match reply_channel
            .basic_consume(
                &reply_queue,
                &reply_queue,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = reply_queue,
                    "failure to declare a consumer"
                );
                return Err(AmqpError::ConsumerDeclarationError(reply_queue));
            }
        };

        let props = build_properties(options, Some(&correlation_id), Some(&reply_queue));

        if let Err(err) = self.publish(body, props).await {
            let _ = reply_channel.close(200, "").await;
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();
        tokio::spawn(await_response(
            reply_channel,
            consumer,
            reply_queue,
            correlation_id,
            tx,
        ));

        Ok(PendingResponse { receiver: rx })
    }

    /// Starts a consumer whose handler owns acknowledgment of each delivery.
    ///
    /// Declares the destination's full topology first: the topic exchange
    /// with its alternate when one is named, the rejectable queue, and the
    /// binding.
    ///
    /// # Returns
    ///
    /// The consumer tag, used with [`LogicalChannel::cancel_consumer`].
    pub async fn consume(
        &self,
        queue_name: &str,
        handler: Arc<dyn ConfirmedMessageHandler>,
        respond: bool,
        options: &ConsumeOptions,
    ) -> Result<String, AmqpError> {
        self.consume_with(
            queue_name,
            DeliveryHandler::Confirmed(handler),
            respond,
            options,
            None,
        )
        .await
    }

    /// Starts a consumer with managed acknowledgment: ack after the handler
    /// returns `Ok`, nack with requeue after `Err`. Replies to senders that
    /// asked for a response.
    pub async fn consume_simple(
        &self,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
        options: &ConsumeOptions,
    ) -> Result<String, AmqpError> {
        self.consume_with(queue_name, DeliveryHandler::Simple(handler), true, options, None)
            .await
    }

    pub(crate) async fn consume_with(
        &self,
        queue_name: &str,
        handler: DeliveryHandler,
        respond: bool,
        options: &ConsumeOptions,
        on_ended: Option<OnEnded>,
    ) -> Result<String, AmqpError> {
        topology::ensure_default_exchange_route(queue_name, &self.destination)?;
        topology::install_destination(
            &self.channel,
            queue_name,
            &self.destination,
            options.max_priority,
        )
        .await?;

        if let Some(count) = options.prefetch {
            if let Err(err) = self.channel.basic_qos(count, BasicQosOptions::default()).await {
                error!(error = err.to_string(), "failure to configure qos");
                return Err(AmqpError::QoSDeclarationError(queue_name.to_owned()));
            }
        }

        let tag = consumer_tag(queue_name);

        let consumer = match self
            .channel
            .basic_consume(
                queue_name,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue_name,
                    "failure to declare a consumer"
                );
                return Err(AmqpError::ConsumerDeclarationError(queue_name.to_owned()));
            }
        };

        debug!("consumer: {} was started", tag);

        let ctx = ConsumeContext {
            channel: self.channel.clone(),
            queue_name: queue_name.to_owned(),
            span_name: span_name(&self.destination),
            handler,
            respond,
        };

        tokio::spawn(dispatch_deliveries(ctx, consumer, on_ended));

        Ok(tag)
    }

    pub async fn cancel_consumer(&self, tag: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to cancel consumer: {}", tag);
                Err(AmqpError::CancelConsumerError(tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    /// Drops every message sitting in the queue.
    ///
    /// # Returns
    /// The number of messages dropped.
    pub async fn purge(&self, queue_name: &str) -> Result<u32, AmqpError> {
        match self
            .channel
            .queue_purge(queue_name, QueuePurgeOptions::default())
            .await
        {
            Ok(count) => {
                debug!("queue: {} was purged, {} messages dropped", queue_name, count);
                Ok(count)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "failure to purge queue: {}", queue_name
                );
                Err(AmqpError::PurgeQueueError(queue_name.to_owned()))
            }
        }
    }

    /// Deletes the queue.
    ///
    /// # Returns
    /// The number of messages deleted with it.
    pub async fn delete(&self, queue_name: &str) -> Result<u32, AmqpError> {
        match self
            .channel
            .queue_delete(queue_name, QueueDeleteOptions::default())
            .await
        {
            Ok(count) => {
                debug!("queue: {} was deleted", queue_name);
                Ok(count)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "failure to delete queue: {}", queue_name
                );
                Err(AmqpError::DeleteQueueError(queue_name.to_owned()))
            }
        }
    }

    pub(crate) async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        match self.channel.close(200, "").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close the channel");
                Err(AmqpError::CloseChannelError)
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, body: &[u8], props: BasicProperties) -> Result<(), AmqpError> {
        debug!(
            "publishing to the exchange: {} with the key: {}",
            self.destination.exchange, self.destination.routing_key
        );

        let confirm = match self
            .channel
            .basic_publish(
                &self.destination.exchange,
                &self.destination.routing_key,
                BasicPublishOptions::default(),
                body,
                props,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "failure to publish");
                return Err(AmqpError::PublishingError);
            }
        };

        if !self.options.confirmable {
            return Ok(());
        }

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                error!("publish was not confirmed by the broker");
                Err(AmqpError::PublishNotConfirmedError)
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "failure to publish");
                Err(AmqpError::PublishingError)
            }
        }
    }
}

/// A response that has been requested but not yet received.
pub struct PendingResponse {
    receiver: oneshot::Receiver<Result<Value, AmqpError>>,
}

impl PendingResponse {
    /// Waits for the correlated reply.
    pub async fn wait(self) -> Result<Value, AmqpError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::ResponseChannelClosedError),
        }
    }
}

// Consumes the reply queue until the response with the matching correlation
// id arrives, then tears the reply route down.
async fn await_response(
    reply_channel: Channel,
    mut consumer: Consumer,
    reply_queue: String,
    correlation_id: String,
    tx: oneshot::Sender<Result<Value, AmqpError>>,
) {
    let mut outcome: Option<Result<Value, AmqpError>> = None;

    while let Some(result) = consumer.next().await {
        match result {
            Ok(delivery) => {
                if !correlation_matches(&delivery.properties, &correlation_id) {
                    debug!("skipping a response with a foreign correlation id");
                    if let Err(err) = delivery
                        .nack(BasicNackOptions {
                            multiple: false,
                            requeue: true,
                        })
                        .await
                    {
                        error!(error = err.to_string(), "error whiling nack msg");
                    }
                    continue;
                }

                let decoded = codec::decode::<Value>(&delivery.data);
                if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
                    error!(error = err.to_string(), "error whiling ack msg");
                }

                outcome = Some(decoded);
                break;
            }
            Err(err) => {
                error!(error = err.to_string(), "error receiving delivery msg");
                outcome = Some(Err(AmqpError::ConsumerError(reply_queue.clone())));
                break;
            }
        }
    }

    let _ = reply_channel
        .basic_cancel(&reply_queue, BasicCancelOptions::default())
        .await;
    let _ = reply_channel.close(200, "").await;

    if let Some(result) = outcome {
        let _ = tx.send(result);
    }
}

fn correlation_matches(properties: &AMQPProperties, correlation_id: &str) -> bool {
    properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str() == correlation_id)
        .unwrap_or(false)
}

fn consumer_tag(queue_name: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", queue_name, &id[..8])
}

fn span_name(destination: &Destination) -> String {
    if destination.uses_default_exchange() {
        destination.routing_key.clone()
    } else {
        format!("{}::{}", destination.exchange, destination.routing_key)
    }
}

pub(crate) fn build_properties(
    options: &MessageOptions,
    correlation_id: Option<&str>,
    reply_to: Option<&str>,
) -> BasicProperties {
    let mut headers = BTreeMap::new();
    otel::inject_context(&mut headers);

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers));

    if options.persistent {
        props = props.with_delivery_mode(2);
    }

    if let Some(priority) = options.priority {
        props = props.with_priority(priority);
    }

    if let Some(correlation_id) = correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id));
    }

    if let Some(reply_to) = reply_to {
        props = props.with_reply_to(ShortString::from(reply_to));
    }

    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_ignores_the_namespace() {
        let options = ChannelOptions::new();
        let first = Destination::topic("orders", "order.created", "commands");
        let second = Destination::topic("audit", "order.created", "commands");

        assert_eq!(
            ChannelIdentity::new(&first, &options),
            ChannelIdentity::new(&second, &options),
        );
    }

    #[test]
    fn identity_splits_on_confirm_mode_and_topology() {
        let destination = Destination::topic("orders", "order.created", "commands");

        let plain = ChannelIdentity::new(&destination, &ChannelOptions::new());
        let confirmable = ChannelIdentity::new(&destination, &ChannelOptions::new().confirmable());
        let alternate = ChannelIdentity::new(
            &destination.clone().with_alternate_exchange("unrouted"),
            &ChannelOptions::new(),
        );

        let mut identities = HashSet::new();
        identities.insert(plain);
        identities.insert(confirmable);
        identities.insert(alternate);

        assert_eq!(identities.len(), 3);
    }

    #[test]
    fn properties_default_to_transient_json() {
        let props = build_properties(&MessageOptions::new(), None, None);

        assert_eq!(
            *props.content_type(),
            Some(ShortString::from(JSON_CONTENT_TYPE)),
        );
        assert!(props.message_id().is_some());
        assert_eq!(*props.delivery_mode(), None);
        assert_eq!(*props.priority(), None);
        assert_eq!(*props.reply_to(), None);
    }

    #[test]
    fn properties_carry_persistence_priority_and_reply_route() {
        let options = MessageOptions::new().persistent().priority(3);
        let props = build_properties(&options, Some("req-42"), Some("__response.replies"));

        assert_eq!(*props.delivery_mode(), Some(2));
        assert_eq!(*props.priority(), Some(3));
        assert_eq!(*props.correlation_id(), Some(ShortString::from("req-42")));
        assert_eq!(
            *props.reply_to(),
            Some(ShortString::from("__response.replies")),
        );
    }

    #[test]
    fn correlation_requires_an_exact_match() {
        let props = AMQPProperties::default().with_correlation_id(ShortString::from("req-42"));

        assert!(correlation_matches(&props, "req-42"));
        assert!(!correlation_matches(&props, "req-43"));
        assert!(!correlation_matches(&AMQPProperties::default(), "req-42"));
    }

    #[test]
    fn consumer_tags_stay_unique_per_queue() {
        let first = consumer_tag("orders");
        let second = consumer_tag("orders");

        assert!(first.starts_with("orders-"));
        assert_ne!(first, second);
    }

    #[test]
    fn span_names_follow_the_destination() {
        assert_eq!(span_name(&Destination::queue("orders")), "orders");
        assert_eq!(
            span_name(&Destination::topic("orders", "order.created", "commands")),
            "commands::order.created",
        );
    }
}
