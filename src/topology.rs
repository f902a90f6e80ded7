// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Topology
//!
//! This module describes where messages go and declares that shape on the
//! broker. A [`Destination`] names a queue, a routing key and an optional
//! topic exchange with an alternate exchange for unroutable messages. Queues
//! are always declared "rejectable": nacked messages dead-letter through the
//! default exchange onto a queue named `__rejected.<queue>` for later
//! inspection or replay.

use std::collections::BTreeMap;

use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel, ExchangeKind,
};
use tracing::{debug, error};
use uuid::Uuid;

use crate::errors::AmqpError;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to cap the priority levels of a queue
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";
/// Constant for the exchange argument naming its alternate exchange
pub const AMQP_HEADERS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Name of the AMQP default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Prefix of the queue that receives dead-lettered messages.
pub const REJECTED_QUEUE_PREFIX: &str = "__rejected.";
/// Prefix of the ephemeral reply queues used for request/response publishes.
pub const RESPONSE_QUEUE_PREFIX: &str = "__response.";

/// Where messages are published to or consumed from.
///
/// The namespace is the queue name. Publishing through the default exchange
/// routes by queue name; publishing through a named exchange routes by the
/// routing key, with an optional alternate exchange collecting messages the
/// primary exchange cannot route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub(crate) namespace: String,
    pub(crate) routing_key: String,
    pub(crate) exchange: String,
    pub(crate) alternate_exchange: Option<String>,
}

impl Destination {
    /// Creates a destination that routes through the default exchange
    /// straight to the named queue.
    pub fn queue(name: &str) -> Destination {
        Destination {
            namespace: name.to_owned(),
            routing_key: name.to_owned(),
            exchange: DEFAULT_EXCHANGE.to_owned(),
            alternate_exchange: None,
        }
    }

    /// Creates a destination that routes through a topic exchange.
    ///
    /// # Parameters
    /// * `namespace` - The queue bound to the exchange
    /// * `routing_key` - The key messages are published and bound with
    /// * `exchange` - The topic exchange name
    pub fn topic(namespace: &str, routing_key: &str, exchange: &str) -> Destination {
        Destination {
            namespace: namespace.to_owned(),
            routing_key: routing_key.to_owned(),
            exchange: exchange.to_owned(),
            alternate_exchange: None,
        }
    }

    /// Wires an alternate exchange that collects unroutable messages.
    pub fn with_alternate_exchange(mut self, name: &str) -> Self {
        self.alternate_exchange = Some(name.to_owned());
        self
    }

    /// Whether this destination publishes through the default exchange.
    pub fn uses_default_exchange(&self) -> bool {
        self.exchange.is_empty()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn alternate_exchange(&self) -> Option<&str> {
        self.alternate_exchange.as_deref()
    }
}

/// Name of the queue that receives messages dead-lettered from `queue_name`.
pub fn rejected_queue_name(queue_name: &str) -> String {
    format!("{}{}", REJECTED_QUEUE_PREFIX, queue_name)
}

/// Name for a fresh ephemeral reply queue of a request/response publish.
pub(crate) fn response_queue_name(exchange: &str, routing_key: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!(
        "{}{}_{}_{}",
        RESPONSE_QUEUE_PREFIX,
        exchange,
        routing_key,
        &id[..8]
    )
}

/// The default exchange routes by queue name, so a destination that uses it
/// must carry the queue name as its routing key.
pub(crate) fn ensure_default_exchange_route(
    queue_name: &str,
    destination: &Destination,
) -> Result<(), AmqpError> {
    if destination.uses_default_exchange() && destination.routing_key != queue_name {
        error!(
            routing_key = destination.routing_key,
            queue = queue_name,
            "the default exchange cannot route to a foreign queue"
        );
        return Err(AmqpError::DefaultExchangeMismatchError(
            destination.routing_key.clone(),
            queue_name.to_owned(),
        ));
    }

    Ok(())
}

/// Declaration arguments of a rejectable queue: dead-letter through the
/// default exchange onto `__rejected.<queue>`, optionally priority-capped.
pub(crate) fn rejectable_queue_args(
    queue_name: &str,
    max_priority: Option<u8>,
) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(DEFAULT_EXCHANGE)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(rejected_queue_name(queue_name))),
    );

    if let Some(limit) = max_priority {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
            AMQPValue::LongInt(LongInt::from(limit)),
        );
    }

    args
}

/// Declares the full topology of a destination on the given channel: the
/// exchange pair when one is named, the rejectable queue, and the binding.
pub(crate) async fn install_destination(
    channel: &Channel,
    queue_name: &str,
    destination: &Destination,
    max_priority: Option<u8>,
) -> Result<(), AmqpError> {
    if !destination.uses_default_exchange() {
        install_exchange(channel, destination).await?;
    }

    install_rejectable_queue(channel, queue_name, max_priority).await?;

    if !destination.uses_default_exchange() {
        bind_queue(
            channel,
            queue_name,
            &destination.exchange,
            &destination.routing_key,
        )
        .await?;
    }

    Ok(())
}

/// Declares the destination's topic exchange, wiring its alternate exchange
/// first when one is named.
pub(crate) async fn install_exchange(
    channel: &Channel,
    destination: &Destination,
) -> Result<(), AmqpError> {
    let mut args = BTreeMap::new();

    if let Some(alternate) = &destination.alternate_exchange {
        declare_topic_exchange(channel, alternate, BTreeMap::new()).await?;

        args.insert(
            ShortString::from(AMQP_HEADERS_ALTERNATE_EXCHANGE),
            AMQPValue::LongString(LongString::from(alternate.as_str())),
        );
    }

    declare_topic_exchange(channel, &destination.exchange, args).await
}

async fn declare_topic_exchange(
    channel: &Channel,
    name: &str,
    args: BTreeMap<ShortString, AMQPValue>,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", name);

    match channel
        .exchange_declare(
            name,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::from(args),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = name,
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(name.to_owned()))
        }
        _ => {
            debug!("exchange: {} was created", name);
            Ok(())
        }
    }
}

/// Declares a durable queue that dead-letters to `__rejected.<queue>`.
pub(crate) async fn install_rejectable_queue(
    channel: &Channel,
    queue_name: &str,
    max_priority: Option<u8>,
) -> Result<(), AmqpError> {
    debug!("creating queue: {}", queue_name);

    match channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            FieldTable::from(rejectable_queue_args(queue_name, max_priority)),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = queue_name,
                "error to declare the queue"
            );
            Err(AmqpError::DeclareQueueError(queue_name.to_owned()))
        }
        _ => {
            debug!("queue: {} was created", queue_name);
            Ok(())
        }
    }
}

/// Declares the non-durable auto-delete queue of one request/response
/// round trip.
pub(crate) async fn install_response_queue(
    channel: &Channel,
    queue_name: &str,
) -> Result<(), AmqpError> {
    debug!("creating response queue: {}", queue_name);

    match channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                passive: false,
                durable: false,
                exclusive: false,
                auto_delete: true,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = queue_name,
                "error to declare the response queue"
            );
            Err(AmqpError::DeclareQueueError(queue_name.to_owned()))
        }
        _ => Ok(()),
    }
}

pub(crate) async fn bind_queue(
    channel: &Channel,
    queue_name: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        queue_name, exchange, routing_key
    );

    match channel
        .queue_bind(
            queue_name,
            exchange,
            routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");

            Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue_name.to_owned(),
            ))
        }
        _ => {
            debug!("queue: {} was bounded", queue_name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_destination_routes_by_queue_name() {
        let destination = Destination::queue("orders");

        assert!(destination.uses_default_exchange());
        assert_eq!(destination.namespace(), "orders");
        assert_eq!(destination.routing_key(), "orders");
        assert_eq!(destination.exchange(), DEFAULT_EXCHANGE);
        assert_eq!(destination.alternate_exchange(), None);
    }

    #[test]
    fn topic_destination_carries_the_alternate_exchange() {
        let destination =
            Destination::topic("orders", "order.created", "commands").with_alternate_exchange("unrouted");

        assert!(!destination.uses_default_exchange());
        assert_eq!(destination.routing_key(), "order.created");
        assert_eq!(destination.exchange(), "commands");
        assert_eq!(destination.alternate_exchange(), Some("unrouted"));
    }

    #[test]
    fn rejected_queue_name_prefixes_the_queue() {
        assert_eq!(rejected_queue_name("orders"), "__rejected.orders");
    }

    #[test]
    fn response_queue_names_are_unique_with_a_short_suffix() {
        let first = response_queue_name("commands", "order.created");
        let second = response_queue_name("commands", "order.created");

        assert!(first.starts_with("__response.commands_order.created_"));
        assert_ne!(first, second);

        let suffix = first.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rejectable_args_dead_letter_through_the_default_exchange() {
        let args = rejectable_queue_args("orders", None);

        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from(""))),
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("__rejected.orders"))),
        );
        assert!(!args.contains_key(&ShortString::from(AMQP_HEADERS_MAX_PRIORITY)));
    }

    #[test]
    fn rejectable_args_cap_priorities_when_asked() {
        let args = rejectable_queue_args("orders", Some(5));

        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MAX_PRIORITY)),
            Some(&AMQPValue::LongInt(5)),
        );
    }

    #[test]
    fn default_exchange_requires_matching_routing_key() {
        let matching = Destination::queue("orders");
        assert!(ensure_default_exchange_route("orders", &matching).is_ok());

        let mismatched = Destination::topic("orders", "other", DEFAULT_EXCHANGE);
        assert_eq!(
            ensure_default_exchange_route("orders", &mismatched),
            Err(AmqpError::DefaultExchangeMismatchError(
                "other".to_owned(),
                "orders".to_owned(),
            )),
        );
    }

    #[test]
    fn named_exchanges_route_by_any_key() {
        let destination = Destination::topic("orders", "order.created", "commands");

        assert!(ensure_default_exchange_route("orders", &destination).is_ok());
    }
}
