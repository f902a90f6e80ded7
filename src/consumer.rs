// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module turns broker deliveries into handler calls. Payloads are
//! decoded from the JSON wire format before the handler runs; handlers either
//! get acknowledgment managed for them ([`MessageHandler`]) or own it
//! explicitly ([`ConfirmedMessageHandler`]). When the sender asked for a
//! response (`reply_to`), the handler's return value is published back with
//! the original correlation id before the delivery is acknowledged.

use std::{borrow::Cow, future::Future, sync::Arc};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    protocol::basic::AMQPProperties,
    types::ShortString,
    BasicProperties, Channel, Consumer,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    codec::{self, JSON_CONTENT_TYPE},
    errors::AmqpError,
    otel,
    topology::DEFAULT_EXCHANGE,
};

/// Options of a negative acknowledgment.
///
/// Requeueing is the default: a nacked message goes back to its queue. Turn
/// it off to dead-letter the message to the queue's `__rejected.<queue>`
/// companion instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackOptions {
    pub requeue: bool,
}

impl Default for NackOptions {
    fn default() -> Self {
        NackOptions { requeue: true }
    }
}

/// The pending acknowledgment of one delivery, owned by a
/// [`ConfirmedMessageHandler`]. Consuming it settles the delivery exactly
/// once.
pub struct DeliveryConfirmation {
    acker: Acker,
}

impl DeliveryConfirmation {
    pub(crate) fn new(acker: Acker) -> DeliveryConfirmation {
        DeliveryConfirmation { acker }
    }

    /// Acknowledges the delivery.
    pub async fn ack(self) -> Result<(), AmqpError> {
        match self.acker.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    /// Negatively acknowledges the delivery, requeueing it unless the
    /// options say otherwise.
    pub async fn nack(self, options: NackOptions) -> Result<(), AmqpError> {
        match self
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: options.requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}

/// Handler whose acknowledgment is managed by the bus: the delivery is acked
/// after `handle` returns `Ok` and nacked with requeue after `Err`.
///
/// Returning `Ok(Some(value))` publishes the value as the response when the
/// sender asked for one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Value) -> Result<Option<Value>, AmqpError>;
}

/// Handler that owns the acknowledgment of each delivery through the
/// [`DeliveryConfirmation`] handed to it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfirmedMessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: Value,
        confirmation: DeliveryConfirmation,
    ) -> Result<Option<Value>, AmqpError>;
}

/// Wraps an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, AmqpError>> + Send + 'static,
{
    Arc::new(FnMessageHandler { f })
}

/// Wraps an async closure into a [`ConfirmedMessageHandler`].
pub fn confirmed_handler_fn<F, Fut>(f: F) -> Arc<dyn ConfirmedMessageHandler>
where
    F: Fn(Value, DeliveryConfirmation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, AmqpError>> + Send + 'static,
{
    Arc::new(FnConfirmedMessageHandler { f })
}

struct FnMessageHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnMessageHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, AmqpError>> + Send + 'static,
{
    async fn handle(&self, message: Value) -> Result<Option<Value>, AmqpError> {
        (self.f)(message).await
    }
}

struct FnConfirmedMessageHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConfirmedMessageHandler for FnConfirmedMessageHandler<F>
where
    F: Fn(Value, DeliveryConfirmation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, AmqpError>> + Send + 'static,
{
    async fn handle(
        &self,
        message: Value,
        confirmation: DeliveryConfirmation,
    ) -> Result<Option<Value>, AmqpError> {
        (self.f)(message, confirmation).await
    }
}

#[derive(Clone)]
pub(crate) enum DeliveryHandler {
    Simple(Arc<dyn MessageHandler>),
    Confirmed(Arc<dyn ConfirmedMessageHandler>),
}

pub(crate) type OnEnded = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ConsumeContext {
    pub(crate) channel: Arc<Channel>,
    pub(crate) queue_name: String,
    pub(crate) span_name: String,
    pub(crate) handler: DeliveryHandler,
    pub(crate) respond: bool,
}

/// Drives a consumer stream to completion, dispatching each delivery to the
/// handler. When the stream ends, for whatever reason, the `on_ended`
/// callback runs exactly once.
pub(crate) async fn dispatch_deliveries(
    ctx: ConsumeContext,
    mut consumer: Consumer,
    on_ended: Option<OnEnded>,
) {
    let tracer = opentelemetry::global::tracer("amqp-bus");

    while let Some(result) = consumer.next().await {
        match result {
            Ok(delivery) => {
                if let Err(err) = handle_delivery(&tracer, &ctx, delivery).await {
                    error!(error = err.to_string(), "errors consume msg");
                }
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = ctx.queue_name,
                    "error receiving delivery msg"
                );
                break;
            }
        }
    }

    debug!(queue = ctx.queue_name, "consumer stream ended");

    if let Some(on_ended) = on_ended {
        on_ended();
    }
}

async fn handle_delivery(
    tracer: &BoxedTracer,
    ctx: &ConsumeContext,
    delivery: Delivery,
) -> Result<(), AmqpError> {
    let (_ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, &ctx.span_name);

    debug!("received message - queue: {}", ctx.queue_name);

    let Delivery {
        data,
        properties,
        acker,
        ..
    } = delivery;

    let message: Value = match codec::decode(&data) {
        Ok(value) => value,
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to parse the payload"),
            });
            warn!("unparseable message, requeuing");
            return nack_and_requeue(&acker, &mut span).await;
        }
    };

    match &ctx.handler {
        DeliveryHandler::Simple(handler) => match handler.handle(message).await {
            Ok(reply) => {
                if let Err(err) = maybe_reply(ctx, &properties, reply).await {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("failure to publish the reply"),
                    });
                    return nack_and_requeue(&acker, &mut span).await;
                }

                match acker.ack(BasicAckOptions { multiple: false }).await {
                    Err(err) => {
                        error!("error whiling ack msg");
                        span.record_error(&err);
                        span.set_status(Status::Error {
                            description: Cow::from("error to ack msg"),
                        });
                        Err(AmqpError::AckMessageError)
                    }
                    _ => {
                        span.set_status(Status::Ok);
                        Ok(())
                    }
                }
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to handle the message"),
                });
                warn!("error whiling handling msg, requeuing");
                nack_and_requeue(&acker, &mut span).await
            }
        },
        DeliveryHandler::Confirmed(handler) => {
            let confirmation = DeliveryConfirmation::new(acker);

            match handler.handle(message, confirmation).await {
                Ok(reply) => {
                    if let Err(err) = maybe_reply(ctx, &properties, reply).await {
                        error!(error = err.to_string(), "failure to publish the reply");
                        span.record_error(&err);
                        span.set_status(Status::Error {
                            description: Cow::from("failure to publish the reply"),
                        });
                    } else {
                        span.set_status(Status::Ok);
                    }
                    Ok(())
                }
                Err(err) => {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("failure to handle the message"),
                    });
                    Ok(())
                }
            }
        }
    }
}

async fn nack_and_requeue(acker: &Acker, span: &mut BoxedSpan) -> Result<(), AmqpError> {
    match acker
        .nack(BasicNackOptions {
            multiple: false,
            requeue: true,
        })
        .await
    {
        Err(err) => {
            error!("error whiling nack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });
            Err(AmqpError::NackMessageError)
        }
        _ => Ok(()),
    }
}

/// Publishes the handler's return value back to the sender when the delivery
/// asked for a response. Replies travel through the default exchange straight
/// to the `reply_to` queue, keeping the original correlation id.
async fn maybe_reply(
    ctx: &ConsumeContext,
    properties: &AMQPProperties,
    reply: Option<Value>,
) -> Result<(), AmqpError> {
    if !ctx.respond {
        return Ok(());
    }

    let Some(reply) = reply else {
        return Ok(());
    };

    let Some((reply_to, correlation_id)) = reply_route(properties) else {
        return Ok(());
    };

    let body = codec::encode(&reply)?;

    let mut props =
        BasicProperties::default().with_content_type(ShortString::from(JSON_CONTENT_TYPE));
    if let Some(correlation_id) = correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id));
    }

    debug!("publishing reply to: {}", reply_to);

    match ctx
        .channel
        .basic_publish(
            DEFAULT_EXCHANGE,
            &reply_to,
            BasicPublishOptions::default(),
            &body,
            props,
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "failure to publish the reply");
            Err(AmqpError::PublishingError)
        }
        _ => Ok(()),
    }
}

fn reply_route(properties: &AMQPProperties) -> Option<(String, Option<String>)> {
    let reply_to = properties.reply_to().as_ref()?.as_str().to_owned();
    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_owned());

    Some((reply_to, correlation_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_route_needs_a_reply_queue() {
        assert_eq!(reply_route(&AMQPProperties::default()), None);

        let without_correlation =
            AMQPProperties::default().with_reply_to(ShortString::from("__response.replies_a1b2c3d4"));
        assert_eq!(
            reply_route(&without_correlation),
            Some(("__response.replies_a1b2c3d4".to_owned(), None)),
        );
    }

    #[test]
    fn reply_route_carries_the_correlation_id() {
        let props = AMQPProperties::default()
            .with_reply_to(ShortString::from("__response.replies_a1b2c3d4"))
            .with_correlation_id(ShortString::from("req-42"));

        assert_eq!(
            reply_route(&props),
            Some((
                "__response.replies_a1b2c3d4".to_owned(),
                Some("req-42".to_owned()),
            )),
        );
    }

    #[tokio::test]
    async fn handler_fn_adapts_a_closure() {
        let handler = handler_fn(|message: Value| async move {
            Ok(Some(json!({ "echo": message })))
        });

        let reply = handler.handle(json!(7)).await.unwrap();

        assert_eq!(reply, Some(json!({ "echo": 7 })));
    }

    #[tokio::test]
    async fn mock_handler_wires_through_the_trait() {
        let mut mock = MockMessageHandler::new();
        mock.expect_handle().times(1).returning(|_| Ok(None));

        let handler: Arc<dyn MessageHandler> = Arc::new(mock);

        assert_eq!(handler.handle(json!({})).await.unwrap(), None);
    }
}
