// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module defines the seam between the connector state machine and the broker:
//! a [`Transport`] opens [`BrokerConnection`]s, a connection opens [`BrokerChannel`]s,
//! and every protocol operation the publisher needs (declare, bind, confirm-select,
//! publish, close) goes through the channel.
//!
//! Asynchronous broker frames (publisher confirms, unexpected closures) are pushed
//! into an [`EventSink`] tagged with the channel generation they belong to, so the
//! connector can tell frames of the current channel from leftovers of a replaced one.
//!
//! [`LapinTransport`] implements the seam on top of `lapin`.

use crate::{
    configs::RabbitMQConfigs,
    confirms::{ConfirmationFrame, DeliveryTag},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Reply code sent on a clean close.
const REPLY_SUCCESS: u16 = 200;

/// Properties attached to every published message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub app_id: String,
    pub content_type: String,
    pub message_id: String,
    pub timestamp: u64,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

impl From<&MessageProperties> for BasicProperties {
    fn from(props: &MessageProperties) -> BasicProperties {
        BasicProperties::default()
            .with_app_id(ShortString::from(props.app_id.clone()))
            .with_content_type(ShortString::from(props.content_type.clone()))
            .with_message_id(ShortString::from(props.message_id.clone()))
            .with_timestamp(props.timestamp)
            .with_headers(FieldTable::from(props.headers.clone()))
    }
}

/// Asynchronous notifications produced by a channel or its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A Basic.Ack or Basic.Nack frame from the broker
    Confirmation {
        generation: u64,
        frame: ConfirmationFrame,
    },
    /// The channel or its connection went away without being asked to
    Closed { generation: u64, error: AmqpError },
}

/// Sending half handed to the transport for one channel generation.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<ChannelEvent>) -> EventSink {
        EventSink { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forwards a confirmation frame. Frames sent after the connector is gone are dropped.
    pub fn confirm(&self, frame: ConfirmationFrame) {
        if self
            .tx
            .send(ChannelEvent::Confirmation {
                generation: self.generation,
                frame,
            })
            .is_err()
        {
            debug!("connector gone, dropping confirmation frame");
        }
    }

    /// Reports an unexpected closure of the channel or connection.
    pub fn closed(&self, error: AmqpError) {
        if self
            .tx
            .send(ChannelEvent::Closed {
                generation: self.generation,
                error,
            })
            .is_err()
        {
            debug!("connector gone, dropping closure notification");
        }
    }
}

/// Opens connections to the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes a new connection. Connection-level failures discovered later are
    /// reported through `events`.
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live transport-level link to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens the single channel used for declarations and publishing.
    async fn open_channel(&self, events: EventSink) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical session over a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Generation of the connector session that opened this channel.
    fn generation(&self) -> u64;

    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Switches the channel into confirmation mode and restarts delivery numbering at 1.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Sends a message and returns the delivery number the channel assigned to it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<DeliveryTag, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// Tells the connector this channel is gone when the client library did not.
    fn report_closed(&self, error: AmqpError);
}

/// [`Transport`] backed by `lapin`.
pub struct LapinTransport {
    cfg: RabbitMQConfigs,
}

impl LapinTransport {
    pub fn new(cfg: &RabbitMQConfigs) -> LapinTransport {
        LapinTransport { cfg: cfg.clone() }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.cfg.connection_name.clone()));

        let conn = match Connection::connect(&self.cfg.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::TransportFailure(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection lost");
            events.closed(AmqpError::TransportFailure(err.to_string()));
        });

        Ok(Arc::new(LapinConnection { conn }))
    }
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self, events: EventSink) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel {
                    channel,
                    events,
                    confirms: AtomicBool::new(false),
                    next_tag: AtomicU64::new(1),
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::TransportFailure(err.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
    events: EventSink,
    confirms: AtomicBool,
    next_tag: AtomicU64,
}

impl LapinChannel {
    fn report_if_closed(&self, err: &lapin::Error) {
        if !self.channel.status().connected() {
            self.events
                .closed(AmqpError::TransportFailure(err.to_string()));
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn generation(&self) -> u64 {
        self.events.generation()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::from(def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        match self
            .channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to enable delivery confirmations");
                self.report_if_closed(&err);
                Err(AmqpError::ConfirmSelectError)
            }
            _ => {
                self.next_tag.store(1, Ordering::SeqCst);
                self.confirms.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<DeliveryTag, AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties.into(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                self.report_if_closed(&err);
                Err(AmqpError::PublishingError)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        if !self.confirms.load(Ordering::SeqCst) {
            return Ok(tag);
        }

        // lapin resolves each publish individually, multiple acks included
        let events = self.events.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(Confirmation::Ack(_)) => events.confirm(ConfirmationFrame::ack(tag, false)),
                Ok(Confirmation::Nack(_)) => events.confirm(ConfirmationFrame::nack(tag, false)),
                Ok(Confirmation::NotRequested) => {
                    warn!(delivery_tag = tag, "confirmation not requested for delivery")
                }
                Err(err) => {
                    error!(error = err.to_string(), "error waiting for confirmation");
                    events.closed(AmqpError::TransportFailure(err.to_string()));
                }
            }
        });

        Ok(tag)
    }

    fn report_closed(&self, error: AmqpError) {
        // lapin only reports connection-level errors, a channel closed by the broker is silent
        self.events.closed(error);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.confirms.store(false, Ordering::SeqCst);
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::TransportFailure(err.to_string()))
    }
}
