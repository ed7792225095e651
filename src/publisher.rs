// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Confirming Publisher
//!
//! This module turns a [`Connector`]'s channel into a reliable message sink. Every
//! time the connector reports a ready channel the publisher switches it into
//! confirmation mode; every message sent is kept in an outstanding-delivery table
//! until the broker acknowledges or rejects it.
//!
//! Rejected messages are never dropped: they are republished up to a configured
//! number of times and then handed to a [`RejectionHandler`], or kept for the
//! application to collect with [`Publisher::take_rejected`].

use crate::{
    callbacks::{
        CallbackRegistry, CloseReason, ConfirmationHandler, LifecycleEvent, LifecycleListener,
        Notification,
    },
    channel::{BrokerChannel, MessageProperties},
    configs::PublisherConfigs,
    confirms::{ConfirmationFrame, ConfirmationKind, DeliveryTag, DeliveryTracker, PendingDelivery},
    connector::Connector,
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use lapin::types::{
    AMQPValue, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header values callers can attach to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> AMQPValue {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Bool(v) => AMQPValue::Boolean(v),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// Counters of what happened to the messages handed to the publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub confirmed: u64,
    pub rejected: u64,
    pub redelivered: u64,
    /// Deliveries whose channel went away before the broker answered
    pub unconfirmed: u64,
}

/// A message the broker refused and that will not be republished.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedDelivery {
    pub delivery: PendingDelivery,
    pub error: AmqpError,
}

/// What was still waiting for a confirmation when the publisher stopped.
///
/// These messages may or may not have reached the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    pub unconfirmed: Vec<PendingDelivery>,
}

/// Application hook for messages the broker rejected.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait RejectionHandler: Send + Sync {
    async fn on_rejected(&self, rejected: RejectedDelivery);
}

#[derive(Default)]
struct PublishState {
    channel: Option<Arc<dyn BrokerChannel>>,
    tracker: DeliveryTracker,
    stopping: bool,
    unconfirmed: Vec<PendingDelivery>,
    rejected: Vec<RejectedDelivery>,
    stats: PublisherStats,
}

impl PublishState {
    fn lose(&mut self, lost: Vec<PendingDelivery>) {
        if lost.is_empty() {
            return;
        }

        warn!(
            count = lost.len(),
            "deliveries left without confirmation by a replaced channel"
        );
        self.stats.unconfirmed += lost.len() as u64;
        self.unconfirmed.extend(lost);
    }
}

struct PublisherCore {
    app_id: String,
    exchange: String,
    routing_key: String,
    max_redeliveries: u32,
    state: Mutex<PublishState>,
    callbacks: CallbackRegistry,
    rejection_handler: RwLock<Option<Arc<dyn RejectionHandler>>>,
}

/// Publishes JSON messages on the connector's channel with delivery confirmations.
#[derive(Clone)]
pub struct Publisher {
    connector: Connector,
    core: Arc<PublisherCore>,
}

impl Publisher {
    /// Creates a publisher on top of `connector` and subscribes it to the connector's
    /// lifecycle and confirmation frames.
    pub fn new(connector: &Connector, cfg: &PublisherConfigs) -> Publisher {
        let topology = connector.topology();
        let core = Arc::new(PublisherCore {
            app_id: cfg.app_id.clone(),
            exchange: topology.exchange_name().to_owned(),
            routing_key: topology.routing_key().to_owned(),
            max_redeliveries: cfg.max_redeliveries,
            state: Mutex::new(PublishState::default()),
            callbacks: CallbackRegistry::new(),
            rejection_handler: RwLock::new(None),
        });

        connector.register_callback(LifecycleEvent::Ready, core.clone());
        connector.register_callback(LifecycleEvent::Closed, core.clone());
        connector.register_confirmation_handler(core.clone());

        Publisher {
            connector: connector.clone(),
            core,
        }
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Starts the connector; the publisher starts itself once the channel is ready.
    pub fn connect(&self) {
        self.connector.start();
    }

    /// Connects and waits until the connector reaches a terminal state.
    pub async fn run(&self) -> Result<(), AmqpError> {
        self.connector.run().await.map(|_| ())
    }

    /// Registers a listener for the publisher's own `Started` event.
    pub fn register_callback(&self, event: LifecycleEvent, listener: Arc<dyn LifecycleListener>) {
        self.core.callbacks.register(event, listener);
    }

    pub fn set_rejection_handler(&self, handler: Arc<dyn RejectionHandler>) {
        *self
            .core
            .rejection_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Enables delivery confirmations on `channel` and fires the `Started` listeners.
    ///
    /// Runs on every ready channel: a new channel starts without confirmations and with
    /// delivery numbering back at 1.
    pub async fn start(
        &self,
        channel: Arc<dyn BrokerChannel>,
        generation: u64,
    ) -> Result<(), AmqpError> {
        self.core.start(channel, generation).await
    }

    /// Serializes `message` to JSON and publishes it.
    ///
    /// Returns the delivery number the channel assigned, or
    /// [`AmqpError::ChannelUnavailable`] when there is no usable channel right now; in
    /// that case nothing was sent and the call can be retried later.
    pub async fn publish<T>(&self, message: &T) -> Result<DeliveryTag, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with_headers(message, &HashMap::new()).await
    }

    pub async fn publish_with_headers<T>(
        &self,
        message: &T,
        headers: &HashMap<String, HeaderValues>,
    ) -> Result<DeliveryTag, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => Ok(payload),
            Err(err) => {
                error!(error = err.to_string(), "error serializing message");
                Err(AmqpError::ParsePayloadError)
            }
        }?;

        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(&Context::current(), &mut btree);
        for (key, value) in headers.clone() {
            btree.insert(ShortString::from(key), value.into());
        }

        let mut state = self.core.state.lock().await;
        self.core
            .send_locked(&mut state, Uuid::new_v4().to_string(), payload, btree, 0)
            .await
    }

    /// Reconciles a Basic.Ack / Basic.Nack frame with the outstanding deliveries.
    pub async fn on_delivery_confirmation(&self, generation: u64, frame: ConfirmationFrame) {
        self.core.on_delivery_confirmation(generation, frame).await
    }

    /// Stops publishing and tears the connector down.
    ///
    /// No send succeeds once this started. Deliveries still outstanding are returned
    /// as unconfirmed: they may or may not have reached the broker.
    pub async fn stop(&self) -> ShutdownReport {
        info!("Stopping.");
        let unconfirmed = {
            let mut state = self.core.state.lock().await;
            state.stopping = true;
            state.channel = None;

            let pending = state.tracker.drain();
            state.stats.unconfirmed += pending.len() as u64;

            let mut unconfirmed = std::mem::take(&mut state.unconfirmed);
            unconfirmed.extend(pending);
            unconfirmed
        };

        if !unconfirmed.is_empty() {
            warn!(
                count = unconfirmed.len(),
                "stopping with unconfirmed deliveries, their status is unknown"
            );
        }

        self.connector.stop().await;
        info!("Stopped.");

        ShutdownReport { unconfirmed }
    }

    /// Whether confirmation mode is on for the current channel.
    pub async fn is_started(&self) -> bool {
        self.core.state.lock().await.channel.is_some()
    }

    pub async fn stats(&self) -> PublisherStats {
        self.core.state.lock().await.stats
    }

    /// Delivery numbers waiting for a confirmation, in ascending order.
    pub async fn outstanding(&self) -> Vec<DeliveryTag> {
        self.core.state.lock().await.tracker.tags()
    }

    /// Rejected deliveries kept because no [`RejectionHandler`] was set.
    pub async fn take_rejected(&self) -> Vec<RejectedDelivery> {
        std::mem::take(&mut self.core.state.lock().await.rejected)
    }

    /// Deliveries lost with a replaced channel; they are not republished.
    pub async fn take_unconfirmed(&self) -> Vec<PendingDelivery> {
        std::mem::take(&mut self.core.state.lock().await.unconfirmed)
    }
}

impl PublisherCore {
    async fn start(&self, channel: Arc<dyn BrokerChannel>, generation: u64) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        if state.stopping {
            debug!("publisher stopping, not enabling delivery confirmations");
            return Ok(());
        }

        let discarded = state.tracker.reset(generation);
        state.lose(discarded);

        info!("Issuing Confirm.Select RPC command");
        channel.confirm_select().await?;
        state.channel = Some(channel);
        drop(state);

        info!(generation, "publisher started");
        self.callbacks
            .dispatch(Notification::Started { generation })
            .await
    }

    /// Sends one message on the current channel and records it as outstanding.
    ///
    /// The caller holds the state lock for the whole call, so delivery numbers are
    /// recorded in the order the channel assigns them.
    async fn send_locked(
        &self,
        state: &mut PublishState,
        message_id: String,
        payload: Vec<u8>,
        headers: BTreeMap<ShortString, AMQPValue>,
        attempts: u32,
    ) -> Result<DeliveryTag, AmqpError> {
        if state.stopping {
            warn!("publisher stopping, message not sent");
            return Err(AmqpError::ChannelUnavailable);
        }

        let current = state
            .channel
            .clone()
            .filter(|channel| channel.generation() == state.tracker.generation());
        let channel = match current {
            Some(channel) if channel.is_open() => channel,
            Some(channel) => {
                error!("Cannot publish the message. Channel closed by the broker.");
                channel.report_closed(AmqpError::TransportFailure(
                    "channel closed by the broker".to_owned(),
                ));
                state.channel = None;
                return Err(AmqpError::ChannelUnavailable);
            }
            None => {
                error!("Cannot publish the message. Channel unavailable or closed.");
                return Err(AmqpError::ChannelUnavailable);
            }
        };

        let properties = MessageProperties {
            app_id: self.app_id.clone(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: message_id.clone(),
            timestamp: unix_timestamp(),
            headers: headers.clone(),
        };

        let delivery_tag = match channel
            .publish(&self.exchange, &self.routing_key, &payload, &properties)
            .await
        {
            Ok(tag) => Ok(tag),
            Err(err) if !channel.is_open() => {
                warn!(error = err.to_string(), "channel closed while publishing");
                Err(AmqpError::ChannelUnavailable)
            }
            Err(err) => Err(err),
        }?;

        state.tracker.record(PendingDelivery {
            delivery_tag,
            generation: channel.generation(),
            message_id,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            payload,
            headers,
            attempts,
            published_at: Instant::now(),
        })?;
        state.stats.published += 1;

        debug!(delivery_tag, "Published message # {}", properties.message_id);
        Ok(delivery_tag)
    }

    async fn on_delivery_confirmation(&self, generation: u64, frame: ConfirmationFrame) {
        let mut state = self.state.lock().await;
        let Some(resolved) = state.tracker.resolve(generation, &frame) else {
            warn!(
                generation,
                delivery_tag = frame.delivery_tag,
                "discarding confirmation of a replaced channel"
            );
            return;
        };

        info!(
            "Received {:?} for delivery tag: {} (multiple: {})",
            frame.kind, frame.delivery_tag, frame.multiple
        );

        if frame.kind == ConfirmationKind::Ack {
            state.stats.confirmed += resolved.len() as u64;
            return;
        }

        let mut escalated = vec![];
        for delivery in resolved {
            if !state.stopping && delivery.attempts < self.max_redeliveries {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    attempt = delivery.attempts + 1,
                    "message rejected, publishing it again"
                );

                match self
                    .send_locked(
                        &mut state,
                        delivery.message_id.clone(),
                        delivery.payload.clone(),
                        delivery.headers.clone(),
                        delivery.attempts + 1,
                    )
                    .await
                {
                    Ok(_) => {
                        state.stats.redelivered += 1;
                        continue;
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "failure to publish rejected message again")
                    }
                }
            }

            escalated.push(RejectedDelivery {
                error: AmqpError::DeliveryRejected {
                    delivery_tag: delivery.delivery_tag,
                    message_id: delivery.message_id.clone(),
                },
                delivery,
            });
        }

        if escalated.is_empty() {
            return;
        }

        state.stats.rejected += escalated.len() as u64;
        for rejected in &escalated {
            error!(
                error = rejected.error.to_string(),
                age_ms = rejected.delivery.age().as_millis() as u64,
                "message rejected by the broker"
            );
        }

        let handler = self
            .rejection_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => {
                drop(state);
                for rejected in escalated {
                    handler.on_rejected(rejected).await;
                }
            }
            None => state.rejected.extend(escalated),
        }
    }

    async fn on_channel_closed(&self, generation: u64, reason: &CloseReason) {
        let mut state = self.state.lock().await;
        if state.tracker.generation() != generation {
            return;
        }

        debug!(reason = ?reason, generation, "publisher lost its channel");
        state.channel = None;
        let lost = state.tracker.drain();
        state.lose(lost);
    }
}

#[async_trait]
impl LifecycleListener for PublisherCore {
    async fn on_event(&self, notification: Notification) -> Result<(), AmqpError> {
        match notification {
            Notification::Ready {
                generation,
                channel,
            } => self.start(channel, generation).await,
            Notification::Closed { generation, reason } => {
                self.on_channel_closed(generation, &reason).await;
                Ok(())
            }
            Notification::Started { .. } => Ok(()),
        }
    }
}

#[async_trait]
impl ConfirmationHandler for PublisherCore {
    async fn on_delivery_confirmation(&self, generation: u64, frame: ConfirmationFrame) {
        PublisherCore::on_delivery_confirmation(self, generation, frame).await
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
