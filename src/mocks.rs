// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A [`Transport`] that never touches the network. It records declarations and
//! published frames, numbers deliveries the way a broker does once confirmation mode
//! is on, and lets tests inject acknowledgements, rejections, closures and failures.

use crate::{
    channel::{BrokerChannel, BrokerConnection, EventSink, MessageProperties, Transport},
    confirms::{ConfirmationFrame, DeliveryTag},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A message the in-memory broker received.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedFrame {
    pub generation: u64,
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Default)]
struct BrokerState {
    connect_failures: usize,
    fail_exchange: bool,
    fail_queue: bool,
    fail_bind: bool,
    fail_confirm_select: bool,
    connections: usize,
    operations: Vec<String>,
    published: Vec<PublishedFrame>,
    channel: Option<ChannelState>,
    sinks: Vec<EventSink>,
}

#[derive(Clone)]
struct ChannelState {
    generation: u64,
    events: EventSink,
    open: bool,
    confirms: bool,
    next_tag: DeliveryTag,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.state().connect_failures = n;
    }

    pub fn fail_exchange_declare(&self, fail: bool) {
        self.state().fail_exchange = fail;
    }

    pub fn fail_queue_declare(&self, fail: bool) {
        self.state().fail_queue = fail;
    }

    pub fn fail_bind(&self, fail: bool) {
        self.state().fail_bind = fail;
    }

    pub fn fail_confirm_select(&self, fail: bool) {
        self.state().fail_confirm_select = fail;
    }

    /// Number of successful connections so far.
    pub fn connections(&self) -> usize {
        self.state().connections
    }

    /// Successful protocol operations, oldest first.
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    pub fn published(&self) -> Vec<PublishedFrame> {
        self.state().published.clone()
    }

    pub fn confirms_enabled(&self) -> bool {
        self.state()
            .channel
            .as_ref()
            .map(|channel| channel.confirms)
            .unwrap_or(false)
    }

    pub fn channel_open(&self) -> bool {
        self.state()
            .channel
            .as_ref()
            .map(|channel| channel.open)
            .unwrap_or(false)
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.state().channel.as_ref().map(|channel| channel.generation)
    }

    /// Sends a Basic.Ack on the current channel.
    pub fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) {
        self.confirm(ConfirmationFrame::ack(delivery_tag, multiple));
    }

    /// Sends a Basic.Nack on the current channel.
    pub fn nack(&self, delivery_tag: DeliveryTag, multiple: bool) {
        self.confirm(ConfirmationFrame::nack(delivery_tag, multiple));
    }

    fn confirm(&self, frame: ConfirmationFrame) {
        let sink = self.state().channel.as_ref().map(|c| c.events.clone());
        if let Some(sink) = sink {
            sink.confirm(frame);
        }
    }

    /// Sends a Basic.Ack through the channel of an arbitrary, possibly replaced, generation.
    pub fn ack_on(&self, generation: u64, delivery_tag: DeliveryTag, multiple: bool) {
        let sink = self
            .state()
            .sinks
            .iter()
            .find(|sink| sink.generation() == generation)
            .cloned();
        if let Some(sink) = sink {
            sink.confirm(ConfirmationFrame::ack(delivery_tag, multiple));
        }
    }

    /// Closes the current channel from the broker side.
    pub fn close_channel(&self, reason: &str) {
        let sink = {
            let mut state = self.state();
            match state.channel.as_mut() {
                Some(channel) => {
                    channel.open = false;
                    Some(channel.events.clone())
                }
                None => None,
            }
        };

        if let Some(sink) = sink {
            sink.closed(AmqpError::TransportFailure(reason.to_owned()));
        }
    }

    /// Closes the current channel without telling the client, the way a broker-side
    /// channel close goes unnoticed until the channel is used.
    pub fn close_channel_silently(&self) {
        if let Some(channel) = self.state().channel.as_mut() {
            channel.open = false;
        }
    }

    /// Opens a channel outside of any connector, for exercising declarations directly.
    pub fn open_test_channel(&self, generation: u64) -> Arc<dyn BrokerChannel> {
        let (tx, _) = mpsc::unbounded_channel();
        self.open(EventSink::new(generation, tx))
    }

    fn open(&self, events: EventSink) -> Arc<dyn BrokerChannel> {
        let generation = events.generation();
        let mut state = self.state();
        state.sinks.push(events.clone());
        state.channel = Some(ChannelState {
            generation,
            events,
            open: true,
            confirms: false,
            next_tag: 1,
        });
        drop(state);

        Arc::new(InMemoryChannel {
            broker: self.clone(),
            generation,
        })
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self, _events: EventSink) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(AmqpError::TransportFailure("connection refused".to_owned()));
        }

        state.connections += 1;
        state.operations.push("connection.open".to_owned());
        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self, events: EventSink) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.broker.state().operations.push("channel.open".to_owned());
        Ok(self.broker.open(events))
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker
            .state()
            .operations
            .push("connection.close".to_owned());
        Ok(())
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    generation: u64,
}

impl InMemoryChannel {
    /// Runs `op` against the broker state if this channel is still the open one.
    fn with_channel<T>(
        &self,
        op: impl FnOnce(&mut BrokerState) -> Result<T, AmqpError>,
    ) -> Result<T, AmqpError> {
        let mut state = self.broker.state();
        let current = state
            .channel
            .as_ref()
            .map(|c| c.generation == self.generation && c.open)
            .unwrap_or(false);
        if !current {
            return Err(AmqpError::TransportFailure("channel closed".to_owned()));
        }
        op(&mut state)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn is_open(&self) -> bool {
        self.with_channel(|_| Ok(())).is_ok()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.with_channel(|state| {
            if state.fail_exchange {
                return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
            }
            state
                .operations
                .push(format!("exchange.declare {} {}", def.name(), def.exchange_kind()));
            Ok(())
        })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.with_channel(|state| {
            if state.fail_queue {
                return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
            }
            state.operations.push(format!("queue.declare {}", def.name()));
            Ok(())
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.with_channel(|state| {
            if state.fail_bind {
                return Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                ));
            }
            state.operations.push(format!(
                "queue.bind {} {} {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.key()
            ));
            Ok(())
        })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.with_channel(|state| {
            if state.fail_confirm_select {
                return Err(AmqpError::ConfirmSelectError);
            }
            state.operations.push("confirm.select".to_owned());
            if let Some(channel) = state.channel.as_mut() {
                channel.confirms = true;
                channel.next_tag = 1;
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<DeliveryTag, AmqpError> {
        self.with_channel(|state| {
            let channel = state.channel.as_mut().ok_or(AmqpError::ChannelError)?;
            let delivery_tag = channel.next_tag;
            channel.next_tag += 1;

            state.published.push(PublishedFrame {
                generation: self.generation,
                delivery_tag,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                payload: payload.to_vec(),
                properties: properties.clone(),
            });
            Ok(delivery_tag)
        })
    }

    fn report_closed(&self, error: AmqpError) {
        let sink = self
            .broker
            .state()
            .sinks
            .iter()
            .find(|sink| sink.generation() == self.generation)
            .cloned();
        if let Some(sink) = sink {
            sink.closed(error);
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.with_channel(|state| {
            if let Some(channel) = state.channel.as_mut() {
                channel.open = false;
                channel.confirms = false;
            }
            state.operations.push("channel.close".to_owned());
            Ok(())
        })
    }
}
