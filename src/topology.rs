// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology
//!
//! The exchange, queue and binding a publisher depends on, and the ordered
//! declaration of them on a fresh channel. The order is fixed: the exchange first,
//! then the queue, then the binding, because a bind referencing an undeclared
//! exchange or queue fails at the protocol level.

use crate::{
    channel::BrokerChannel,
    configs::TopologyConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// Immutable topology descriptor, redeclared on every new channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    exchange: ExchangeDefinition,
    queue: Option<QueueDefinition>,
    routing_key: String,
}

impl Topology {
    /// Creates a topology publishing to `exchange` with `routing_key`.
    ///
    /// An empty exchange name targets the broker's default exchange, which is never
    /// declared nor bound.
    pub fn new(exchange: ExchangeDefinition, routing_key: &str) -> Topology {
        Topology {
            exchange,
            queue: None,
            routing_key: routing_key.to_owned(),
        }
    }

    /// Adds the queue bound to the exchange with the routing key.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queue = Some(def);
        self
    }

    pub fn from_configs(cfg: &TopologyConfigs) -> Topology {
        let mut exchange = ExchangeDefinition::new(&cfg.exchange).kind(cfg.exchange_kind.clone());
        if cfg.durable {
            exchange = exchange.durable();
        }

        let topology = Topology::new(exchange, &cfg.routing_key);
        if cfg.queue.is_empty() {
            return topology;
        }

        let mut queue = QueueDefinition::new(&cfg.queue);
        if cfg.durable {
            queue = queue.durable();
        }
        topology.queue(queue)
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub fn queue_definition(&self) -> Option<&QueueDefinition> {
        self.queue.as_ref()
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The binding implied by the descriptor, if any.
    pub fn binding(&self) -> Option<QueueBinding> {
        if self.exchange.name().is_empty() {
            return None;
        }

        self.queue.as_ref().map(|queue| {
            QueueBinding::new(queue.name())
                .exchange(self.exchange.name())
                .routing_key(&self.routing_key)
        })
    }

    /// Declares the exchange, then the queue, then binds them.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if !self.exchange.name().is_empty() {
            debug!("creating exchange: {}", self.exchange.name());
            channel.declare_exchange(&self.exchange).await?;
            debug!("exchange: {} was created", self.exchange.name());
        }

        if let Some(queue) = &self.queue {
            debug!("creating queue: {}", queue.name());
            channel.declare_queue(queue).await?;
            debug!("queue: {} was created", queue.name());
        }

        if let Some(binding) = self.binding() {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.key()
            );
            channel.bind_queue(&binding).await?;
            debug!("queue was bounded");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exchange::ExchangeKind, mocks::InMemoryBroker};

    fn orders() -> TopologyConfigs {
        TopologyConfigs {
            exchange: "orders".into(),
            exchange_kind: ExchangeKind::Topic,
            queue: "orders.q".into(),
            routing_key: "orders.new".into(),
            durable: true,
        }
    }

    #[test]
    fn builds_from_configs() {
        let topology = Topology::from_configs(&orders());

        assert_eq!(topology.exchange_name(), "orders");
        assert_eq!(topology.exchange().exchange_kind(), &ExchangeKind::Topic);
        assert_eq!(topology.queue_definition().unwrap().name(), "orders.q");
        assert_eq!(
            topology.binding(),
            Some(
                QueueBinding::new("orders.q")
                    .exchange("orders")
                    .routing_key("orders.new")
            )
        );
    }

    #[test]
    fn default_exchange_is_never_bound() {
        let topology = Topology::from_configs(&TopologyConfigs {
            exchange: "".into(),
            ..orders()
        });

        assert!(topology.binding().is_none());
    }

    #[tokio::test]
    async fn installs_in_protocol_order() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_test_channel(1);

        Topology::from_configs(&orders())
            .install(channel.as_ref())
            .await
            .unwrap();

        assert_eq!(
            broker.operations(),
            vec![
                "exchange.declare orders topic",
                "queue.declare orders.q",
                "queue.bind orders.q orders orders.new",
            ]
        );
    }

    #[tokio::test]
    async fn stops_at_the_first_failed_step() {
        let broker = InMemoryBroker::new();
        broker.fail_queue_declare(true);
        let channel = broker.open_test_channel(1);

        let err = Topology::from_configs(&orders())
            .install(channel.as_ref())
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareQueueError("orders.q".into()));
        assert!(err.is_topology_failure());
        assert_eq!(broker.operations(), vec!["exchange.declare orders topic"]);
    }
}
