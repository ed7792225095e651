// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Confirming Publisher
//!
//! This module provides the error taxonomy shared by the connector and the publisher.
//! Transport and topology failures are handled by the connector state machine, while
//! content-level failures (rejected deliveries) are escalated to the application.

use thiserror::Error;

/// Represents errors that can occur while connecting, declaring topology or publishing.
///
/// Every variant is cheap to clone so the connector can keep the last error around
/// and hand copies to lifecycle listeners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid or missing configuration
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// Connection or channel lost unexpectedly, or the connection could not be established
    #[error("transport failure `{0}`")]
    TransportFailure(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error switching the channel into confirmation mode
    #[error("failure to enable delivery confirmations")]
    ConfirmSelectError,

    /// No usable channel right now; the message was not sent and may be retried later
    #[error("channel unavailable, message not sent")]
    ChannelUnavailable,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// The broker negatively acknowledged a published message
    #[error("delivery `{delivery_tag}` of message `{message_id}` was rejected by the broker")]
    DeliveryRejected {
        delivery_tag: u64,
        message_id: String,
    },
}

impl AmqpError {
    /// Whether the error comes from one of the exchange/queue/bind steps.
    pub fn is_topology_failure(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
        )
    }

    /// Whether the error means the link to the broker is gone.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            AmqpError::TransportFailure(_) | AmqpError::ChannelError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_topology_failures() {
        assert!(AmqpError::DeclareExchangeError("orders".into()).is_topology_failure());
        assert!(AmqpError::DeclareQueueError("orders.q".into()).is_topology_failure());
        assert!(
            AmqpError::BindingExchangeToQueueError("orders".into(), "orders.q".into())
                .is_topology_failure()
        );
        assert!(!AmqpError::ChannelUnavailable.is_topology_failure());
    }

    #[test]
    fn classifies_transport_failures() {
        assert!(AmqpError::TransportFailure("reset".into()).is_transport_failure());
        assert!(AmqpError::ChannelError.is_transport_failure());
        assert!(!AmqpError::PublishingError.is_transport_failure());
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("orders".into(), "orders.q".into());
        assert_eq!(
            err.to_string(),
            "failure to binding exchange `orders` to queue `orders.q`"
        );
    }
}
