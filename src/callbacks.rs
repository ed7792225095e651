// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Callbacks
//!
//! A typed registry of listeners keyed by a fixed set of lifecycle events. Listeners
//! are appended during setup and dispatched in registration order, one after the
//! other, each awaited before the next one runs.

use crate::{channel::BrokerChannel, confirms::ConfirmationFrame, errors::AmqpError};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, error};

/// Names of the lifecycle milestones listeners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Channel opened and topology declared
    Ready,
    /// Publisher switched the channel into confirmation mode
    Started,
    /// Channel and connection are gone
    Closed,
}

/// Why the connector dropped its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `stop()` was requested
    Stopped,
    /// The channel was lost and a reconnect is scheduled
    Unexpected(AmqpError),
    /// The channel was lost and the connector gave up
    Failed(AmqpError),
}

/// Payload delivered to listeners.
#[derive(Clone)]
pub enum Notification {
    Ready {
        generation: u64,
        channel: Arc<dyn BrokerChannel>,
    },
    Started {
        generation: u64,
    },
    Closed {
        generation: u64,
        reason: CloseReason,
    },
}

impl Notification {
    pub fn event(&self) -> LifecycleEvent {
        match self {
            Notification::Ready { .. } => LifecycleEvent::Ready,
            Notification::Started { .. } => LifecycleEvent::Started,
            Notification::Closed { .. } => LifecycleEvent::Closed,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            Notification::Ready { generation, .. }
            | Notification::Started { generation }
            | Notification::Closed { generation, .. } => *generation,
        }
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Ready { generation, .. } => f
                .debug_struct("Ready")
                .field("generation", generation)
                .finish_non_exhaustive(),
            Notification::Started { generation } => f
                .debug_struct("Started")
                .field("generation", generation)
                .finish(),
            Notification::Closed { generation, reason } => f
                .debug_struct("Closed")
                .field("generation", generation)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Receives lifecycle notifications.
///
/// Returning an error from a `Ready` notification aborts the session: the connector
/// tears the channel down and goes through its reconnect policy.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn on_event(&self, notification: Notification) -> Result<(), AmqpError>;
}

/// Receives every Basic.Ack / Basic.Nack frame of the connector's channels.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn on_delivery_confirmation(&self, generation: u64, frame: ConfirmationFrame);
}

/// Adapts a plain closure into a [`LifecycleListener`].
pub struct FnListener<F>(pub F);

#[async_trait]
impl<F> LifecycleListener for FnListener<F>
where
    F: Fn(&Notification) + Send + Sync,
{
    async fn on_event(&self, notification: Notification) -> Result<(), AmqpError> {
        (self.0)(&notification);
        Ok(())
    }
}

/// Append-only registry of lifecycle listeners.
#[derive(Default)]
pub struct CallbackRegistry {
    listeners: RwLock<HashMap<LifecycleEvent, Vec<Arc<dyn LifecycleListener>>>>,
}

impl CallbackRegistry {
    pub fn new() -> CallbackRegistry {
        CallbackRegistry::default()
    }

    pub fn register(&self, event: LifecycleEvent, listener: Arc<dyn LifecycleListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event)
            .or_default()
            .push(listener);
    }

    /// Registers a synchronous closure.
    pub fn register_fn<F>(&self, event: LifecycleEvent, listener: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(FnListener(listener)));
    }

    pub fn listeners(&self, event: LifecycleEvent) -> Vec<Arc<dyn LifecycleListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .cloned()
            .unwrap_or_default()
    }

    /// Invokes the listeners of the notification's event in registration order,
    /// stopping at the first failure.
    pub async fn dispatch(&self, notification: Notification) -> Result<(), AmqpError> {
        let event = notification.event();
        let listeners = self.listeners(event);
        debug!(event = ?event, listeners = listeners.len(), "dispatching lifecycle event");

        for listener in listeners {
            if let Err(err) = listener.on_event(notification.clone()).await {
                error!(error = err.to_string(), event = ?event, "lifecycle listener failed");
                return Err(err);
            }
        }

        Ok(())
    }
}
