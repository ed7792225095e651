// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod callbacks;
pub mod channel;
pub mod configs;
pub mod confirms;
pub mod connector;
pub mod errors;
pub mod exchange;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use connector::{Connector, ConnectorState};
pub use publisher::{Publisher, PublisherStats, ShutdownReport};
