// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher Confirms Bookkeeping
//!
//! The broker numbers every message published on a channel in confirmation mode,
//! starting at 1, and later answers each number with a Basic.Ack or Basic.Nack.
//! [`DeliveryTracker`] keeps the table of numbers sent on the current channel that
//! are still waiting for that answer.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, ShortString};
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};
use tracing::{error, warn};

/// Per-channel delivery number assigned by the broker.
pub type DeliveryTag = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationKind {
    Ack,
    Nack,
}

/// A Basic.Ack / Basic.Nack frame as received from the broker.
///
/// With `multiple` set the frame covers every outstanding delivery number up to and
/// including `delivery_tag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationFrame {
    pub delivery_tag: DeliveryTag,
    pub multiple: bool,
    pub kind: ConfirmationKind,
}

impl ConfirmationFrame {
    pub fn ack(delivery_tag: DeliveryTag, multiple: bool) -> ConfirmationFrame {
        ConfirmationFrame {
            delivery_tag,
            multiple,
            kind: ConfirmationKind::Ack,
        }
    }

    pub fn nack(delivery_tag: DeliveryTag, multiple: bool) -> ConfirmationFrame {
        ConfirmationFrame {
            delivery_tag,
            multiple,
            kind: ConfirmationKind::Nack,
        }
    }
}

/// A message handed to the channel that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelivery {
    pub delivery_tag: DeliveryTag,
    pub generation: u64,
    pub message_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
    /// How many times this payload was republished after a rejection
    pub attempts: u32,
    pub published_at: Instant,
}

impl PendingDelivery {
    pub fn age(&self) -> Duration {
        self.published_at.elapsed()
    }
}

/// Outstanding-delivery table of a single channel generation.
///
/// The table only ever holds numbers sent on the current generation; switching to a
/// new generation empties it because the broker restarts numbering at 1.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    generation: u64,
    last_tag: DeliveryTag,
    outstanding: BTreeMap<DeliveryTag, PendingDelivery>,
}

impl DeliveryTracker {
    pub fn new() -> DeliveryTracker {
        DeliveryTracker::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn contains(&self, tag: DeliveryTag) -> bool {
        self.outstanding.contains_key(&tag)
    }

    pub fn tags(&self) -> Vec<DeliveryTag> {
        self.outstanding.keys().copied().collect()
    }

    /// Moves the table to `generation` and returns whatever the previous channel
    /// left unconfirmed.
    pub fn reset(&mut self, generation: u64) -> Vec<PendingDelivery> {
        self.generation = generation;
        self.last_tag = 0;
        self.drain()
    }

    /// Removes every entry, e.g. when the channel is torn down.
    pub fn drain(&mut self) -> Vec<PendingDelivery> {
        std::mem::take(&mut self.outstanding).into_values().collect()
    }

    /// Records a delivery the channel just accepted.
    ///
    /// Fails when the delivery belongs to another generation or when its number does
    /// not strictly follow the last recorded one.
    pub fn record(&mut self, delivery: PendingDelivery) -> Result<(), AmqpError> {
        if delivery.generation != self.generation {
            error!(
                generation = delivery.generation,
                current = self.generation,
                "refusing delivery of a stale channel"
            );
            return Err(AmqpError::ChannelUnavailable);
        }

        if delivery.delivery_tag <= self.last_tag {
            error!(
                delivery_tag = delivery.delivery_tag,
                last_tag = self.last_tag,
                "delivery numbers must increase"
            );
            return Err(AmqpError::InternalError);
        }

        self.last_tag = delivery.delivery_tag;
        self.outstanding.insert(delivery.delivery_tag, delivery);
        Ok(())
    }

    /// Removes the entries a confirmation frame covers.
    ///
    /// Returns `None` for frames of another generation, which must not touch the table.
    pub fn resolve(
        &mut self,
        generation: u64,
        frame: &ConfirmationFrame,
    ) -> Option<Vec<PendingDelivery>> {
        if generation != self.generation {
            return None;
        }

        if !frame.multiple {
            return Some(match self.outstanding.remove(&frame.delivery_tag) {
                Some(delivery) => vec![delivery],
                None => {
                    warn!(
                        delivery_tag = frame.delivery_tag,
                        "confirmation for an unknown delivery"
                    );
                    vec![]
                }
            });
        }

        let rest = match frame.delivery_tag.checked_add(1) {
            Some(bound) => self.outstanding.split_off(&bound),
            None => BTreeMap::new(),
        };
        let covered = std::mem::replace(&mut self.outstanding, rest);

        Some(covered.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(generation: u64, tag: DeliveryTag) -> PendingDelivery {
        PendingDelivery {
            delivery_tag: tag,
            generation,
            message_id: format!("msg-{tag}"),
            exchange: "orders".into(),
            routing_key: "orders.new".into(),
            payload: br#"{"id":1}"#.to_vec(),
            headers: BTreeMap::new(),
            attempts: 0,
            published_at: Instant::now(),
        }
    }

    fn tracker_with(generation: u64, tags: &[DeliveryTag]) -> DeliveryTracker {
        let mut tracker = DeliveryTracker::new();
        tracker.reset(generation);
        for tag in tags {
            tracker.record(delivery(generation, *tag)).unwrap();
        }
        tracker
    }

    #[test]
    fn single_ack_removes_exactly_the_match() {
        let mut tracker = tracker_with(1, &[1, 2, 3]);

        let resolved = tracker.resolve(1, &ConfirmationFrame::ack(2, false)).unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].delivery_tag, 2);
        assert_eq!(tracker.tags(), vec![1, 3]);
    }

    #[test]
    fn multiple_ack_covers_the_range_including_its_boundary() {
        let mut tracker = tracker_with(1, &[2, 3, 5, 8]);

        let resolved = tracker.resolve(1, &ConfirmationFrame::ack(5, true)).unwrap();

        let tags: Vec<_> = resolved.iter().map(|d| d.delivery_tag).collect();
        assert_eq!(tags, vec![2, 3, 5]);
        assert_eq!(tracker.tags(), vec![8]);
    }

    #[test]
    fn multiple_nack_at_max_tag_empties_the_table() {
        let mut tracker = tracker_with(1, &[1, 2]);

        let resolved = tracker
            .resolve(1, &ConfirmationFrame::nack(DeliveryTag::MAX, true))
            .unwrap();

        assert_eq!(resolved.len(), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn unknown_tag_resolves_nothing() {
        let mut tracker = tracker_with(1, &[1]);

        let resolved = tracker.resolve(1, &ConfirmationFrame::ack(9, false)).unwrap();

        assert!(resolved.is_empty());
        assert!(tracker.contains(1));
    }

    #[test]
    fn stale_generation_frames_are_ignored() {
        let mut tracker = tracker_with(2, &[1]);

        assert!(tracker.resolve(1, &ConfirmationFrame::ack(1, true)).is_none());
        assert!(tracker.contains(1));
    }

    #[test]
    fn reset_discards_previous_channel_entries() {
        let mut tracker = tracker_with(1, &[1, 2, 3]);

        let discarded = tracker.reset(2);

        assert_eq!(discarded.len(), 3);
        assert!(tracker.is_empty());
        assert_eq!(tracker.generation(), 2);
        tracker.record(delivery(2, 1)).unwrap();
        assert_eq!(tracker.tags(), vec![1]);
    }

    #[test]
    fn record_rejects_stale_and_non_increasing_tags() {
        let mut tracker = tracker_with(2, &[4]);

        assert_eq!(
            tracker.record(delivery(1, 5)),
            Err(AmqpError::ChannelUnavailable)
        );
        assert_eq!(tracker.record(delivery(2, 4)), Err(AmqpError::InternalError));
        assert_eq!(tracker.record(delivery(2, 3)), Err(AmqpError::InternalError));
        assert_eq!(tracker.tags(), vec![4]);
    }

    #[test]
    fn removed_entries_are_not_resurrected_by_a_later_ack() {
        let mut tracker = tracker_with(1, &[1, 2]);

        let drained = tracker.drain();
        assert_eq!(drained.len(), 2);

        let resolved = tracker.resolve(1, &ConfirmationFrame::ack(2, true)).unwrap();
        assert!(resolved.is_empty());
        assert!(tracker.is_empty());
    }
}
