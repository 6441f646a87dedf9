//! Per-connection message queue.
//!
//! Keeps pending entries in insertion order and in priority order at the
//! same time. Entries are numbered with a monotonically increasing sequence
//! number, which also breaks ties between equal priorities.
//!
//! The queue only orders entries. Quota charges and pool slices travel
//! with each entry and are settled by the owning connection.

use bus_types::{MessageHeader, Priority};
use quota::Charge;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Queue error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Queue is empty")]
    Empty,

    #[error("No queued message at or below priority {ceiling}")]
    NothingEligible { ceiling: i64 },
}

/// Which entry a dequeue picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSelector {
    /// Oldest entry first
    Fifo,
    /// Lowest priority value not above the ceiling, oldest first on ties
    Priority(Priority),
}

/// One pending message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub seq: u64,
    pub header: MessageHeader,
    /// Slice offset in the owning connection's pool
    pub offset: u64,
    pub size: u64,
    pub charge: Charge,
}

impl QueueEntry {
    pub fn is_notification(&self) -> bool {
        self.header.is_notification()
    }
}

/// Ordered queue of pending messages.
#[derive(Debug, Clone, Default)]
pub struct MessageQueue {
    next_seq: u64,
    entries: BTreeMap<u64, QueueEntry>,
    by_priority: BTreeSet<(Priority, u64)>,
    notifications: BTreeSet<u64>,
    dropped: u64,
}

impl MessageQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of queued notifications.
    pub fn notification_count(&self) -> usize {
        self.notifications.len()
    }

    /// Appends an entry and returns its sequence number.
    pub fn push(&mut self, header: MessageHeader, offset: u64, size: u64, charge: Charge) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.by_priority.insert((header.priority, seq));
        if header.is_notification() {
            self.notifications.insert(seq);
        }
        self.entries.insert(
            seq,
            QueueEntry {
                seq,
                header,
                offset,
                size,
                charge,
            },
        );
        seq
    }

    /// Returns the sequence number `pop(selector)` would remove.
    pub fn peek(&self, selector: QueueSelector) -> Result<u64, QueueError> {
        match selector {
            QueueSelector::Fifo => self
                .entries
                .keys()
                .next()
                .copied()
                .ok_or(QueueError::Empty),
            QueueSelector::Priority(ceiling) => match self.by_priority.iter().next() {
                None => Err(QueueError::Empty),
                Some((priority, seq)) if *priority <= ceiling => Ok(*seq),
                Some(_) => Err(QueueError::NothingEligible {
                    ceiling: ceiling.value(),
                }),
            },
        }
    }

    /// Returns the entry `pop(selector)` would remove, leaving it queued.
    pub fn peek_entry(&self, selector: QueueSelector) -> Result<&QueueEntry, QueueError> {
        let seq = self.peek(selector)?;
        self.entries.get(&seq).ok_or(QueueError::Empty)
    }

    /// Removes the entry chosen by `selector`.
    pub fn pop(&mut self, selector: QueueSelector) -> Result<QueueEntry, QueueError> {
        let seq = self.peek(selector)?;
        self.remove(seq).ok_or(QueueError::Empty)
    }

    /// Removes the entry with sequence number `seq`.
    pub fn remove(&mut self, seq: u64) -> Option<QueueEntry> {
        let entry = self.entries.remove(&seq)?;
        self.by_priority.remove(&(entry.header.priority, seq));
        self.notifications.remove(&seq);
        Some(entry)
    }

    /// Removes the oldest queued notification, if any.
    pub fn evict_oldest_notification(&mut self) -> Option<QueueEntry> {
        let seq = self.notifications.iter().next().copied()?;
        self.remove(seq)
    }

    /// Counts one lost notification.
    pub fn record_dropped(&mut self) {
        self.dropped = self.dropped.saturating_add(1);
    }

    /// Notifications lost since the last successful receive.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Returns and resets the lost-notification count.
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }

    /// Removes every entry in insertion order.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.by_priority.clear();
        self.notifications.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
