//! Quota audit log
//!
//! Test-visible record of what happened to messages on their way through
//! the bus:
//! - Deliveries into a destination queue
//! - Rejections by the message, reply or pool quota
//! - Notifications lost under pressure
//! - Reply requests that timed out or lost their replier
//!
//! The log is deterministic and queryable in tests. It never affects
//! enforcement.

use bus_api::Instant;
use bus_types::{ConnectionId, Cookie};
use serde::{Deserialize, Serialize};

/// Audited bus event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaEvent {
    /// A message was queued; `src` is `None` for notifications
    MessageQueued {
        src: Option<ConnectionId>,
        dst: ConnectionId,
        offset: u64,
        size: u64,
    },

    /// A send was refused by a quota or the pool
    QuotaRejected {
        src: ConnectionId,
        dst: ConnectionId,
        reason: String,
    },

    /// A broadcast skipped a destination that refused it
    BroadcastSkipped {
        src: ConnectionId,
        dst: ConnectionId,
        reason: String,
    },

    /// A notification was lost; `evicted` if an older one made room
    NotificationDropped { dst: ConnectionId, evicted: bool },

    /// A received slice was released
    SliceReleased { conn: ConnectionId, offset: u64 },

    /// A reply-expecting request passed its deadline
    ReplyTimedOut {
        waiter: ConnectionId,
        replier: ConnectionId,
        cookie: Cookie,
    },

    /// The replier of a pending request went away
    ReplierDied {
        waiter: ConnectionId,
        replier: ConnectionId,
        cookie: Cookie,
    },
}

impl QuotaEvent {
    /// Connection whose queue or pool the event concerns
    pub fn connection(&self) -> ConnectionId {
        match self {
            QuotaEvent::MessageQueued { dst, .. }
            | QuotaEvent::QuotaRejected { dst, .. }
            | QuotaEvent::BroadcastSkipped { dst, .. }
            | QuotaEvent::NotificationDropped { dst, .. } => *dst,
            QuotaEvent::SliceReleased { conn, .. } => *conn,
            QuotaEvent::ReplyTimedOut { waiter, .. } | QuotaEvent::ReplierDied { waiter, .. } => {
                *waiter
            }
        }
    }
}

/// Audit entry with timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAuditEntry {
    pub timestamp: Instant,
    pub event: QuotaEvent,
}

/// Quota audit log
#[derive(Debug, Default)]
pub struct QuotaAuditLog {
    entries: Vec<QuotaAuditEntry>,
}

impl QuotaAuditLog {
    /// Creates a new empty audit log
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event
    pub fn record_event(&mut self, timestamp: Instant, event: QuotaEvent) {
        self.entries.push(QuotaAuditEntry { timestamp, event });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns all entries
    pub fn get_entries(&self) -> &[QuotaAuditEntry] {
        &self.entries
    }

    /// Checks if any entry matches a predicate
    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&QuotaEvent) -> bool,
    {
        self.entries.iter().any(|entry| predicate(&entry.event))
    }

    /// Counts events matching a predicate
    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&QuotaEvent) -> bool,
    {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.event))
            .count()
    }

    /// Finds entries concerning one connection
    pub fn entries_for_connection(&self, conn: ConnectionId) -> Vec<&QuotaAuditEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.event.connection() == conn)
            .collect()
    }

    /// Clears all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
