//! Per-connection quota tracker
//!
//! One tracker belongs to each connection and counts what *other* users
//! have queued into it, plus the requests the connection itself is waiting
//! on.
//!
//! Message tiers:
//! - while the queue holds fewer than `max_msgs_unaccounted` entries, a
//!   message is charged to nobody ([`Charge::Unaccounted`]);
//! - past that depth every message is charged to its sending user, who may
//!   hold at most `max_msgs_per_user` accounted messages.
//!
//! User messages are additionally bounded by `max_msgs`. Notifications are
//! admitted only while the total queue depth is below `max_msgs`; the caller
//! decides what to evict when they are refused.

use crate::{MessageCount, PoolBytes, QuotaError, QuotaLimits, QuotaScope};
use bus_types::UserId;
use std::collections::HashMap;
use std::fmt;

/// What a reservation is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// A user message sent on behalf of this user
    Message(UserId),
    /// A kernel-generated notification
    Notification,
    /// A reply-expecting request opened by the tracker's own connection
    PendingReply,
}

/// Receipt for a successful reservation
///
/// Handed back to [`QuotaTracker::release`] exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    Unaccounted,
    Accounted(UserId),
    Notification,
    PendingReply,
}

impl Charge {
    /// Returns whether the charge occupies a queue slot
    pub fn is_queued(&self) -> bool {
        !matches!(self, Charge::PendingReply)
    }
}

/// Snapshot of a tracker's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaUsage {
    pub queued: MessageCount,
    pub user_messages: MessageCount,
    pub notifications: MessageCount,
    pub pending_replies: MessageCount,
}

impl fmt::Display for QuotaUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QuotaUsage[queued={}, user={}, notify={}, replies={}]",
            self.queued.0, self.user_messages.0, self.notifications.0, self.pending_replies.0
        )
    }
}

/// Quota counters for one connection
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    limits: QuotaLimits,
    user_messages: MessageCount,
    notifications: MessageCount,
    accounted: HashMap<UserId, MessageCount>,
    pending_replies: MessageCount,
}

impl QuotaTracker {
    /// Creates a tracker with the given limits
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            user_messages: MessageCount::zero(),
            notifications: MessageCount::zero(),
            accounted: HashMap::new(),
            pending_replies: MessageCount::zero(),
        }
    }

    /// Returns the configured limits
    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    /// Total queue depth, user messages and notifications together
    pub fn queued(&self) -> MessageCount {
        self.user_messages.saturating_add(self.notifications)
    }

    /// Accounted messages currently charged to `user`
    pub fn accounted_for(&self, user: UserId) -> MessageCount {
        self.accounted.get(&user).copied().unwrap_or_default()
    }

    /// Outstanding reply-expecting requests
    pub fn pending_replies(&self) -> MessageCount {
        self.pending_replies
    }

    /// Returns whether the queue is at the depth where notifications are refused
    pub fn notifications_under_pressure(&self) -> bool {
        self.queued() >= self.limits.max_msgs
    }

    /// Checks a payload against the size ceiling
    pub fn check_payload(&self, size: PoolBytes) -> Result<(), QuotaError> {
        if size > self.limits.max_payload_size {
            return Err(QuotaError::PayloadTooLarge {
                size,
                limit: self.limits.max_payload_size,
            });
        }
        Ok(())
    }

    /// Reserves quota for one item
    pub fn reserve(&mut self, kind: QuotaKind) -> Result<Charge, QuotaError> {
        match kind {
            QuotaKind::Message(user) => self.reserve_message(user),
            QuotaKind::Notification => {
                if self.notifications_under_pressure() {
                    return Err(QuotaError::QuotaExceeded {
                        scope: QuotaScope::Connection,
                        limit: self.limits.max_msgs,
                    });
                }
                self.notifications.increment();
                Ok(Charge::Notification)
            }
            QuotaKind::PendingReply => {
                if self.pending_replies >= self.limits.max_pending_replies {
                    return Err(QuotaError::TooManyLinks {
                        limit: self.limits.max_pending_replies,
                    });
                }
                self.pending_replies.increment();
                Ok(Charge::PendingReply)
            }
        }
    }

    fn reserve_message(&mut self, user: UserId) -> Result<Charge, QuotaError> {
        if self.user_messages >= self.limits.max_msgs {
            return Err(QuotaError::QuotaExceeded {
                scope: QuotaScope::Connection,
                limit: self.limits.max_msgs,
            });
        }

        if self.queued() < self.limits.max_msgs_unaccounted {
            self.user_messages.increment();
            return Ok(Charge::Unaccounted);
        }

        let held = self.accounted.entry(user).or_default();
        if *held >= self.limits.max_msgs_per_user {
            return Err(QuotaError::QuotaExceeded {
                scope: QuotaScope::User(user),
                limit: self.limits.max_msgs_per_user,
            });
        }
        held.increment();
        self.user_messages.increment();
        Ok(Charge::Accounted(user))
    }

    /// Returns a charge previously handed out by [`reserve`](Self::reserve)
    pub fn release(&mut self, charge: Charge) {
        match charge {
            Charge::Unaccounted => self.user_messages.decrement(),
            Charge::Accounted(user) => {
                self.user_messages.decrement();
                if let Some(held) = self.accounted.get_mut(&user) {
                    held.decrement();
                    if held.is_zero() {
                        self.accounted.remove(&user);
                    }
                }
            }
            Charge::Notification => self.notifications.decrement(),
            Charge::PendingReply => self.pending_replies.decrement(),
        }
    }

    /// Returns a snapshot of all counters
    pub fn usage(&self) -> QuotaUsage {
        QuotaUsage {
            queued: self.queued(),
            user_messages: self.user_messages,
            notifications: self.notifications,
            pending_replies: self.pending_replies,
        }
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(QuotaLimits::default())
    }
}
