//! # Quota
//!
//! This crate provides the quota accounting primitives for the kbus
//! message queues.
//!
//! ## Philosophy
//!
//! - **Receivers are protected from senders**: a single user can never fill
//!   another connection's queue or pool on its own
//! - **Limits are enforced, not advisory**: every reservation returns a
//!   [`Charge`] that must be handed back on release
//! - **Accounting is deterministic and testable**: no clocks, no globals
//! - **Best-effort traffic never blocks real traffic**: kernel notifications
//!   are bounded separately and may be evicted
//!
//! ## Core Concepts
//!
//! - Units: [`MessageCount`], [`PoolBytes`]
//! - [`QuotaLimits`]: configured ceilings (defaults mirror kdbus)
//! - [`QuotaTracker`]: per-destination counters, keyed by sending user
//! - [`pool_share`]: the dynamic one-third fair-share rule for pool space
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - A memory allocator (see the pool in `sim_bus`)
//! - Process-wide accounting (every tracker belongs to one connection)

pub mod pool_share;
pub mod tracker;

#[cfg(test)]
mod tests_prop;

use bus_types::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use pool_share::{check_pool_share, PoolShareSnapshot};
pub use tracker::{Charge, QuotaKind, QuotaTracker, QuotaUsage};

/// Message count
///
/// Counts queued messages or outstanding requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MessageCount(pub u64);

impl MessageCount {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn increment(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    pub fn decrement(&mut self) {
        self.0 = self.0.saturating_sub(1);
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for MessageCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} messages", self.0)
    }
}

/// Pool bytes
///
/// Bytes of a connection's receive pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PoolBytes(pub u64);

impl PoolBytes {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for PoolBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

/// Quota limits
///
/// Immutable ceilings for one connection. The defaults are the kdbus values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    /// Queued user messages per connection, regardless of sender
    pub max_msgs: MessageCount,
    /// Queue depth below which messages are not charged to their user
    pub max_msgs_unaccounted: MessageCount,
    /// Accounted messages a single user may have queued
    pub max_msgs_per_user: MessageCount,
    /// Outstanding reply-expecting requests per connection
    pub max_pending_replies: MessageCount,
    /// A user may hold at most `1 / pool_share_divisor` of the free pool
    pub pool_share_divisor: u64,
    /// Largest payload a single message may carry
    pub max_payload_size: PoolBytes,
}

impl QuotaLimits {
    pub const DEFAULT_MAX_MSGS: u64 = 256;
    pub const DEFAULT_MAX_MSGS_UNACCOUNTED: u64 = 16;
    pub const DEFAULT_MAX_MSGS_PER_USER: u64 = 16;
    pub const DEFAULT_MAX_PENDING_REPLIES: u64 = 128;
    pub const DEFAULT_POOL_SHARE_DIVISOR: u64 = 3;
    pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 2 * 1024 * 1024;

    /// Builder: sets the per-connection message ceiling
    pub fn with_max_msgs(mut self, limit: MessageCount) -> Self {
        self.max_msgs = limit;
        self
    }

    /// Builder: sets the unaccounted tier size
    pub fn with_max_msgs_unaccounted(mut self, limit: MessageCount) -> Self {
        self.max_msgs_unaccounted = limit;
        self
    }

    /// Builder: sets the per-user accounted ceiling
    pub fn with_max_msgs_per_user(mut self, limit: MessageCount) -> Self {
        self.max_msgs_per_user = limit;
        self
    }

    /// Builder: sets the outstanding request ceiling
    pub fn with_max_pending_replies(mut self, limit: MessageCount) -> Self {
        self.max_pending_replies = limit;
        self
    }

    /// Builder: sets the pool fair-share divisor
    pub fn with_pool_share_divisor(mut self, divisor: u64) -> Self {
        self.pool_share_divisor = divisor;
        self
    }

    /// Builder: sets the payload size ceiling
    pub fn with_max_payload_size(mut self, limit: PoolBytes) -> Self {
        self.max_payload_size = limit;
        self
    }

    /// Most messages one user can have queued in one connection
    pub fn max_msgs_for_single_user(&self) -> MessageCount {
        self.max_msgs_unaccounted
            .saturating_add(self.max_msgs_per_user)
            .min(self.max_msgs)
    }

    /// Checks that the limits are internally consistent
    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.pool_share_divisor == 0 {
            return Err(QuotaError::InvalidLimits {
                reason: "pool_share_divisor must be non-zero".to_string(),
            });
        }
        if self.max_msgs.is_zero() {
            return Err(QuotaError::InvalidLimits {
                reason: "max_msgs must be non-zero".to_string(),
            });
        }
        if self.max_msgs_unaccounted > self.max_msgs {
            return Err(QuotaError::InvalidLimits {
                reason: "max_msgs_unaccounted exceeds max_msgs".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_msgs: MessageCount::new(Self::DEFAULT_MAX_MSGS),
            max_msgs_unaccounted: MessageCount::new(Self::DEFAULT_MAX_MSGS_UNACCOUNTED),
            max_msgs_per_user: MessageCount::new(Self::DEFAULT_MAX_MSGS_PER_USER),
            max_pending_replies: MessageCount::new(Self::DEFAULT_MAX_PENDING_REPLIES),
            pool_share_divisor: Self::DEFAULT_POOL_SHARE_DIVISOR,
            max_payload_size: PoolBytes::new(Self::DEFAULT_MAX_PAYLOAD_SIZE),
        }
    }
}

impl fmt::Display for QuotaLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QuotaLimits[msgs={}, unaccounted={}, per_user={}, replies={}, share=1/{}, payload={}]",
            self.max_msgs.0,
            self.max_msgs_unaccounted.0,
            self.max_msgs_per_user.0,
            self.max_pending_replies.0,
            self.pool_share_divisor,
            self.max_payload_size.0
        )
    }
}

/// Which ceiling a rejected message ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaScope {
    /// The connection-wide message ceiling
    Connection,
    /// The per-user accounted ceiling
    User(UserId),
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaScope::Connection => write!(f, "connection"),
            QuotaScope::User(user) => write!(f, "{}", user),
        }
    }
}

/// Quota-related errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("Message quota exceeded for {scope}: limit={limit}")]
    QuotaExceeded { scope: QuotaScope, limit: MessageCount },

    #[error("Too many pending replies: limit={limit}")]
    TooManyLinks { limit: MessageCount },

    #[error("Pool fair share exceeded: requested={requested}, allowed={allowed}")]
    OutOfPoolSpace { requested: PoolBytes, allowed: PoolBytes },

    #[error("Payload too large: size={size}, limit={limit}")]
    PayloadTooLarge { size: PoolBytes, limit: PoolBytes },

    #[error("Invalid quota limits: {reason}")]
    InvalidLimits { reason: String },
}
