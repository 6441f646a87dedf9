//! Unique identifiers for bus entities

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a bus connection
///
/// Ids are handed out by the bus at registration, start at 1 and are never
/// reused for the lifetime of a bus. Ordering matters: locks on two
/// connections are always taken in ascending id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a connection id from its raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

/// Opaque identity of the user a connection sends on behalf of
///
/// Supplied by the registration collaborator. Several connections may share
/// one user; per-user quota is charged across all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(u32);

impl UserId {
    /// Creates a user id from its raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id value
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User({})", self.0)
    }
}

/// Caller-chosen correlation id attached to a sent message
///
/// A cookie of zero means "unset"; a message that expects a reply must carry
/// a non-zero cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Cookie(u64);

impl Cookie {
    /// The unset cookie
    pub const NONE: Cookie = Cookie(0);

    /// Creates a cookie from its raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw cookie value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns whether the cookie is unset
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
