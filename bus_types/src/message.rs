//! Message headers and kinds

use crate::flags::MessageFlags;
use crate::ids::{ConnectionId, Cookie};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Receive priority of a message
///
/// Lower values are more urgent. A priority receive with ceiling `P` only
/// considers messages whose priority is `<= P`. Messages sent without an
/// explicit priority carry [`Priority::DEFAULT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Priority(pub i64);

impl Priority {
    /// Priority of messages sent without one
    pub const DEFAULT: Priority = Priority(0);

    /// Least urgent priority; used as the ceiling that admits everything
    pub const LOWEST: Priority = Priority(i64::MAX);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prio {}", self.0)
    }
}

/// Where a message is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// A single connection
    Unicast(ConnectionId),
    /// Every connection subscribed to broadcasts, except the sender
    Broadcast,
}

impl Destination {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }
}

/// Kernel-generated notification payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// A connection registered
    IdAdd { id: ConnectionId },
    /// A connection went away
    IdRemove { id: ConnectionId },
    /// A request with this cookie got no reply before its deadline
    ReplyTimeout { cookie: Cookie },
    /// The connection a request was addressed to went away before replying
    ReplyDead { cookie: Cookie },
}

/// What kind of message a queue entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Ordinary user payload
    Data,
    /// Reply correlated with an earlier request
    Reply { reply_cookie: Cookie },
    /// Kernel-generated notification
    Notification(NotificationKind),
}

/// Header stored in the pool next to every message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sending connection; `None` for kernel notifications
    pub src: Option<ConnectionId>,
    pub dst: Destination,
    pub cookie: Cookie,
    pub priority: Priority,
    pub flags: u64,
    pub kind: MessageKind,
}

impl MessageHeader {
    /// Header for a user message
    pub fn data(src: ConnectionId, dst: Destination, cookie: Cookie) -> Self {
        Self {
            src: Some(src),
            dst,
            cookie,
            priority: Priority::DEFAULT,
            flags: 0,
            kind: MessageKind::Data,
        }
    }

    /// Header for a reply to `reply_cookie`
    pub fn reply(src: ConnectionId, dst: ConnectionId, reply_cookie: Cookie) -> Self {
        Self {
            src: Some(src),
            dst: Destination::Unicast(dst),
            cookie: Cookie::NONE,
            priority: Priority::DEFAULT,
            flags: 0,
            kind: MessageKind::Reply { reply_cookie },
        }
    }

    /// Header for a kernel notification delivered to `dst`
    pub fn notification(dst: ConnectionId, kind: NotificationKind) -> Self {
        Self {
            src: None,
            dst: Destination::Unicast(dst),
            cookie: Cookie::NONE,
            priority: Priority::DEFAULT,
            flags: 0,
            kind: MessageKind::Notification(kind),
        }
    }

    /// Builder: sets the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: sets the message flags
    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags.bits();
        self
    }

    /// Returns the message flags
    pub fn message_flags(&self) -> MessageFlags {
        MessageFlags::from_bits_truncate(self.flags)
    }

    pub fn is_notification(&self) -> bool {
        matches!(self.kind, MessageKind::Notification(_))
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst.is_broadcast()
    }

    pub fn expects_reply(&self) -> bool {
        self.message_flags().contains(MessageFlags::EXPECT_REPLY)
    }

    /// Returns the notification payload, if this is a notification
    pub fn notification_kind(&self) -> Option<NotificationKind> {
        match self.kind {
            MessageKind::Notification(kind) => Some(kind),
            _ => None,
        }
    }
}
