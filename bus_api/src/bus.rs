//! Bus API trait and request types

use crate::{BusError, Duration};
use bus_types::{
    ConnectionId, Cookie, Destination, MatchRule, MessageFlags, MessageHeader, Priority,
    ReceiveFlags, ReturnFlags, UserId,
};

/// How long a receive may wait for an eligible message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// Fail with [`BusError::WouldBlock`] if nothing is eligible
    #[default]
    NonBlocking,
    /// Wait until a message arrives or the connection goes away
    Blocking,
    /// Wait at most the given duration, then fail with [`BusError::TimedOut`]
    Timeout(Duration),
}

/// A message to send
///
/// Built with [`SendRequest::unicast`] or [`SendRequest::broadcast`] and
/// refined with the `with_*` builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub dst: Destination,
    pub cookie: Cookie,
    pub flags: MessageFlags,
    /// Reply deadline relative to the send; only meaningful with
    /// [`MessageFlags::EXPECT_REPLY`]
    pub timeout: Duration,
    pub priority: Priority,
    pub payload: Vec<u8>,
}

impl SendRequest {
    /// Creates a request addressed to one connection
    pub fn unicast(dst: ConnectionId) -> Self {
        Self::to(Destination::Unicast(dst))
    }

    /// Creates a request addressed to every subscribed connection
    pub fn broadcast() -> Self {
        Self::to(Destination::Broadcast)
    }

    fn to(dst: Destination) -> Self {
        Self {
            dst,
            cookie: Cookie::NONE,
            flags: MessageFlags::empty(),
            timeout: Duration::ZERO,
            priority: Priority::DEFAULT,
            payload: Vec::new(),
        }
    }

    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Marks the request as expecting a reply within `timeout`
    pub fn expect_reply(mut self, timeout: Duration) -> Self {
        self.flags |= MessageFlags::EXPECT_REPLY;
        self.timeout = timeout;
        self
    }

    pub fn expects_reply(&self) -> bool {
        self.flags.contains(MessageFlags::EXPECT_REPLY)
    }
}

/// Parameters of a receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiveRequest {
    pub flags: ReceiveFlags,
    /// Priority ceiling, honoured with [`ReceiveFlags::USE_PRIORITY`]
    pub priority: Priority,
    pub wait: Wait,
}

impl ReceiveRequest {
    /// Non-blocking receive in insertion order
    pub fn fifo() -> Self {
        Self::default()
    }

    /// Non-blocking receive of the most urgent message at or below `ceiling`
    pub fn priority(ceiling: Priority) -> Self {
        Self {
            flags: ReceiveFlags::USE_PRIORITY,
            priority: ceiling,
            wait: Wait::NonBlocking,
        }
    }

    pub fn with_wait(mut self, wait: Wait) -> Self {
        self.wait = wait;
        self
    }
}

/// Result of a successful receive
///
/// The slice at `offset` stays allocated in the receiver's pool until
/// [`BusApi::release`] is called for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveHandle {
    pub offset: u64,
    pub size: u64,
    pub header: MessageHeader,
    /// Notifications lost since the previous successful receive
    pub dropped_count: u64,
    pub return_flags: ReturnFlags,
}

impl ReceiveHandle {
    pub fn dropped(&self) -> bool {
        self.return_flags.contains(ReturnFlags::DROPPED_MSGS)
    }
}

/// A received message read back from the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

/// The bus API trait
///
/// Every operation is addressed by the calling connection's id. The trait
/// takes `&self`; implementations synchronize internally so one bus can be
/// shared between threads.
///
/// # Example
///
/// ```ignore
/// let a = bus.hello(UserId::new(1000))?;
/// let b = bus.hello(UserId::new(1000))?;
/// bus.send(b, SendRequest::unicast(a).with_cookie(Cookie::new(1)))?;
/// let handle = bus.receive(a, ReceiveRequest::fifo())?;
/// bus.release(a, handle.offset)?;
/// ```
pub trait BusApi {
    /// Registers a new connection owned by `user`
    fn hello(&self, user: UserId) -> Result<ConnectionId, BusError>;

    /// Tears a connection down, dropping everything it holds
    fn bye(&self, conn: ConnectionId) -> Result<(), BusError>;

    /// Adds a subscription to a connection's match rules
    fn add_match(&self, conn: ConnectionId, rule: MatchRule) -> Result<(), BusError>;

    /// Sends a message
    ///
    /// All-or-nothing for unicast. Broadcasts skip destinations that refuse
    /// the message.
    fn send(&self, src: ConnectionId, request: SendRequest) -> Result<(), BusError>;

    /// Dequeues one message into the connection's pool
    fn receive(
        &self,
        conn: ConnectionId,
        request: ReceiveRequest,
    ) -> Result<ReceiveHandle, BusError>;

    /// Frees a received slice
    fn release(&self, conn: ConnectionId, offset: u64) -> Result<(), BusError>;

    /// Answers the request `reply_cookie` that `dst` sent to `conn`
    fn reply(
        &self,
        conn: ConnectionId,
        reply_cookie: Cookie,
        dst: ConnectionId,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Reads a received, unreleased slice
    fn read(&self, conn: ConnectionId, offset: u64) -> Result<Message, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_builder() {
        let request = SendRequest::unicast(ConnectionId::new(3))
            .with_cookie(Cookie::new(9))
            .with_priority(Priority::new(-5))
            .with_payload(b"hi".to_vec())
            .expect_reply(Duration::from_secs(1));
        assert_eq!(request.dst, Destination::Unicast(ConnectionId::new(3)));
        assert!(request.expects_reply());
        assert_eq!(request.timeout, Duration::from_secs(1));
        assert_eq!(request.payload, b"hi");
    }

    #[test]
    fn test_broadcast_defaults() {
        let request = SendRequest::broadcast();
        assert!(request.dst.is_broadcast());
        assert!(!request.expects_reply());
        assert_eq!(request.priority, Priority::DEFAULT);
    }

    #[test]
    fn test_receive_request_defaults_to_fifo() {
        let request = ReceiveRequest::fifo();
        assert!(request.flags.is_empty());
        assert_eq!(request.wait, Wait::NonBlocking);

        let request = ReceiveRequest::priority(Priority::new(-100))
            .with_wait(Wait::Timeout(Duration::from_millis(5)));
        assert!(request.flags.contains(ReceiveFlags::USE_PRIORITY));
        assert_eq!(request.priority, Priority::new(-100));
    }
}
