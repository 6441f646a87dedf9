//! Bus Scenario Test Utilities
//!
//! This crate provides shared helpers for the bus integration scenarios.
//!
//! ## Test Philosophy
//!
//! - **Receivers stay protected**: no sender can exhaust another
//!   connection's queue, pool or reply slots
//! - **Errno fidelity**: every refusal surfaces as the kdbus errno
//! - **Deterministic time**: reply deadlines fire only when a test advances
//!   the simulated clock

use bus_api::{BusApi, BusError, Duration, ReceiveHandle, ReceiveRequest, SendRequest, Wait};
use bus_types::{ConnectionId, Cookie, UserId};
use sim_bus::{Bus, BusConfig};

/// The uid every scenario connection runs under unless stated otherwise
pub const TEST_USER: UserId = UserId::new(1000);

/// Creates a simulated bus with the default kdbus limits
pub fn test_bus() -> Bus {
    test_bus_with(BusConfig::default())
}

/// Creates a simulated bus with a custom configuration
pub fn test_bus_with(config: BusConfig) -> Bus {
    Bus::simulated(config).expect("test configuration is valid")
}

/// Registers a connection for [`TEST_USER`]
pub fn hello(bus: &Bus) -> ConnectionId {
    bus.hello(TEST_USER).expect("hello succeeds")
}

/// Sends a plain message with `cookie` from `src` to `dst`
pub fn send_msg(
    bus: &Bus,
    src: ConnectionId,
    dst: ConnectionId,
    cookie: u64,
) -> Result<(), BusError> {
    bus.send(src, SendRequest::unicast(dst).with_cookie(Cookie::new(cookie)))
}

/// Sends a reply-expecting message
pub fn send_request(
    bus: &Bus,
    src: ConnectionId,
    dst: ConnectionId,
    cookie: u64,
    timeout: Duration,
) -> Result<(), BusError> {
    bus.send(
        src,
        SendRequest::unicast(dst)
            .with_cookie(Cookie::new(cookie))
            .expect_reply(timeout),
    )
}

/// Receives one message in FIFO order and releases its slice
pub fn recv_and_release(bus: &Bus, conn: ConnectionId) -> Result<ReceiveHandle, BusError> {
    let handle = bus.receive(conn, ReceiveRequest::fifo())?;
    bus.release(conn, handle.offset)?;
    Ok(handle)
}

/// Receives with a wall-time timeout
pub fn recv_timeout(
    bus: &Bus,
    conn: ConnectionId,
    timeout: Duration,
) -> Result<ReceiveHandle, BusError> {
    bus.receive(
        conn,
        ReceiveRequest::fifo().with_wait(Wait::Timeout(timeout)),
    )
}

/// Sends plain messages until the first failure, returning how many got through
pub fn fill_queue(
    bus: &Bus,
    src: ConnectionId,
    dst: ConnectionId,
    max: usize,
) -> (usize, Option<BusError>) {
    for sent in 0..max {
        if let Err(err) = send_msg(bus, src, dst, sent as u64 + 1) {
            return (sent, Some(err));
        }
    }
    (max, None)
}

/// Receives and releases until the queue reports empty
pub fn drain(bus: &Bus, conn: ConnectionId) -> usize {
    let mut count = 0;
    while recv_and_release(bus, conn).is_ok() {
        count += 1;
    }
    count
}
