//! Basic Messaging Integration Tests
//!
//! These tests validate the point-to-point and broadcast paths:
//! - Broadcasts never loop back to their sender
//! - Reply-expecting sends need a cookie and a timeout
//! - Replies without a matching request are refused
//! - Received slices are released exactly once

use bus_api::{BusApi, BusError, Duration, Errno, ReceiveRequest, SendRequest};
use bus_types::{Cookie, MatchRule, MessageFlags};
use sim_bus::QuotaEvent;
use tests_bus::{hello, recv_timeout, test_bus};

const COOKIE: u64 = 0x1234abcd5678eeff;

// ============================================================================
// Test A: Broadcast delivery
// ============================================================================

#[test]
fn test_broadcast_skips_sender() {
    let bus = test_bus();
    let sender = hello(&bus);
    let conn = hello(&bus);

    bus.add_match(conn, MatchRule::all()).unwrap();
    bus.add_match(sender, MatchRule::all()).unwrap();

    bus.send(sender, SendRequest::broadcast().with_cookie(Cookie::new(COOKIE)))
        .unwrap();

    // Make sure that we do not get our own broadcasts
    let err = bus.receive(sender, ReceiveRequest::fifo()).unwrap_err();
    assert_eq!(err.errno(), Errno::EAGAIN);

    // ... and receive on the 2nd
    let handle = recv_timeout(&bus, conn, Duration::from_millis(100)).unwrap();
    assert_eq!(handle.header.cookie, Cookie::new(COOKIE));
    assert!(handle.header.is_broadcast());
    assert_eq!(handle.header.src, Some(sender));

    bus.release(conn, handle.offset).unwrap();
}

#[test]
fn test_broadcast_requires_subscription() {
    let bus = test_bus();
    let sender = hello(&bus);
    let subscribed = hello(&bus);
    let silent = hello(&bus);
    bus.add_match(subscribed, MatchRule::broadcasts()).unwrap();

    bus.send(sender, SendRequest::broadcast().with_cookie(Cookie::new(1)))
        .unwrap();

    assert!(bus.receive(subscribed, ReceiveRequest::fifo()).is_ok());
    assert_eq!(
        bus.receive(silent, ReceiveRequest::fifo()),
        Err(BusError::WouldBlock)
    );
}

#[test]
fn test_broadcast_cannot_expect_reply() {
    let bus = test_bus();
    let sender = hello(&bus);
    let err = bus
        .send(
            sender,
            SendRequest::broadcast()
                .with_cookie(Cookie::new(1))
                .expect_reply(Duration::from_secs(1)),
        )
        .unwrap_err();
    assert_eq!(err.errno(), Errno::EINVAL);
}

#[test]
fn test_broadcast_skips_full_destination() {
    let bus = test_bus();
    let sender = hello(&bus);
    let full = hello(&bus);
    let open = hello(&bus);
    bus.add_match(full, MatchRule::broadcasts()).unwrap();
    bus.add_match(open, MatchRule::broadcasts()).unwrap();

    // Exhaust the sender's share of `full` with unicast traffic
    let mut cookie = 0;
    loop {
        cookie += 1;
        if bus
            .send(sender, SendRequest::unicast(full).with_cookie(Cookie::new(cookie)))
            .is_err()
        {
            break;
        }
    }

    bus.send(sender, SendRequest::broadcast().with_cookie(Cookie::new(999)))
        .expect("broadcast succeeds even if one destination refuses it");

    let handle = bus.receive(open, ReceiveRequest::fifo()).unwrap();
    assert_eq!(handle.header.cookie, Cookie::new(999));
    assert!(bus
        .audit()
        .has_event(|e| matches!(e, QuotaEvent::BroadcastSkipped { dst, .. } if *dst == full)));
}

// ============================================================================
// Test B: Reply validation
// ============================================================================

#[test]
fn test_expect_reply_needs_cookie_and_timeout() {
    let bus = test_bus();
    let sender = hello(&bus);
    let conn = hello(&bus);

    // Msgs that expect a reply must have timeout and cookie
    let mut request = SendRequest::unicast(conn);
    request.flags = MessageFlags::EXPECT_REPLY;
    assert_eq!(bus.send(sender, request).unwrap_err().errno(), Errno::EINVAL);

    let no_cookie = SendRequest::unicast(conn).expect_reply(Duration::from_secs(1));
    assert_eq!(bus.send(sender, no_cookie).unwrap_err().errno(), Errno::EINVAL);

    let no_timeout = SendRequest::unicast(conn)
        .with_cookie(Cookie::new(1))
        .expect_reply(Duration::ZERO);
    assert_eq!(bus.send(sender, no_timeout).unwrap_err().errno(), Errno::EINVAL);

    // Nothing was queued by the refused sends
    assert_eq!(
        bus.receive(conn, ReceiveRequest::fifo()),
        Err(BusError::WouldBlock)
    );
}

#[test]
fn test_faked_reply_rejected() {
    let bus = test_bus();
    let sender = hello(&bus);
    let conn = hello(&bus);

    // Faked replies with a valid reply cookie are rejected
    let err = bus
        .reply(conn, Cookie::new(COOKIE ^ 0x5a5a), sender, Vec::new())
        .unwrap_err();
    assert!(matches!(err, BusError::PermissionDenied(_)));
    assert_eq!(err.errno(), Errno::EPERM);
}

#[test]
fn test_reply_only_from_addressed_connection() {
    let bus = test_bus();
    let waiter = hello(&bus);
    let replier = hello(&bus);
    let intruder = hello(&bus);

    bus.send(
        waiter,
        SendRequest::unicast(replier)
            .with_cookie(Cookie::new(77))
            .expect_reply(Duration::from_secs(1)),
    )
    .unwrap();

    let err = bus
        .reply(intruder, Cookie::new(77), waiter, Vec::new())
        .unwrap_err();
    assert_eq!(err.errno(), Errno::EPERM);

    bus.reply(replier, Cookie::new(77), waiter, b"done".to_vec())
        .unwrap();
    let handle = bus.receive(waiter, ReceiveRequest::fifo()).unwrap();
    assert_eq!(handle.header.src, Some(replier));
    assert_eq!(bus.read(waiter, handle.offset).unwrap().payload, b"done");

    // A second reply to the same request is unsolicited
    let err = bus
        .reply(replier, Cookie::new(77), waiter, Vec::new())
        .unwrap_err();
    assert_eq!(err.errno(), Errno::EPERM);
}

// ============================================================================
// Test C: Slice release
// ============================================================================

#[test]
fn test_release_once() {
    let bus = test_bus();
    let a = hello(&bus);
    let b = hello(&bus);

    bus.send(
        b,
        SendRequest::unicast(a)
            .with_cookie(Cookie::new(1))
            .with_payload(vec![7u8; 100]),
    )
    .unwrap();
    let handle = bus.receive(a, ReceiveRequest::fifo()).unwrap();

    assert!(bus.read(a, handle.offset).is_ok());
    bus.release(a, handle.offset).unwrap();
    assert_eq!(bus.release(a, handle.offset), Err(BusError::NotFound(handle.offset)));
    assert_eq!(bus.read(a, handle.offset).unwrap_err().errno(), Errno::ENXIO);
}

#[test]
fn test_released_space_is_reused() {
    let bus = test_bus();
    let a = hello(&bus);
    let b = hello(&bus);

    bus.send(b, SendRequest::unicast(a).with_cookie(Cookie::new(1)))
        .unwrap();
    let first = bus.receive(a, ReceiveRequest::fifo()).unwrap();
    bus.release(a, first.offset).unwrap();

    bus.send(b, SendRequest::unicast(a).with_cookie(Cookie::new(2)))
        .unwrap();
    let second = bus.receive(a, ReceiveRequest::fifo()).unwrap();
    assert_eq!(first.offset, second.offset);
}

#[test]
fn test_cannot_release_queued_slice() {
    let bus = test_bus();
    let a = hello(&bus);
    let b = hello(&bus);

    bus.send(b, SendRequest::unicast(a).with_cookie(Cookie::new(1)))
        .unwrap();
    // The queued slice sits at offset 0 but was never received
    assert_eq!(bus.release(a, 0).unwrap_err().errno(), Errno::ENXIO);
}

#[test]
fn test_oversized_payload_rejected() {
    let bus = test_bus();
    let a = hello(&bus);
    let b = hello(&bus);
    let limit = bus.config().limits.max_payload_size.0 as usize;

    let err = bus
        .send(
            b,
            SendRequest::unicast(a)
                .with_cookie(Cookie::new(1))
                .with_payload(vec![0u8; limit + 1]),
        )
        .unwrap_err();
    assert_eq!(err.errno(), Errno::EINVAL);
}
