//! # Simulated Bus
//!
//! This crate provides an in-process implementation of the bus API.
//!
//! ## Purpose
//!
//! The simulated bus runs the full message-queue and quota machinery
//! without a kernel:
//! - Runs under `cargo test`
//! - Thread-safe (one bus shared by many client threads)
//! - Deterministic time on demand ([`timer::SimClock`])
//! - Inspectable (queue, pool and quota state are readable in tests)
//!
//! ## Philosophy
//!
//! **Receivers are protected from senders.**
//!
//! Every byte and every queue slot a message occupies is charged against
//! the destination's quotas before the message becomes visible. Sends are
//! all-or-nothing: a failure at any step leaves no trace in either
//! connection.
//!
//! ## Structure
//!
//! - [`pool`]: per-connection receive pool
//! - [`message_queue`]: FIFO and priority ordering
//! - [`reply`]: outstanding reply expectations
//! - [`connection`]: the locked state tying them together
//! - [`quota_audit`]: test-visible record of quota decisions

pub mod config;
pub mod connection;
pub mod message_queue;
pub mod pool;
pub mod quota_audit;
pub mod reply;
pub mod timer;

pub use config::{BusConfig, ConfigError};
pub use connection::{Connection, ConnectionState, Delivery, Slot};
pub use message_queue::{MessageQueue, QueueEntry, QueueError, QueueSelector};
pub use pool::{Pool, PoolError};
pub use quota_audit::{QuotaAuditEntry, QuotaAuditLog, QuotaEvent};
pub use reply::{DeadlineIndex, PendingReply, ReplyError, ReplyTracker};
pub use timer::{BusClock, MonotonicClock, SimClock};

use bus_api::{
    BusApi, BusError, Duration, Instant, Message, ReceiveHandle, ReceiveRequest, SendRequest, Wait,
};
use bus_types::{
    ConnectionId, Cookie, Destination, MatchRule, MessageHeader, NotificationKind, ReceiveFlags,
    UserId,
};
use connection::{lock_pair, LockedPair};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Simulated bus
///
/// Holds the connection registry. Each connection carries its own lock;
/// the registry lock is only held to look connections up, add or remove
/// them.
pub struct Bus {
    config: BusConfig,
    clock: Arc<dyn BusClock>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    /// Connections with a reply deadline, earliest first
    deadlines: Mutex<DeadlineIndex>,
    /// Audit log for quota decisions (test-only)
    audit: Mutex<QuotaAuditLog>,
}

impl Bus {
    /// Creates a bus running on wall time
    pub fn new(config: BusConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Creates a bus whose time only moves through [`Bus::advance_time`]
    pub fn simulated(config: BusConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(SimClock::new()))
    }

    /// Creates a bus on the given clock
    pub fn with_clock(config: BusConfig, clock: Arc<dyn BusClock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            deadlines: Mutex::new(DeadlineIndex::new()),
            audit: Mutex::new(QuotaAuditLog::new()),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Returns the current bus time
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Advances bus time and fires every reply deadline that passed
    ///
    /// Only moves a simulated clock.
    pub fn advance_time(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.process_timeouts()
    }

    /// Returns a reference to the quota audit log
    pub fn audit(&self) -> MutexGuard<'_, QuotaAuditLog> {
        self.audit.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Runs `f` against a connection's locked state
    pub fn inspect<R>(
        &self,
        conn: ConnectionId,
        f: impl FnOnce(&ConnectionState) -> R,
    ) -> Result<R, BusError> {
        let conn = self.lookup(conn)?;
        let state = conn.lock();
        Ok(f(&state))
    }

    /// Expires reply expectations whose deadline passed
    ///
    /// Each expired request frees its reply slot and leaves a
    /// `ReplyTimeout` notification in the waiter's queue. Only connections
    /// with a due deadline are locked. Returns the number of expired
    /// requests.
    pub fn process_timeouts(&self) -> usize {
        let now = self.now();
        let mut total = 0;

        let due = self.deadlines.lock().take_due(now);
        for id in due {
            let conn = match self.lookup(id) {
                Ok(conn) => conn,
                Err(_) => continue,
            };
            let mut state = conn.lock();
            total += self.expire_due(&conn, &mut state, now);
            if let Some(next) = state.replies().next_deadline() {
                self.deadlines.lock().insert(next, id);
            }
        }
        total
    }

    /// Expires the due reply expectations of a locked connection
    fn expire_due(&self, conn: &Connection, state: &mut ConnectionState, now: Instant) -> usize {
        match state.replies().next_deadline() {
            Some(deadline) if deadline.has_elapsed(now) => {}
            _ => return 0,
        }
        let expired = state.expire_replies(conn.id(), now);
        conn.wake_all();

        let count = expired.len();
        for (pending, delivery) in expired {
            log::debug!(
                "reply {} from {} to {} timed out",
                pending.cookie,
                pending.replier,
                conn.id()
            );
            self.record(QuotaEvent::ReplyTimedOut {
                waiter: conn.id(),
                replier: pending.replier,
                cookie: pending.cookie,
            });
            self.record_notification(conn.id(), delivery);
        }
        count
    }

    fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection>, BusError> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(BusError::UnknownConnection(id))
    }

    /// All connections, lowest id first
    fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut conns: Vec<_> = self.connections.read().values().cloned().collect();
        conns.sort_by_key(|conn| conn.id());
        conns
    }

    fn record(&self, event: QuotaEvent) {
        let now = self.now();
        self.audit.lock().record_event(now, event);
    }

    fn record_notification(&self, dst: ConnectionId, delivery: Delivery) {
        match delivery {
            Delivery::Queued(slot) => self.record_queued(None, dst, slot),
            Delivery::EvictedOldest(slot) => {
                self.record(QuotaEvent::NotificationDropped { dst, evicted: true });
                self.record_queued(None, dst, slot);
            }
            Delivery::Dropped => {
                log::warn!("notification for {} lost under pressure", dst);
                self.record(QuotaEvent::NotificationDropped {
                    dst,
                    evicted: false,
                });
            }
        }
    }

    fn record_queued(&self, src: Option<ConnectionId>, dst: ConnectionId, slot: Slot) {
        self.record(QuotaEvent::MessageQueued {
            src,
            dst,
            offset: slot.offset,
            size: slot.size,
        });
    }

    fn check_payload(&self, payload: &[u8]) -> Result<(), BusError> {
        let limit = self.config.limits.max_payload_size;
        if payload.len() as u64 > limit.0 {
            return Err(BusError::InvalidArgument(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                limit
            )));
        }
        Ok(())
    }

    /// Queues a lifecycle notification in every subscribed connection
    /// except `about` itself
    fn notify_subscribers(&self, about: ConnectionId, kind: NotificationKind) {
        for conn in self.snapshot() {
            if conn.id() == about {
                continue;
            }
            let delivery = {
                let mut state = conn.lock();
                if !state.is_active() || !state.matches().wants_notification(&kind) {
                    continue;
                }
                state.enqueue_notification(conn.id(), kind)
            };
            conn.wake_all();
            self.record_notification(conn.id(), delivery);
        }
    }

    fn finish_send(
        &self,
        src: ConnectionId,
        dest: &Connection,
        outcome: Result<Slot, BusError>,
    ) -> Result<(), BusError> {
        match outcome {
            Ok(slot) => {
                dest.wake_all();
                self.record_queued(Some(src), dest.id(), slot);
                Ok(())
            }
            Err(err) => {
                log::debug!("send from {} to {} failed: {}", src, dest.id(), err);
                if matches!(
                    err,
                    BusError::QuotaExceeded(_)
                        | BusError::TooManyLinks(_)
                        | BusError::OutOfPoolSpace(_)
                ) {
                    self.record(QuotaEvent::QuotaRejected {
                        src,
                        dst: dest.id(),
                        reason: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    fn unicast(
        &self,
        sender: &Connection,
        dest: &Connection,
        request: SendRequest,
    ) -> Result<(), BusError> {
        let header = MessageHeader::data(sender.id(), request.dst, request.cookie)
            .with_priority(request.priority)
            .with_flags(request.flags);
        let deadline = request
            .expects_reply()
            .then(|| self.now() + request.timeout);
        let send = Delivering {
            user: sender.user(),
            replier: dest.id(),
            header,
            payload: request.payload,
            deadline,
        };

        let outcome = match lock_pair(sender, dest) {
            LockedPair::Same(mut state) => send.deliver(None, &mut state),
            LockedPair::Pair {
                mut first,
                mut second,
            } => {
                if first.is_active() {
                    send.deliver(Some(&mut *first), &mut second)
                } else {
                    Err(BusError::UnknownConnection(sender.id()))
                }
            }
        };
        if let (Ok(_), Some(deadline)) = (&outcome, deadline) {
            self.deadlines.lock().insert(deadline, sender.id());
        }
        self.finish_send(sender.id(), dest, outcome)
    }

    fn broadcast(&self, sender: &Connection, request: SendRequest) -> Result<(), BusError> {
        let header = MessageHeader::data(sender.id(), Destination::Broadcast, request.cookie)
            .with_priority(request.priority)
            .with_flags(request.flags);

        for dest in self.snapshot() {
            if dest.id() == sender.id() {
                continue;
            }
            let outcome = {
                let mut state = dest.lock();
                if !state.is_active() || !state.matches().broadcasts {
                    continue;
                }
                state.enqueue_message(sender.user(), header, request.payload.clone())
            };
            match outcome {
                Ok(slot) => {
                    dest.wake_all();
                    self.record_queued(Some(sender.id()), dest.id(), slot);
                }
                Err(err) => {
                    log::debug!("broadcast from {} skipped {}: {}", sender.id(), dest.id(), err);
                    self.record(QuotaEvent::BroadcastSkipped {
                        src: sender.id(),
                        dst: dest.id(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A unicast message on its way into the destination queue
struct Delivering {
    user: UserId,
    replier: ConnectionId,
    header: MessageHeader,
    payload: Vec<u8>,
    deadline: Option<Instant>,
}

impl Delivering {
    /// Opens the reply expectation, if any, then queues the message
    ///
    /// `waiter` is `None` when the sender addresses itself.
    fn deliver(
        self,
        mut waiter: Option<&mut ConnectionState>,
        dest: &mut ConnectionState,
    ) -> Result<Slot, BusError> {
        if !dest.is_active() {
            return Err(BusError::UnknownConnection(self.replier));
        }
        let cookie = self.header.cookie;

        if let Some(deadline) = self.deadline {
            match waiter.as_deref_mut() {
                Some(waiter) => waiter.open_reply(self.replier, cookie, deadline)?,
                None => dest.open_reply(self.replier, cookie, deadline)?,
            }
        }

        let result = dest.enqueue_message(self.user, self.header, self.payload);
        if result.is_err() && self.deadline.is_some() {
            match waiter {
                Some(waiter) => waiter.cancel_reply(self.replier, cookie),
                None => dest.cancel_reply(self.replier, cookie),
            }
        }
        result
    }
}

impl BusApi for Bus {
    fn hello(&self, user: UserId) -> Result<ConnectionId, BusError> {
        self.process_timeouts();

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(id, user, &self.config));
        self.connections.write().insert(id, conn);
        log::debug!("hello: {} for {}", id, user);

        self.notify_subscribers(id, NotificationKind::IdAdd { id });
        Ok(id)
    }

    fn bye(&self, id: ConnectionId) -> Result<(), BusError> {
        self.process_timeouts();

        let conn = self
            .connections
            .write()
            .remove(&id)
            .ok_or(BusError::UnknownConnection(id))?;
        conn.lock().teardown();
        conn.wake_all();

        for waiter in self.snapshot() {
            let dead = waiter.lock().forget_replier(waiter.id(), id);
            if dead.is_empty() {
                continue;
            }
            waiter.wake_all();
            for (pending, delivery) in dead {
                self.record(QuotaEvent::ReplierDied {
                    waiter: waiter.id(),
                    replier: id,
                    cookie: pending.cookie,
                });
                self.record_notification(waiter.id(), delivery);
            }
        }

        self.notify_subscribers(id, NotificationKind::IdRemove { id });
        log::debug!("bye: {}", id);
        Ok(())
    }

    fn add_match(&self, conn: ConnectionId, rule: MatchRule) -> Result<(), BusError> {
        let conn = self.lookup(conn)?;
        conn.lock().add_match(rule);
        Ok(())
    }

    fn send(&self, src: ConnectionId, request: SendRequest) -> Result<(), BusError> {
        self.process_timeouts();
        self.check_payload(&request.payload)?;

        if request.expects_reply() {
            if request.dst.is_broadcast() {
                return Err(BusError::InvalidArgument(
                    "broadcasts cannot expect a reply".to_string(),
                ));
            }
            if request.cookie.is_none() || request.timeout.is_zero() {
                return Err(BusError::InvalidArgument(
                    "reply-expecting messages need a cookie and a timeout".to_string(),
                ));
            }
        }

        let sender = self.lookup(src)?;
        match request.dst {
            Destination::Broadcast => self.broadcast(&sender, request),
            Destination::Unicast(dst) => {
                let dest = self.lookup(dst)?;
                self.unicast(&sender, &dest, request)
            }
        }
    }

    fn receive(
        &self,
        id: ConnectionId,
        request: ReceiveRequest,
    ) -> Result<ReceiveHandle, BusError> {
        self.process_timeouts();

        let conn = self.lookup(id)?;
        let selector = if request.flags.contains(ReceiveFlags::USE_PRIORITY) {
            QueueSelector::Priority(request.priority)
        } else {
            QueueSelector::Fifo
        };
        let deadline = match request.wait {
            Wait::Timeout(timeout) => std::time::Instant::now().checked_add(timeout.to_std()),
            _ => None,
        };

        let mut state = conn.lock();
        loop {
            if !state.is_active() {
                return Err(BusError::ConnectionClosed(id));
            }
            self.expire_due(&conn, &mut state, self.now());
            match state.dequeue(selector) {
                Err(BusError::WouldBlock) => {}
                result => return result,
            }

            match (request.wait, deadline) {
                (Wait::NonBlocking, _) => return Err(BusError::WouldBlock),
                (Wait::Timeout(_), Some(limit)) if std::time::Instant::now() >= limit => {
                    return Err(BusError::TimedOut)
                }
                _ => {}
            }

            // Wake up for our own reply deadlines as well
            let reply_due = state
                .replies()
                .next_deadline()
                .and_then(|due| self.clock.wall_deadline(due));
            let wake_at = match (deadline, reply_due) {
                (Some(limit), Some(due)) => Some(limit.min(due)),
                (limit, due) => limit.or(due),
            };
            conn.wait(&mut state, wake_at);
        }
    }

    fn release(&self, id: ConnectionId, offset: u64) -> Result<(), BusError> {
        let conn = self.lookup(id)?;
        conn.lock().release(offset)?;
        self.record(QuotaEvent::SliceReleased { conn: id, offset });
        Ok(())
    }

    fn reply(
        &self,
        id: ConnectionId,
        reply_cookie: Cookie,
        dst: ConnectionId,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.process_timeouts();
        self.check_payload(&payload)?;

        let replier = self.lookup(id)?;
        let waiter = self.lookup(dst)?;
        let header = MessageHeader::reply(id, dst, reply_cookie);

        let outcome = {
            let mut state = waiter.lock();
            if !state.is_active() {
                return Err(BusError::UnknownConnection(dst));
            }
            let pending = state.take_reply(id, reply_cookie)?;
            match state.enqueue_message(replier.user(), header, payload) {
                Ok(slot) => {
                    state.settle_reply(pending);
                    Ok(slot)
                }
                Err(err) => {
                    state.restore_reply(pending);
                    Err(err)
                }
            }
        };
        self.finish_send(id, &waiter, outcome)
    }

    fn read(&self, id: ConnectionId, offset: u64) -> Result<Message, BusError> {
        let conn = self.lookup(id)?;
        let state = conn.lock();
        let (header, payload) = state.pool().read(offset)?;
        Ok(Message {
            header: *header,
            payload: payload.to_vec(),
        })
    }
}
