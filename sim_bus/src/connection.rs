//! Connections and their locked state
//!
//! A [`Connection`] is one bus endpoint. Everything it owns (pool, queue,
//! quota counters, reply tracker, match rules) sits behind a single mutex,
//! so an entry and its pool slice always change together.
//!
//! Lock order: when two connections must be held at once, the lower
//! [`ConnectionId`] is locked first. See [`lock_pair`].

use crate::config::BusConfig;
use crate::message_queue::{MessageQueue, QueueEntry, QueueError, QueueSelector};
use crate::pool::{slice_size, Pool, PoolError};
use crate::reply::{PendingReply, ReplyError, ReplyTracker};
use bus_api::{BusError, Instant, ReceiveHandle};
use bus_types::{
    ConnectionId, Cookie, MatchRule, MessageHeader, NotificationKind, ReturnFlags, UserId,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use quota::{check_pool_share, PoolBytes, QuotaKind, QuotaTracker};

impl From<PoolError> for BusError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoSpace { .. } => BusError::OutOfPoolSpace(err.to_string()),
            PoolError::NotFound { offset } => BusError::NotFound(offset),
        }
    }
}

impl From<QueueError> for BusError {
    fn from(_: QueueError) -> Self {
        BusError::WouldBlock
    }
}

impl From<ReplyError> for BusError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::NotExpected { .. } => BusError::PermissionDenied(err.to_string()),
            ReplyError::AlreadyPending { .. } => BusError::InvalidArgument(err.to_string()),
        }
    }
}

/// Location of a queued message in the destination pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: u64,
    pub size: u64,
}

/// What happened to a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued(Slot),
    /// Queued after evicting the oldest queued notification
    EvictedOldest(Slot),
    /// Lost; counted in the destination's dropped counter
    Dropped,
}

/// State guarded by a connection's lock
#[derive(Debug)]
pub struct ConnectionState {
    pool: Pool,
    queue: MessageQueue,
    quota: QuotaTracker,
    replies: ReplyTracker,
    matches: MatchRule,
    active: bool,
}

impl ConnectionState {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            pool: Pool::new(config.pool_size),
            queue: MessageQueue::new(),
            quota: QuotaTracker::new(config.limits),
            replies: ReplyTracker::new(),
            matches: MatchRule::none(),
            active: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn replies(&self) -> &ReplyTracker {
        &self.replies
    }

    pub fn matches(&self) -> MatchRule {
        self.matches
    }

    pub fn add_match(&mut self, rule: MatchRule) {
        self.matches = self.matches.union(&rule);
    }

    /// Queues a user message sent by `user`
    ///
    /// Charges the message quota, checks the sender's pool share and copies
    /// the payload into the pool. Nothing is left behind on failure.
    pub fn enqueue_message(
        &mut self,
        user: UserId,
        header: MessageHeader,
        payload: Vec<u8>,
    ) -> Result<Slot, BusError> {
        let payload_len = payload.len() as u64;
        self.quota.check_payload(PoolBytes::new(payload_len))?;
        let charge = self.quota.reserve(QuotaKind::Message(user))?;

        let size = slice_size(payload_len);
        let divisor = self.quota.limits().pool_share_divisor;
        let snapshot = self.pool.share_snapshot(user);
        if let Err(err) = check_pool_share(&snapshot, PoolBytes::new(size), divisor) {
            self.quota.release(charge);
            return Err(err.into());
        }

        let offset = match self.pool.allocate(Some(user), header, payload) {
            Ok(offset) => offset,
            Err(err) => {
                self.quota.release(charge);
                return Err(err.into());
            }
        };
        self.queue.push(header, offset, size, charge);
        Ok(Slot { offset, size })
    }

    /// Queues a kernel notification addressed to `dst`
    ///
    /// Never fails. Under pressure the oldest queued notification makes
    /// room and hands over its quota charge; without one to evict, or
    /// without pool space, the new notification is lost.
    pub fn enqueue_notification(&mut self, dst: ConnectionId, kind: NotificationKind) -> Delivery {
        let header = MessageHeader::notification(dst, kind);
        let (charge, evicted) = match self.quota.reserve(QuotaKind::Notification) {
            Ok(charge) => (charge, false),
            Err(_) => match self.queue.evict_oldest_notification() {
                Some(oldest) => {
                    self.free_slice(oldest.offset);
                    self.queue.record_dropped();
                    (oldest.charge, true)
                }
                None => {
                    self.queue.record_dropped();
                    return Delivery::Dropped;
                }
            },
        };

        match self.pool.allocate(None, header, Vec::new()) {
            Ok(offset) => {
                let slot = Slot {
                    offset,
                    size: slice_size(0),
                };
                self.queue.push(header, offset, slot.size, charge);
                if evicted {
                    Delivery::EvictedOldest(slot)
                } else {
                    Delivery::Queued(slot)
                }
            }
            Err(_) => {
                self.quota.release(charge);
                self.queue.record_dropped();
                Delivery::Dropped
            }
        }
    }

    /// Moves the selected entry out of the queue and publishes its slice
    pub fn dequeue(&mut self, selector: QueueSelector) -> Result<ReceiveHandle, BusError> {
        let (seq, offset) = {
            let entry = self.queue.peek_entry(selector)?;
            (entry.seq, entry.offset)
        };
        self.pool.publish(offset)?;
        let entry = self.queue.remove(seq).ok_or(QueueError::Empty)?;
        self.quota.release(entry.charge);

        let dropped_count = self.queue.take_dropped();
        let return_flags = if dropped_count > 0 {
            ReturnFlags::DROPPED_MSGS
        } else {
            ReturnFlags::empty()
        };
        Ok(ReceiveHandle {
            offset: entry.offset,
            size: entry.size,
            header: entry.header,
            dropped_count,
            return_flags,
        })
    }

    /// Frees a received slice
    pub fn release(&mut self, offset: u64) -> Result<u64, BusError> {
        Ok(self.pool.release(offset)?)
    }

    /// Opens a reply expectation towards `replier`, taking a reply slot
    pub fn open_reply(
        &mut self,
        replier: ConnectionId,
        cookie: Cookie,
        deadline: Instant,
    ) -> Result<(), BusError> {
        let charge = self.quota.reserve(QuotaKind::PendingReply)?;
        let pending = PendingReply {
            replier,
            cookie,
            deadline,
            charge,
        };
        if let Err(err) = self.replies.open(pending) {
            self.quota.release(charge);
            return Err(err.into());
        }
        Ok(())
    }

    /// Takes the expectation `replier` is answering, keeping its slot held
    pub fn take_reply(
        &mut self,
        replier: ConnectionId,
        cookie: Cookie,
    ) -> Result<PendingReply, BusError> {
        Ok(self.replies.close(replier, cookie)?)
    }

    /// Puts back an expectation whose reply could not be delivered
    pub fn restore_reply(&mut self, pending: PendingReply) {
        if self.replies.open(pending).is_err() {
            self.quota.release(pending.charge);
        }
    }

    /// Frees the reply slot held by a finished expectation
    pub fn settle_reply(&mut self, pending: PendingReply) {
        self.quota.release(pending.charge);
    }

    /// Drops an expectation opened by a send that did not go through
    pub fn cancel_reply(&mut self, replier: ConnectionId, cookie: Cookie) {
        if let Ok(pending) = self.replies.close(replier, cookie) {
            self.settle_reply(pending);
        }
    }

    /// Settles expired expectations and queues a timeout notice for each
    pub fn expire_replies(
        &mut self,
        me: ConnectionId,
        now: Instant,
    ) -> Vec<(PendingReply, Delivery)> {
        let expired = self.replies.expire(now);
        self.notify_waiter(me, expired, |cookie| NotificationKind::ReplyTimeout { cookie })
    }

    /// Settles expectations towards a departed replier and queues a
    /// reply-dead notice for each
    pub fn forget_replier(
        &mut self,
        me: ConnectionId,
        replier: ConnectionId,
    ) -> Vec<(PendingReply, Delivery)> {
        let dead = self.replies.forget_replier(replier);
        self.notify_waiter(me, dead, |cookie| NotificationKind::ReplyDead { cookie })
    }

    fn notify_waiter(
        &mut self,
        me: ConnectionId,
        finished: Vec<PendingReply>,
        kind: impl Fn(Cookie) -> NotificationKind,
    ) -> Vec<(PendingReply, Delivery)> {
        finished
            .into_iter()
            .map(|pending| {
                self.settle_reply(pending);
                let delivery = self.enqueue_notification(me, kind(pending.cookie));
                (pending, delivery)
            })
            .collect()
    }

    /// Deactivates the connection and frees everything it holds
    pub fn teardown(&mut self) {
        self.active = false;
        for entry in self.queue.drain() {
            self.discard(entry);
        }
        for pending in self.replies.drain() {
            self.settle_reply(pending);
        }
        self.pool.clear();
    }

    fn discard(&mut self, entry: QueueEntry) {
        self.quota.release(entry.charge);
        self.free_slice(entry.offset);
    }

    /// Frees the slice of an entry leaving the queue
    fn free_slice(&mut self, offset: u64) {
        if let Err(err) = self.pool.free(offset) {
            log::warn!("queue entry without pool slice: {}", err);
        }
    }
}

/// One bus endpoint
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user: UserId,
    state: Mutex<ConnectionState>,
    wake: Condvar,
}

impl Connection {
    pub fn new(id: ConnectionId, user: UserId, config: &BusConfig) -> Self {
        Self {
            id,
            user,
            state: Mutex::new(ConnectionState::new(config)),
            wake: Condvar::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock()
    }

    /// Wakes every receiver blocked on this connection
    pub fn wake_all(&self) {
        self.wake.notify_all();
    }

    /// Blocks until woken; `deadline` bounds the wait in wall time
    ///
    /// Returns `false` if the deadline passed.
    pub fn wait(
        &self,
        state: &mut MutexGuard<'_, ConnectionState>,
        deadline: Option<std::time::Instant>,
    ) -> bool {
        match deadline {
            Some(deadline) => !self.wake.wait_until(state, deadline).timed_out(),
            None => {
                self.wake.wait(state);
                true
            }
        }
    }
}

/// Two connection locks taken in id order
pub enum LockedPair<'a> {
    /// Both sides are the same connection
    Same(MutexGuard<'a, ConnectionState>),
    Pair {
        first: MutexGuard<'a, ConnectionState>,
        second: MutexGuard<'a, ConnectionState>,
    },
}

/// Locks `first` and `second`, lower id first
///
/// In the returned `Pair`, `first` and `second` correspond to the
/// arguments, not to the locking order.
pub fn lock_pair<'a>(first: &'a Connection, second: &'a Connection) -> LockedPair<'a> {
    if first.id == second.id {
        return LockedPair::Same(first.lock());
    }
    if first.id < second.id {
        let first_guard = first.lock();
        let second_guard = second.lock();
        LockedPair::Pair {
            first: first_guard,
            second: second_guard,
        }
    } else {
        let second_guard = second.lock();
        let first_guard = first.lock();
        LockedPair::Pair {
            first: first_guard,
            second: second_guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_types::{Destination, Priority};
    use quota::{MessageCount, QuotaLimits};

    fn config() -> BusConfig {
        BusConfig::default()
    }

    fn data(cookie: u64) -> MessageHeader {
        MessageHeader::data(
            ConnectionId::new(2),
            Destination::Unicast(ConnectionId::new(1)),
            Cookie::new(cookie),
        )
    }

    fn id_add(raw: u64) -> NotificationKind {
        NotificationKind::IdAdd {
            id: ConnectionId::new(raw),
        }
    }

    #[test]
    fn test_enqueue_then_dequeue_publishes_slice() {
        let mut state = ConnectionState::new(&config());
        let slot = state
            .enqueue_message(UserId::new(1), data(7), b"hello".to_vec())
            .unwrap();
        assert!(state.release(slot.offset).is_err());

        let handle = state.dequeue(QueueSelector::Fifo).unwrap();
        assert_eq!(handle.offset, slot.offset);
        assert_eq!(handle.header.cookie, Cookie::new(7));
        assert!(state.quota().queued().is_zero());
        assert_eq!(state.pool().read(slot.offset).unwrap().1, b"hello");

        state.release(slot.offset).unwrap();
        assert_eq!(state.pool().live_bytes(), 0);
    }

    #[test]
    fn test_failed_enqueue_leaves_nothing_behind() {
        let limits = QuotaLimits::default()
            .with_max_msgs_unaccounted(MessageCount::new(1))
            .with_max_msgs_per_user(MessageCount::new(1));
        let mut state = ConnectionState::new(&config().with_limits(limits));
        state.enqueue_message(UserId::new(1), data(1), vec![]).unwrap();
        state.enqueue_message(UserId::new(1), data(2), vec![]).unwrap();

        let live = state.pool().live_bytes();
        let err = state
            .enqueue_message(UserId::new(1), data(3), vec![])
            .unwrap_err();
        assert!(matches!(err, BusError::QuotaExceeded(_)));
        assert_eq!(state.pool().live_bytes(), live);
        assert_eq!(state.queue().len(), 2);
    }

    #[test]
    fn test_pool_share_rollback_releases_charge() {
        let mut state = ConnectionState::new(&config().with_pool_size(3 * 1024));
        // 1 KiB pool share: a 1000-byte payload plus header does not fit
        let err = state
            .enqueue_message(UserId::new(1), data(1), vec![0; 1000])
            .unwrap_err();
        assert!(matches!(err, BusError::OutOfPoolSpace(_)));
        assert!(state.quota().queued().is_zero());
        assert_eq!(state.pool().live_bytes(), 0);
    }

    #[test]
    fn test_oversized_payload_is_invalid() {
        let limits = QuotaLimits::default().with_max_payload_size(PoolBytes::new(4));
        let mut state = ConnectionState::new(&config().with_limits(limits));
        let err = state
            .enqueue_message(UserId::new(1), data(1), vec![0; 5])
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidArgument(_)));
    }

    #[test]
    fn test_notification_evicts_oldest_under_pressure() {
        let limits = QuotaLimits::default().with_max_msgs(MessageCount::new(2));
        let mut state = ConnectionState::new(&config().with_limits(limits));
        let me = ConnectionId::new(1);
        assert!(matches!(state.enqueue_notification(me, id_add(10)), Delivery::Queued(_)));
        assert!(matches!(state.enqueue_notification(me, id_add(11)), Delivery::Queued(_)));
        assert!(matches!(
            state.enqueue_notification(me, id_add(12)),
            Delivery::EvictedOldest(_)
        ));
        assert_eq!(state.queue().len(), 2);

        let handle = state.dequeue(QueueSelector::Fifo).unwrap();
        assert_eq!(handle.dropped_count, 1);
        assert!(handle.dropped());
        assert_eq!(handle.header.notification_kind(), Some(id_add(11)));

        let handle = state.dequeue(QueueSelector::Fifo).unwrap();
        assert_eq!(handle.dropped_count, 0);
        assert!(!handle.dropped());
    }

    #[test]
    fn test_notification_dropped_without_victim() {
        let limits = QuotaLimits::default()
            .with_max_msgs(MessageCount::new(1))
            .with_max_msgs_unaccounted(MessageCount::new(1));
        let mut state = ConnectionState::new(&config().with_limits(limits));
        state.enqueue_message(UserId::new(1), data(1), vec![]).unwrap();
        assert_eq!(
            state.enqueue_notification(ConnectionId::new(1), id_add(5)),
            Delivery::Dropped
        );
        assert_eq!(state.queue().dropped(), 1);
    }

    #[test]
    fn test_priority_dequeue_respects_ceiling() {
        let mut state = ConnectionState::new(&config());
        state
            .enqueue_message(UserId::new(1), data(1).with_priority(Priority::new(5)), vec![])
            .unwrap();
        assert_eq!(
            state.dequeue(QueueSelector::Priority(Priority::new(0))),
            Err(BusError::WouldBlock)
        );
        assert!(state.dequeue(QueueSelector::Priority(Priority::new(5))).is_ok());
    }

    #[test]
    fn test_reply_slots() {
        let mut state = ConnectionState::new(&config());
        let replier = ConnectionId::new(2);
        state
            .open_reply(replier, Cookie::new(1), Instant::from_nanos(100))
            .unwrap();
        assert_eq!(state.quota().pending_replies(), MessageCount::new(1));

        assert!(matches!(
            state.take_reply(ConnectionId::new(3), Cookie::new(1)),
            Err(BusError::PermissionDenied(_))
        ));

        let pending = state.take_reply(replier, Cookie::new(1)).unwrap();
        state.restore_reply(pending);
        assert_eq!(state.replies().len(), 1);

        let pending = state.take_reply(replier, Cookie::new(1)).unwrap();
        state.settle_reply(pending);
        assert!(state.quota().pending_replies().is_zero());
    }

    #[test]
    fn test_expired_reply_queues_timeout_notice() {
        let mut state = ConnectionState::new(&config());
        let me = ConnectionId::new(1);
        state
            .open_reply(ConnectionId::new(2), Cookie::new(9), Instant::from_nanos(100))
            .unwrap();

        assert!(state.expire_replies(me, Instant::from_nanos(99)).is_empty());
        let expired = state.expire_replies(me, Instant::from_nanos(100));
        assert_eq!(expired.len(), 1);
        assert!(state.quota().pending_replies().is_zero());

        let handle = state.dequeue(QueueSelector::Fifo).unwrap();
        assert_eq!(
            handle.header.notification_kind(),
            Some(NotificationKind::ReplyTimeout {
                cookie: Cookie::new(9)
            })
        );
    }

    #[test]
    fn test_teardown_frees_everything() {
        let mut state = ConnectionState::new(&config());
        state.enqueue_message(UserId::new(1), data(1), vec![0; 32]).unwrap();
        state.enqueue_notification(ConnectionId::new(1), id_add(4));
        state
            .open_reply(ConnectionId::new(2), Cookie::new(1), Instant::from_nanos(10))
            .unwrap();

        state.teardown();
        assert!(!state.is_active());
        assert_eq!(state.quota().usage(), Default::default());
        assert_eq!(state.pool().live_bytes(), 0);
        assert!(state.replies().is_empty());
    }

    #[test]
    fn test_dequeue_keeps_entry_when_slice_is_missing() {
        let mut state = ConnectionState::new(&config());
        let slot = state
            .enqueue_message(UserId::new(1), data(1), vec![0; 8])
            .unwrap();
        state.pool.free(slot.offset).unwrap();

        let err = state.dequeue(QueueSelector::Fifo).unwrap_err();
        assert_eq!(err, BusError::NotFound(slot.offset));
        assert_eq!(state.queue().len(), 1);
        assert_eq!(state.quota().queued(), MessageCount::new(1));
    }

    #[test]
    fn test_teardown_tolerates_missing_slices() {
        let mut state = ConnectionState::new(&config());
        let slot = state
            .enqueue_message(UserId::new(1), data(1), vec![0; 8])
            .unwrap();
        state.enqueue_message(UserId::new(1), data(2), vec![0; 8]).unwrap();
        state.pool.free(slot.offset).unwrap();

        state.teardown();
        assert!(state.queue().is_empty());
        assert!(state.quota().queued().is_zero());
        assert_eq!(state.pool().slice_count(), 0);
    }

    #[test]
    fn test_lock_pair_orders_by_id() {
        let low = Connection::new(ConnectionId::new(1), UserId::new(1), &config());
        let high = Connection::new(ConnectionId::new(2), UserId::new(1), &config());

        match lock_pair(&high, &low) {
            LockedPair::Pair { mut first, second } => {
                first.add_match(MatchRule::broadcasts());
                assert!(second.matches().is_none());
            }
            LockedPair::Same(_) => panic!("distinct connections"),
        }
        assert!(high.lock().matches().broadcasts);
        assert!(matches!(lock_pair(&low, &low), LockedPair::Same(_)));
    }
}
