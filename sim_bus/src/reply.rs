//! Outstanding reply expectations
//!
//! Each connection keeps a [`ReplyTracker`] of the requests *it* sent with
//! `EXPECT_REPLY`, keyed by the addressed replier and the request cookie.
//! The quota slot for each request is held in the entry and handed back
//! when the entry goes away.

use bus_api::Instant;
use bus_types::{ConnectionId, Cookie};
use quota::Charge;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Reply tracking errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("Request {cookie} to {replier} is already pending")]
    AlreadyPending { replier: ConnectionId, cookie: Cookie },

    #[error("No request {cookie} pending for replier {replier}")]
    NotExpected { replier: ConnectionId, cookie: Cookie },
}

/// One reply-expecting request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReply {
    pub replier: ConnectionId,
    pub cookie: Cookie,
    pub deadline: Instant,
    pub charge: Charge,
}

/// Requests a connection is waiting on
#[derive(Debug, Clone, Default)]
pub struct ReplyTracker {
    pending: BTreeMap<(ConnectionId, Cookie), PendingReply>,
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, replier: ConnectionId, cookie: Cookie) -> bool {
        self.pending.contains_key(&(replier, cookie))
    }

    /// Records a new request
    pub fn open(&mut self, pending: PendingReply) -> Result<(), ReplyError> {
        let key = (pending.replier, pending.cookie);
        if self.pending.contains_key(&key) {
            return Err(ReplyError::AlreadyPending {
                replier: pending.replier,
                cookie: pending.cookie,
            });
        }
        self.pending.insert(key, pending);
        Ok(())
    }

    /// Removes the request `replier` is answering
    pub fn close(
        &mut self,
        replier: ConnectionId,
        cookie: Cookie,
    ) -> Result<PendingReply, ReplyError> {
        self.pending
            .remove(&(replier, cookie))
            .ok_or(ReplyError::NotExpected { replier, cookie })
    }

    /// Removes every request whose deadline has passed at `now`
    pub fn expire(&mut self, now: Instant) -> Vec<PendingReply> {
        let expired: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline.has_elapsed(now))
            .map(|(key, _)| *key)
            .collect();
        let mut expired: Vec<_> = expired
            .into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .collect();
        expired.sort_by_key(|pending| pending.deadline);
        expired
    }

    /// Removes every request addressed to `replier`
    pub fn forget_replier(&mut self, replier: ConnectionId) -> Vec<PendingReply> {
        let keys: Vec<_> = self
            .pending
            .keys()
            .filter(|(id, _)| *id == replier)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .collect()
    }

    /// Earliest deadline among pending requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    /// Removes everything
    pub fn drain(&mut self) -> Vec<PendingReply> {
        std::mem::take(&mut self.pending).into_values().collect()
    }
}

/// Bus-wide index of connections waiting on a reply deadline
///
/// Entries may go stale when a request is answered or its waiter leaves;
/// the sweep re-checks each connection under its own lock.
#[derive(Debug, Clone, Default)]
pub struct DeadlineIndex {
    due: BTreeSet<(Instant, ConnectionId)>,
}

impl DeadlineIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }

    /// Registers `waiter` to be checked at `deadline`
    pub fn insert(&mut self, deadline: Instant, waiter: ConnectionId) {
        self.due.insert((deadline, waiter));
    }

    /// Earliest registered deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.due.iter().next().map(|(deadline, _)| *deadline)
    }

    /// Removes every entry due at `now`, returning each waiter once
    pub fn take_due(&mut self, now: Instant) -> Vec<ConnectionId> {
        let mut waiters = Vec::new();
        while let Some(&(deadline, waiter)) = self.due.iter().next() {
            if !deadline.has_elapsed(now) {
                break;
            }
            self.due.remove(&(deadline, waiter));
            if !waiters.contains(&waiter) {
                waiters.push(waiter);
            }
        }
        waiters
    }
}
