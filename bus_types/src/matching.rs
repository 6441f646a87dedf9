//! Subscription rules
//!
//! Content-based filtering is out of scope; a connection only states which
//! classes of unsolicited traffic it wants to see.

use crate::message::NotificationKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which broadcasts and kernel notifications a connection subscribes to
///
/// Rules accumulate: adding a rule to a connection unions it with the rules
/// already installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MatchRule {
    pub broadcasts: bool,
    pub id_add: bool,
    pub id_remove: bool,
}

impl MatchRule {
    /// Subscribes to nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// The empty match: every broadcast and every notification
    pub fn all() -> Self {
        Self {
            broadcasts: true,
            id_add: true,
            id_remove: true,
        }
    }

    /// Broadcasts only
    pub fn broadcasts() -> Self {
        Self {
            broadcasts: true,
            ..Self::none()
        }
    }

    /// Connection-registered notifications only
    pub fn id_add() -> Self {
        Self {
            id_add: true,
            ..Self::none()
        }
    }

    /// Connection-removed notifications only
    pub fn id_remove() -> Self {
        Self {
            id_remove: true,
            ..Self::none()
        }
    }

    /// Returns the union of two rules
    pub fn union(&self, other: &MatchRule) -> MatchRule {
        MatchRule {
            broadcasts: self.broadcasts || other.broadcasts,
            id_add: self.id_add || other.id_add,
            id_remove: self.id_remove || other.id_remove,
        }
    }

    pub fn is_none(&self) -> bool {
        !self.broadcasts && !self.id_add && !self.id_remove
    }

    /// Checks whether a lifecycle notification should be delivered
    ///
    /// Reply timeouts and reply-dead notices are addressed, not broadcast, so
    /// they are always delivered regardless of rules.
    pub fn wants_notification(&self, kind: &NotificationKind) -> bool {
        match kind {
            NotificationKind::IdAdd { .. } => self.id_add,
            NotificationKind::IdRemove { .. } => self.id_remove,
            NotificationKind::ReplyTimeout { .. } | NotificationKind::ReplyDead { .. } => true,
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.broadcasts { "B" } else { "-" },
            if self.id_add { "A" } else { "-" },
            if self.id_remove { "R" } else { "-" }
        )
    }
}
