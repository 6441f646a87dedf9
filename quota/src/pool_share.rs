//! Pool fair-share rule
//!
//! A sending user may occupy at most `1 / divisor` of the space that is
//! free *from its point of view*: the pool capacity minus what every other
//! user currently holds. The user's own live bytes count as free, so a user
//! holding nothing may take a full share of everything not held by others,
//! and the share shrinks as other users fill the pool.

use crate::{PoolBytes, QuotaError};

/// Point-in-time view of one pool, taken under the pool's lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShareSnapshot {
    pub capacity: PoolBytes,
    /// Live bytes held by the requesting user
    pub user_live: PoolBytes,
    /// Live bytes held by everyone else
    pub others_live: PoolBytes,
}

impl PoolShareSnapshot {
    /// Space the requesting user sees as free
    pub fn free_space(&self) -> PoolBytes {
        self.capacity.saturating_sub(self.others_live)
    }

    /// Total bytes the user may hold after an allocation
    pub fn share(&self, divisor: u64) -> PoolBytes {
        PoolBytes::new(self.free_space().0 / divisor.max(1))
    }

    /// Bytes the user may still allocate
    pub fn allowance(&self, divisor: u64) -> PoolBytes {
        self.share(divisor).saturating_sub(self.user_live)
    }
}

/// Checks a `request`-byte allocation against the fair share
pub fn check_pool_share(
    snapshot: &PoolShareSnapshot,
    request: PoolBytes,
    divisor: u64,
) -> Result<(), QuotaError> {
    let divisor = divisor.max(1);
    let after = snapshot
        .user_live
        .checked_add(request)
        .ok_or(QuotaError::OutOfPoolSpace {
            requested: request,
            allowed: snapshot.allowance(divisor),
        })?;

    // after <= free / divisor, compared without truncating the share
    let free = snapshot.free_space();
    if (after.0 as u128) * (divisor as u128) > free.0 as u128 {
        return Err(QuotaError::OutOfPoolSpace {
            requested: request,
            allowed: snapshot.allowance(divisor),
        });
    }
    Ok(())
}
