//! Per-connection receive pool
//!
//! A fixed-capacity region that backs every message queued to, or received
//! by, one connection. Space is handed out first-fit from a free list that
//! coalesces neighbours on free.
//!
//! Each slice carries the message header and its payload. A slice is
//! `Queued` while its entry sits in the queue, and `Public` after it was
//! received and until the receiver releases it. Only public slices can be
//! read or released through the bus.
//!
//! Live bytes are tracked per sending user so the fair-share rule can be
//! evaluated against a consistent snapshot.

use bus_types::{MessageHeader, UserId};
use quota::{PoolBytes, PoolShareSnapshot};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Bytes reserved in front of every payload for the message header
pub const SLICE_HEADER_SIZE: u64 = 64;

/// Slice sizes are rounded up to this alignment
pub const SLICE_ALIGN: u64 = 8;

/// Pool size a slice needs for a payload of `payload_len` bytes
pub fn slice_size(payload_len: u64) -> u64 {
    let raw = SLICE_HEADER_SIZE.saturating_add(payload_len);
    raw.saturating_add(SLICE_ALIGN - 1) / SLICE_ALIGN * SLICE_ALIGN
}

/// Pool errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("No contiguous space for {requested} bytes (largest free block {largest_free})")]
    NoSpace { requested: u64, largest_free: u64 },

    #[error("No slice at offset {offset:#x}")]
    NotFound { offset: u64 },
}

/// Lifecycle state of a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceState {
    Queued,
    Public,
}

#[derive(Debug, Clone)]
struct Slice {
    len: u64,
    /// Sending user, `None` for kernel notifications
    owner: Option<UserId>,
    state: SliceState,
    header: MessageHeader,
    payload: Vec<u8>,
}

/// Fixed-capacity allocator for one connection
#[derive(Debug, Clone)]
pub struct Pool {
    capacity: u64,
    /// Free blocks keyed by offset
    free: BTreeMap<u64, u64>,
    slices: BTreeMap<u64, Slice>,
    live: u64,
    live_by_user: HashMap<UserId, u64>,
}

impl Pool {
    /// Creates an empty pool of `capacity` bytes
    pub fn new(capacity: u64) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            free,
            slices: BTreeMap::new(),
            live: 0,
            live_by_user: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes held by queued and public slices
    pub fn live_bytes(&self) -> u64 {
        self.live
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity - self.live
    }

    /// Bytes held by slices sent by `user`
    pub fn live_for(&self, user: UserId) -> u64 {
        self.live_by_user.get(&user).copied().unwrap_or(0)
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Largest contiguous free block
    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Fair-share snapshot from `user`'s point of view
    pub fn share_snapshot(&self, user: UserId) -> PoolShareSnapshot {
        let user_live = self.live_for(user);
        PoolShareSnapshot {
            capacity: PoolBytes::new(self.capacity),
            user_live: PoolBytes::new(user_live),
            others_live: PoolBytes::new(self.live - user_live),
        }
    }

    /// Allocates a queued slice holding `header` and `payload`
    ///
    /// Returns the slice offset.
    pub fn allocate(
        &mut self,
        owner: Option<UserId>,
        header: MessageHeader,
        payload: Vec<u8>,
    ) -> Result<u64, PoolError> {
        let len = slice_size(payload.len() as u64);
        let (offset, block) = self
            .free
            .iter()
            .find(|(_, block)| **block >= len)
            .map(|(offset, block)| (*offset, *block))
            .ok_or(PoolError::NoSpace {
                requested: len,
                largest_free: self.largest_free(),
            })?;

        self.free.remove(&offset);
        if block > len {
            self.free.insert(offset + len, block - len);
        }

        self.live += len;
        if let Some(user) = owner {
            *self.live_by_user.entry(user).or_insert(0) += len;
        }
        self.slices.insert(
            offset,
            Slice {
                len,
                owner,
                state: SliceState::Queued,
                header,
                payload,
            },
        );
        Ok(offset)
    }

    /// Marks a queued slice as received
    pub fn publish(&mut self, offset: u64) -> Result<(), PoolError> {
        let slice = self
            .slices
            .get_mut(&offset)
            .ok_or(PoolError::NotFound { offset })?;
        slice.state = SliceState::Public;
        Ok(())
    }

    /// Returns the state of the slice at `offset`
    pub fn state(&self, offset: u64) -> Option<SliceState> {
        self.slices.get(&offset).map(|slice| slice.state)
    }

    /// Returns the size of the slice at `offset`
    pub fn slice_len(&self, offset: u64) -> Option<u64> {
        self.slices.get(&offset).map(|slice| slice.len)
    }

    /// Header and payload of a public slice
    pub fn read(&self, offset: u64) -> Result<(&MessageHeader, &[u8]), PoolError> {
        match self.slices.get(&offset) {
            Some(slice) if slice.state == SliceState::Public => {
                Ok((&slice.header, slice.payload.as_slice()))
            }
            _ => Err(PoolError::NotFound { offset }),
        }
    }

    /// Frees a public slice on behalf of the receiver
    pub fn release(&mut self, offset: u64) -> Result<u64, PoolError> {
        match self.state(offset) {
            Some(SliceState::Public) => self.free(offset),
            _ => Err(PoolError::NotFound { offset }),
        }
    }

    /// Frees a slice in any state
    ///
    /// Used when a queued entry is evicted, rolled back or torn down.
    pub fn free(&mut self, offset: u64) -> Result<u64, PoolError> {
        let slice = self
            .slices
            .remove(&offset)
            .ok_or(PoolError::NotFound { offset })?;

        self.live -= slice.len;
        if let Some(user) = slice.owner {
            if let Some(held) = self.live_by_user.get_mut(&user) {
                *held -= slice.len;
                if *held == 0 {
                    self.live_by_user.remove(&user);
                }
            }
        }
        self.insert_free(offset, slice.len);
        Ok(slice.len)
    }

    fn insert_free(&mut self, mut offset: u64, mut len: u64) {
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                offset = prev;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            len += next_len;
        }
        self.free.insert(offset, len);
    }

    /// Frees every slice
    pub fn clear(&mut self) {
        *self = Pool::new(self.capacity);
    }

    #[cfg(test)]
    fn free_blocks(&self) -> Vec<(u64, u64)> {
        self.free.iter().map(|(o, l)| (*o, *l)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_types::{ConnectionId, Cookie, Destination};
    use proptest::prelude::*;

    fn header() -> MessageHeader {
        MessageHeader::data(
            ConnectionId::new(1),
            Destination::Unicast(ConnectionId::new(2)),
            Cookie::new(1),
        )
    }

    fn user(raw: u32) -> Option<UserId> {
        Some(UserId::new(raw))
    }

    #[test]
    fn test_slice_size_includes_header_and_alignment() {
        assert_eq!(slice_size(0), 64);
        assert_eq!(slice_size(1), 72);
        assert_eq!(slice_size(8), 72);
        assert_eq!(slice_size(9), 80);
    }

    #[test]
    fn test_first_fit_allocation() {
        let mut pool = Pool::new(1024);
        let a = pool.allocate(user(1), header(), vec![0; 8]).unwrap();
        let b = pool.allocate(user(1), header(), vec![0; 8]).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 72);
        assert_eq!(pool.live_bytes(), 144);
        assert_eq!(pool.live_for(UserId::new(1)), 144);
    }

    #[test]
    fn test_released_offset_is_reused() {
        let mut pool = Pool::new(1024);
        let a = pool.allocate(user(1), header(), vec![1; 8]).unwrap();
        pool.publish(a).unwrap();
        pool.release(a).unwrap();
        let b = pool.allocate(user(2), header(), vec![2; 8]).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.live_for(UserId::new(1)), 0);
    }

    #[test]
    fn test_release_requires_public_slice() {
        let mut pool = Pool::new(1024);
        let a = pool.allocate(user(1), header(), vec![]).unwrap();
        assert_eq!(pool.release(a), Err(PoolError::NotFound { offset: a }));
        assert!(pool.read(a).is_err());

        pool.publish(a).unwrap();
        assert_eq!(pool.release(a), Ok(64));
        // No double free
        assert_eq!(pool.release(a), Err(PoolError::NotFound { offset: a }));
    }

    #[test]
    fn test_read_public_slice() {
        let mut pool = Pool::new(1024);
        let a = pool.allocate(user(1), header(), b"payload".to_vec()).unwrap();
        pool.publish(a).unwrap();
        let (read_header, payload) = pool.read(a).unwrap();
        assert_eq!(*read_header, header());
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_free_coalesces_neighbours() {
        let mut pool = Pool::new(256);
        let a = pool.allocate(user(1), header(), vec![]).unwrap();
        let b = pool.allocate(user(1), header(), vec![]).unwrap();
        let c = pool.allocate(user(1), header(), vec![]).unwrap();
        pool.free(a).unwrap();
        pool.free(c).unwrap();
        assert_eq!(pool.free_blocks(), vec![(0, 64), (128, 128)]);
        pool.free(b).unwrap();
        assert_eq!(pool.free_blocks(), vec![(0, 256)]);
    }

    #[test]
    fn test_no_contiguous_space() {
        let mut pool = Pool::new(192);
        let a = pool.allocate(user(1), header(), vec![]).unwrap();
        let _b = pool.allocate(user(1), header(), vec![]).unwrap();
        let _c = pool.allocate(user(1), header(), vec![]).unwrap();
        pool.free(a).unwrap();
        let err = pool.allocate(user(1), header(), vec![0; 8]).unwrap_err();
        assert_eq!(
            err,
            PoolError::NoSpace {
                requested: 72,
                largest_free: 64
            }
        );
    }

    #[test]
    fn test_share_snapshot_splits_users() {
        let mut pool = Pool::new(4096);
        pool.allocate(user(1), header(), vec![0; 64]).unwrap();
        pool.allocate(user(2), header(), vec![0; 192]).unwrap();
        pool.allocate(None, header(), vec![]).unwrap();

        let snap = pool.share_snapshot(UserId::new(1));
        assert_eq!(snap.user_live, PoolBytes::new(128));
        assert_eq!(snap.others_live, PoolBytes::new(256 + 64));
    }

    #[test]
    fn test_clear_frees_everything() {
        let mut pool = Pool::new(1024);
        for _ in 0..4 {
            pool.allocate(user(1), header(), vec![0; 16]).unwrap();
        }
        pool.clear();
        assert_eq!(pool.live_bytes(), 0);
        assert_eq!(pool.slice_count(), 0);
        assert_eq!(pool.largest_free(), 1024);
        assert_eq!(pool.free_blocks(), vec![(0, 1024)]);
        assert_eq!(pool.allocate(user(2), header(), vec![]), Ok(0));
    }

    proptest! {
        #[test]
        fn accounting_is_exact(ops in proptest::collection::vec((any::<bool>(), 0usize..200), 0..200)) {
            let mut pool = Pool::new(8192);
            let mut held: Vec<u64> = Vec::new();

            for (alloc, n) in ops {
                if alloc {
                    if let Ok(offset) = pool.allocate(user((n % 3) as u32), header(), vec![0; n]) {
                        held.push(offset);
                    }
                } else if !held.is_empty() {
                    let offset = held.remove(n % held.len());
                    prop_assert!(pool.free(offset).is_ok());
                }

                let free: u64 = pool.free_blocks().iter().map(|(_, len)| len).sum();
                prop_assert_eq!(free + pool.live_bytes(), pool.capacity());

                let per_user: u64 = (0..3).map(|raw| pool.live_for(UserId::new(raw))).sum();
                prop_assert_eq!(per_user, pool.live_bytes());

                // Free blocks never touch: coalescing is complete
                let blocks = pool.free_blocks();
                for pair in blocks.windows(2) {
                    prop_assert!(pair[0].0 + pair[0].1 < pair[1].0);
                }
            }
        }
    }
}
