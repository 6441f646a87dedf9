//! Flag sets carried by send and receive commands

use bitflags::bitflags;

bitflags! {
    /// Flags attached to a sent message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u64 {
        /// The sender expects a reply correlated by the message cookie.
        ///
        /// Only valid together with a non-zero cookie and a positive timeout.
        const EXPECT_REPLY = 1 << 0;
    }
}

bitflags! {
    /// Flags controlling how a receive picks its message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReceiveFlags: u64 {
        /// Only consider messages whose priority is at or below the
        /// requested ceiling and pick the most urgent one.
        const USE_PRIORITY = 1 << 0;
    }
}

bitflags! {
    /// Flags returned to the receiver alongside a message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReturnFlags: u64 {
        /// Notifications were discarded since the previous successful receive.
        const DROPPED_MSGS = 1 << 0;
    }
}
