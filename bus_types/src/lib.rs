//! # Bus Types
//!
//! This crate defines the fundamental types shared by every kbus crate.
//!
//! ## Philosophy
//!
//! - **Identities are numeric and explicit**: a connection is addressed by
//!   the id the bus handed out at registration, never by a name.
//! - **Senders are users**: quota is charged to the opaque [`UserId`] a
//!   connection registered with, not to the connection itself.
//! - **Kernel messages are messages**: notifications travel through the same
//!   queue as user traffic and are told apart only by [`MessageKind`].
//!
//! ## Key Types
//!
//! - [`ConnectionId`], [`UserId`], [`Cookie`]: identifiers
//! - [`Priority`]: signed receive priority (lower value = more urgent)
//! - [`MessageHeader`]: what a receiver can learn about a queued message
//! - [`MatchRule`]: broadcast / notification subscriptions

pub mod flags;
pub mod ids;
pub mod matching;
pub mod message;

pub use flags::{MessageFlags, ReceiveFlags, ReturnFlags};
pub use ids::{ConnectionId, Cookie, UserId};
pub use matching::MatchRule;
pub use message::{Destination, MessageHeader, MessageKind, NotificationKind, Priority};
