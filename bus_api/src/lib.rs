//! # Bus API
//!
//! This crate defines the interface between bus clients and the message bus.
//!
//! ## Philosophy
//!
//! The bus provides **mechanisms**, not policies:
//! - Connection registration (explicit `hello` / `bye`)
//! - Queued delivery into per-connection pools
//! - Reply tracking with deadlines
//! - Quota enforcement on behalf of receivers
//!
//! ## Design Goals
//!
//! 1. **Testability**: The entire API can be driven in-process
//! 2. **Explicitness**: Every pool offset handed out must be released
//! 3. **Errno fidelity**: Every failure maps onto the kdbus errno
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - D-Bus (no names, no policy, no activation)
//! - The kdbus ioctl ABI (requests are typed structs, not byte items)

pub mod bus;
pub mod error;
pub mod time;

pub use bus::{BusApi, Message, ReceiveHandle, ReceiveRequest, SendRequest, Wait};
pub use error::{BusError, Errno};
pub use time::{Duration, Instant};
