//! Bus error types

use bus_types::ConnectionId;
use quota::QuotaError;
use std::fmt;
use thiserror::Error;

/// Kernel errno value reported for a failed bus operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const EPERM: Errno = Errno(1);
    pub const ENXIO: Errno = Errno(6);
    pub const EAGAIN: Errno = Errno(11);
    pub const EINVAL: Errno = Errno(22);
    pub const EMLINK: Errno = Errno(31);
    pub const ECONNRESET: Errno = Errno(104);
    pub const ENOBUFS: Errno = Errno(105);
    pub const ETIMEDOUT: Errno = Errno(110);

    /// Returns the symbolic name, or `None` for values the bus never reports
    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Errno::EPERM => "EPERM",
            Errno::ENXIO => "ENXIO",
            Errno::EAGAIN => "EAGAIN",
            Errno::EINVAL => "EINVAL",
            Errno::EMLINK => "EMLINK",
            Errno::ECONNRESET => "ECONNRESET",
            Errno::ENOBUFS => "ENOBUFS",
            Errno::ETIMEDOUT => "ETIMEDOUT",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "errno {}", self.0),
        }
    }
}

/// Errors that can occur when interacting with the bus
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// Malformed request: bad flag combination, oversized payload, self-send
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Reply without a matching outstanding request
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Destination queue ceiling reached
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Too many outstanding reply-expecting requests
    #[error("Too many links: {0}")]
    TooManyLinks(String),

    /// Pool fair share or contiguous space exhausted
    #[error("Out of pool space: {0}")]
    OutOfPoolSpace(String),

    /// Nothing eligible to receive
    #[error("Operation would block")]
    WouldBlock,

    /// Pool offset is not a received, unreleased slice
    #[error("Offset not found: {0:#x}")]
    NotFound(u64),

    /// Connection id is not registered
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Connection was torn down while the caller waited on it
    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),

    /// Receive deadline elapsed
    #[error("Operation timed out")]
    TimedOut,
}

impl BusError {
    /// Returns the kdbus errno for this error
    pub fn errno(&self) -> Errno {
        match self {
            BusError::InvalidArgument(_) => Errno::EINVAL,
            BusError::PermissionDenied(_) => Errno::EPERM,
            BusError::QuotaExceeded(_) | BusError::OutOfPoolSpace(_) => Errno::ENOBUFS,
            BusError::TooManyLinks(_) => Errno::EMLINK,
            BusError::WouldBlock => Errno::EAGAIN,
            BusError::NotFound(_) | BusError::UnknownConnection(_) => Errno::ENXIO,
            BusError::ConnectionClosed(_) => Errno::ECONNRESET,
            BusError::TimedOut => Errno::ETIMEDOUT,
        }
    }
}

impl From<QuotaError> for BusError {
    fn from(err: QuotaError) -> Self {
        let detail = err.to_string();
        match err {
            QuotaError::QuotaExceeded { .. } => BusError::QuotaExceeded(detail),
            QuotaError::TooManyLinks { .. } => BusError::TooManyLinks(detail),
            QuotaError::OutOfPoolSpace { .. } => BusError::OutOfPoolSpace(detail),
            QuotaError::PayloadTooLarge { .. } | QuotaError::InvalidLimits { .. } => {
                BusError::InvalidArgument(detail)
            }
        }
    }
}
