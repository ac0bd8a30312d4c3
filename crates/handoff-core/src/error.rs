//! handoff-core error types.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors from `RingQueue::with_capacity`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Capacity is zero, above `MAX_CAPACITY`, or not a power of two.
    #[error("invalid ring capacity {0}: must be a power of two in 1..=1024")]
    InvalidCapacity(usize),
    /// Slot storage could not be allocated.
    #[error("failed to allocate ring storage: not enough memory")]
    OutOfMemory,
}

/// Error returned by `Producer::enqueue` when the ring is full.
///
/// Carries the rejected item back so ownership returns to the sender.
#[derive(Clone, PartialEq, Eq)]
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    /// Recover the item that could not be enqueued.
    #[inline]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ring queue full")
    }
}

impl<T> std::error::Error for QueueFull<T> {}

/// An epoll or eventfd call failed.
#[derive(Debug, Error)]
#[error("{op} failed: {source}")]
pub struct ReactorError {
    /// The libc call that failed.
    pub op: &'static str,
    #[source]
    pub source: io::Error,
}

impl ReactorError {
    /// Capture `errno` for the call that just failed.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Self { op, source: io::Error::last_os_error() }
    }
}

pub type CoreResult<T> = std::result::Result<T, ReactorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            QueueError::InvalidCapacity(3).to_string(),
            "invalid ring capacity 3: must be a power of two in 1..=1024"
        );
        assert_eq!(QueueFull(7u32).to_string(), "ring queue full");

        let e = ReactorError { op: "epoll_ctl", source: io::Error::from_raw_os_error(libc::EBADF) };
        assert!(e.to_string().starts_with("epoll_ctl failed: "));
    }

    #[test]
    fn test_queue_full_returns_item() {
        let err = QueueFull(String::from("ctx"));
        assert_eq!(format!("{:?}", err), "QueueFull(..)");
        assert_eq!(err.into_inner(), "ctx");
    }
}
