//! `WakeSignal`: coalesced, payload-free cross-thread wake.
//!
//! Backed by an eventfd that the owning reactor watches for readability,
//! plus a pending flag. Only the raise that flips the flag from clear to
//! set touches the eventfd; every other raise before the reactor wakes is
//! absorbed. The reactor drains the eventfd and then clears the flag, so a
//! raise that lands during the wake callback produces exactly one more
//! wake.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{CoreResult, ReactorError};

pub struct WakeSignal {
    fd: OwnedFd,
    pending: AtomicBool,
}

impl WakeSignal {
    /// Create a new eventfd-backed signal.
    pub fn new() -> CoreResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(ReactorError::last_os("eventfd"));
        }
        // Safety: eventfd returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd, pending: AtomicBool::new(false) })
    }

    /// Request a wake. Never blocks; safe from any thread.
    ///
    /// Raises issued before the reactor next runs the callback collapse
    /// into one callback invocation.
    pub fn raise(&self) -> CoreResult<()> {
        if self.pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // EAGAIN: the counter is saturated, so a wake is already readable.
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(());
            }
            self.pending.store(false, Ordering::Release);
            return Err(ReactorError { op: "eventfd write", source: err });
        }
        Ok(())
    }

    /// True between a raise and the reactor acknowledging it.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Drain the eventfd and reopen the signal for the next raise.
    ///
    /// Called by the reactor right before it runs the wake callback. The
    /// flag is cleared after the read: clearing first could let a raise
    /// write the eventfd and have that write swallowed by the read.
    pub(crate) fn acknowledge(&self) {
        let mut val: u64 = 0;
        // EAGAIN just means another acknowledge already drained it.
        let _ = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // AcqRel: synchronizes with the last raiser, so its queue writes
        // are visible to the callback.
        self.pending.swap(false, Ordering::AcqRel);
    }
}

impl AsRawFd for WakeSignal {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for WakeSignal {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for WakeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeSignal")
            .field("fd", &self.fd.as_raw_fd())
            .field("pending", &self.is_pending())
            .finish()
    }
}
