//! Termination handling without a signal handler.
//!
//! SIGINT and SIGTERM are blocked on the calling thread before the workers
//! start, so every thread spawned afterwards inherits the mask and the
//! signals stay pending until `sigtimedwait` picks them up on the
//! controlling thread. No global state is touched from signal context.

use std::ptr;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use tracing::{info, warn};

use crate::error::ServerResult;
use crate::supervisor::Control;

/// How often the controlling thread checks whether a worker has exited.
const EXIT_POLL: Duration = Duration::from_millis(100);

pub struct TerminationSignals {
    mask: SigSet,
}

impl TerminationSignals {
    /// Block SIGINT and SIGTERM on the calling thread.
    ///
    /// Call before `Supervisor::run` so the worker threads inherit the
    /// mask.
    pub fn block() -> ServerResult<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block()?;
        Ok(Self { mask })
    }

    /// Wait for one of the blocked signals.
    pub fn wait(&self) -> ServerResult<Signal> {
        Ok(self.mask.wait()?)
    }

    /// Wait up to `timeout` for one of the blocked signals.
    pub fn wait_timeout(&self, timeout: Duration) -> ServerResult<Option<Signal>> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let ret = unsafe { libc::sigtimedwait(self.mask.as_ref(), ptr::null_mut(), &ts) };
        if ret >= 0 {
            return Ok(Some(Signal::try_from(ret)?));
        }
        match Errno::last() {
            Errno::EAGAIN | Errno::EINTR => Ok(None),
            e => Err(e.into()),
        }
    }

    /// Wait for a termination signal, then stop both reactors.
    ///
    /// Also returns, with `None`, once either worker has exited on its
    /// own; `Supervisor::run` then reports why.
    pub fn wait_then_shutdown(&self, ctl: &Control<'_>) -> ServerResult<Option<Signal>> {
        let result = loop {
            if ctl.worker_exited() {
                warn!("worker exited, no longer waiting for signals");
                break Ok(None);
            }
            match self.wait_timeout(EXIT_POLL) {
                Ok(None) => continue,
                other => break other,
            }
        };
        if let Ok(Some(sig)) = &result {
            info!(signal = sig.as_str(), "termination requested");
        }
        ctl.shutdown();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;
    use std::time::Instant;

    #[test]
    fn test_wait_timeout_expires_without_signal() {
        let signals = TerminationSignals::block().unwrap();
        let start = Instant::now();
        assert_eq!(signals.wait_timeout(Duration::from_millis(20)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_wait_timeout_takes_pending_signal() {
        let signals = TerminationSignals::block().unwrap();
        raise(Signal::SIGINT).unwrap();
        let sig = signals.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(sig, Some(Signal::SIGINT));
    }
}
