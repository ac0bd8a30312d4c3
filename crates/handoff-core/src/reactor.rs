//! # Reactor: single-threaded epoll dispatch loop
//!
//! One reactor per worker thread. It multiplexes descriptor readiness and
//! `WakeSignal` wakes, and runs every callback to completion on the thread
//! that called `run()`.
//!
//! ```text
//!  epoll_wait ──► token < WAKE_BASE   → handler.on_ready(token, readiness)
//!             ├─► WAKE_BASE + i       → acknowledge wakes[i], handler.on_wake(i)
//!             └─► STOP_TOKEN          → acknowledge stop, leave the loop
//! ```
//!
//! Descriptors are level-triggered. A descriptor whose interest drops to
//! nothing is removed from the epoll set (`Poller::update`), so a hung-up
//! socket that nobody is watching cannot spin the loop.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ops::BitOr;

use tracing::{debug, trace};

use crate::error::{CoreResult, ReactorError};
use crate::wake::WakeSignal;

/// Tokens at or above this value belong to the reactor itself.
pub const WAKE_BASE: usize = usize::MAX - 64;
const STOP_TOKEN: usize = usize::MAX;
pub const MAX_WAKES: usize = 63;
const EVENTS_CAPACITY: usize = 256;

/// Identifies a registered descriptor in callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Token(pub usize);

/// Identifies a watched `WakeSignal` in `on_wake`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakeId(pub usize);

/// Readiness a descriptor is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    pub const NONE: Self = Self { readable: false, writable: false };
    pub const READABLE: Self = Self { readable: true, writable: false };
    pub const WRITABLE: Self = Self { readable: false, writable: true };

    #[inline]
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.readable
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.writable
    }

    /// `self` without the bits of `other`.
    #[inline]
    pub fn remove(self, other: Self) -> Self {
        Self {
            readable: self.readable && !other.readable,
            writable: self.writable && !other.writable,
        }
    }

    fn epoll_bits(self) -> u32 {
        let mut bits = 0;
        if self.readable {
            bits |= libc::EPOLLIN as u32;
        }
        if self.writable {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            readable: self.readable || rhs.readable,
            writable: self.writable || rhs.writable,
        }
    }
}

/// What epoll reported for a descriptor.
///
/// Hang-up and error conditions mark both directions ready, so the next
/// read or write surfaces the condition to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    fn from_bits(bits: u32) -> Self {
        let broken = bits & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
        Self {
            readable: broken || bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
            writable: broken || bits & libc::EPOLLOUT as u32 != 0,
        }
    }
}

/// Interest registration on the reactor's epoll instance.
///
/// Handed to callbacks so they can change what they watch.
pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> CoreResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(ReactorError::last_os("epoll_create1"));
        }
        // Safety: epoll_create1 returned a fresh descriptor.
        Ok(Self { epfd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> CoreResult<()> {
        debug_assert!(token.0 < WAKE_BASE, "token {} is reserved", token.0);
        self.ctl(libc::EPOLL_CTL_ADD, fd, token.0, interest.epoll_bits(), "epoll_ctl(ADD)")
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> CoreResult<()> {
        debug_assert!(token.0 < WAKE_BASE, "token {} is reserved", token.0);
        self.ctl(libc::EPOLL_CTL_MOD, fd, token.0, interest.epoll_bits(), "epoll_ctl(MOD)")
    }

    pub fn deregister(&self, fd: RawFd) -> CoreResult<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0, "epoll_ctl(DEL)")
    }

    /// Move `fd` from interest `old` to `new`, adding or removing it from
    /// the epoll set when either side is empty.
    pub fn update(&self, fd: RawFd, token: Token, old: Interest, new: Interest) -> CoreResult<()> {
        match (old.is_empty(), new.is_empty()) {
            (true, true) => Ok(()),
            (true, false) => self.register(fd, token, new),
            (false, true) => self.deregister(fd),
            (false, false) if old != new => self.reregister(fd, token, new),
            (false, false) => Ok(()),
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, data: usize, events: u32, name: &'static str) -> CoreResult<()> {
        let mut event = libc::epoll_event { events, u64: data as u64 };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(ReactorError::last_os(name));
        }
        Ok(())
    }

    /// Block until at least one event is ready. EINTR yields zero events.
    fn wait(&self, events: &mut [libc::epoll_event]) -> CoreResult<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                -1,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                debug!("epoll_wait interrupted");
                return Ok(0);
            }
            return Err(ReactorError { op: "epoll_wait", source: err });
        }
        Ok(n as usize)
    }
}

/// Callbacks a stage implements. Both run on the reactor's thread.
pub trait EventHandler {
    /// A registered descriptor is ready.
    fn on_ready(&mut self, poller: &Poller, token: Token, ready: Readiness);

    /// A watched `WakeSignal` was raised one or more times since the last
    /// call. One call may stand for many raises.
    fn on_wake(&mut self, poller: &Poller, wake: WakeId);
}

/// The dispatch loop. Borrows its signals; the owner of the signals must
/// outlive every thread that runs or raises them.
pub struct Reactor<'s> {
    poller: Poller,
    stop: &'s WakeSignal,
    wakes: Vec<&'s WakeSignal>,
    events: Vec<libc::epoll_event>,
}

impl<'s> Reactor<'s> {
    /// Create a reactor bound to `stop`, its `StopSignal`.
    pub fn new(stop: &'s WakeSignal) -> CoreResult<Self> {
        let poller = Poller::new()?;
        poller.ctl(
            libc::EPOLL_CTL_ADD,
            stop.as_raw_fd(),
            STOP_TOKEN,
            libc::EPOLLIN as u32,
            "epoll_ctl(ADD stop)",
        )?;
        Ok(Self {
            poller,
            stop,
            wakes: Vec::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; EVENTS_CAPACITY],
        })
    }

    /// Watch `signal`; its raises arrive as `on_wake` with the returned id.
    ///
    /// At most `MAX_WAKES` signals per reactor; one more fails with `ENOSPC`.
    pub fn watch(&mut self, signal: &'s WakeSignal) -> CoreResult<WakeId> {
        let idx = self.wakes.len();
        if idx >= MAX_WAKES {
            return Err(ReactorError {
                op: "watch",
                source: std::io::Error::from_raw_os_error(libc::ENOSPC),
            });
        }
        self.poller.ctl(
            libc::EPOLL_CTL_ADD,
            signal.as_raw_fd(),
            WAKE_BASE + idx,
            libc::EPOLLIN as u32,
            "epoll_ctl(ADD wake)",
        )?;
        self.wakes.push(signal);
        Ok(WakeId(idx))
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// Dispatch events to `handler` until the stop signal is raised.
    ///
    /// The callback in progress when stop is observed runs to completion;
    /// events after the stop in the same batch are not dispatched.
    pub fn run<H: EventHandler>(&mut self, handler: &mut H) -> CoreResult<()> {
        loop {
            let n = self.poller.wait(&mut self.events)?;
            for i in 0..n {
                let event = self.events[i];
                let token = event.u64 as usize;
                let bits = event.events;

                if token == STOP_TOKEN {
                    self.stop.acknowledge();
                    trace!("stop signal observed");
                    return Ok(());
                }
                if token >= WAKE_BASE {
                    let idx = token - WAKE_BASE;
                    if let Some(signal) = self.wakes.get(idx).copied() {
                        signal.acknowledge();
                        handler.on_wake(&self.poller, WakeId(idx));
                    }
                    continue;
                }
                handler.on_ready(&self.poller, Token(token), Readiness::from_bits(bits));
            }
        }
    }
}
