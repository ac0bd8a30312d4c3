//! # handoff-core
//!
//! The hand-off machinery between two single-threaded pipeline stages.
//!
//! ## Modules
//!
//! - `ring` - fixed-capacity SPSC queue that moves ownership between threads
//! - `wake` - coalesced cross-thread wake backed by an eventfd
//! - `reactor` - epoll dispatch loop with per-kind callbacks and a stop signal
//! - `error` - Error types
//!
//! The wake signal and reactor are Linux-only (eventfd + epoll).

pub mod error;
pub mod ring;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod wake;
        pub mod reactor;

        pub use wake::WakeSignal;
        pub use reactor::{EventHandler, Interest, Poller, Reactor, Readiness, Token, WakeId};
    } else {
        compile_error!("handoff-core: the reactor requires Linux (epoll + eventfd)");
    }
}

// Re-exports for convenience
pub use error::{CoreResult, QueueError, QueueFull, ReactorError};
pub use ring::{Consumer, Producer, RingQueue, MAX_CAPACITY};
