//! Server error types.
//!
//! Startup failures (`Config`, `Resource`) are fatal and map to a non-zero
//! exit. Per-connection IO failures never surface here; the IO stage logs
//! them and closes the connection in place.

use std::io;

use handoff_core::{QueueError, ReactorError};
use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("signal handling failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("{0} worker panicked")]
    WorkerPanicked(&'static str),
}

/// Invalid startup configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid queue capacity {0}: must be a power of two no larger than 1024")]
    QueueCapacity(usize),

    #[error("listen backlog must be at least 1")]
    Backlog,

    #[error("drain batch must be at least 1")]
    DrainBatch,

    #[error("cannot parse {key}={value:?}")]
    Env { key: &'static str, value: String },
}

/// A startup resource could not be created.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to create stream listen socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to bind stream listen socket to port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on stream socket: {0}")]
    Listen(#[source] io::Error),

    #[error("failed to create {which} queue: {source}")]
    Queue {
        which: &'static str,
        #[source]
        source: QueueError,
    },

    #[error("failed to create {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}
