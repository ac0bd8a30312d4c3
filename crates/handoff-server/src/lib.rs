//! # handoff-server
//!
//! A TCP server split across two threads. The IO stage owns every socket;
//! the processing stage transforms buffered bytes. Connections travel
//! between them as boxed contexts over a pair of SPSC queues, with a
//! coalesced wake signal in each direction.
//!
//! ## Modules
//!
//! - `supervisor` - builds both stages, runs them on scoped threads, joins
//! - `io_stage` - accept, read, hand off, write back
//! - `processing` - the `Transform` seam and the processing stage
//! - `context` / `conn_table` - per-connection state and its owner's table
//! - `signals` - SIGINT/SIGTERM via `sigtimedwait`
//! - `config`, `logging`, `error`, `stats`

pub mod config;
pub mod conn_table;
pub mod context;
pub mod error;
pub mod io_stage;
pub mod link;
pub mod listener;
pub mod logging;
pub mod processing;
pub mod signals;
pub mod stats;
pub mod supervisor;

// Re-exports
pub use config::ServerConfig;
pub use context::{ConnState, ConnectionContext, BUF_SIZE};
pub use error::{ConfigError, ResourceError, ServerError, ServerResult};
pub use processing::{Reverse, Transform};
pub use signals::TerminationSignals;
pub use stats::StatsSnapshot;
pub use supervisor::{Control, Shutdown, Supervisor};
