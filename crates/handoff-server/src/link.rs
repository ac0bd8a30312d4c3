//! One stage's view of the pipeline: its end of each queue, both wake
//! signals, and the shared counters. Nothing here is owned; the
//! `Supervisor` holds the queues and signals for the lifetime `'q`.

use std::sync::atomic::AtomicBool;

use handoff_core::{Consumer, Producer, WakeSignal};
use tracing::warn;

use crate::context::ConnectionContext;
use crate::stats::PipelineStats;

pub type Handoff = Box<ConnectionContext>;

pub struct StageLink<'q> {
    /// Outbound queue, toward the peer stage.
    pub tx: Producer<'q, Handoff>,
    /// Inbound queue, from the peer stage.
    pub rx: Consumer<'q, Handoff>,
    pub peer_wake: &'q WakeSignal,
    pub own_wake: &'q WakeSignal,
    /// Set by the processing stage when the return queue refused a
    /// context; cleared by the IO stage once it has made room.
    pub return_stalled: &'q AtomicBool,
    pub stats: &'q PipelineStats,
}

impl StageLink<'_> {
    pub fn raise_peer(&self) {
        if let Err(e) = self.peer_wake.raise() {
            warn!(error = %e, "failed to wake peer stage");
        }
    }

    /// Come back to this stage after the current batch of events.
    pub fn raise_own(&self) {
        if let Err(e) = self.own_wake.raise() {
            warn!(error = %e, "failed to re-arm own wake");
        }
    }
}
