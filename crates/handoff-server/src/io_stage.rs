//! IO stage: accept, read, hand off, write back.
//!
//! Owns the listening socket and every connection. Per connection:
//!
//! ```text
//!   Reading ──read > 0──► QueuedForProcessing ──returned──► Writing
//!      ▲  │                                                   │
//!      │  └──EOF / error──► Closed ◄──────write error─────────┤
//!      └────────────────────── fully flushed ◄────────────────┘
//! ```
//!
//! A connection is registered with epoll only while it is `Reading` or
//! `Writing`. While queued its interest is empty, so a hang-up cannot fire
//! for a context this stage does not hold.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;

use handoff_core::{EventHandler, Interest, Poller, QueueFull, Readiness, Token, WakeId};
use tracing::{debug, info, trace, warn};

use crate::conn_table::ConnTable;
use crate::context::{ConnState, ConnectionContext};
use crate::error::ServerResult;
use crate::link::{Handoff, StageLink};
use crate::stats::PipelineStats;

/// Token of the listening socket. Connection tokens are table indices.
pub const LISTENER: Token = Token(usize::MAX >> 1);

pub struct IoStage<'q> {
    listener: TcpListener,
    conns: ConnTable,
    /// Connections the forward queue refused, oldest first. Their contexts
    /// stay in the table with empty interest.
    parked: VecDeque<Token>,
    link: StageLink<'q>,
    batch: usize,
}

impl<'q> IoStage<'q> {
    pub fn new(listener: TcpListener, link: StageLink<'q>, batch: usize) -> Self {
        Self {
            listener,
            conns: ConnTable::new(),
            parked: VecDeque::new(),
            link,
            batch: batch.max(1),
        }
    }

    /// Watch the listening socket on `poller`.
    pub fn register(&self, poller: &Poller) -> ServerResult<()> {
        poller.register(self.listener.as_raw_fd(), LISTENER, Interest::READABLE)?;
        Ok(())
    }

    /// Connections currently alive, including those out for processing.
    pub fn active(&self) -> usize {
        self.conns.active()
    }

    fn accept(&mut self, poller: &Poller) {
        let (stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => return,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%peer, error = %e, "failed to make stream non-blocking, dropping");
            return;
        }

        let token = self.conns.insert_with(|token| ConnectionContext::new(token, stream, peer));
        let Some(ctx) = self.conns.get_mut(token) else {
            return;
        };
        let fd = ctx.fd();
        if let Err(e) = ctx.set_interest(poller, Interest::READABLE) {
            warn!(%peer, fd, error = %e, "failed to register stream, dropping");
            self.conns.remove(token);
            return;
        }

        PipelineStats::bump(&self.link.stats.accepts);
        info!(%peer, fd, token = token.0, "new stream");
    }

    fn on_readable(&mut self, poller: &Poller, token: Token) {
        let Some(ctx) = self.conns.get_mut(token) else {
            return;
        };
        if !ctx.has_room() {
            return;
        }

        match ctx.fill() {
            Ok(0) if ctx.is_empty() => {
                debug!(token = token.0, "peer closed");
                self.close(poller, token);
                return;
            }
            Ok(n) => PipelineStats::add(&self.link.stats.bytes_in, n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => return,
            Err(e) => {
                PipelineStats::bump(&self.link.stats.io_errors);
                warn!(peer = %ctx.peer(), token = token.0, error = %e, "read failed");
                self.close(poller, token);
                return;
            }
        }

        if !ctx.is_empty() {
            self.forward(poller, token);
        }
    }

    /// Stop reading and hand the connection to the processing stage.
    fn forward(&mut self, poller: &Poller, token: Token) {
        let Some(ctx) = self.conns.get_mut(token) else {
            return;
        };
        if let Err(e) = ctx.set_interest(poller, Interest::NONE) {
            warn!(peer = %ctx.peer(), token = token.0, error = %e, "failed to pause stream");
            self.close(poller, token);
            return;
        }
        ctx.set_state(ConnState::QueuedForProcessing);

        // Keep arrival order behind anything already parked.
        if !self.parked.is_empty() {
            self.parked.push_back(token);
            self.retry_parked();
            if self.parked.back() == Some(&token) {
                self.parked_rejection(token);
            }
            return;
        }

        if let Err(QueueFull(ctx)) = self.hand_off(token) {
            self.conns.restore(ctx);
            self.parked.push_back(token);
            self.parked_rejection(token);
            self.link.raise_peer();
        }
    }

    /// Count and log a stream that has just been parked. Retries of an
    /// already parked stream are not counted again.
    fn parked_rejection(&self, token: Token) {
        PipelineStats::bump(&self.link.stats.forward_rejections);
        match self.conns.get(token) {
            Some(ctx) => warn!(
                peer = %ctx.peer(),
                token = token.0,
                parked = self.parked.len(),
                "forward queue full, parking stream"
            ),
            None => warn!(token = token.0, "forward queue full, parking stream"),
        }
    }

    fn hand_off(&mut self, token: Token) -> Result<(), QueueFull<Handoff>> {
        let Some(ctx) = self.conns.lend(token) else {
            return Ok(());
        };
        self.link.tx.enqueue(ctx)?;
        PipelineStats::bump(&self.link.stats.forwarded);
        self.link.raise_peer();
        Ok(())
    }

    fn retry_parked(&mut self) {
        while let Some(&token) = self.parked.front() {
            if let Err(QueueFull(ctx)) = self.hand_off(token) {
                self.conns.restore(ctx);
                self.link.raise_peer();
                break;
            }
            self.parked.pop_front();
        }
    }

    /// A processed context came back: start writing it out.
    fn resume(&mut self, poller: &Poller, ctx: Handoff) {
        let token = ctx.token();
        PipelineStats::bump(&self.link.stats.returned);
        self.conns.restore(ctx);

        let Some(ctx) = self.conns.get_mut(token) else {
            return;
        };
        ctx.set_state(ConnState::Writing);
        if let Err(e) = ctx.set_interest(poller, Interest::WRITABLE) {
            warn!(peer = %ctx.peer(), token = token.0, error = %e, "failed to arm write");
            self.close(poller, token);
        }
    }

    fn on_writable(&mut self, poller: &Poller, token: Token) {
        let Some(ctx) = self.conns.get_mut(token) else {
            return;
        };

        match ctx.flush() {
            Ok(n) => PipelineStats::add(&self.link.stats.bytes_out, n),
            Err(e) => {
                PipelineStats::bump(&self.link.stats.io_errors);
                warn!(peer = %ctx.peer(), token = token.0, error = %e, "write failed");
                self.close(poller, token);
                return;
            }
        }

        if ctx.is_empty() && ctx.has_room() {
            ctx.set_state(ConnState::Reading);
            if let Err(e) = ctx.set_interest(poller, Interest::READABLE) {
                warn!(peer = %ctx.peer(), token = token.0, error = %e, "failed to resume read");
                self.close(poller, token);
            }
        }
    }

    fn close(&mut self, poller: &Poller, token: Token) {
        let Some(mut ctx) = self.conns.remove(token) else {
            return;
        };
        if let Err(e) = ctx.set_interest(poller, Interest::NONE) {
            debug!(token = token.0, error = %e, "deregister on close failed");
        }
        ctx.set_state(ConnState::Closed);
        PipelineStats::bump(&self.link.stats.closes);
        info!(peer = %ctx.peer(), fd = ctx.fd(), token = token.0, "close stream");
    }
}

impl EventHandler for IoStage<'_> {
    fn on_ready(&mut self, poller: &Poller, token: Token, ready: Readiness) {
        if token == LISTENER {
            self.accept(poller);
            return;
        }

        let Some(ctx) = self.conns.get_mut(token) else {
            trace!(token = token.0, "readiness for a stream not held here");
            return;
        };
        match ctx.state() {
            ConnState::Reading if ready.readable => self.on_readable(poller, token),
            ConnState::Writing if ready.writable => self.on_writable(poller, token),
            state => trace!(token = token.0, ?state, ?ready, "readiness ignored"),
        }
    }

    fn on_wake(&mut self, poller: &Poller, _wake: WakeId) {
        let mut drained = 0;
        while drained < self.batch {
            let Some(ctx) = self.link.rx.dequeue() else {
                break;
            };
            drained += 1;
            self.resume(poller, ctx);
        }

        if drained == self.batch && !self.link.rx.is_empty() {
            self.link.raise_own();
        }
        if self.link.return_stalled.swap(false, Ordering::AcqRel) {
            self.link.raise_peer();
        }

        // Returns free forward slots.
        self.retry_parked();
    }
}
