//! Processing stage: transform the buffered bytes and send them back.
//!
//! Runs on its own reactor with no descriptors of its own, only the wake
//! signal the IO stage raises. It never opens, closes, or frees a
//! connection; a context it cannot return is held until the return queue
//! has room again.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use handoff_core::{EventHandler, Poller, QueueFull, Readiness, Token, WakeId};
use tracing::{trace, warn};

use crate::link::{Handoff, StageLink};
use crate::stats::PipelineStats;

/// An in-place payload transform.
///
/// `data` and `scratch` have the same length; `scratch` is free working
/// space whose contents are discarded afterwards.
pub trait Transform: Send {
    fn apply(&mut self, data: &mut [u8], scratch: &mut [u8]);
}

impl<F> Transform for F
where
    F: FnMut(&mut [u8], &mut [u8]) + Send,
{
    fn apply(&mut self, data: &mut [u8], scratch: &mut [u8]) {
        self(data, scratch)
    }
}

/// Reverse the byte range.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reverse;

impl Transform for Reverse {
    fn apply(&mut self, data: &mut [u8], scratch: &mut [u8]) {
        scratch.copy_from_slice(data);
        for (dst, src) in data.iter_mut().zip(scratch.iter().rev()) {
            *dst = *src;
        }
    }
}

pub struct ProcessingStage<'q, X> {
    transform: X,
    link: StageLink<'q>,
    /// Processed contexts the return queue refused, oldest first.
    backlog: VecDeque<Handoff>,
    batch: usize,
}

impl<'q, X: Transform> ProcessingStage<'q, X> {
    pub fn new(transform: X, link: StageLink<'q>, batch: usize) -> Self {
        Self { transform, link, backlog: VecDeque::new(), batch: batch.max(1) }
    }

    /// Contexts still held when the stage stopped.
    pub fn into_backlog(self) -> VecDeque<Handoff> {
        self.backlog
    }

    /// Return a processed context. False if it had to be held back.
    fn send_back(&mut self, ctx: Handoff) -> bool {
        let token = ctx.token();
        match self.link.tx.enqueue(ctx) {
            Ok(()) => {
                self.link.raise_peer();
                true
            }
            Err(QueueFull(ctx)) => {
                PipelineStats::bump(&self.link.stats.return_rejections);
                warn!(token = token.0, peer = %ctx.peer(), "return queue full, holding context");
                self.backlog.push_back(ctx);
                self.stall();
                false
            }
        }
    }

    /// Retry held contexts in order. True once the backlog is empty.
    fn flush_backlog(&mut self) -> bool {
        let mut sent = false;
        while let Some(ctx) = self.backlog.pop_front() {
            match self.link.tx.enqueue(ctx) {
                Ok(()) => sent = true,
                Err(QueueFull(ctx)) => {
                    self.backlog.push_front(ctx);
                    break;
                }
            }
        }
        if !self.backlog.is_empty() {
            self.stall();
        } else if sent {
            self.link.raise_peer();
        }
        self.backlog.is_empty()
    }

    fn stall(&self) {
        self.link.return_stalled.store(true, Ordering::Release);
        self.link.raise_peer();
    }
}

impl<X: Transform> EventHandler for ProcessingStage<'_, X> {
    fn on_ready(&mut self, _poller: &Poller, token: Token, _ready: Readiness) {
        trace!(token = token.0, "processing stage has no descriptors");
    }

    fn on_wake(&mut self, _poller: &Poller, _wake: WakeId) {
        if !self.flush_backlog() {
            return;
        }

        let mut drained = 0;
        while drained < self.batch {
            let Some(mut ctx) = self.link.rx.dequeue() else {
                break;
            };
            drained += 1;
            ctx.apply(&mut self.transform);
            PipelineStats::bump(&self.link.stats.processed);
            if !self.send_back(ctx) {
                return;
            }
        }

        if drained == self.batch && !self.link.rx.is_empty() {
            self.link.raise_own();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_util::loopback_pair;
    use crate::context::ConnectionContext;
    use handoff_core::{RingQueue, WakeSignal};
    use std::io::Write;
    use std::sync::atomic::AtomicBool;

    fn filled(token: usize, bytes: &[u8]) -> (Handoff, std::net::TcpStream) {
        let (mut ctx, mut client) = loopback_pair(Token(token));
        client.write_all(bytes).unwrap();
        crate::context::test_util::fill_blocking(&mut ctx).unwrap();
        assert_eq!(ctx.data(), bytes);
        (ctx, client)
    }

    struct Fixture {
        forward: RingQueue<Box<ConnectionContext>>,
        backward: RingQueue<Box<ConnectionContext>>,
        io_wake: WakeSignal,
        own_wake: WakeSignal,
        stalled: AtomicBool,
        stats: PipelineStats,
    }

    impl Fixture {
        fn new(capacity: usize) -> Self {
            Self {
                forward: RingQueue::with_capacity(8).unwrap(),
                backward: RingQueue::with_capacity(capacity).unwrap(),
                io_wake: WakeSignal::new().unwrap(),
                own_wake: WakeSignal::new().unwrap(),
                stalled: AtomicBool::new(false),
                stats: PipelineStats::new(),
            }
        }
    }

    #[test]
    fn test_reverse() {
        let mut data = *b"hello world";
        let mut scratch = [0u8; 11];
        Reverse.apply(&mut data, &mut scratch);
        assert_eq!(&data, b"dlrow olleh");

        let mut empty: [u8; 0] = [];
        Reverse.apply(&mut empty, &mut []);
    }

    #[test]
    fn test_closure_transform() {
        let mut upper = |data: &mut [u8], _: &mut [u8]| data.make_ascii_uppercase();
        let mut data = *b"abc";
        Transform::apply(&mut upper, &mut data, &mut [0u8; 3]);
        assert_eq!(&data, b"ABC");
    }

    #[test]
    fn test_wake_processes_and_returns() {
        let mut fx = Fixture::new(8);
        let poller = Poller::new().unwrap();
        let (mut fwd_tx, fwd_rx) = fx.forward.split();
        let (ret_tx, mut ret_rx) = fx.backward.split();

        let (a, _ca) = filled(1, b"abc");
        let (b, _cb) = filled(2, b"xy");
        fwd_tx.enqueue(a).unwrap();
        fwd_tx.enqueue(b).unwrap();

        let link = StageLink {
            tx: ret_tx,
            rx: fwd_rx,
            peer_wake: &fx.io_wake,
            own_wake: &fx.own_wake,
            return_stalled: &fx.stalled,
            stats: &fx.stats,
        };
        let mut stage = ProcessingStage::new(Reverse, link, 64);
        stage.on_wake(&poller, WakeId(0));

        let first = ret_rx.dequeue().unwrap();
        assert_eq!(first.token(), Token(1));
        assert_eq!(first.data(), b"cba");
        let second = ret_rx.dequeue().unwrap();
        assert_eq!(second.data(), b"yx");
        assert!(ret_rx.dequeue().is_none());

        assert!(fx.io_wake.is_pending());
        assert_eq!(fx.stats.snapshot().processed, 2);
    }

    #[test]
    fn test_return_full_holds_and_stalls() {
        // Capacity 2: one usable return slot.
        let mut fx = Fixture::new(2);
        let poller = Poller::new().unwrap();
        let (mut fwd_tx, fwd_rx) = fx.forward.split();
        let (ret_tx, mut ret_rx) = fx.backward.split();

        let (a, _ca) = filled(1, b"ab");
        let (b, _cb) = filled(2, b"cd");
        let (c, _cc) = filled(3, b"ef");
        fwd_tx.enqueue(a).unwrap();
        fwd_tx.enqueue(b).unwrap();
        fwd_tx.enqueue(c).unwrap();

        let link = StageLink {
            tx: ret_tx,
            rx: fwd_rx,
            peer_wake: &fx.io_wake,
            own_wake: &fx.own_wake,
            return_stalled: &fx.stalled,
            stats: &fx.stats,
        };
        let mut stage = ProcessingStage::new(Reverse, link, 64);
        stage.on_wake(&poller, WakeId(0));

        // One returned, one held, one still waiting in the forward queue.
        assert_eq!(stage.backlog.len(), 1);
        assert_eq!(stage.link.rx.len(), 1);
        assert!(fx.stalled.load(Ordering::Acquire));
        assert!(fx.io_wake.is_pending());
        assert_eq!(fx.stats.snapshot().return_rejections, 1);

        // IO stage drains the return queue and clears the flag.
        assert_eq!(ret_rx.dequeue().unwrap().data(), b"ba");
        fx.stalled.store(false, Ordering::Release);

        // The held context goes out first; the last one is held in turn.
        stage.on_wake(&poller, WakeId(0));
        assert_eq!(stage.backlog.len(), 1);
        assert!(stage.link.rx.is_empty());
        assert_eq!(ret_rx.dequeue().unwrap().data(), b"dc");

        stage.on_wake(&poller, WakeId(0));
        stage.on_wake(&poller, WakeId(0));
        assert_eq!(ret_rx.dequeue().unwrap().data(), b"fe");
        assert!(stage.into_backlog().is_empty());
    }

    #[test]
    fn test_batch_bound_rearms_own_wake() {
        let mut fx = Fixture::new(8);
        let poller = Poller::new().unwrap();
        let (mut fwd_tx, fwd_rx) = fx.forward.split();
        let (ret_tx, mut ret_rx) = fx.backward.split();

        let mut clients = Vec::new();
        for i in 0..3 {
            let (ctx, client) = filled(i, b"z");
            clients.push(client);
            fwd_tx.enqueue(ctx).unwrap();
        }

        let link = StageLink {
            tx: ret_tx,
            rx: fwd_rx,
            peer_wake: &fx.io_wake,
            own_wake: &fx.own_wake,
            return_stalled: &fx.stalled,
            stats: &fx.stats,
        };
        let mut stage = ProcessingStage::new(Reverse, link, 2);
        stage.on_wake(&poller, WakeId(0));

        assert_eq!(fx.stats.snapshot().processed, 2);
        assert!(fx.own_wake.is_pending(), "leftover work must re-arm the wake");

        stage.on_wake(&poller, WakeId(0));
        assert_eq!(fx.stats.snapshot().processed, 3);
        for _ in 0..3 {
            assert!(ret_rx.dequeue().is_some());
        }
    }
}
