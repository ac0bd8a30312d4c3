//! Supervisor: builds the pipeline, runs it, tears it down.
//!
//! ```text
//!                forward queue (Box<ConnectionContext>)
//!   ┌──────────┐ ─────────────────────────────────────► ┌──────────────────┐
//!   │ IoStage  │            raise proc_wake              │ ProcessingStage  │
//!   │ reactor  │ ◄───────────────────────────────────── │ reactor          │
//!   └──────────┘ return queue, raise io_wake             └──────────────────┘
//! ```
//!
//! The supervisor owns both queues, all four wake signals (one wake and
//! one stop per reactor), and the counters. The stages borrow them and run
//! on scoped threads, so every borrow ends before anything is released.
//! Teardown is ordinary drop order: whatever was created before a failure
//! is released on the way out, exactly once.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use handoff_core::{EventHandler, Reactor, RingQueue, WakeSignal};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::{ResourceError, ServerError, ServerResult};
use crate::io_stage::IoStage;
use crate::link::{Handoff, StageLink};
use crate::listener::bind_listener;
use crate::processing::{ProcessingStage, Transform};
use crate::stats::{PipelineStats, StatsSnapshot};

const IO_THREAD: &str = "handoff-io";
const PROCESSING_THREAD: &str = "handoff-processing";

pub struct Supervisor {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Handle given to the controlling thread while the workers run.
#[derive(Clone, Copy)]
pub struct Control<'s> {
    stops: [&'s WakeSignal; 2],
    exited: &'s AtomicBool,
    local_addr: SocketAddr,
    stats: &'s PipelineStats,
}

impl Control<'_> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask both reactors to stop. Safe to call repeatedly.
    pub fn shutdown(&self) {
        for stop in self.stops {
            if let Err(e) = stop.raise() {
                error!(error = %e, "failed to raise stop signal");
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// True once either worker thread has returned or unwound.
    pub fn worker_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// Stops the workers when the controlling closure returns or unwinds.
struct StopGuard<'s>(Control<'s>);

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// Held by each worker thread. On return or unwind it marks the exit and
/// stops the other stage.
struct WorkerExit<'s>(Control<'s>);

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        self.0.exited.store(true, Ordering::Release);
        self.0.shutdown();
    }
}

/// What `Supervisor::run` hands back after a clean stop.
#[derive(Debug)]
pub struct Shutdown<R> {
    /// The controlling closure's return value.
    pub output: R,
    pub stats: StatsSnapshot,
}

impl Supervisor {
    /// Validate `config` and bind the listening socket.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let listener = bind_listener(config.port, config.backlog)?;
        let local_addr = listener.local_addr().map_err(ResourceError::Listen)?;
        Ok(Self { config, listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run both stages until `control` returns.
    ///
    /// `control` runs on the calling thread while the workers serve
    /// traffic; both reactors are stopped as soon as it returns, then
    /// `run` joins the workers. If a worker fails or panics first, the
    /// other is stopped and `Control::worker_exited` turns true so that
    /// `control` can return; the failure is what `run` reports.
    pub fn run<X, F, R>(self, transform: X, control: F) -> ServerResult<Shutdown<R>>
    where
        X: Transform,
        F: FnOnce(&Control<'_>) -> R,
    {
        let Supervisor { config, listener, local_addr } = self;

        let mut forward = RingQueue::<Handoff>::with_capacity(config.queue_capacity)
            .map_err(|source| ResourceError::Queue { which: "forward", source })?;
        let mut backward = RingQueue::<Handoff>::with_capacity(config.queue_capacity)
            .map_err(|source| ResourceError::Queue { which: "return", source })?;

        let io_wake = WakeSignal::new()?;
        let io_stop = WakeSignal::new()?;
        let proc_wake = WakeSignal::new()?;
        let proc_stop = WakeSignal::new()?;
        let return_stalled = AtomicBool::new(false);
        let exited = AtomicBool::new(false);
        let stats = PipelineStats::new();

        let ctl = Control {
            stops: [&io_stop, &proc_stop],
            exited: &exited,
            local_addr,
            stats: &stats,
        };

        let mut io_reactor = Reactor::new(&io_stop)?;
        io_reactor.watch(&io_wake)?;
        let mut proc_reactor = Reactor::new(&proc_stop)?;
        proc_reactor.watch(&proc_wake)?;

        let (fwd_tx, fwd_rx) = forward.split();
        let (ret_tx, ret_rx) = backward.split();

        let io_stage = IoStage::new(
            listener,
            StageLink {
                tx: fwd_tx,
                rx: ret_rx,
                peer_wake: &proc_wake,
                own_wake: &io_wake,
                return_stalled: &return_stalled,
                stats: &stats,
            },
            config.drain_batch,
        );
        io_stage.register(io_reactor.poller())?;

        let processing = ProcessingStage::new(
            transform,
            StageLink {
                tx: ret_tx,
                rx: fwd_rx,
                peer_wake: &io_wake,
                own_wake: &proc_wake,
                return_stalled: &return_stalled,
                stats: &stats,
            },
            config.drain_batch,
        );

        info!(
            addr = %local_addr,
            backlog = config.backlog,
            queue_capacity = config.queue_capacity,
            "listening"
        );

        let (output, io_result, proc_result) = thread::scope(|s| -> ServerResult<_> {
            let proc_handle = thread::Builder::new()
                .name(PROCESSING_THREAD.into())
                .spawn_scoped(s, move || {
                    let _exit = WorkerExit(ctl);
                    let mut stage = processing;
                    let result = drive(PROCESSING_THREAD, proc_reactor, &mut stage);
                    (result, stage.into_backlog())
                })
                .map_err(|source| ResourceError::Thread { name: PROCESSING_THREAD, source })?;

            let io_handle = match thread::Builder::new()
                .name(IO_THREAD.into())
                .spawn_scoped(s, move || {
                    let _exit = WorkerExit(ctl);
                    let mut stage = io_stage;
                    drive(IO_THREAD, io_reactor, &mut stage)
                }) {
                Ok(handle) => handle,
                Err(source) => {
                    ctl.shutdown();
                    let _ = proc_handle.join();
                    return Err(ResourceError::Thread { name: IO_THREAD, source }.into());
                }
            };

            let output = {
                let _guard = StopGuard(ctl);
                control(&ctl)
            };

            let proc_result = proc_handle.join();
            let io_result = io_handle.join();
            Ok((output, io_result, proc_result))
        })?;

        let io_result = io_result.map_err(|_| ServerError::WorkerPanicked("io"))?;
        let (proc_result, held) =
            proc_result.map_err(|_| ServerError::WorkerPanicked("processing"))?;
        if !held.is_empty() {
            warn!(count = held.len(), "releasing contexts held by processing stage");
        }
        drop(held);

        let snapshot = stats.snapshot();
        info!("shutdown: {}", snapshot);

        io_result?;
        proc_result?;
        Ok(Shutdown { output, stats: snapshot })
    }
}

/// Run one stage's reactor.
fn drive<H: EventHandler>(
    name: &'static str,
    mut reactor: Reactor<'_>,
    stage: &mut H,
) -> ServerResult<()> {
    info!("{} running", name);
    let result = reactor.run(stage).map_err(ServerError::from);
    match &result {
        Ok(()) => info!("{} stopped", name),
        Err(e) => error!(error = %e, "{} reactor failed", name),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::processing::Reverse;
    use crate::signals::TerminationSignals;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn test_config() -> ServerConfig {
        ServerConfig::default().port(0).backlog(64)
    }

    fn connect(ctl: &Control<'_>) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", ctl.local_addr().port())).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }

    fn roundtrip(stream: &mut TcpStream, msg: &[u8]) -> Vec<u8> {
        stream.write_all(msg).unwrap();
        let mut out = vec![0u8; msg.len()];
        stream.read_exact(&mut out).unwrap();
        out
    }

    fn wait_until<F: FnMut() -> bool>(mut cond: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_reverse_roundtrip() {
        let sup = Supervisor::new(test_config()).unwrap();
        let done = sup
            .run(Reverse, |ctl| {
                let mut client = connect(ctl);
                assert_eq!(roundtrip(&mut client, b"abc"), b"cba");
                assert_eq!(roundtrip(&mut client, b"hello world"), b"dlrow olleh");
            })
            .unwrap();

        assert_eq!(done.stats.accepts, 1);
        assert_eq!(done.stats.processed, 2);
        assert_eq!(done.stats.bytes_in, 14);
        assert_eq!(done.stats.bytes_out, 14);
    }

    #[test]
    fn test_full_buffer_then_disconnect() {
        let sup = Supervisor::new(test_config()).unwrap();
        sup.run(Reverse, |ctl| {
            let mut client = connect(ctl);
            client.write_all(&[b'x'; 256]).unwrap();
            drop(client);

            wait_until(|| ctl.stats().closes >= 1);
            assert_eq!(ctl.stats().open(), 0);

            // Still serving.
            let mut next = connect(ctl);
            assert_eq!(roundtrip(&mut next, b"ok"), b"ko");
        })
        .unwrap();
    }

    #[test]
    fn test_concurrent_clients() {
        let sup = Supervisor::new(test_config()).unwrap();
        sup.run(Reverse, |ctl| {
            thread::scope(|s| {
                for id in 0..2u8 {
                    s.spawn(move || {
                        let mut client = connect(ctl);
                        for round in 0..50u8 {
                            let msg = [b'a' + id, b'0' + round % 10, b'z' - id];
                            let mut expected = msg;
                            expected.reverse();
                            assert_eq!(roundtrip(&mut client, &msg), expected);
                        }
                    });
                }
            });
        })
        .unwrap();
    }

    #[test]
    fn test_forward_rejection_under_slow_processing() {
        let (started_tx, started_rx) = mpsc::channel();
        let slow = move |data: &mut [u8], scratch: &mut [u8]| {
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(300));
            Reverse.apply(data, scratch);
        };

        // Capacity 2 leaves one usable slot per queue.
        let sup = Supervisor::new(test_config().queue_capacity(2)).unwrap();
        let done = sup
            .run(slow, |ctl| {
                let mut c1 = connect(ctl);
                let mut c2 = connect(ctl);
                let mut c3 = connect(ctl);

                c1.write_all(b"one").unwrap();
                started_rx.recv_timeout(Duration::from_secs(10)).unwrap();

                c2.write_all(b"two").unwrap();
                wait_until(|| ctl.stats().forwarded >= 2);

                c3.write_all(b"three").unwrap();
                wait_until(|| ctl.stats().forward_rejections >= 1);

                let mut out = [0u8; 3];
                c1.read_exact(&mut out).unwrap();
                assert_eq!(&out, b"eno");
                c2.read_exact(&mut out).unwrap();
                assert_eq!(&out, b"owt");
                let mut out = [0u8; 5];
                c3.read_exact(&mut out).unwrap();
                assert_eq!(&out, b"eerht");
            })
            .unwrap();

        assert!(done.stats.forward_rejections >= 1);
        assert_eq!(done.stats.processed, 3);
    }

    #[test]
    fn test_termination_signal_stops_server() {
        let signals = TerminationSignals::block().unwrap();
        let sup = Supervisor::new(test_config()).unwrap();

        let done = sup
            .run(Reverse, |ctl| {
                let mut client = connect(ctl);
                assert_eq!(roundtrip(&mut client, b"hi"), b"ih");

                // Delivered to this thread, which has it blocked.
                nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
                let sig = signals.wait_then_shutdown(ctl);
                drop(client);
                sig
            })
            .unwrap();

        assert_eq!(done.output.unwrap(), Some(nix::sys::signal::Signal::SIGTERM));
    }

    #[test]
    fn test_worker_panic_ends_signal_wait() {
        let signals = TerminationSignals::block().unwrap();
        let broken = |data: &mut [u8], _: &mut [u8]| {
            if !data.is_empty() {
                panic!("transform failed");
            }
        };

        let sup = Supervisor::new(test_config()).unwrap();
        let start = Instant::now();
        let result = sup.run(broken, |ctl| {
            let mut client = connect(ctl);
            client.write_all(b"x").unwrap();
            // No signal is ever sent; only the worker exit ends this wait.
            let waited = signals.wait_then_shutdown(ctl);
            assert!(ctl.worker_exited());
            waited
        });

        assert!(matches!(result, Err(ServerError::WorkerPanicked("processing"))));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_immediate_shutdown() {
        let sup = Supervisor::new(test_config()).unwrap();
        let addr = sup.local_addr();
        let done = sup.run(Reverse, |ctl| ctl.local_addr()).unwrap();
        assert_eq!(done.output, addr);
        assert_eq!(done.stats, StatsSnapshot::default());
    }

    #[test]
    fn test_invalid_capacity_rejected_before_bind() {
        match Supervisor::new(test_config().queue_capacity(3)) {
            Err(ServerError::Config(ConfigError::QueueCapacity(3))) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
