//! handoff-reverse
//!
//! TCP server that writes back every chunk it receives, byte-reversed.
//! One thread does all socket IO, a second thread reverses; connections
//! move between them over SPSC hand-off queues.
//!
//! Usage:
//!     cargo build --release -p handoff-reverse
//!     ./target/release/handoff-reverse [-p port] [-b backlog] [-r ring]
//!
//! Test with:
//!     printf 'hello world' | nc -q1 localhost 1234     # → dlrow olleh
//!
//! Stop with Ctrl-C or SIGTERM; exit status is 0 after both workers return.
//! A worker that fails or panics stops the server with exit status 1.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use handoff_server::{logging, Reverse, ServerConfig, ServerResult, Supervisor, TerminationSignals};

#[derive(Parser, Debug)]
#[command(name = "handoff-reverse", about = "Two-stage TCP byte-reversal server")]
struct Args {
    /// Port to listen on [env: HANDOFF_PORT, default 1234]
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen backlog [env: HANDOFF_BACKLOG, default 1024]
    #[arg(short, long)]
    backlog: Option<u32>,

    /// Hand-off queue capacity, a power of two up to 1024
    /// [env: HANDOFF_QUEUE_CAPACITY, default 1024]
    #[arg(short = 'r', long = "ring")]
    ring: Option<usize>,

    /// Queue items drained per wake [env: HANDOFF_DRAIN_BATCH, default 64]
    #[arg(long)]
    drain_batch: Option<usize>,
}

impl Args {
    fn into_config(self) -> ServerResult<ServerConfig> {
        let mut config = ServerConfig::from_env()?;
        if let Some(port) = self.port {
            config = config.port(port);
        }
        if let Some(backlog) = self.backlog {
            config = config.backlog(backlog);
        }
        if let Some(ring) = self.ring {
            config = config.queue_capacity(ring);
        }
        if let Some(batch) = self.drain_batch {
            config = config.drain_batch(batch);
        }
        Ok(config)
    }
}

fn serve(args: Args) -> ServerResult<()> {
    let config = args.into_config()?;

    // Before any worker exists, so all of them inherit the mask.
    let signals = TerminationSignals::block()?;
    let supervisor = Supervisor::new(config)?;

    let done = supervisor.run(Reverse, |ctl| signals.wait_then_shutdown(ctl))?;
    done.output?;

    info!("bye: {}", done.stats);
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init();

    match serve(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("handoff-reverse: {}", e);
            ExitCode::FAILURE
        }
    }
}
