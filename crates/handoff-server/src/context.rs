//! Per-connection state handed between the stages.
//!
//! A `ConnectionContext` is always boxed. Whichever stage holds the box has
//! exclusive access; moving the box into a `Producer` is the only way to
//! hand it over.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use handoff_core::{CoreResult, Interest, Poller, Token};

use crate::processing::Transform;

/// Bytes buffered per connection before reads stop.
pub const BUF_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Owned by the IO stage, waiting for bytes from the peer.
    Reading,
    /// In the forward queue, the processing stage, or the return queue.
    QueuedForProcessing,
    /// Back on the IO stage, flushing the transformed bytes.
    Writing,
    /// Torn down; the context is about to be dropped.
    Closed,
}

pub struct ConnectionContext {
    token: Token,
    stream: TcpStream,
    peer: SocketAddr,
    buf: [u8; BUF_SIZE],
    len: usize,
    scratch: [u8; BUF_SIZE],
    state: ConnState,
    interest: Interest,
}

impl ConnectionContext {
    /// Zero-initialised context for a freshly accepted stream.
    ///
    /// The stream is expected to be non-blocking already. Interest starts
    /// empty; the IO stage registers it.
    pub fn new(token: Token, stream: TcpStream, peer: SocketAddr) -> Box<Self> {
        Box::new(Self {
            token,
            stream,
            peer,
            buf: [0; BUF_SIZE],
            len: 0,
            scratch: [0; BUF_SIZE],
            state: ConnState::Reading,
            interest: Interest::NONE,
        })
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Buffered bytes not yet written back.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn has_room(&self) -> bool {
        self.len < BUF_SIZE
    }

    /// One read into the free tail of the buffer.
    ///
    /// `Ok(0)` means the peer closed its side. Callers check `has_room()`
    /// first; a full buffer also reads zero bytes.
    pub fn fill(&mut self) -> io::Result<usize> {
        let n = self.stream.read(&mut self.buf[self.len..])?;
        self.len += n;
        Ok(n)
    }

    /// Write as much of the buffer as the socket takes.
    ///
    /// Unwritten bytes move to the front of the buffer. Returns the number
    /// of bytes written, which is zero if the socket is still full.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut written = 0;
        let result = loop {
            if written == self.len {
                break Ok(());
            }
            match self.stream.write(&self.buf[written..self.len]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.buf.copy_within(written..self.len, 0);
        self.len -= written;
        result.map(|()| written)
    }

    /// Run `transform` over the buffered bytes in place.
    pub fn apply<X: Transform + ?Sized>(&mut self, transform: &mut X) {
        let len = self.len;
        transform.apply(&mut self.buf[..len], &mut self.scratch[..len]);
    }

    /// Change this connection's epoll interest.
    pub fn set_interest(&mut self, poller: &Poller, interest: Interest) -> CoreResult<()> {
        poller.update(self.fd(), self.token, self.interest, interest)?;
        self.interest = interest;
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("fd", &self.fd())
            .field("len", &self.len)
            .field("state", &self.state)
            .finish()
    }
}
