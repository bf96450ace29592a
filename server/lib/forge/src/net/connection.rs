use crate::http::parser::{HttpParser, ParseStatus};
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::net::buffer::Buffer;
use crate::net::security::{SecurityGuard, SecurityLimits};
use ember::logging::{self, Logger};
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

/// Index of a connection inside the pool. Cross-thread references carry a
/// slot plus the sequence observed at hand-off; the pool resolves the slot
/// back to the live connection.
pub type Slot = usize;

/// Lifecycle of one request on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Idle between requests.
    Waiting,
    /// Bytes of an incomplete request are arriving.
    Reading,
    /// A complete request is with the worker pool.
    Processing,
    /// The response is being drained to the socket.
    Writing,
    /// Tear-down underway; nothing further is dispatched.
    Closing,
}

/// Per-request parsing and response state carried by a connection.
pub struct HttpContext {
    pub parser: HttpParser,
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub keep_alive: bool,
    pub last_activity: Instant,
    pub state: ConnState,
}

impl HttpContext {
    pub fn new() -> HttpContext {
        HttpContext {
            parser: HttpParser::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            keep_alive: false,
            last_activity: Instant::now(),
            state: ConnState::Waiting,
        }
    }

    /// Back to WAITING for the next request on a keep-alive connection.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.request = HttpRequest::new();
        self.response.clear();
        self.keep_alive = false;
        self.state = ConnState::Waiting;
        self.last_activity = Instant::now();
    }
}

/// The full server-side state of one accepted TCP stream. A slot outlives
/// any individual socket: `activate` installs a fresh stream and bumps the
/// sequence, `retire_stream` closes it and bumps the sequence again, so
/// stale slot references can always be detected.
pub struct Connection {
    slot: Slot,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    pub read_buffer: Buffer,
    pub write_buffer: Buffer,
    pub ctx: HttpContext,
    pub guard: SecurityGuard,
    sequence: u64,
    /// WRITE interest currently installed in the poll.
    pub want_write: bool,
    log: Logger,
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        slot: Slot,
        limits: SecurityLimits,
        log: L,
    ) -> Connection {
        let conn_log = match log.into() {
            Some(log) => log.new(logging::o!("slot" => slot)),
            None => logging::discard(),
        };

        Connection {
            slot,
            stream: None,
            peer: None,
            read_buffer: Buffer::new(),
            write_buffer: Buffer::new(),
            ctx: HttpContext::new(),
            guard: SecurityGuard::new(limits),
            sequence: 0,
            want_write: false,
            log: conn_log,
        }
    }

    #[inline]
    pub fn slot(&self) -> Slot {
        self.slot
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// A connection without a stream is free or reclaim-pending.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    #[inline]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline]
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Installs a freshly accepted stream into this slot.
    pub fn activate(&mut self, stream: TcpStream, peer: SocketAddr, now: Instant) {
        self.sequence += 1;
        self.stream = Some(stream);
        self.peer = Some(peer);
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.ctx.reset();
        self.ctx.last_activity = now;
        self.guard.reset(now);
        self.want_write = false;

        logging::debug!(self.log, "connection activated";
                        "peer" => %peer, "sequence" => self.sequence);
    }

    /// Closes the socket for reclamation. The sequence bump invalidates
    /// every outstanding slot reference; the slot itself stays out of the
    /// free list until the reclaim grace elapses.
    pub fn retire_stream(&mut self) -> Option<TcpStream> {
        let stream = self.stream.take();
        if stream.is_some() {
            self.sequence += 1;
            self.ctx.state = ConnState::Closing;
            logging::debug!(self.log, "connection retired";
                            "sequence" => self.sequence,
                            "unread" => self.read_buffer.len(),
                            "unsent" => self.write_buffer.len());
        }
        stream
    }

    /// Final reset when the pool takes the slot back.
    pub fn release(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.ctx.reset();
        self.peer = None;
        self.want_write = false;
    }

    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.ctx.last_activity = now;
    }

    /// Drains the socket into the read buffer. Returns bytes read and
    /// whether the peer closed its end.
    pub fn fill_read_buffer(&mut self) -> io::Result<(usize, bool)> {
        match self.stream.as_mut() {
            Some(stream) => self.read_buffer.ingress(stream),
            None => Ok((0, true)),
        }
    }

    /// Sends as much of the write buffer as the socket accepts.
    pub fn flush_write_buffer(&mut self) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => self.write_buffer.egress(stream),
            None => Ok(0),
        }
    }

    /// Runs the parser over the unread bytes and consumes what it took.
    pub fn parse_available(&mut self) -> ParseStatus {
        let (consumed, status) = self.ctx.parser.parse(self.read_buffer.read_slice());
        self.read_buffer.consume(consumed);
        status
    }
}
