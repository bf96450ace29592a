use crate::engine::EngineStats;
use crate::http::parser::ParseStatus;
use crate::http::response::HttpResponse;
use crate::net::connection::{ConnState, Connection, Slot};
use crate::net::pool::ConnectionPool;
use crate::net::timer::{TimerKind, TimerWheel, MONITOR_INTERVAL};
use crate::workers::{Job, JobQueue};
use ember::config::NetConfig;
use ember::logging::{self, Logger};
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Completed-connection queue depth on each listening socket.
pub const LISTEN_BACKLOG: i32 = 511;

/// Readiness events accepted per wakeup.
const MAX_EVENTS: usize = 512;

const WAKER_TOKEN: Token = Token(0);
const LISTENER_TOKEN_BASE: usize = 1;
const CONN_TOKEN_BASE: usize = 64;

/// Work for the I/O thread, pushed by workers, the timer monitor and the
/// send drainer. Poll registrations are only ever touched on the I/O
/// thread, so everything funnels through here.
#[derive(Debug, Clone, Copy)]
pub enum IoCommand {
    /// Drain the slot's write buffer; register WRITE interest if the
    /// socket pushes back.
    RegisterWrite { slot: Slot, sequence: u64 },
    /// Close the slot, provided the sequence still matches.
    Close { slot: Slot, sequence: u64 },
    /// Stop the loop.
    Shutdown,
}

/// Cross-thread mailbox for the event loop, wrapped around the poll waker.
pub struct CommandQueue {
    commands: Mutex<Vec<IoCommand>>,
    waker: Waker,
}

impl CommandQueue {
    pub(crate) fn new(waker: Waker) -> CommandQueue {
        CommandQueue {
            commands: Mutex::new(Vec::new()),
            waker,
        }
    }

    pub fn register_write(&self, slot: Slot, sequence: u64) {
        self.push(IoCommand::RegisterWrite { slot, sequence });
    }

    pub fn close(&self, slot: Slot, sequence: u64) {
        self.push(IoCommand::Close { slot, sequence });
    }

    pub fn shutdown(&self) {
        self.push(IoCommand::Shutdown);
    }

    fn push(&self, command: IoCommand) {
        self.commands.lock().unwrap().push(command);
        let _ = self.waker.wake();
    }

    fn drain(&self) -> Vec<IoCommand> {
        std::mem::take(&mut *self.commands.lock().unwrap())
    }
}

/// Knobs the loop needs from the `[net]` / `[net_security]` sections.
#[derive(Debug, Clone, Copy)]
pub struct EventLoopConfig {
    pub wait_time_enable: bool,
    pub timeout_kick: bool,
    pub flood_kick_enable: bool,
}

enum WriteOutcome {
    /// Nothing left to send; the connection carries on.
    Idle,
    /// Bytes remain; WRITE interest is registered.
    Pending,
    /// The connection must be reclaimed.
    Close,
}

/// One readiness loop per worker process, on a dedicated I/O thread: it
/// accepts, reads and feeds the parser, hands complete requests to the
/// worker pool, and drains response bytes back out.
pub struct EventLoop {
    poll: Poll,
    listeners: Vec<TcpListener>,
    pool: Arc<ConnectionPool>,
    timer: Arc<TimerWheel>,
    jobs: Arc<JobQueue>,
    commands: Arc<CommandQueue>,
    stats: Arc<EngineStats>,
    live: IndexSet<Slot>,
    config: EventLoopConfig,
    stop: Arc<AtomicBool>,
    log: Logger,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut listeners: Vec<TcpListener>,
        config: EventLoopConfig,
        pool: Arc<ConnectionPool>,
        timer: Arc<TimerWheel>,
        jobs: Arc<JobQueue>,
        stats: Arc<EngineStats>,
        stop: Arc<AtomicBool>,
        log: &Logger,
    ) -> io::Result<EventLoop> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        for (index, listener) in listeners.iter_mut().enumerate() {
            poll.registry().register(
                listener,
                Token(LISTENER_TOKEN_BASE + index),
                Interest::READABLE,
            )?;
        }

        Ok(EventLoop {
            poll,
            listeners,
            pool,
            timer,
            jobs,
            commands: Arc::new(CommandQueue::new(waker)),
            stats,
            live: IndexSet::new(),
            config,
            stop,
            log: log.new(logging::o!("subsystem" => "event_loop")),
        })
    }

    pub fn command_queue(&self) -> Arc<CommandQueue> {
        self.commands.clone()
    }

    /// Runs until the stop flag is raised, then reclaims every live
    /// connection.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        logging::info!(self.log, "event loop running";
                       "listeners" => self.listeners.len());

        while !self.stop.load(Ordering::SeqCst) {
            if let Err(err) = self.poll.poll(&mut events, Some(MONITOR_INTERVAL)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::crit!(self.log, "poll failed"; "error" => %err);
                break;
            }

            let ready: Vec<(Token, bool, bool, bool)> = events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable(),
                        event.is_writable(),
                        event.is_error() || event.is_read_closed() || event.is_write_closed(),
                    )
                })
                .collect();

            for (token, readable, writable, failed) in ready {
                match token {
                    WAKER_TOKEN => {}
                    Token(raw) if raw >= CONN_TOKEN_BASE => {
                        self.connection_ready(raw - CONN_TOKEN_BASE, readable, writable, failed);
                    }
                    Token(raw) => {
                        let index = raw - LISTENER_TOKEN_BASE;
                        if index < self.listeners.len() {
                            self.accept_ready(index);
                        }
                    }
                }
            }

            self.run_commands();
        }

        let live: Vec<Slot> = self.live.iter().copied().collect();
        for slot in live {
            self.close_connection(slot);
        }
        logging::info!(self.log, "event loop stopped");
    }

    fn run_commands(&mut self) {
        for command in self.commands.drain() {
            match command {
                IoCommand::RegisterWrite { slot, sequence } => {
                    self.command_write(slot, sequence)
                }
                IoCommand::Close { slot, sequence } => self.command_close(slot, sequence),
                IoCommand::Shutdown => self.stop.store(true, Ordering::SeqCst),
            }
        }
    }

    fn accept_ready(&mut self, index: usize) {
        loop {
            match self.listeners[index].accept() {
                Ok((stream, peer)) => self.install_connection(stream, peer),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Descriptor exhaustion and the like: log, give the
                    // backlog a breather until the next readiness wakeup.
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn install_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let (slot, sequence) = match self.pool.acquire(stream, peer) {
            Some(acquired) => acquired,
            None => {
                self.stats.refused_inc();
                logging::warn!(self.log, "connection pool exhausted, dropping socket";
                               "peer" => %peer);
                return;
            }
        };

        let conn_arc = match self.pool.get(slot) {
            Some(conn) => conn,
            None => return,
        };
        let registration = {
            let mut conn = conn_arc.lock().unwrap();
            let token = Token(CONN_TOKEN_BASE + slot);
            match conn.stream_mut() {
                Some(stream) => self.poll.registry().register(stream, token, Interest::READABLE),
                None => return,
            }
        };

        if let Err(err) = registration {
            logging::error!(self.log, "socket registration failed";
                            "slot" => slot, "error" => %err);
            self.pool.enqueue_for_reclaim(slot);
            return;
        }

        self.live.insert(slot);
        self.stats.online_inc();
        self.stats.accepted_inc();
        if self.config.wait_time_enable {
            self.timer.add(slot, sequence, TimerKind::Idle, Instant::now());
        }
        logging::debug!(self.log, "connection accepted";
                        "slot" => slot, "peer" => %peer);
    }

    fn connection_ready(&mut self, slot: Slot, readable: bool, writable: bool, failed: bool) {
        if readable {
            self.read_ready(slot);
        }
        if writable {
            self.write_ready(slot, failed);
        }
        if failed && !readable && !writable {
            self.close_connection(slot);
        }
    }

    fn read_ready(&mut self, slot: Slot) {
        let conn_arc = match self.pool.get(slot) {
            Some(conn) => conn,
            None => return,
        };
        let mut conn = conn_arc.lock().unwrap();
        if !conn.is_open() {
            return;
        }

        let now = Instant::now();
        let (count, eof) = match conn.fill_read_buffer() {
            Ok(result) => result,
            Err(err) => {
                logging::debug!(conn.log(), "read failed"; "error" => %err);
                drop(conn);
                self.close_connection(slot);
                return;
            }
        };

        if count > 0 {
            conn.touch(now);
            let flooded = conn.guard.check(now);
            if flooded && self.config.flood_kick_enable {
                logging::warn!(conn.log(), "flood detected, kicking");
                drop(conn);
                self.close_connection(slot);
                return;
            }

            if let WriteOutcome::Close = self.drive_parser(&mut conn, slot) {
                drop(conn);
                self.close_connection(slot);
                return;
            }
        }

        if eof {
            logging::debug!(conn.log(), "peer closed connection");
            drop(conn);
            self.close_connection(slot);
        }
    }

    /// Feeds buffered bytes to the parser while the connection is between
    /// requests. A complete request moves the context to PROCESSING and a
    /// job to the worker pool; a malformed one gets the 400 and a close.
    fn drive_parser(&mut self, conn: &mut Connection, slot: Slot) -> WriteOutcome {
        if conn.read_buffer.is_empty() {
            return WriteOutcome::Idle;
        }
        match conn.ctx.state {
            ConnState::Waiting | ConnState::Reading => {}
            // Mid-request bytes stay buffered until the context returns to
            // WAITING.
            _ => return WriteOutcome::Idle,
        }
        conn.ctx.state = ConnState::Reading;

        match conn.parse_available() {
            ParseStatus::NeedMore => WriteOutcome::Idle,
            ParseStatus::Error => {
                logging::warn!(conn.log(), "malformed request";
                               "reason" => conn.ctx.parser.last_error().to_string());
                let mut response = HttpResponse::new();
                response.set_status(400, "");
                response.set_header("Connection", "close");
                response.text("Bad Request");
                let bytes = response.serialize();

                conn.ctx.keep_alive = false;
                conn.ctx.state = ConnState::Writing;
                conn.ctx.response = response;
                conn.write_buffer.append(&bytes);
                self.drain_write(conn, slot)
            }
            ParseStatus::Complete => {
                let sequence = conn.sequence();
                conn.ctx.keep_alive = conn.ctx.parser.wants_keep_alive();
                conn.ctx.request = conn.ctx.parser.take_request();
                conn.ctx.state = ConnState::Processing;
                self.timer.add(slot, sequence, TimerKind::Request, Instant::now());
                self.jobs.submit(Job { slot, sequence });
                WriteOutcome::Idle
            }
        }
    }

    fn write_ready(&mut self, slot: Slot, failed: bool) {
        let conn_arc = match self.pool.get(slot) {
            Some(conn) => conn,
            None => return,
        };
        let mut conn = conn_arc.lock().unwrap();
        if !conn.is_open() {
            return;
        }

        if failed {
            // Write readiness paired with an error or hang-up: account for
            // the send that will never complete and reset the context.
            conn.guard.decrement_send();
            conn.ctx.reset();
            drop(conn);
            self.close_connection(slot);
            return;
        }

        let outcome = self.drain_write(&mut conn, slot);
        drop(conn);
        if let WriteOutcome::Close = outcome {
            self.close_connection(slot);
        }
    }

    /// Pushes the write buffer at the socket. A full drain completes the
    /// response lifecycle; a partial one leaves WRITE interest armed.
    fn drain_write(&mut self, conn: &mut Connection, slot: Slot) -> WriteOutcome {
        match conn.flush_write_buffer() {
            Ok(_) => {
                if conn.write_buffer.is_empty() {
                    self.finish_write(conn, slot)
                } else {
                    self.set_write_interest(conn, slot, true);
                    WriteOutcome::Pending
                }
            }
            Err(err) => {
                logging::debug!(conn.log(), "write failed"; "error" => %err);
                WriteOutcome::Close
            }
        }
    }

    /// The response has fully left the buffer: either rotate back to
    /// WAITING for the next request or close per negotiation.
    fn finish_write(&mut self, conn: &mut Connection, slot: Slot) -> WriteOutcome {
        self.set_write_interest(conn, slot, false);
        if conn.ctx.state != ConnState::Writing {
            return WriteOutcome::Idle;
        }

        self.timer.remove_slot(slot);

        if conn.ctx.keep_alive {
            let sequence = conn.sequence();
            conn.ctx.reset();
            self.timer
                .add(slot, sequence, TimerKind::KeepAlive, Instant::now());
            // Pipelined bytes already buffered parse right away.
            self.drive_parser(conn, slot)
        } else {
            conn.ctx.state = ConnState::Closing;
            WriteOutcome::Close
        }
    }

    fn set_write_interest(&self, conn: &mut Connection, slot: Slot, enabled: bool) {
        if conn.want_write == enabled {
            return;
        }
        let token = Token(CONN_TOKEN_BASE + slot);
        let interest = if enabled {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Some(stream) = conn.stream_mut() {
            match self.poll.registry().reregister(stream, token, interest) {
                Ok(()) => conn.want_write = enabled,
                Err(err) => {
                    logging::warn!(self.log, "interest change failed";
                                   "slot" => slot, "error" => %err);
                }
            }
        }
    }

    fn command_write(&mut self, slot: Slot, sequence: u64) {
        let conn_arc = match self.pool.get(slot) {
            Some(conn) => conn,
            None => return,
        };
        let mut conn = conn_arc.lock().unwrap();
        if !conn.is_open() || conn.sequence() != sequence {
            return;
        }
        let outcome = self.drain_write(&mut conn, slot);
        drop(conn);
        if let WriteOutcome::Close = outcome {
            self.close_connection(slot);
        }
    }

    fn command_close(&mut self, slot: Slot, sequence: u64) {
        if let Some(conn_arc) = self.pool.get(slot) {
            let valid = {
                let conn = conn_arc.lock().unwrap();
                conn.is_open() && conn.sequence() == sequence
            };
            if valid {
                self.close_connection(slot);
            }
        }
    }

    /// Deregisters the socket and parks the connection for deferred
    /// reclamation.
    fn close_connection(&mut self, slot: Slot) {
        let conn_arc = match self.pool.get(slot) {
            Some(conn) => conn,
            None => return,
        };
        {
            let mut conn = conn_arc.lock().unwrap();
            if !conn.is_open() {
                return;
            }
            if let Some(stream) = conn.stream_mut() {
                let _ = self.poll.registry().deregister(stream);
            }
        }

        self.timer.remove_slot(slot);
        self.live.swap_remove(&slot);
        self.pool.enqueue_for_reclaim(slot);
        self.stats.online_dec();
    }
}

/// Opens the configured listening sockets: SO_REUSEADDR, non-blocking,
/// backlog 511, bound to the configured address.
pub fn bind_listeners(
    net: &NetConfig,
    log: &Logger,
) -> io::Result<(Vec<TcpListener>, Vec<SocketAddr>)> {
    let mut listeners = Vec::new();
    let mut addrs = Vec::new();

    for port in &net.listen_ports {
        let addr: SocketAddr = format!("{}:{}", net.bind_address, port)
            .parse()
            .map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad bind address {}:{}: {}", net.bind_address, port, err),
                )
            })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener = TcpListener::from_std(socket.into());
        let local = listener.local_addr()?;
        logging::info!(log, "listening"; "addr" => %local);
        addrs.push(local);
        listeners.push(listener);
    }

    Ok((listeners, addrs))
}
