//! Wires the subsystems into one running worker: the event loop on its
//! I/O thread, the handler pool, the reclaimer, the timer monitor and the
//! send-queue drainer.

use crate::http::response::HttpResponse;
use crate::net::connection::ConnState;
use crate::net::event_loop::{bind_listeners, CommandQueue, EventLoop, EventLoopConfig};
use crate::net::pool::{ConnectionPool, PoolConfig, RECLAIM_INTERVAL};
use crate::net::security::SecurityLimits;
use crate::net::send_queue::SendQueue;
use crate::net::timer::{TimerKind, TimerWheel, MONITOR_INTERVAL};
use crate::router::Router;
use crate::workers::{JobQueue, WorkerPool};
use ember::config::ServerConfig;
use ember::logging::{self, Logger};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Status counters are logged every this many monitor ticks.
const STATUS_LOG_TICKS: u32 = 20;

#[derive(Debug)]
pub enum EngineError {
    Io(io::Error),
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> EngineError {
        EngineError::Io(err)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Io(err) => write!(f, "engine initialization failed: {}", err),
        }
    }
}

impl std::error::Error for EngineError {}

/// Worker-wide counters, shared across threads and exposed to handlers.
pub struct EngineStats {
    started_at: Instant,
    started_unix: u64,
    online: AtomicUsize,
    accepted: AtomicUsize,
    refused: AtomicUsize,
    discarded_sends: AtomicUsize,
}

impl EngineStats {
    pub fn new() -> EngineStats {
        EngineStats {
            started_at: Instant::now(),
            started_unix: ember::time::unix_now(),
            online: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            refused: AtomicUsize::new(0),
            discarded_sends: AtomicUsize::new(0),
        }
    }

    pub fn online_inc(&self) {
        self.online.fetch_add(1, Ordering::Relaxed);
    }

    pub fn online_dec(&self) {
        self.online.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn accepted_inc(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refused_inc(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn discarded_send_inc(&self) {
        self.discarded_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn online(&self) -> usize {
        self.online.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, pool: &ConnectionPool) -> StatsSnapshot {
        StatsSnapshot {
            online_users: self.online.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            discarded_sends: self.discarded_sends.load(Ordering::Relaxed),
            total_connections: pool.total(),
            free_connections: pool.free_count(),
            reclaim_pending: pool.reclaim_pending(),
            live_connections: pool.live(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            started_unix: self.started_unix,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub online_users: usize,
    pub accepted: usize,
    pub refused: usize,
    pub discarded_sends: usize,
    pub total_connections: usize,
    pub free_connections: usize,
    pub reclaim_pending: usize,
    pub live_connections: usize,
    pub uptime_secs: u64,
    pub started_unix: u64,
}

/// A running worker engine. Dropping it does not stop the threads; call
/// `shutdown` (tests, tools) or `wait` (the worker binary).
pub struct Engine {
    pool: Arc<ConnectionPool>,
    stats: Arc<EngineStats>,
    commands: Arc<CommandQueue>,
    send_queue: Arc<SendQueue>,
    stop: Arc<AtomicBool>,
    local_addrs: Vec<SocketAddr>,
    io_handle: Option<thread::JoinHandle<()>>,
    aux_handles: Vec<thread::JoinHandle<()>>,
    workers: Option<WorkerPool>,
    log: Logger,
}

impl Engine {
    /// Brings the whole worker up: listeners, event loop, handler pool,
    /// reclaimer, timer monitor and send drainer.
    pub fn start(config: &ServerConfig, router: Router, log: &Logger) -> Result<Engine, EngineError> {
        let engine_log = log.new(logging::o!("subsystem" => "engine"));

        let limits = SecurityLimits {
            short_window: Duration::from_millis(config.net_security.flood_time_interval_ms),
            short_max_requests: config.net_security.flood_kick_counter,
            ..SecurityLimits::default()
        };

        let pool = Arc::new(ConnectionPool::new(
            PoolConfig {
                worker_connections: config.net.worker_connections,
                allow_overflow: config.net.allow_overflow,
                recycle_wait: Duration::from_secs(config.net.recycle_wait_secs),
            },
            limits,
            log,
        ));
        let timer = Arc::new(TimerWheel::new(Duration::from_secs(config.net.max_wait_secs)));
        let stats = Arc::new(EngineStats::new());
        let stop = Arc::new(AtomicBool::new(false));
        let jobs = Arc::new(JobQueue::new());
        let send_queue = Arc::new(SendQueue::new());
        let router = Arc::new(router);

        let (listeners, local_addrs) = bind_listeners(&config.net, log)?;

        let mut event_loop = EventLoop::new(
            listeners,
            EventLoopConfig {
                wait_time_enable: config.net.wait_time_enable,
                timeout_kick: config.net.timeout_kick,
                flood_kick_enable: config.net_security.flood_kick_enable,
            },
            pool.clone(),
            timer.clone(),
            jobs.clone(),
            stats.clone(),
            stop.clone(),
            log,
        )?;
        let commands = event_loop.command_queue();

        let workers = WorkerPool::start(
            config.proc.msg_recv_work_thread_count,
            jobs.clone(),
            router,
            pool.clone(),
            commands.clone(),
            send_queue.clone(),
            log,
        );

        let io_handle = thread::Builder::new()
            .name("forge-io".to_string())
            .spawn(move || event_loop.run())?;

        let mut aux_handles = Vec::new();

        // Reclaimer: returns closed connections to the free list once the
        // grace window has passed.
        {
            let pool = pool.clone();
            let stop = stop.clone();
            let reclaim_log = engine_log.new(logging::o!("thread" => "reclaimer"));
            aux_handles.push(
                thread::Builder::new()
                    .name("forge-reclaimer".to_string())
                    .spawn(move || {
                        while !stop.load(Ordering::SeqCst) {
                            thread::sleep(RECLAIM_INTERVAL);
                            let released = pool.sweep_reclaim(Instant::now());
                            if released > 0 {
                                logging::debug!(reclaim_log, "connections released";
                                                "count" => released);
                            }
                        }
                    })?,
            );
        }

        // Timer monitor: delivers expiries, logs status periodically.
        {
            let timer = timer.clone();
            let pool = pool.clone();
            let commands = commands.clone();
            let stats = stats.clone();
            let stop = stop.clone();
            let timeout_kick = config.net.timeout_kick;
            let monitor_log = engine_log.new(logging::o!("thread" => "timer_monitor"));
            aux_handles.push(
                thread::Builder::new()
                    .name("forge-timer".to_string())
                    .spawn(move || {
                        let mut ticks: u32 = 0;
                        while !stop.load(Ordering::SeqCst) {
                            thread::sleep(MONITOR_INTERVAL);
                            if stop.load(Ordering::SeqCst) {
                                break;
                            }
                            process_timers(&timer, &pool, &commands, timeout_kick, &monitor_log);

                            ticks = ticks.wrapping_add(1);
                            if ticks % STATUS_LOG_TICKS == 0 {
                                let snapshot = stats.snapshot(&pool);
                                logging::info!(monitor_log, "worker status";
                                               "online" => snapshot.online_users,
                                               "live" => snapshot.live_connections,
                                               "free" => snapshot.free_connections,
                                               "reclaim_pending" => snapshot.reclaim_pending,
                                               "accepted" => snapshot.accepted,
                                               "refused" => snapshot.refused);
                            }
                        }
                    })?,
            );
        }

        // Send drainer: deferred writes for oversized responses.
        {
            let send_queue = send_queue.clone();
            let pool = pool.clone();
            let commands = commands.clone();
            let stats = stats.clone();
            let drainer_log = engine_log.new(logging::o!("thread" => "send_drainer"));
            aux_handles.push(
                thread::Builder::new()
                    .name("forge-sender".to_string())
                    .spawn(move || run_drainer(&send_queue, &pool, &commands, &stats, &drainer_log))?,
            );
        }

        logging::info!(engine_log, "engine started";
                       "workers" => config.proc.msg_recv_work_thread_count,
                       "pool" => config.net.worker_connections);

        Ok(Engine {
            pool,
            stats,
            commands,
            send_queue,
            stop,
            local_addrs,
            io_handle: Some(io_handle),
            aux_handles,
            workers: Some(workers),
            log: engine_log,
        })
    }

    /// Bound addresses, resolved (useful when a port was configured as 0).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.pool)
    }

    /// Handle for handlers that want to expose engine statistics.
    pub fn stats_handle(&self) -> EngineHandle {
        EngineHandle {
            pool: self.pool.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Blocks until the I/O thread exits, then tears everything down.
    pub fn wait(mut self) {
        if let Some(handle) = self.io_handle.take() {
            let _ = handle.join();
        }
        self.teardown();
    }

    /// Stops all threads and joins them. Queued jobs drain first.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.commands.shutdown();
        if let Some(handle) = self.io_handle.take() {
            let _ = handle.join();
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.send_queue.shutdown();
        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
        for handle in self.aux_handles.drain(..) {
            let _ = handle.join();
        }
        logging::info!(self.log, "engine stopped");
    }
}

/// Cheap clone handed to handlers (the `/status` route) for live counters.
#[derive(Clone)]
pub struct EngineHandle {
    pool: Arc<ConnectionPool>,
    stats: Arc<EngineStats>,
}

impl EngineHandle {
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.pool)
    }
}

/// Delivers due timers. An entry whose stored sequence no longer matches
/// the connection is dropped silently: the connection was reused.
pub(crate) fn process_timers(
    wheel: &TimerWheel,
    pool: &ConnectionPool,
    commands: &CommandQueue,
    timeout_kick: bool,
    log: &Logger,
) {
    let now = Instant::now();
    for entry in wheel.expired(now) {
        let conn_arc = match pool.get(entry.slot) {
            Some(conn) => conn,
            None => continue,
        };
        let mut conn = conn_arc.lock().unwrap();
        if conn.sequence() != entry.sequence || !conn.is_open() {
            continue;
        }

        let quiet = now.duration_since(conn.ctx.last_activity);
        match entry.kind {
            TimerKind::KeepAlive => {
                if conn.ctx.state == ConnState::Waiting
                    && quiet >= wheel.duration_of(TimerKind::KeepAlive)
                {
                    logging::debug!(log, "keep-alive expired"; "slot" => entry.slot);
                    drop(conn);
                    commands.close(entry.slot, entry.sequence);
                } else {
                    // Still in use: arm another interval.
                    wheel.add(entry.slot, entry.sequence, TimerKind::KeepAlive, now);
                }
            }
            TimerKind::Request => {
                if conn.ctx.state == ConnState::Processing {
                    logging::warn!(log, "request processing timed out"; "slot" => entry.slot);
                    let mut response = HttpResponse::new();
                    response.set_status(408, "");
                    response.set_header("Connection", "close");
                    response.text("Request Timeout");
                    let bytes = response.serialize();

                    conn.ctx.keep_alive = false;
                    conn.ctx.state = ConnState::Writing;
                    conn.ctx.response = response;
                    conn.write_buffer.append(&bytes);
                    drop(conn);
                    commands.register_write(entry.slot, entry.sequence);
                }
            }
            TimerKind::Idle => {
                if timeout_kick && quiet >= wheel.duration_of(TimerKind::Idle) {
                    logging::debug!(log, "idle connection kicked"; "slot" => entry.slot);
                    drop(conn);
                    commands.close(entry.slot, entry.sequence);
                } else if timeout_kick {
                    wheel.add(entry.slot, entry.sequence, TimerKind::Idle, now);
                }
            }
        }
    }
}

/// The send-queue drainer: validates each entry's sequence, attempts a
/// direct send, and falls back to WRITE readiness when the socket pushes
/// back.
fn run_drainer(
    queue: &SendQueue,
    pool: &ConnectionPool,
    commands: &CommandQueue,
    stats: &EngineStats,
    log: &Logger,
) {
    while let Some(item) = queue.next() {
        let conn_arc = match pool.get(item.slot) {
            Some(conn) => conn,
            None => continue,
        };
        let mut conn = conn_arc.lock().unwrap();
        if conn.sequence() != item.sequence || !conn.is_open() {
            // The connection moved on while the entry sat in the queue.
            stats.discarded_send_inc();
            continue;
        }
        conn.guard.decrement_send();

        match conn.flush_write_buffer() {
            Ok(_) => {
                // The event loop finishes the lifecycle (or registers
                // WRITE for the remainder).
                drop(conn);
                commands.register_write(item.slot, item.sequence);
            }
            Err(err) => {
                logging::debug!(log, "deferred send failed";
                                "slot" => item.slot, "error" => %err);
                drop(conn);
                commands.close(item.slot, item.sequence);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::security::SecurityLimits;
    use mio::{Poll, Token, Waker};
    use std::io::{ErrorKind, Read, Write};
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.net.bind_address = "127.0.0.1".to_string();
        config.net.listen_ports = vec![0];
        config.net.worker_connections = 8;
        config.net.recycle_wait_secs = 0;
        config.proc.msg_recv_work_thread_count = 2;
        config
    }

    fn test_router() -> Router {
        let router = Router::new(None);
        router.add_route("GET", "/health", |_req, res, _params| {
            res.json(format!(
                "{{\"status\":\"OK\",\"timestamp\":{}}}",
                ember::time::unix_now()
            ));
        });
        router.add_route("POST", "/echo", |req, res, _params| {
            res.set_content_type("application/octet-stream");
            res.set_body(req.body.clone());
        });
        router.add_route("GET", "/boom", |_req, _res, _params| {
            panic!("handler exploded");
        });
        router
    }

    fn start_engine(config: &ServerConfig) -> Engine {
        let log = ember::logging::discard();
        Engine::start(config, test_router(), &log).unwrap()
    }

    fn connect(engine: &Engine) -> StdTcpStream {
        let stream = StdTcpStream::connect(engine.local_addrs()[0]).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Reads one full response (headers, then Content-Length bytes).
    fn read_response(stream: &mut StdTcpStream) -> (u16, String, Vec<u8>) {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];

        let header_end = loop {
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            let count = stream.read(&mut chunk).expect("response read");
            assert!(count > 0, "connection closed before headers completed");
            raw.extend_from_slice(&chunk[..count]);
        };

        let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
        let content_length = head
            .lines()
            .find_map(|line| {
                let mut parts = line.splitn(2, ':');
                let name = parts.next()?.trim();
                if name.eq_ignore_ascii_case("content-length") {
                    parts.next()?.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);

        let mut body = raw[header_end + 4..].to_vec();
        while body.len() < content_length {
            let count = stream.read(&mut chunk).expect("body read");
            assert!(count > 0, "connection closed mid-body");
            body.extend_from_slice(&chunk[..count]);
        }

        let status: u16 = head
            .lines()
            .next()
            .unwrap()
            .split(' ')
            .nth(1)
            .unwrap()
            .parse()
            .unwrap();
        (status, head, body)
    }

    /// True when the server has dropped the connection: a clean FIN or a
    /// reset both count.
    fn reads_eof(stream: &mut StdTcpStream) -> bool {
        let mut byte = [0u8; 1];
        loop {
            match stream.read(&mut byte) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(ref err)
                    if err.kind() == ErrorKind::ConnectionReset
                        || err.kind() == ErrorKind::BrokenPipe =>
                {
                    return true
                }
                Err(_) => return false,
            }
        }
    }

    #[test]
    fn test_health_endpoint_end_to_end() {
        let engine = start_engine(&test_config());
        let mut stream = connect(&engine);

        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let (status, head, body) = read_response(&mut stream);

        assert_eq!(status, 200);
        assert!(head.contains("Content-Type: application/json"));
        assert!(head.contains("Connection: keep-alive"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("{\"status\":\"OK\",\"timestamp\":"));

        engine.shutdown();
    }

    #[test]
    fn test_unknown_route_gets_404_envelope() {
        let engine = start_engine(&test_config());
        let mut stream = connect(&engine);

        stream
            .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let (status, _head, body) = read_response(&mut stream);

        assert_eq!(status, 404);
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["code"], 404);
        assert_eq!(parsed["message"], "Route not found");
        assert_eq!(parsed["data"], serde_json::Value::Null);

        engine.shutdown();
    }

    #[test]
    fn test_keep_alive_sequence_with_final_close() {
        let engine = start_engine(&test_config());
        let mut stream = connect(&engine);

        for _ in 0..2 {
            stream
                .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n")
                .unwrap();
            let (status, head, _body) = read_response(&mut stream);
            assert_eq!(status, 200);
            assert!(head.contains("Connection: keep-alive"));
        }

        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        let (status, head, _body) = read_response(&mut stream);
        assert_eq!(status, 200);
        assert!(head.contains("Connection: close"));
        assert!(reads_eof(&mut stream));

        engine.shutdown();
    }

    #[test]
    fn test_pipelined_requests_answered_in_order() {
        let engine = start_engine(&test_config());
        let mut stream = connect(&engine);

        stream
            .write_all(
                b"GET /health HTTP/1.1\r\nHost: x\r\n\r\nPOST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello",
            )
            .unwrap();

        let (status, _head, body) = read_response(&mut stream);
        assert_eq!(status, 200);
        assert!(String::from_utf8_lossy(&body).contains("\"status\":\"OK\""));

        let (status, _head, body) = read_response(&mut stream);
        assert_eq!(status, 200);
        assert_eq!(body, b"hello");

        engine.shutdown();
    }

    #[test]
    fn test_request_body_reaches_handler_verbatim() {
        let engine = start_engine(&test_config());
        let mut stream = connect(&engine);

        // Declared length wins: the handler sees exactly the 11 bytes.
        stream
            .write_all(
                b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\nContent-Type: application/json\r\n\r\n{\"a\":\"b\"}XY",
            )
            .unwrap();
        let (status, _head, body) = read_response(&mut stream);

        assert_eq!(status, 200);
        assert_eq!(body, b"{\"a\":\"b\"}XY");

        engine.shutdown();
    }

    #[test]
    fn test_chunked_request_end_to_end() {
        let engine = start_engine(&test_config());
        let mut stream = connect(&engine);

        stream
            .write_all(
                b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
            )
            .unwrap();
        let (status, _head, body) = read_response(&mut stream);

        assert_eq!(status, 200);
        assert_eq!(body, b"hello");

        engine.shutdown();
    }

    #[test]
    fn test_malformed_request_gets_400_and_close() {
        let engine = start_engine(&test_config());
        let mut stream = connect(&engine);

        // HTTP/1.1 without a Host header.
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let (status, head, _body) = read_response(&mut stream);

        assert_eq!(status, 400);
        assert!(head.contains("Connection: close"));
        assert!(reads_eof(&mut stream));

        engine.shutdown();
    }

    #[test]
    fn test_handler_panic_gets_500_and_close() {
        let engine = start_engine(&test_config());
        let mut stream = connect(&engine);

        stream
            .write_all(b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let (status, head, body) = read_response(&mut stream);

        assert_eq!(status, 500);
        assert!(head.contains("Connection: close"));
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["code"], 500);
        assert!(reads_eof(&mut stream));

        engine.shutdown();
    }

    #[test]
    fn test_pool_capacity_refuses_extra_sockets() {
        let mut config = test_config();
        config.net.worker_connections = 2;
        config.net.recycle_wait_secs = 60;
        let engine = start_engine(&config);

        // Occupy both slots with live keep-alive connections.
        let mut first = connect(&engine);
        let mut second = connect(&engine);
        for stream in [&mut first, &mut second] {
            stream
                .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n")
                .unwrap();
            let (status, _, _) = read_response(stream);
            assert_eq!(status, 200);
        }

        // The third socket is accepted by the OS and then dropped by the
        // worker without a connection.
        let mut third = connect(&engine);
        third
            .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        assert!(reads_eof(&mut third));
        assert_eq!(engine.stats().refused, 1);

        engine.shutdown();
    }

    #[test]
    fn test_flood_kick_closes_connection() {
        let mut config = test_config();
        config.net_security.flood_kick_enable = true;
        // A wide window makes the rate deterministic: the 11th request
        // inside it trips the guard.
        config.net_security.flood_time_interval_ms = 10_000;
        config.net_security.flood_kick_counter = 10;
        let engine = start_engine(&config);

        let mut stream = connect(&engine);
        let mut completed = 0;
        for _ in 0..50 {
            if stream
                .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n")
                .is_err()
            {
                break;
            }
            let mut probe = [0u8; 4096];
            match stream.read(&mut probe) {
                Ok(0) | Err(_) => break,
                Ok(_) => completed += 1,
            }
        }

        assert!(completed < 50, "flood guard never tripped");
        engine.shutdown();
    }

    #[test]
    fn test_request_timeout_overwrites_with_408() {
        // Drive the monitor logic directly with a zero request deadline.
        let wheel = TimerWheel::with_durations(
            Duration::from_secs(65),
            Duration::from_secs(0),
            Duration::from_secs(1800),
        );
        let pool = ConnectionPool::new(
            PoolConfig {
                worker_connections: 1,
                allow_overflow: false,
                recycle_wait: Duration::from_secs(0),
            },
            SecurityLimits::default(),
            None,
        );

        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let _client = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let (slot, sequence) = pool
            .acquire(mio::net::TcpStream::from_std(server), peer)
            .unwrap();

        {
            let conn_arc = pool.get(slot).unwrap();
            conn_arc.lock().unwrap().ctx.state = ConnState::Processing;
        }
        wheel.add(slot, sequence, TimerKind::Request, Instant::now());

        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), Token(0)).unwrap();
        let commands = CommandQueueProbe::new(waker);

        let log = ember::logging::discard();
        process_timers(&wheel, &pool, commands.queue(), false, &log);

        let conn_arc = pool.get(slot).unwrap();
        let conn = conn_arc.lock().unwrap();
        assert_eq!(conn.ctx.state, ConnState::Writing);
        assert!(!conn.ctx.keep_alive);
        let pending = String::from_utf8_lossy(conn.write_buffer.read_slice()).into_owned();
        assert!(pending.starts_with("HTTP/1.1 408"));
        assert!(pending.contains("Connection: close"));
    }

    #[test]
    fn test_stale_timer_entry_is_dropped() {
        let wheel = TimerWheel::with_durations(
            Duration::from_secs(0),
            Duration::from_secs(0),
            Duration::from_secs(0),
        );
        let pool = ConnectionPool::new(
            PoolConfig {
                worker_connections: 1,
                allow_overflow: false,
                recycle_wait: Duration::from_secs(60),
            },
            SecurityLimits::default(),
            None,
        );

        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let _client = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let (slot, sequence) = pool
            .acquire(mio::net::TcpStream::from_std(server), peer)
            .unwrap();

        {
            let conn_arc = pool.get(slot).unwrap();
            conn_arc.lock().unwrap().ctx.state = ConnState::Processing;
        }
        // Arm with the old sequence, then invalidate it by reclaiming.
        wheel.add(slot, sequence, TimerKind::Request, Instant::now());
        pool.enqueue_for_reclaim(slot);

        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), Token(0)).unwrap();
        let commands = CommandQueueProbe::new(waker);

        let log = ember::logging::discard();
        process_timers(&wheel, &pool, commands.queue(), false, &log);

        // No handler ran for the stale entry: the buffer stayed empty.
        let conn_arc = pool.get(slot).unwrap();
        assert!(conn_arc.lock().unwrap().write_buffer.is_empty());
    }

    /// Wraps a CommandQueue for tests that only push into it.
    struct CommandQueueProbe {
        queue: Arc<CommandQueue>,
    }

    impl CommandQueueProbe {
        fn new(waker: Waker) -> CommandQueueProbe {
            CommandQueueProbe {
                queue: Arc::new(CommandQueue::new(waker)),
            }
        }

        fn queue(&self) -> &CommandQueue {
            &self.queue
        }
    }
}
