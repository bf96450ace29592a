use crate::net::connection::{Connection, Slot};
use crate::net::security::SecurityLimits;
use ember::logging::{self, Logger};
use mio::net::TcpStream;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// How often the reclaimer thread sweeps.
pub const RECLAIM_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Slots created eagerly.
    pub worker_connections: usize,
    /// Allocate past `worker_connections` instead of refusing acquires.
    pub allow_overflow: bool,
    /// Delay between closing a socket and reusing its slot, sized to
    /// outlive any in-flight worker job.
    pub recycle_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            worker_connections: 2048,
            allow_overflow: false,
            recycle_wait: Duration::from_secs(60),
        }
    }
}

struct ReclaimEntry {
    slot: Slot,
    enqueued_at: Instant,
}

struct FreeList {
    free: Vec<Slot>,
}

/// Fixed-capacity connection pool. Slots are `Arc<Mutex<Connection>>`; the
/// pool hands out slot indices and resolves them back, so worker threads,
/// timers and the send queue never hold a connection across a hand-off,
/// only a (slot, sequence) pair.
pub struct ConnectionPool {
    slots: RwLock<Vec<Arc<Mutex<Connection>>>>,
    free_list: Mutex<FreeList>,
    reclaim_list: Mutex<Vec<ReclaimEntry>>,
    limits: SecurityLimits,
    config: PoolConfig,
    log: Logger,
}

impl ConnectionPool {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: PoolConfig,
        limits: SecurityLimits,
        log: L,
    ) -> ConnectionPool {
        let pool_log = match log.into() {
            Some(log) => log.new(logging::o!("subsystem" => "pool")),
            None => logging::discard(),
        };

        let mut slots = Vec::with_capacity(config.worker_connections);
        let mut free = Vec::with_capacity(config.worker_connections);
        for slot in 0..config.worker_connections {
            slots.push(Arc::new(Mutex::new(Connection::new(
                slot, limits, &pool_log,
            ))));
            free.push(slot);
        }
        // Pop order matches the original's free-list front.
        free.reverse();

        ConnectionPool {
            slots: RwLock::new(slots),
            free_list: Mutex::new(FreeList { free }),
            reclaim_list: Mutex::new(Vec::new()),
            limits,
            config,
            log: pool_log,
        }
    }

    /// Resolves a slot to its connection.
    pub fn get(&self, slot: Slot) -> Option<Arc<Mutex<Connection>>> {
        self.slots.read().unwrap().get(slot).cloned()
    }

    /// Takes a free slot for a freshly accepted stream, bumping its
    /// sequence. Returns the slot and the new sequence, or nothing when
    /// the pool is exhausted and overflow is disabled (the caller drops
    /// the socket).
    pub fn acquire(&self, stream: TcpStream, peer: SocketAddr) -> Option<(Slot, u64)> {
        let slot = {
            let mut free_list = self.free_list.lock().unwrap();
            match free_list.free.pop() {
                Some(slot) => slot,
                None if self.config.allow_overflow => {
                    let mut slots = self.slots.write().unwrap();
                    let slot = slots.len();
                    slots.push(Arc::new(Mutex::new(Connection::new(
                        slot,
                        self.limits,
                        &self.log,
                    ))));
                    logging::info!(self.log, "overflow connection allocated"; "slot" => slot);
                    slot
                }
                None => return None,
            }
        };

        let conn_arc = self.get(slot)?;
        let mut conn = conn_arc.lock().unwrap();
        conn.activate(stream, peer, Instant::now());
        Some((slot, conn.sequence()))
    }

    /// Closes the connection's socket and parks the slot for the grace
    /// window. Never frees synchronously: an in-flight worker job holding
    /// the old sequence must be able to observe the bump and reject its
    /// result before the slot is reused.
    pub fn enqueue_for_reclaim(&self, slot: Slot) {
        let conn_arc = match self.get(slot) {
            Some(conn) => conn,
            None => return,
        };

        {
            let mut conn = conn_arc.lock().unwrap();
            match conn.retire_stream() {
                Some(stream) => drop(stream),
                // Already retired; don't enqueue twice.
                None => return,
            }
        }

        let mut reclaim = self.reclaim_list.lock().unwrap();
        reclaim.push(ReclaimEntry {
            slot,
            enqueued_at: Instant::now(),
        });
    }

    /// Releases every reclaim entry whose grace window has elapsed.
    /// Returns how many slots went back to the free list.
    pub fn sweep_reclaim(&self, now: Instant) -> usize {
        let due: Vec<Slot> = {
            let mut reclaim = self.reclaim_list.lock().unwrap();
            let mut due = Vec::new();
            reclaim.retain(|entry| {
                if now.duration_since(entry.enqueued_at) >= self.config.recycle_wait {
                    due.push(entry.slot);
                    false
                } else {
                    true
                }
            });
            due
        };

        for &slot in &due {
            if let Some(conn_arc) = self.get(slot) {
                conn_arc.lock().unwrap().release();
            }
            self.free_list.lock().unwrap().free.push(slot);
            logging::debug!(self.log, "connection released"; "slot" => slot);
        }
        due.len()
    }

    pub fn total(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.lock().unwrap().free.len()
    }

    pub fn reclaim_pending(&self) -> usize {
        self.reclaim_list.lock().unwrap().len()
    }

    /// live == total − free − reclaim-pending
    pub fn live(&self) -> usize {
        self.total() - self.free_count() - self.reclaim_pending()
    }

    pub fn recycle_wait(&self) -> Duration {
        self.config.recycle_wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpStream;
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};

    struct Loopback {
        listener: StdTcpListener,
        addr: SocketAddr,
        // Keep client ends alive so the server sockets stay open.
        clients: Vec<StdTcpStream>,
    }

    impl Loopback {
        fn new() -> Loopback {
            let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            Loopback {
                listener,
                addr,
                clients: Vec::new(),
            }
        }

        fn pair(&mut self) -> (TcpStream, SocketAddr) {
            let client = StdTcpStream::connect(self.addr).unwrap();
            let (server, peer) = self.listener.accept().unwrap();
            server.set_nonblocking(true).unwrap();
            self.clients.push(client);
            (TcpStream::from_std(server), peer)
        }
    }

    fn pool(capacity: usize, overflow: bool, grace: Duration) -> ConnectionPool {
        ConnectionPool::new(
            PoolConfig {
                worker_connections: capacity,
                allow_overflow: overflow,
                recycle_wait: grace,
            },
            SecurityLimits::default(),
            None,
        )
    }

    #[test]
    fn test_acquire_release_lifecycle() {
        let mut loopback = Loopback::new();
        let pool = pool(2, false, Duration::from_secs(0));

        assert_eq!(pool.total(), 2);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.live(), 0);

        let (stream, peer) = loopback.pair();
        let (slot, seq) = pool.acquire(stream, peer).unwrap();
        assert_eq!(pool.live(), 1);
        assert_eq!(seq, 1);

        // Closed-fd invariant: in-use slots hold a stream, the rest don't.
        let conn = pool.get(slot).unwrap();
        assert!(conn.lock().unwrap().is_open());

        pool.enqueue_for_reclaim(slot);
        assert_eq!(pool.reclaim_pending(), 1);
        assert_eq!(pool.live(), 0);
        assert!(!pool.get(slot).unwrap().lock().unwrap().is_open());

        // Grace of zero: the sweep frees immediately.
        assert_eq!(pool.sweep_reclaim(Instant::now()), 1);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.reclaim_pending(), 0);
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let mut loopback = Loopback::new();
        let pool = pool(1, false, Duration::from_secs(0));

        let (stream, peer) = loopback.pair();
        let (slot, seq1) = pool.acquire(stream, peer).unwrap();

        pool.enqueue_for_reclaim(slot);
        let seq_after_retire = pool.get(slot).unwrap().lock().unwrap().sequence();
        assert!(seq_after_retire > seq1);

        pool.sweep_reclaim(Instant::now());
        let (stream, peer) = loopback.pair();
        let (slot2, seq2) = pool.acquire(stream, peer).unwrap();

        assert_eq!(slot2, slot);
        assert!(seq2 > seq_after_retire);
    }

    #[test]
    fn test_exhaustion_without_overflow() {
        let mut loopback = Loopback::new();
        let pool = pool(1, false, Duration::from_secs(60));

        let (stream, peer) = loopback.pair();
        pool.acquire(stream, peer).unwrap();

        let (stream, peer) = loopback.pair();
        assert!(pool.acquire(stream, peer).is_none());
        assert_eq!(pool.total(), 1);
    }

    #[test]
    fn test_overflow_grows_the_pool() {
        let mut loopback = Loopback::new();
        let pool = pool(1, true, Duration::from_secs(60));

        let (stream, peer) = loopback.pair();
        let (slot1, _) = pool.acquire(stream, peer).unwrap();

        let (stream, peer) = loopback.pair();
        let (slot2, _) = pool.acquire(stream, peer).unwrap();

        assert_ne!(slot1, slot2);
        assert_eq!(pool.total(), 2);
        assert_eq!(pool.live(), 2);
    }

    #[test]
    fn test_grace_window_delays_reuse() {
        let mut loopback = Loopback::new();
        let pool = pool(1, false, Duration::from_secs(60));

        let (stream, peer) = loopback.pair();
        let (slot, _) = pool.acquire(stream, peer).unwrap();
        pool.enqueue_for_reclaim(slot);

        // Within the grace window nothing is released.
        assert_eq!(pool.sweep_reclaim(Instant::now()), 0);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.reclaim_pending(), 1);

        // Once the window has elapsed the slot comes back.
        assert_eq!(pool.sweep_reclaim(Instant::now() + Duration::from_secs(61)), 1);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_double_reclaim_is_idempotent() {
        let mut loopback = Loopback::new();
        let pool = pool(1, false, Duration::from_secs(0));

        let (stream, peer) = loopback.pair();
        let (slot, _) = pool.acquire(stream, peer).unwrap();

        pool.enqueue_for_reclaim(slot);
        pool.enqueue_for_reclaim(slot);

        assert_eq!(pool.reclaim_pending(), 1);
        assert_eq!(pool.sweep_reclaim(Instant::now()), 1);
        assert_eq!(pool.free_count(), 1);
    }
}
