//! Bounded handler-execution pool. The I/O thread hands over (slot,
//! sequence) job tokens; workers validate the token against the live
//! connection before and after running the handler, so a connection that
//! was timed out, flooded or reused in the meantime never sees a stale
//! result.

use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::net::connection::{ConnState, Slot};
use crate::net::event_loop::CommandQueue;
use crate::net::pool::ConnectionPool;
use crate::net::send_queue::{SendItem, SendQueue, LARGE_RESPONSE_THRESHOLD};
use crate::router::Router;
use ember::logging::{self, Logger};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// A connection with a parse-complete request, ready for dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Job {
    pub slot: Slot,
    pub sequence: u64,
}

/// Mutex+condvar FIFO between the I/O thread and the workers.
pub struct JobQueue {
    queue: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    stop: AtomicBool,
}

impl JobQueue {
    pub fn new() -> JobQueue {
        JobQueue {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    /// One worker is woken per submission.
    pub fn submit(&self, job: Job) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(job);
        self.condvar.notify_one();
    }

    /// Blocks for the next job. The backlog drains before a shutdown is
    /// honoured.
    pub fn next(&self) -> Option<Job> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(job) = queue.pop_front() {
                return Some(job);
            }
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            queue = self.condvar.wait(queue).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }
}

/// The worker threads themselves.
pub struct WorkerPool {
    jobs: Arc<JobQueue>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        count: usize,
        jobs: Arc<JobQueue>,
        router: Arc<Router>,
        pool: Arc<ConnectionPool>,
        commands: Arc<CommandQueue>,
        send_queue: Arc<SendQueue>,
        log: &Logger,
    ) -> WorkerPool {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let jobs = jobs.clone();
            let router = router.clone();
            let pool = pool.clone();
            let commands = commands.clone();
            let send_queue = send_queue.clone();
            let worker_log = log.new(logging::o!("worker" => index));

            let handle = thread::Builder::new()
                .name(format!("forge-worker-{}", index))
                .spawn(move || {
                    logging::debug!(worker_log, "worker started");
                    while let Some(job) = jobs.next() {
                        process_job(job, &router, &pool, &commands, &send_queue, &worker_log);
                    }
                    logging::debug!(worker_log, "worker stopped");
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        WorkerPool { jobs, handles }
    }

    pub fn queued(&self) -> usize {
        self.jobs.len()
    }

    /// Raises the stop flag and joins every worker; queued jobs finish
    /// first.
    pub fn shutdown(self) {
        self.jobs.shutdown();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn process_job(
    job: Job,
    router: &Router,
    pool: &ConnectionPool,
    commands: &CommandQueue,
    send_queue: &SendQueue,
    log: &Logger,
) {
    let conn_arc = match pool.get(job.slot) {
        Some(conn) => conn,
        None => return,
    };

    // Phase one: validate the token and take the request out. The lock is
    // released before the handler runs so the I/O thread and the timer
    // monitor are never stuck behind a slow handler.
    let mut request = {
        let mut conn = conn_arc.lock().unwrap();
        if conn.sequence() != job.sequence
            || conn.ctx.state != ConnState::Processing
            || !conn.is_open()
        {
            logging::debug!(log, "stale job discarded";
                            "slot" => job.slot, "sequence" => job.sequence);
            return;
        }
        std::mem::replace(&mut conn.ctx.request, HttpRequest::new())
    };

    let mut response = HttpResponse::new();
    let dispatched = router.dispatch(&mut request, &mut response);

    // Phase two: re-validate before touching the connection. A request
    // timeout or a close may have intervened while the handler ran.
    let mut conn = conn_arc.lock().unwrap();
    if conn.sequence() != job.sequence || conn.ctx.state != ConnState::Processing {
        logging::debug!(log, "job result discarded";
                        "slot" => job.slot, "sequence" => job.sequence);
        return;
    }

    if !dispatched {
        // Handler blew up; the router already shaped the 500. Never reuse
        // the connection after that.
        conn.ctx.keep_alive = false;
    }

    let connection_header = if conn.ctx.keep_alive {
        "keep-alive"
    } else {
        "close"
    };
    response.set_header("Connection", connection_header);

    let bytes = response.serialize();
    let large = bytes.len() >= LARGE_RESPONSE_THRESHOLD;

    conn.ctx.state = ConnState::Writing;
    conn.write_buffer.append(&bytes);
    conn.ctx.response = response;

    if large {
        // Big responses drain on the send-queue thread.
        conn.guard.increment_send();
        if conn.guard.send_overflow() {
            logging::warn!(log, "send queue overflow, closing";
                           "slot" => job.slot, "pending" => conn.guard.send_count());
            drop(conn);
            commands.close(job.slot, job.sequence);
            return;
        }
        drop(conn);
        send_queue.push(SendItem {
            slot: job.slot,
            sequence: job.sequence,
        });
    } else {
        drop(conn);
        commands.register_write(job.slot, job.sequence);
    }
}
