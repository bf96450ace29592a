use crate::net::connection::Slot;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// Responses at least this large are drained by the send-queue thread
/// instead of inline on the I/O thread.
pub const LARGE_RESPONSE_THRESHOLD: usize = 64 * 1024;

/// A deferred-send request: drain the write buffer of `slot`, provided its
/// sequence still matches.
#[derive(Debug, Clone, Copy)]
pub struct SendItem {
    pub slot: Slot,
    pub sequence: u64,
}

/// Condvar-signalled FIFO feeding the background drainer thread. Strictly
/// additive to the inline write path: entries that went stale or that the
/// socket won't accept yet fall back to WRITE readiness registration.
pub struct SendQueue {
    queue: Mutex<VecDeque<SendItem>>,
    condvar: Condvar,
    stop: AtomicBool,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    pub fn push(&self, item: SendItem) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(item);
        self.condvar.notify_one();
    }

    /// Blocks for the next entry; drains the backlog before honouring a
    /// shutdown.
    pub fn next(&self) -> Option<SendItem> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = SendQueue::new();
        queue.push(SendItem { slot: 1, sequence: 1 });
        queue.push(SendItem { slot: 2, sequence: 1 });

        assert_eq!(queue.next().unwrap().slot, 1);
        assert_eq!(queue.next().unwrap().slot, 2);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_blocking_hand_off() {
        let queue = Arc::new(SendQueue::new());
        let producer_queue = queue.clone();

        let consumer = thread::spawn(move || queue.next());
        thread::spawn(move || {
            producer_queue.push(SendItem { slot: 7, sequence: 3 });
        });

        let item = consumer.join().unwrap().unwrap();
        assert_eq!(item.slot, 7);
        assert_eq!(item.sequence, 3);
    }

    #[test]
    fn test_shutdown_drains_backlog_first() {
        let queue = SendQueue::new();
        queue.push(SendItem { slot: 5, sequence: 1 });
        queue.shutdown();

        assert!(queue.next().is_some());
        assert!(queue.next().is_none());
    }
}
