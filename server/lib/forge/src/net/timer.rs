use crate::net::connection::Slot;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cadence of the monitor thread.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Keep-alive connections are closed after this much silence.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(65);

/// How long a handler may take to produce its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle interval; configurable via `net.max_wait_secs`.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Idle,
    KeepAlive,
    Request,
}

/// One armed deadline. The sequence captured at insertion gates delivery:
/// if the connection was reused in the meantime the entry is dead.
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    pub slot: Slot,
    pub sequence: u64,
    pub kind: TimerKind,
}

struct WheelInner {
    // Keyed by expiry; the counter disambiguates equal instants.
    entries: BTreeMap<(Instant, u64), TimerEntry>,
    next_id: u64,
}

/// Ordered deadline store shared by the event loop and the monitor thread.
pub struct TimerWheel {
    inner: Mutex<WheelInner>,
    keep_alive: Duration,
    request: Duration,
    idle: Duration,
}

impl TimerWheel {
    pub fn new(idle: Duration) -> TimerWheel {
        TimerWheel::with_durations(KEEP_ALIVE_TIMEOUT, REQUEST_TIMEOUT, idle)
    }

    pub fn with_durations(keep_alive: Duration, request: Duration, idle: Duration) -> TimerWheel {
        TimerWheel {
            inner: Mutex::new(WheelInner {
                entries: BTreeMap::new(),
                next_id: 0,
            }),
            keep_alive,
            request,
            idle,
        }
    }

    pub fn duration_of(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::Idle => self.idle,
            TimerKind::KeepAlive => self.keep_alive,
            TimerKind::Request => self.request,
        }
    }

    /// Arms a deadline of the given kind for (slot, sequence).
    pub fn add(&self, slot: Slot, sequence: u64, kind: TimerKind, now: Instant) {
        let expiry = now + self.duration_of(kind);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            (expiry, id),
            TimerEntry {
                slot,
                sequence,
                kind,
            },
        );
    }

    /// Drops every entry pointing at `slot`.
    pub fn remove_slot(&self, slot: Slot) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|_, entry| entry.slot != slot);
    }

    /// Removes and returns entries whose expiry is at or before `now`,
    /// earliest first. Sequence validation is the caller's job, since only
    /// the pool knows the live sequence.
    pub fn expired(&self, now: Instant) -> Vec<TimerEntry> {
        let mut inner = self.inner.lock().unwrap();
        let due_keys: Vec<(Instant, u64)> = inner
            .entries
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();

        due_keys
            .into_iter()
            .filter_map(|key| inner.entries.remove(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}
