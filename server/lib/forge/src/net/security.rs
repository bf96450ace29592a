use std::time::{Duration, Instant};

/// Flood thresholds and the send-queue backpressure cap.
#[derive(Debug, Clone, Copy)]
pub struct SecurityLimits {
    pub short_window: Duration,
    pub short_max_requests: u32,
    pub long_window: Duration,
    pub long_max_requests: u32,
    pub max_send_count: u32,
}

impl Default for SecurityLimits {
    fn default() -> SecurityLimits {
        SecurityLimits {
            short_window: Duration::from_millis(100),
            short_max_requests: 10,
            long_window: Duration::from_secs(60),
            long_max_requests: 1000,
            max_send_count: 1000,
        }
    }
}

/// Per-connection request-rate tracking over two sliding windows, plus the
/// outstanding-send counter used for write backpressure.
pub struct SecurityGuard {
    limits: SecurityLimits,
    short_count: u32,
    long_count: u32,
    short_window_start: Instant,
    long_window_start: Instant,
    send_count: u32,
}

impl SecurityGuard {
    pub fn new(limits: SecurityLimits) -> SecurityGuard {
        let now = Instant::now();
        SecurityGuard {
            limits,
            short_count: 0,
            long_count: 0,
            short_window_start: now,
            long_window_start: now,
            send_count: 0,
        }
    }

    /// Counts one request-ish event at `now` and reports whether either
    /// window threshold is exceeded.
    pub fn check(&mut self, now: Instant) -> bool {
        let mut flood = false;

        if now.duration_since(self.short_window_start) < self.limits.short_window {
            self.short_count += 1;
            if self.short_count > self.limits.short_max_requests {
                flood = true;
            }
        } else {
            self.short_count = 1;
            self.short_window_start = now;
        }

        if now.duration_since(self.long_window_start) >= self.limits.long_window {
            self.long_count = 1;
            self.long_window_start = now;
        } else {
            self.long_count += 1;
            if self.long_count > self.limits.long_max_requests {
                flood = true;
            }
        }

        flood
    }

    #[inline]
    pub fn increment_send(&mut self) {
        self.send_count += 1;
    }

    #[inline]
    pub fn decrement_send(&mut self) {
        if self.send_count > 0 {
            self.send_count -= 1;
        }
    }

    #[inline]
    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    /// Too many writes outstanding: the connection gets closed.
    #[inline]
    pub fn send_overflow(&self) -> bool {
        self.send_count > self.limits.max_send_count
    }

    /// Fresh counters for a reused connection.
    pub fn reset(&mut self, now: Instant) {
        self.short_count = 0;
        self.long_count = 0;
        self.short_window_start = now;
        self.long_window_start = now;
        self.send_count = 0;
    }
}
