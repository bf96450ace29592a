use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch, as stamped into health responses, user
/// records and the engine's start marker.
#[inline]
pub fn unix_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs(),
        // Only reachable with a system clock set before 1970.
        Err(_) => 0,
    }
}
