use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[must_use]
pub fn now() -> SystemTime {
    SystemTime::now()
}

#[must_use]
pub fn instant_now() -> Instant {
    Instant::now()
}

/// Seconds since the unix epoch, `0` if the system clock is set before it.
#[must_use]
pub fn unix_secs() -> u64 {
    now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
