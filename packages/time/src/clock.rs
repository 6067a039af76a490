//! Coarse process-wide seconds clock
//!
//! Reading the system clock on every cache hit is measurable on hot paths, so this module keeps
//! a single atomic counter that a background ticker refreshes every [`RESOLUTION`]. The value is
//! anchored to the unix epoch when the clock first starts and advanced with a monotonic
//! [`Instant`] afterwards, so it never goes backwards even if the wall clock does.
//!
//! The ticker thread is started lazily by the first call to [`secs`].

use std::{
    sync::{
        LazyLock, Once,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

/// How often the ticker refreshes the counter.
pub const RESOLUTION: Duration = Duration::from_millis(500);

struct Clock {
    base_unix: u64,
    started: Instant,
    current: AtomicU64,
    ticking: AtomicBool,
}

impl Clock {
    fn new() -> Self {
        let base_unix = crate::standard::unix_secs();

        Self {
            base_unix,
            started: crate::standard::instant_now(),
            current: AtomicU64::new(base_unix),
            ticking: AtomicBool::new(false),
        }
    }

    fn compute(&self) -> u64 {
        self.base_unix + self.started.elapsed().as_secs()
    }

    fn tick(&self) {
        self.current.store(self.compute(), Ordering::Relaxed);
    }
}

static CLOCK: LazyLock<Clock> = LazyLock::new(Clock::new);
static TICKER: Once = Once::new();

fn start_ticker() {
    let spawned = thread::Builder::new()
        .name("tea-clock".to_string())
        .spawn(|| {
            loop {
                CLOCK.tick();
                thread::sleep(RESOLUTION);
            }
        });

    match spawned {
        Ok(_) => {
            CLOCK.ticking.store(true, Ordering::Release);
            log::debug!("start_ticker: coarse clock started resolution={RESOLUTION:?}");
        }
        Err(e) => {
            log::warn!("start_ticker: failed to spawn clock thread, reading directly: {e:?}");
        }
    }
}

/// Current coarse time in seconds.
///
/// Values are comparable with each other and with unix timestamps taken at roughly the same
/// time, with up to [`RESOLUTION`] of lag.
#[must_use]
pub fn secs() -> u64 {
    TICKER.call_once(start_ticker);

    if CLOCK.ticking.load(Ordering::Acquire) {
        CLOCK.current.load(Ordering::Relaxed)
    } else {
        CLOCK.compute()
    }
}

/// Whether the background ticker is running.
#[must_use]
pub fn is_ticking() -> bool {
    CLOCK.ticking.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn secs_is_anchored_to_unix_time() {
        let unix = crate::standard::unix_secs();
        let coarse = secs();

        assert!(coarse + 2 >= unix, "coarse={coarse} unix={unix}");
        assert!(coarse <= unix + 2, "coarse={coarse} unix={unix}");
    }

    #[test_log::test]
    fn secs_never_goes_backwards() {
        let first = secs();
        thread::sleep(RESOLUTION * 3);
        let second = secs();

        assert!(second >= first);
        assert!(is_ticking());
    }
}
