//! Adaptive backoff for the stub's step-retry loop (spec §4.2 "Backoff on
//! failure").
//!
//! On BSD a background process that attempts a read is charged a ~0.5s
//! kernel-imposed delay per attempt, so a coarser initial lag minimizes the
//! number of attempts; on Linux the finer default is usually sufficient on
//! the first try. Both platforms grow the lag by the same conservative
//! multiplier, since every retry is costly.

use std::time::Duration;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub(crate) const IS_BSD_FAMILY: bool = true;
#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
pub(crate) const IS_BSD_FAMILY: bool = false;

pub(crate) const DEFAULT_LAG_LINUX: Duration = Duration::from_millis(20);
pub(crate) const DEFAULT_LAG_BSD: Duration = Duration::from_millis(150);
pub(crate) const DEFAULT_MULTIPLIER: f64 = 1.5;

pub(crate) fn platform_default_lag() -> Duration {
    if IS_BSD_FAMILY {
        DEFAULT_LAG_BSD
    } else {
        DEFAULT_LAG_LINUX
    }
}

/// Tracks the current retry lag across one `step` retry loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    lag: Duration,
    multiplier: f64,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, multiplier: f64) -> Self {
        Self {
            lag: initial,
            multiplier,
        }
    }

    pub(crate) fn current(&self) -> Duration {
        self.lag
    }

    /// Grow the lag after a failed attempt, per the 1.5x-by-default policy.
    pub(crate) fn grow(&mut self) {
        self.lag = self.lag.mul_f64(self.multiplier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_multiplier_each_retry() {
        let mut backoff = Backoff::new(Duration::from_millis(20), 1.5);
        assert_eq!(backoff.current(), Duration::from_millis(20));
        backoff.grow();
        assert_eq!(backoff.current(), Duration::from_millis(30));
        backoff.grow();
        assert_eq!(backoff.current(), Duration::from_millis(45));
    }

    #[test]
    fn platform_default_matches_family() {
        let expected = if IS_BSD_FAMILY {
            DEFAULT_LAG_BSD
        } else {
            DEFAULT_LAG_LINUX
        };
        assert_eq!(platform_default_lag(), expected);
    }

    proptest::proptest! {
        #[test]
        fn lag_never_shrinks(initial_ms in 1u64..1000, multiplier in 1.0f64..3.0, retries in 0u32..20) {
            let mut backoff = Backoff::new(Duration::from_millis(initial_ms), multiplier);
            let mut previous = backoff.current();
            for _ in 0..retries {
                backoff.grow();
                proptest::prop_assert!(backoff.current() >= previous);
                previous = backoff.current();
            }
        }
    }
}
