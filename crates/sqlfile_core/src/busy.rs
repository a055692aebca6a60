//! Busy handlers decide whether a contended lock is retried.

use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

/// Back-off schedule of the default handler, in milliseconds.
const DELAYS_MS: [u64; 12] = [1, 2, 5, 10, 15, 20, 25, 25, 25, 50, 50, 100];

/// Called when a lock attempt finds the file busy.
///
/// `attempt` counts previous calls for the same acquisition, starting at
/// zero. Returning `true` retries the lock; returning `false` gives up and
/// the acquisition fails with [`crate::CoreError::Busy`].
pub trait BusyHandler: Send + Sync {
    /// Decides whether to retry, possibly after sleeping.
    fn on_busy(&self, attempt: u32, timeout: Duration) -> bool;
}

impl<F> BusyHandler for F
where
    F: Fn(u32, Duration) -> bool + Send + Sync,
{
    fn on_busy(&self, attempt: u32, timeout: Duration) -> bool {
        self(attempt, timeout)
    }
}

/// Sleeps along a growing schedule until the total wait would pass the
/// timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackoffBusyHandler;

impl BackoffBusyHandler {
    /// Delay before retry number `attempt`, and the total slept before it.
    fn schedule(attempt: u32) -> (Duration, Duration) {
        let n = attempt as usize;
        let last = DELAYS_MS.len() - 1;
        let delay = DELAYS_MS[n.min(last)];
        let prior: u64 = if n <= last {
            DELAYS_MS[..n].iter().sum()
        } else {
            DELAYS_MS.iter().sum::<u64>() + DELAYS_MS[last] * (n - last - 1) as u64
        };
        (Duration::from_millis(delay), Duration::from_millis(prior))
    }
}

impl BusyHandler for BackoffBusyHandler {
    fn on_busy(&self, attempt: u32, timeout: Duration) -> bool {
        let (delay, prior) = Self::schedule(attempt);
        if prior >= timeout {
            return false;
        }
        thread::sleep(delay.min(timeout - prior));
        true
    }
}

/// Gives up immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetry;

impl BusyHandler for NoRetry {
    fn on_busy(&self, _attempt: u32, _timeout: Duration) -> bool {
        false
    }
}

/// Returns the process default busy handler.
#[must_use]
pub fn default_busy_handler() -> Arc<dyn BusyHandler> {
    static DEFAULT: OnceLock<Arc<dyn BusyHandler>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(BackoffBusyHandler)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn schedule_accumulates() {
        assert_eq!(
            BackoffBusyHandler::schedule(0),
            (Duration::from_millis(1), Duration::ZERO)
        );
        assert_eq!(
            BackoffBusyHandler::schedule(3),
            (Duration::from_millis(10), Duration::from_millis(8))
        );
        // 1+2+5+10+15+20+25+25+25+50+50+100 = 328, then 100 per retry.
        assert_eq!(
            BackoffBusyHandler::schedule(13),
            (Duration::from_millis(100), Duration::from_millis(428))
        );
    }

    #[test]
    fn zero_timeout_never_retries() {
        assert!(!BackoffBusyHandler.on_busy(0, Duration::ZERO));
        assert!(!NoRetry.on_busy(0, Duration::from_secs(1)));
    }

    #[test]
    fn backoff_is_bounded_by_timeout() {
        let handler = default_busy_handler();
        let timeout = Duration::from_millis(30);
        let start = Instant::now();
        let mut attempt = 0;
        while handler.on_busy(attempt, timeout) {
            attempt += 1;
        }
        assert!(attempt > 0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn closures_are_handlers() {
        let handler = |attempt: u32, _timeout: Duration| attempt < 2;
        assert!(handler.on_busy(1, Duration::ZERO));
        assert!(!handler.on_busy(2, Duration::ZERO));
    }
}
