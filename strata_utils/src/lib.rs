//! Utilities shared by the producer and consumer sides of the stream protocol.
//!
//! This crate provides the small timing primitives the rest of the workspace is built
//! on (a process-wide clock, deadlines and inactivity timers), and the bounded queue
//! that sits between every producer and consumer (see [`queue`]).

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

pub mod queue;

/// A lightweight wrapper around [`std::time::Instant`] used to track timeouts.
/// Stores the instant at which the timer was last reset.
///
/// This type is primarily intended for implementing heartbeat or inactivity
/// timeouts on long-lived connections.
///
/// ```ignore
/// let mut timer = ConnectionTimer::new();
///
/// // we have received a message from the peer.
/// timer.reset();
///
/// if timer.elapsed() > TIMEOUT {
///     // consider the peer disconnected
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionTimer(Instant);

impl Default for ConnectionTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTimer {
    /// Creates a new timer starting at the current instant.
    #[inline(always)]
    pub fn new() -> Self {
        Self(Instant::now())
    }

    /// Resets the timer to start measuring elapsed time from now.
    #[inline(always)]
    pub fn reset(&mut self) {
        *self = Self::new()
    }

    /// Returns the amount of time elapsed since the last reset.
    #[inline(always)]
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    /// Returns whether more than `timeout` elapsed since the last reset.
    #[inline(always)]
    pub fn expired(&self, timeout: Duration) -> bool {
        self.elapsed() > timeout
    }
}

static CLOCK_ANCHOR: OnceLock<(Instant, f64)> = OnceLock::new();

/// Returns the current time, in seconds, on the local clock.
///
/// The clock is monotonic within a process. Its origin is the Unix epoch as read from
/// the system clock the first time this function is called, so that processes running on
/// the same machine agree on it, give or take system clock adjustments.
pub fn local_clock() -> f64 {
    let (start, offset) = CLOCK_ANCHOR.get_or_init(|| {
        let since_epoch = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        (Instant::now(), since_epoch)
    });

    offset + start.elapsed().as_secs_f64()
}

/// The point in time at which a blocking operation gives up.
///
/// Built from an optional timeout, where `None` means waiting forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never passes.
    pub const NEVER: Self = Self(None);

    /// Creates a deadline `timeout` from now. Timeouts too large to be represented never
    /// pass.
    #[inline(always)]
    pub fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.and_then(|t| Instant::now().checked_add(t)))
    }

    #[inline(always)]
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    #[inline(always)]
    pub fn is_never(&self) -> bool {
        self.0.is_none()
    }

    /// Time left before the deadline passes, `None` if it never does.
    #[inline(always)]
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|d| d.saturating_duration_since(Instant::now()))
    }

    #[inline(always)]
    pub fn expired(&self) -> bool {
        self.0.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline passes, capped to `max`.
    #[inline(always)]
    pub fn remaining_or(&self, max: Duration) -> Duration {
        self.remaining().map_or(max, |r| r.min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_clock_is_monotonic_and_epoch_based() {
        let a = local_clock();
        std::thread::sleep(Duration::from_millis(5));
        let b = local_clock();

        assert!(b - a >= 0.004);

        let wall = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();

        assert!((wall - b).abs() < 1.);
    }

    #[test]
    fn deadlines() {
        assert!(!Deadline::NEVER.expired());
        assert_eq!(Deadline::NEVER.remaining(), None);
        assert_eq!(Deadline::after(None), Deadline::NEVER);

        let now = Deadline::after(Some(Duration::ZERO));
        assert!(now.expired());
        assert_eq!(now.remaining(), Some(Duration::ZERO));

        let later = Deadline::after(Some(Duration::from_secs(60)));
        assert!(!later.expired());
        assert_eq!(later.remaining_or(Duration::from_secs(1)), Duration::from_secs(1));

        assert!(Deadline::after(Some(Duration::MAX)).is_never());
    }

    #[test]
    fn connection_timer() {
        let mut timer = ConnectionTimer::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(timer.expired(Duration::from_millis(10)));

        timer.reset();
        assert!(!timer.expired(Duration::from_secs(10)));
    }
}
