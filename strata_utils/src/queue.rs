//! Bounded, timestamp-aware sample queues, and periodic wake-up logic.
//!
//! Every producer-consumer pair in the protocol is decoupled by a [`SampleQueue`]: one on
//! the outlet side per connected consumer, one on the inlet side. Writers never block:
//! when a queue is full, its oldest elements are dropped and counted.
use core::num;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

use crate::Deadline;

/// A counter that tracks progress through fixed-size periods.
///
/// Each time the counter advances past a multiple of it's period, a boundary
/// is considered crossed.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicCounter {
    period: num::NonZeroUsize,
    current: usize, // always less than self.period
}

impl PeriodicCounter {
    /// Creates a new counter with the given `period`.
    #[inline(always)]
    pub const fn new(period: num::NonZeroUsize) -> Self {
        Self { period, current: 0 }
    }

    /// Returns the configured period (or chunk size).
    #[inline(always)]
    pub const fn period(&self) -> num::NonZeroUsize {
        self.period
    }

    /// Advances the counter by `n` steps.
    ///
    /// Returns the number of period boundaries crossed.
    #[inline(always)]
    pub fn advance(&mut self, n: usize) -> usize {
        let p = self.period();
        let next = self.current.strict_add(n);
        self.current = next % p;
        next / p
    }

    /// Forgets any progress made through the current period.
    #[inline(always)]
    pub fn reset(&mut self) {
        self.current = 0;
    }
}

/// Elements that can be stored in a [`SampleQueue`].
pub trait Timestamped {
    /// Timestamp of this element, in seconds.
    fn timestamp(&self) -> f64;
}

impl<T> Timestamped for (f64, T) {
    #[inline(always)]
    fn timestamp(&self) -> f64 {
        self.0
    }
}

/// Capacity of a [`SampleQueue`].
///
/// A queue is over capacity when it holds more than `max_samples` elements, or when the
/// timestamps of its oldest and newest elements are more than `max_duration` seconds
/// apart.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BufferLimit {
    pub max_samples: Option<usize>,
    pub max_duration: Option<f64>,
}

impl BufferLimit {
    pub const UNBOUNDED: Self = Self {
        max_samples: None,
        max_duration: None,
    };

    #[inline(always)]
    pub const fn samples(n: usize) -> Self {
        Self {
            max_samples: Some(n),
            max_duration: None,
        }
    }

    #[inline(always)]
    pub const fn duration(seconds: f64) -> Self {
        Self {
            max_samples: None,
            max_duration: Some(seconds),
        }
    }

    /// The tightest combination of two limits.
    pub fn min(self, other: Self) -> Self {
        fn tightest<T: PartialOrd>(a: Option<T>, b: Option<T>) -> Option<T> {
            match (a, b) {
                (Some(a), Some(b)) => Some(if b < a { b } else { a }),
                (a, b) => a.or(b),
            }
        }

        Self {
            max_samples: tightest(self.max_samples, other.max_samples),
            max_duration: tightest(self.max_duration, other.max_duration),
        }
    }

    fn exceeded<T: Timestamped>(&self, items: &VecDeque<T>) -> bool {
        if self.max_samples.is_some_and(|max| items.len() > max) {
            return true;
        }

        match (self.max_duration, items.front(), items.back()) {
            (Some(max), Some(first), Some(last)) => last.timestamp() - first.timestamp() > max,
            _ => false,
        }
    }
}

/// Returned by blocking reads on a closed, fully drained, [`SampleQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    dropped: u64,
    closed: bool,
    // set when the reader is woken, cleared by `wait_ready`
    signaled: bool,
    wake: Option<PeriodicCounter>,
}

/// A bounded FIFO between one writer and one reader.
///
/// Writes never block: elements pushed into a full queue evict the oldest ones, which
/// are counted (see [`SampleQueue::dropped`]). Reads block, with a timeout, until an
/// element is available.
///
/// By default, every write wakes a waiting reader. A queue created with
/// [`SampleQueue::with_wake_period`] instead only wakes its reader each time the given
/// number of elements has been written, or when explicitly asked to.
#[derive(Debug)]
pub struct SampleQueue<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
    limit: BufferLimit,
}

impl<T: Timestamped> SampleQueue<T> {
    pub fn new(limit: BufferLimit) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                dropped: 0,
                closed: false,
                signaled: false,
                wake: None,
            }),
            ready: Condvar::new(),
            limit,
        }
    }

    pub fn with_wake_period(limit: BufferLimit, period: num::NonZeroUsize) -> Self {
        let queue = Self::new(limit);
        queue.state.lock().wake = Some(PeriodicCounter::new(period));
        queue
    }

    #[inline(always)]
    pub fn limit(&self) -> BufferLimit {
        self.limit
    }

    /// Appends one element. See [`SampleQueue::push_all`].
    #[inline(always)]
    pub fn push(&self, item: T, pushthrough: bool) -> usize {
        self.push_all(core::iter::once(item), pushthrough)
    }

    /// Appends elements, evicting the oldest ones while the queue is over capacity.
    ///
    /// If `pushthrough` is set, a waiting reader is woken regardless of the wake period.
    /// Elements pushed into a closed queue are discarded.
    ///
    /// Returns the number of elements evicted.
    pub fn push_all(&self, items: impl IntoIterator<Item = T>, pushthrough: bool) -> usize {
        let mut state = self.state.lock();

        if state.closed {
            return 0;
        }

        let mut pushed = 0usize;
        let mut evicted = 0usize;

        for item in items {
            state.items.push_back(item);
            pushed += 1;

            while self.limit.exceeded(&state.items) && state.items.pop_front().is_some() {
                evicted += 1;
            }
        }

        state.dropped = state.dropped.strict_add(evicted as u64);

        let wake = match state.wake.as_mut() {
            Some(counter) if pushthrough => {
                counter.reset();
                true
            }
            Some(counter) => counter.advance(pushed) > 0,
            None => pushed > 0,
        };

        if wake {
            state.signaled = true;
            drop(state);
            self.ready.notify_all();
        }

        evicted
    }

    /// Removes the oldest element, waiting up to `timeout` for one (forever if `None`).
    ///
    /// Returns `Ok(None)` on timeout, and `Err(Closed)` once the queue has been closed and
    /// fully drained.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<Option<T>, Closed> {
        let deadline = Deadline::after(timeout);
        let mut state = self.state.lock();

        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }

            if state.closed {
                return Err(Closed);
            }

            match deadline.instant() {
                None => self.ready.wait(&mut state),
                Some(at) => {
                    if self.ready.wait_until(&mut state, at).timed_out() && state.items.is_empty() {
                        return if state.closed { Err(Closed) } else { Ok(None) };
                    }
                }
            }
        }
    }

    /// Waits up to `timeout` for the reader to be woken, either by a write or by the
    /// queue being closed. Returns `false` on timeout.
    ///
    /// Wake-ups happening while the reader isn't waiting are not lost: the next call
    /// returns immediately.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();

        if !state.signaled && !state.closed {
            self.ready.wait_for(&mut state, timeout);
        }

        let woken = state.signaled || state.closed;
        state.signaled = false;
        woken
    }

    /// Removes up to `max` of the oldest elements, without blocking.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut state = self.state.lock();
        let n = max.min(state.items.len());
        state.items.drain(..n).collect()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Discards every queued element, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.items.len();
        state.items.clear();
        n
    }

    /// Closes the queue, waking every waiting reader. Queued elements can still be read.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Total number of elements evicted since creation.
    #[inline(always)]
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Wakes a waiting reader.
    #[inline(always)]
    pub fn notify(&self) {
        self.state.lock().signaled = true;
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Instant};

    fn nz(n: usize) -> num::NonZeroUsize {
        num::NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn periodic_counter() {
        let mut counter = PeriodicCounter::new(nz(4));

        assert_eq!(counter.advance(3), 0);
        assert_eq!(counter.advance(1), 1);
        assert_eq!(counter.advance(9), 2);
        assert_eq!(counter.advance(3), 1);

        counter.reset();
        assert_eq!(counter.advance(3), 0);
    }

    #[test]
    fn limits_combine() {
        let a = BufferLimit::samples(10);
        let b = BufferLimit {
            max_samples: Some(4),
            max_duration: Some(2.),
        };

        assert_eq!(a.min(b), b);
        assert_eq!(a.min(BufferLimit::UNBOUNDED), a);
        assert_eq!(BufferLimit::default(), BufferLimit::UNBOUNDED);
    }

    #[test]
    fn drops_oldest_by_count() {
        let queue = SampleQueue::new(BufferLimit::samples(3));

        let evicted = queue.push_all((0..5).map(|i| (i as f64, i)), true);

        assert_eq!(evicted, 2);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.drain(usize::MAX), [(2., 2), (3., 3), (4., 4)]);
    }

    #[test]
    fn drops_oldest_by_duration() {
        let queue = SampleQueue::new(BufferLimit::duration(1.5));

        for i in 0..5 {
            queue.push((i as f64, ()), true);
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 3);
        assert_eq!(queue.pop(None), Ok(Some((3., ()))));
    }

    #[test]
    fn pop_times_out() {
        let queue = SampleQueue::<(f64, ())>::new(BufferLimit::UNBOUNDED);

        let start = Instant::now();
        assert_eq!(queue.pop(Some(Duration::from_millis(50))), Ok(None));
        assert!(start.elapsed() >= Duration::from_millis(45));

        assert_eq!(queue.pop(Some(Duration::ZERO)), Ok(None));
    }

    #[test]
    fn pop_wakes_on_push() {
        let queue = Arc::new(SampleQueue::new(BufferLimit::UNBOUNDED));

        let writer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push((1., 'a'), false);
            })
        };

        assert_eq!(queue.pop(Some(Duration::from_secs(5))), Ok(Some((1., 'a'))));
        writer.join().unwrap();
    }

    #[test]
    fn closed_queue_drains_then_fails() {
        let queue = SampleQueue::new(BufferLimit::UNBOUNDED);
        queue.push((0., 0), true);
        queue.close();

        assert_eq!(queue.push((1., 1), true), 0);
        assert_eq!(queue.pop(None), Ok(Some((0., 0))));
        assert_eq!(queue.pop(None), Err(Closed));
        assert!(queue.wait_ready(Duration::ZERO));
    }

    #[test]
    fn wake_period_batches_wakeups() {
        let queue = SampleQueue::with_wake_period(BufferLimit::UNBOUNDED, nz(4));

        queue.push_all((0..3).map(|i| (i as f64, ())), false);
        assert!(!queue.wait_ready(Duration::from_millis(10)));
        assert_eq!(queue.len(), 3);

        let queue = Arc::new(queue);
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_ready(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push((3., ()), false);

        assert!(waiter.join().unwrap());

        // pushthrough wakes regardless of the period
        queue.push((4., ()), true);
        assert!(queue.wait_ready(Duration::ZERO));
        assert!(!queue.wait_ready(Duration::ZERO));
        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
    }
}
