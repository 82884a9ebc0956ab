//! Stream consumers.
//!
//! An [`Inlet`] subscribes to one outlet's feed. A background receiver thread reads the
//! outlet's chunks, restores their timestamps, and queues their samples until they are
//! pulled. The receiver watches the connection and, if allowed to, finds the stream again
//! after losing it, possibly served by a restarted outlet.

use crate::{Error, Result};
use core::{num::NonZeroUsize, time::Duration};
use parking_lot::Mutex;
use replace_with::replace_with_or_abort;
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};
use strata_network::{
    Config,
    client::tcp::{FeedConnection, fetch_full_info},
    clock::{ClockSync, TimeCorrection},
    io_err_is_timeout,
    resolver::{Wanted, resolve},
};
use strata_proto::{
    ChannelValue, Endpoint, Expr, StreamInfo, Values,
    message::{Match, Response, WireChunk},
};
use strata_utils::{
    ConnectionTimer, Deadline,
    queue::{BufferLimit, Closed, SampleQueue},
};

/// How long a single attempt at finding a lost stream again lasts.
const RELOCATE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between failed reconnection attempts.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Timeout used for descriptor requests meant to wait forever.
const LONG_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

/// Transformations applied to timestamps as they are pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Postprocessing {
    /// Add the current time correction, mapping timestamps onto the local clock.
    pub clock_sync: bool,
    /// Never return a timestamp lower than the previous one.
    pub monotonize: bool,
}

/// Per-inlet settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InletConfig {
    /// Bounds of the receive queue. The oldest samples are dropped when it overflows.
    pub buffer: BufferLimit,
    /// Largest chunk the outlet may send, `None` to let it choose.
    pub max_chunk_len: Option<usize>,
    /// Whether to find the stream again after losing its connection, instead of closing.
    pub recover: bool,
    pub postprocessing: Postprocessing,
}

impl Default for InletConfig {
    fn default() -> Self {
        Self {
            buffer: BufferLimit::duration(360.),
            max_chunk_len: None,
            recover: true,
            postprocessing: Postprocessing::default(),
        }
    }
}

/// Lifecycle of an inlet's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InletState {
    /// Not yet opened.
    Created,
    Connecting,
    /// Receiving samples.
    Open,
    /// The connection was lost, and is about to be either recovered or closed.
    Lost,
    /// Looking for the stream again.
    Reconnecting,
    /// Terminal.
    Closed,
}

/// A pulled sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<T> {
    /// One value per channel.
    pub values: Vec<T>,
    pub timestamp: f64,
}

type Queued = (f64, Values);

#[derive(Debug)]
struct Status {
    state: InletState,
    endpoint: Option<Endpoint>,
}

#[derive(Debug)]
struct Shared {
    config: Arc<Config>,
    settings: InletConfig,
    info: StreamInfo,
    queue: SampleQueue<Queued>,
    clock: ClockSync,
    status: Mutex<Status>,
    /// Samples the outlet dropped before sending them.
    remote_dropped: AtomicU64,
    stop: AtomicBool,
}

/// Receives one stream from the network.
///
/// Samples are buffered from the moment the stream is opened (explicitly, or by the first
/// pull) until they are pulled.
#[derive(Debug)]
pub struct Inlet {
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    last_timestamp: Mutex<Option<f64>>,
}

impl Inlet {
    /// Creates an inlet for a resolved stream, with the process-wide network settings.
    ///
    /// No connection is made until the stream is opened.
    pub fn new(info: &StreamInfo, settings: InletConfig) -> Result<Self> {
        Self::new_with_config(info, settings, Config::global())
    }

    /// Creates an inlet for a resolved stream, with explicit network settings.
    pub fn new_with_config(
        info: &StreamInfo,
        settings: InletConfig,
        config: Arc<Config>,
    ) -> Result<Self> {
        if !info.format().is_transportable() {
            return Err(Error::InvalidArgument(format!(
                "streams of format `{}` can't be received",
                info.format()
            )));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                clock: ClockSync::new(config.clone()),
                config,
                settings,
                info: info.clone(),
                queue: SampleQueue::new(settings.buffer),
                status: Mutex::new(Status {
                    state: InletState::Created,
                    endpoint: info.endpoint().copied(),
                }),
                remote_dropped: AtomicU64::new(0),
                stop: AtomicBool::new(false),
            }),
            receiver: Mutex::new(None),
            last_timestamp: Mutex::new(None),
        })
    }

    #[inline(always)]
    pub fn state(&self) -> InletState {
        self.shared.state()
    }

    /// Subscribes to the stream, waiting up to `timeout` for the outlet to accept.
    ///
    /// Does nothing if the stream is already open. Fails with `ConnectionLost` once the
    /// inlet is closed.
    pub fn open_stream(&self, timeout: Option<Duration>) -> Result<()> {
        self.open_until(Deadline::after(timeout))
    }

    fn open_until(&self, deadline: Deadline) -> Result<()> {
        let mut receiver = self.receiver.lock();

        if self.shared.state() == InletState::Closed {
            return Err(Error::ConnectionLost);
        }

        if receiver.is_some() {
            return Ok(());
        }

        self.shared.set_state(InletState::Connecting);

        let feed = match self.shared.connect(deadline) {
            Ok(feed) => feed,
            Err(e) => {
                self.shared.set_state(InletState::Created);
                return Err(e);
            }
        };

        self.shared.set_state(InletState::Open);

        if self.shared.settings.postprocessing.clock_sync {
            self.shared.clock.start()?;
        }

        let shared = self.shared.clone();
        *receiver = Some(
            std::thread::Builder::new()
                .name("strata-inlet".into())
                .spawn(move || receive(&shared, feed))?,
        );

        Ok(())
    }

    /// Unsubscribes from the stream. Samples already received can still be pulled.
    ///
    /// The inlet can't be opened again.
    pub fn close_stream(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.queue.close();

        if let Some(receiver) = self.receiver.lock().take() {
            let _ = receiver.join();
        }

        self.shared.set_state(InletState::Closed);
    }

    fn check_format<T: ChannelValue>(&self) -> Result<()> {
        if T::FORMAT != self.shared.info.format() {
            return Err(Error::InvalidArgument(format!(
                "pulling {} values from a {} stream",
                T::FORMAT,
                self.shared.info.format()
            )));
        }

        Ok(())
    }

    /// Opens the stream if it never was. Returns `false` if it couldn't be opened in time.
    fn ensure_open(&self, deadline: Deadline) -> Result<bool> {
        if self.shared.state() != InletState::Created {
            return Ok(true);
        }

        match self.open_until(deadline) {
            Ok(()) => Ok(true),
            Err(Error::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn postprocess(&self, mut timestamp: f64) -> f64 {
        let Postprocessing {
            clock_sync,
            monotonize,
        } = self.shared.settings.postprocessing;

        if clock_sync {
            if let Some(correction) = self.shared.clock.latest() {
                timestamp += correction.offset;
            }
        }

        if monotonize {
            let mut last = self.last_timestamp.lock();

            if let Some(last) = *last {
                timestamp = timestamp.max(last);
            }

            *last = Some(timestamp);
        }

        timestamp
    }

    fn to_sample<T: ChannelValue>(&self, (timestamp, values): Queued) -> Result<Sample<T>> {
        let values = T::from_values(values).map_err(|values| {
            Error::InvalidArgument(format!("received {} values", values.format()))
        })?;

        Ok(Sample {
            values,
            timestamp: self.postprocess(timestamp),
        })
    }

    /// Pulls the oldest buffered sample, waiting up to `timeout` for one.
    ///
    /// Opens the stream if needed. Returns `None` on timeout. Once the connection is lost
    /// for good, buffered samples are still returned, then `ConnectionLost`.
    pub fn pull_sample<T: ChannelValue>(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Sample<T>>> {
        self.check_format::<T>()?;

        let deadline = Deadline::after(timeout);

        if !self.ensure_open(deadline)? {
            return Ok(None);
        }

        match self.shared.queue.pop(deadline.remaining()) {
            Ok(Some(queued)) => self.to_sample(queued).map(Some),
            Ok(None) => Ok(None),
            Err(Closed) => Err(Error::ConnectionLost),
        }
    }

    /// Pulls every buffered sample, waiting up to `timeout` for at least one.
    ///
    /// Returns an empty chunk on timeout.
    pub fn pull_chunk<T: ChannelValue>(&self, timeout: Option<Duration>) -> Result<Vec<Sample<T>>> {
        let Some(first) = self.pull_sample(timeout)? else {
            return Ok(Vec::new());
        };

        let mut chunk = vec![first];

        for queued in self.shared.queue.drain(usize::MAX) {
            chunk.push(self.to_sample(queued)?);
        }

        Ok(chunk)
    }

    /// Number of samples buffered, ready to be pulled.
    #[inline(always)]
    pub fn samples_available(&self) -> usize {
        self.shared.queue.len()
    }

    /// Discards every buffered sample, returning how many there were.
    #[inline(always)]
    pub fn flush(&self) -> usize {
        self.shared.queue.clear()
    }

    /// Number of samples lost to buffer overflows, on either side of the connection.
    pub fn dropped_samples(&self) -> u64 {
        self.shared
            .queue
            .dropped()
            .saturating_add(self.shared.remote_dropped.load(Ordering::Relaxed))
    }

    /// Fetches the stream's full descriptor, metadata tree included.
    pub fn info(&self, timeout: Option<Duration>) -> Result<StreamInfo> {
        let endpoint = self
            .shared
            .status
            .lock()
            .endpoint
            .ok_or_else(|| Error::InvalidArgument("the stream has no known endpoint".into()))?;

        let mut info = fetch_full_info(
            endpoint.data_addr(),
            &self.shared.config,
            timeout.unwrap_or(LONG_TIMEOUT),
        )?;

        info.set_endpoint(Some(endpoint));

        Ok(info)
    }

    /// The value to add to the stream's timestamps to map them onto the local clock.
    ///
    /// Opens the stream if needed, then waits up to `timeout` for a first estimate.
    pub fn time_correction(&self, timeout: Option<Duration>) -> Result<f64> {
        self.time_correction_ex(timeout).map(|tc| tc.offset)
    }

    /// Like [`Inlet::time_correction`], also returning when the estimate was measured,
    /// and its uncertainty.
    pub fn time_correction_ex(&self, timeout: Option<Duration>) -> Result<TimeCorrection> {
        let deadline = Deadline::after(timeout);

        if !self.ensure_open(deadline)? {
            return Err(Error::Timeout);
        }

        Ok(self.shared.clock.time_correction(deadline.remaining())?)
    }

    /// Returns whether the stream moved to another outlet instance since the last call,
    /// in which case earlier time corrections no longer apply.
    #[inline(always)]
    pub fn was_clock_reset(&self) -> bool {
        self.shared.clock.was_clock_reset()
    }
}

impl Drop for Inlet {
    fn drop(&mut self) {
        self.close_stream();
    }
}

impl Shared {
    fn state(&self) -> InletState {
        self.status.lock().state
    }

    fn set_state(&self, state: InletState) {
        let mut status = self.status.lock();

        if status.state == state || status.state == InletState::Closed {
            return;
        }

        log::info!(
            "inlet for {}: {:?} -> {state:?}",
            self.info.name(),
            status.state
        );

        status.state = state;
    }

    /// Records a new feed as the current one.
    fn attach(&self, endpoint: Endpoint, feed: &FeedConnection) {
        self.status.lock().endpoint = Some(endpoint);
        self.clock.set_target(endpoint.service_addr(), feed.uid());
    }

    fn open_feed(&self, endpoint: Endpoint, timeout: Duration) -> io::Result<FeedConnection> {
        let feed = FeedConnection::open(
            endpoint.data_addr(),
            &self.config,
            self.settings.buffer,
            self.settings.max_chunk_len,
            timeout,
        )?;

        self.attach(endpoint, &feed);

        Ok(feed)
    }

    /// Subscribes to the known endpoint, looking for the stream again if that fails and
    /// recovery is enabled.
    fn connect(&self, deadline: Deadline) -> Result<FeedConnection> {
        loop {
            let endpoint = self.status.lock().endpoint;
            let timeout = deadline.remaining_or(self.config.connection_timeout);

            let error = match endpoint {
                Some(endpoint) => match self.open_feed(endpoint, timeout) {
                    Ok(feed) => return Ok(feed),
                    Err(e) => Error::from(e),
                },
                None => Error::InvalidArgument(
                    "the descriptor has no endpoint, it must come from a resolver".into(),
                ),
            };

            if !self.settings.recover {
                return Err(error);
            }

            log::debug!("could not subscribe to {}: {error}", self.info.name());

            if deadline.expired() {
                return Err(Error::Timeout);
            }

            match self.relocate(deadline.remaining_or(RELOCATE_TIMEOUT)) {
                Some(found) => self.status.lock().endpoint = Some(found),
                None if deadline.expired() => return Err(Error::Timeout),
                None => std::thread::sleep(deadline.remaining_or(RETRY_DELAY)),
            }
        }
    }

    /// Resolves this stream again, by its source id if it has one, otherwise by its name,
    /// type and host.
    fn relocate(&self, timeout: Duration) -> Option<Endpoint> {
        let predicate = match self.relocation_predicate() {
            Ok(p) => p,
            Err(e) => {
                log::warn!("can't look for {} again: {e}", self.info.name());
                return None;
            }
        };

        let found = match resolve(
            &self.config,
            Match::Predicate(predicate),
            Wanted::AtLeast(1),
            Some(timeout),
        ) {
            Ok(found) => found,
            Err(e) => {
                log::debug!("looking for {} failed: {e}", self.info.name());
                return None;
            }
        };

        found
            .into_iter()
            .filter(|candidate| {
                candidate.format() == self.info.format()
                    && candidate.channel_count() == self.info.channel_count()
            })
            .find_map(|candidate| candidate.endpoint().copied())
    }

    fn relocation_predicate(&self) -> Result<Expr> {
        let info = &self.info;

        let identity = if info.source_id().is_empty() {
            Expr::property("hostname", info.hostname())?
        } else {
            Expr::property("source_id", info.source_id())?
        };

        Ok(Expr::property("name", info.name())?
            .and(Expr::property("type", info.content_type())?)
            .and(identity))
    }

    /// Queues the samples of a chunk.
    fn deliver(&self, chunk: WireChunk, prev: &mut Option<f64>) -> io::Result<()> {
        let period = self.info.core().nominal_rate.period();
        let channels = NonZeroUsize::new(self.info.core().channel_count.as_usize())
            .ok_or(io::ErrorKind::InvalidData)?;

        let timestamps = chunk
            .expand(period, prev)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "undated first sample"))?;

        if chunk.values.format() != self.info.format()
            || chunk.values.len() != timestamps.len() * channels.get()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk doesn't match the stream's shape",
            ));
        }

        if chunk.dropped > 0 {
            log::debug!(
                "outlet of {} dropped {} samples",
                self.info.name(),
                chunk.dropped
            );
            self.remote_dropped.fetch_add(chunk.dropped, Ordering::Relaxed);
        }

        let evicted = self
            .queue
            .push_all(timestamps.into_iter().zip(chunk.values.split(channels)), true);

        if evicted > 0 {
            log::debug!("inlet of {} dropped {evicted} samples", self.info.name());
        }

        Ok(())
    }

    /// Handles a lost connection: gives up, or looks for the stream again.
    fn recover(&self) -> Link {
        if !self.settings.recover {
            self.queue.close();
            self.set_state(InletState::Closed);
            return Link::Done;
        }

        self.set_state(InletState::Reconnecting);

        let Some(endpoint) = self.relocate(RELOCATE_TIMEOUT) else {
            return Link::Lost;
        };

        if self.stop.load(Ordering::Relaxed) {
            return Link::Done;
        }

        match self.open_feed(endpoint, self.config.connection_timeout) {
            Ok(feed) => {
                log::info!(
                    "recovered {}, now served by {} at {}",
                    self.info.name(),
                    feed.uid(),
                    endpoint.data_addr()
                );
                // same instance or not, the stream went through a gap
                self.clock.mark_reset();
                self.set_state(InletState::Open);
                Link::connected(feed)
            }
            Err(e) => {
                log::warn!("could not reconnect to {}: {e}", self.info.name());
                std::thread::sleep(RETRY_DELAY);
                Link::Lost
            }
        }
    }
}

/// State of the receiver's connection.
enum Link {
    Connected {
        feed: FeedConnection,
        watchdog: ConnectionTimer,
        /// Timestamp of the last sample received, to restore omitted timestamps.
        prev: Option<f64>,
    },
    Lost,
    Done,
}

impl Link {
    fn connected(feed: FeedConnection) -> Self {
        Self::Connected {
            feed,
            watchdog: ConnectionTimer::new(),
            prev: None,
        }
    }

    fn step(self, shared: &Shared) -> Self {
        let (mut feed, mut watchdog, mut prev) = match self {
            Self::Connected {
                feed,
                watchdog,
                prev,
            } => (feed, watchdog, prev),
            Self::Lost => return shared.recover(),
            Self::Done => return Self::Done,
        };

        let lost = match feed.recv() {
            Ok(Response::Chunk(chunk)) => {
                watchdog.reset();
                shared
                    .deliver(chunk, &mut prev)
                    .map_err(|e| log::warn!("bad chunk from {}: {e}", shared.info.name()))
                    .is_err()
            }
            Ok(Response::Heartbeat) => {
                watchdog.reset();
                false
            }
            Ok(other) => {
                log::debug!("ignoring unexpected feed message {other:?}");
                watchdog.reset();
                false
            }
            Err(e) if io_err_is_timeout(e.kind()) => {
                let silent = watchdog.expired(shared.config.connection_timeout);

                if silent {
                    log::warn!(
                        "no data from {} for {:?}",
                        shared.info.name(),
                        watchdog.elapsed()
                    );
                }

                silent
            }
            Err(e) => {
                log::info!("connection to {} lost: {e}", shared.info.name());
                true
            }
        };

        if lost {
            feed.close();
            shared.set_state(InletState::Lost);
            Self::Lost
        } else {
            Self::Connected {
                feed,
                watchdog,
                prev,
            }
        }
    }
}

fn receive(shared: &Shared, feed: FeedConnection) {
    let mut link = Link::connected(feed);

    loop {
        if shared.stop.load(Ordering::Relaxed) {
            if let Link::Connected { feed, .. } = &link {
                feed.close();
            }
            break;
        }

        if matches!(link, Link::Done) {
            break;
        }

        replace_with_or_abort(&mut link, |link| link.step(shared));
    }
}
