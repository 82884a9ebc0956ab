//! Outlet stream server.
//!
//! Consumers connect over TCP, and either request the full descriptor, or subscribe to
//! the sample feed. Each subscribed consumer gets its own bounded queue and its own
//! sender thread, so a slow or broken consumer never holds back the producer or the other
//! consumers.

use crate::{Config, FrameReader, POLL_INTERVAL, io_err_is_timeout, write_frame};
use core::{
    net::{Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    time::Duration,
};
use parking_lot::{Condvar, Mutex};
use std::{
    io,
    net::{TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};
use strata_proto::{
    SampleFormat, StreamInfo, Values,
    message::{Request, Response, WireChunk},
};
use strata_utils::{
    ConnectionTimer, Deadline,
    queue::{BufferLimit, SampleQueue},
};

/// A sample waiting to be sent: its timestamp, and its values (one per channel).
pub type QueuedSample = (f64, Values);

#[derive(Debug)]
struct Consumer {
    peer: SocketAddr,
    queue: SampleQueue<QueuedSample>,
}

#[derive(Debug)]
struct Shared {
    info: StreamInfo,
    info_xml: String,
    config: Arc<Config>,
    limit: BufferLimit,
    chunk_len: Option<NonZeroUsize>,
    consumers: Mutex<Vec<Arc<Consumer>>>,
    consumers_changed: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: AtomicBool,
}

impl Shared {
    fn add_consumer(&self, consumer: Arc<Consumer>) {
        let mut consumers = self.consumers.lock();

        if self.stop.load(Ordering::Relaxed) {
            consumer.queue.close();
        }

        consumers.push(consumer);
        drop(consumers);

        self.consumers_changed.notify_all();
    }

    fn remove_consumer(&self, consumer: &Arc<Consumer>) {
        self.consumers.lock().retain(|c| !Arc::ptr_eq(c, consumer));
        self.consumers_changed.notify_all();
    }
}

/// Serves a stream's descriptor and sample feed to any number of consumers.
#[derive(Debug)]
pub struct FeedServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
}

impl FeedServer {
    /// Binds a listener on an ephemeral port and starts accepting consumers.
    ///
    /// `limit` bounds each consumer's queue, in addition to the bounds consumers ask for.
    /// `chunk_len` is the preferred number of samples per chunk, used when consumers don't
    /// ask for one.
    pub fn start(
        info: StreamInfo,
        config: Arc<Config>,
        limit: BufferLimit,
        chunk_len: Option<NonZeroUsize>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let local_addr = listener.local_addr()?;
        // polled, so that the acceptor notices shutdowns
        listener.set_nonblocking(true)?;

        let shared = Arc::new(Shared {
            info_xml: info.to_xml(),
            info,
            config,
            limit,
            chunk_len,
            consumers: Mutex::new(Vec::new()),
            consumers_changed: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });

        let acceptor = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("strata-feed-accept".into())
                .spawn(move || accept_loop(listener, shared))?
        };

        Ok(Self {
            shared,
            local_addr,
            acceptor: Some(acceptor),
        })
    }

    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Enqueues samples for every connected consumer.
    ///
    /// With `pushthrough`, consumers' sender threads are woken right away. Otherwise, they
    /// wake up once a full chunk is queued, or after a short delay.
    pub fn push(&self, samples: &[QueuedSample], pushthrough: bool) {
        for consumer in self.shared.consumers.lock().iter() {
            let evicted = consumer.queue.push_all(samples.iter().cloned(), pushthrough);

            if evicted > 0 {
                log::debug!("dropped {evicted} samples for slow consumer {}", consumer.peer);
            }
        }
    }

    #[inline(always)]
    pub fn has_consumers(&self) -> bool {
        !self.shared.consumers.lock().is_empty()
    }

    /// Waits until at least one consumer is subscribed, or until `timeout` elapses
    /// (forever if `None`). Returns whether a consumer is subscribed.
    pub fn wait_for_consumers(&self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::after(timeout);
        let mut consumers = self.shared.consumers.lock();

        while consumers.is_empty() {
            match deadline.instant() {
                None => self.shared.consumers_changed.wait(&mut consumers),
                Some(at) => {
                    if self.shared.consumers_changed.wait_until(&mut consumers, at).timed_out() {
                        return !consumers.is_empty();
                    }
                }
            }
        }

        true
    }

    /// Stops accepting consumers, and disconnects the current ones once their queues
    /// are flushed.
    pub fn shutdown(&mut self) {
        if self.shared.stop.swap(true, Ordering::Relaxed) {
            return;
        }

        for consumer in self.shared.consumers.lock().iter() {
            consumer.queue.close();
        }

        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }

        let workers = core::mem::take(&mut *self.shared.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for FeedServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::Relaxed) {
        let stream = match listener.accept() {
            Ok((s, _)) => s,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                log::debug!("failed to accept a consumer: {e}");
                continue;
            }
        };

        // accepted sockets may inherit the listener's mode
        if let Err(e) = stream.set_nonblocking(false) {
            log::debug!("failed to set up a consumer connection: {e}");
            continue;
        }

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("strata-feed".into())
                .spawn(move || {
                    if let Err(e) = handle_connection(stream, &shared) {
                        log::debug!("consumer connection failed: {e}");
                    }
                })
        };

        match worker {
            Ok(handle) => {
                let mut workers = shared.workers.lock();
                workers.retain(|w| !w.is_finished());
                workers.push(handle);
            }
            Err(e) => log::warn!("failed to spawn a consumer thread: {e}"),
        }
    }
}

fn handle_connection(stream: TcpStream, shared: &Shared) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    let timeout = shared.config.connection_timeout;

    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut reader = FrameReader::new(stream.try_clone()?, shared.config.max_frame_len);
    let mut writer = stream;
    let mut idle = ConnectionTimer::new();

    while !shared.stop.load(Ordering::Relaxed) {
        let request = match reader.read_frame::<Request>() {
            Ok(r) => r,
            Err(e) if io_err_is_timeout(e.kind()) => {
                if idle.expired(timeout) {
                    break;
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        idle.reset();

        match request {
            Request::FullInfo => {
                write_frame(&mut writer, &Response::FullInfo(shared.info_xml.clone()))?;
            }
            Request::Feed {
                max_samples,
                max_duration,
                max_chunk_len,
            } => {
                let limit = shared.limit.min(BufferLimit {
                    max_samples,
                    max_duration,
                });

                let chunk_len = max_chunk_len
                    .and_then(NonZeroUsize::new)
                    .or(shared.chunk_len)
                    .or(NonZeroUsize::new(shared.config.chunk_len))
                    .unwrap_or(NonZeroUsize::MIN);

                return serve_feed(writer, peer, shared, limit, chunk_len);
            }
        }
    }

    Ok(())
}

fn serve_feed(
    mut writer: TcpStream,
    peer: SocketAddr,
    shared: &Shared,
    limit: BufferLimit,
    chunk_len: NonZeroUsize,
) -> io::Result<()> {
    write_frame(
        &mut writer,
        &Response::FeedAccepted {
            uid: shared.info.uid().to_owned(),
        },
    )?;

    let consumer = Arc::new(Consumer {
        peer,
        queue: SampleQueue::with_wake_period(limit, chunk_len),
    });

    shared.add_consumer(consumer.clone());
    log::info!("consumer {peer} subscribed to {}", shared.info.name());

    let res = feed_loop(&mut writer, &consumer, shared, chunk_len);

    shared.remove_consumer(&consumer);
    log::info!("consumer {peer} unsubscribed from {}", shared.info.name());

    res
}

fn feed_loop(
    writer: &mut TcpStream,
    consumer: &Consumer,
    shared: &Shared,
    chunk_len: NonZeroUsize,
) -> io::Result<()> {
    let format = shared.info.format();
    let period = shared.info.core().nominal_rate.period();
    let channels = shared.info.core().channel_count.as_usize();
    let heartbeat = shared.config.heartbeat_interval;

    let mut prev_timestamp = None;
    let mut reported_drops = 0;
    let mut since_send = ConnectionTimer::new();

    loop {
        consumer.queue.wait_ready(POLL_INTERVAL.min(heartbeat));
        let closed = consumer.queue.is_closed();

        loop {
            let batch = consumer.queue.drain(chunk_len.get());

            if batch.is_empty() {
                break;
            }

            let dropped = consumer.queue.dropped();

            let chunk = build_chunk(
                batch,
                format,
                channels,
                period,
                &mut prev_timestamp,
                dropped - reported_drops,
            )?;

            reported_drops = dropped;

            write_frame(writer, &Response::Chunk(chunk))?;
            since_send.reset();
        }

        if closed {
            return Ok(());
        }

        if since_send.expired(heartbeat) {
            write_frame(writer, &Response::Heartbeat)?;
            since_send.reset();
        }
    }
}

fn build_chunk(
    batch: Vec<QueuedSample>,
    format: SampleFormat,
    channels: usize,
    period: Option<f64>,
    prev_timestamp: &mut Option<f64>,
    dropped: u64,
) -> io::Result<WireChunk> {
    let mut values = Values::with_capacity(format, batch.len().strict_mul(channels))
        .ok_or(io::ErrorKind::InvalidInput)?;

    let mut stamps = Vec::with_capacity(batch.len());

    for (t, v) in &batch {
        stamps.push(*t);

        if !values.extend_from(v) {
            return Err(io::ErrorKind::InvalidInput.into());
        }
    }

    Ok(WireChunk {
        timestamps: WireChunk::compress(&stamps, period, prev_timestamp),
        values,
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(limit: BufferLimit) -> (FeedServer, StreamInfo) {
        let mut info =
            StreamInfo::new("Counter", "Test", 2, 10., SampleFormat::Int32, "counter").unwrap();
        info.assign_identity("feed-test", 0.);

        let server = FeedServer::start(
            info.clone(),
            Arc::new(Config::default()),
            limit,
            NonZeroUsize::new(4),
        )
        .unwrap();

        (server, info)
    }

    fn connect(server: &FeedServer) -> (FrameReader<TcpStream>, TcpStream) {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        (FrameReader::new(stream.try_clone().unwrap(), 1 << 20), stream)
    }

    fn sample(i: i32) -> QueuedSample {
        (f64::from(i) / 10., Values::Int32(vec![i, -i]))
    }

    #[test]
    fn serves_full_info() {
        let (server, info) = server(BufferLimit::UNBOUNDED);
        let (mut reader, mut writer) = connect(&server);

        write_frame(&mut writer, &Request::FullInfo).unwrap();

        let Response::FullInfo(xml) = reader.read_frame().unwrap() else {
            panic!("expected a descriptor");
        };

        assert_eq!(StreamInfo::from_xml(&xml).unwrap(), info);
    }

    #[test]
    fn feeds_samples_in_order_with_compressed_timestamps() {
        let (server, info) = server(BufferLimit::UNBOUNDED);
        let (mut reader, mut writer) = connect(&server);

        write_frame(
            &mut writer,
            &Request::Feed {
                max_samples: None,
                max_duration: None,
                max_chunk_len: None,
            },
        )
        .unwrap();

        assert_eq!(
            reader.read_frame::<Response>().unwrap(),
            Response::FeedAccepted {
                uid: info.uid().to_owned()
            }
        );

        assert!(server.wait_for_consumers(Some(Duration::from_secs(5))));

        let samples: Vec<_> = (0..10).map(sample).collect();
        server.push(&samples, true);

        let mut received = Vec::new();
        let mut prev = None;

        while received.len() < 10 {
            match reader.read_frame::<Response>().unwrap() {
                Response::Chunk(chunk) => {
                    assert!(chunk.len() <= 4);
                    let stamps = chunk.expand(Some(0.1), &mut prev).unwrap();
                    let Values::Int32(values) = chunk.values else {
                        panic!("wrong format");
                    };
                    received.extend(stamps.into_iter().zip(values.chunks(2).map(|v| v[0])));
                }
                Response::Heartbeat => {}
                other => panic!("unexpected {other:?}"),
            }
        }

        for (i, (t, v)) in received.into_iter().enumerate() {
            assert_eq!(v, i as i32);
            assert_eq!(t, samples[i].0);
        }
    }

    #[test]
    fn consumer_queues_are_bounded() {
        let (server, _) = server(BufferLimit::samples(3));
        let (mut reader, mut writer) = connect(&server);

        write_frame(
            &mut writer,
            &Request::Feed {
                max_samples: Some(100),
                max_duration: None,
                max_chunk_len: Some(100),
            },
        )
        .unwrap();

        let _accepted: Response = reader.read_frame().unwrap();
        assert!(server.wait_for_consumers(Some(Duration::from_secs(5))));

        // one batch larger than the outlet-side bound, without waking the sender
        let samples: Vec<_> = (0..8).map(sample).collect();
        server.push(&samples, false);

        let chunk = loop {
            match reader.read_frame::<Response>().unwrap() {
                Response::Chunk(chunk) => break chunk,
                Response::Heartbeat => {}
                other => panic!("unexpected {other:?}"),
            }
        };

        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.dropped, 5);
        assert_eq!(chunk.values, Values::Int32(vec![5, -5, 6, -6, 7, -7]));
    }

    #[test]
    fn shutdown_disconnects_consumers() {
        let (mut server, _) = server(BufferLimit::UNBOUNDED);
        let (mut reader, mut writer) = connect(&server);

        write_frame(
            &mut writer,
            &Request::Feed {
                max_samples: None,
                max_duration: None,
                max_chunk_len: None,
            },
        )
        .unwrap();
        let _accepted: Response = reader.read_frame().unwrap();
        assert!(server.wait_for_consumers(Some(Duration::from_secs(5))));

        let start = std::time::Instant::now();
        server.shutdown();
        assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
        assert!(!server.has_consumers());

        let err = loop {
            match reader.read_frame::<Response>() {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };

        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
