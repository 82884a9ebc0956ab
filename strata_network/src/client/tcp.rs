//! Stream connections: full descriptor requests and sample feeds.

use crate::{Config, FrameReader, POLL_INTERVAL, write_frame};
use core::net::SocketAddr;
use core::time::Duration;
use std::{
    io,
    net::{Shutdown, TcpStream},
};
use strata_proto::{
    StreamInfo,
    message::{Request, Response},
};
use strata_utils::queue::BufferLimit;

fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout.max(Duration::from_millis(1)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Fetches the full descriptor of the stream served at `addr`, metadata tree included.
pub fn fetch_full_info(addr: SocketAddr, config: &Config, timeout: Duration) -> io::Result<StreamInfo> {
    let timeout = timeout.max(Duration::from_millis(1));
    let mut stream = connect(addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    write_frame(&mut stream, &Request::FullInfo)?;

    let mut reader = FrameReader::new(&stream, config.max_frame_len);

    match reader.read_frame()? {
        Response::FullInfo(xml) => StreamInfo::from_xml(&xml)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected answer to a descriptor request: {other:?}"),
        )),
    }
}

/// A subscription to an outlet's sample feed.
#[derive(Debug)]
pub struct FeedConnection {
    reader: FrameReader<TcpStream>,
    uid: String,
}

impl FeedConnection {
    /// Connects to the stream served at `addr`, and subscribes to its feed.
    ///
    /// `limit` and `max_chunk_len` are forwarded to the outlet, which uses them to bound
    /// the queue it keeps for this consumer, and the chunks it sends.
    pub fn open(
        addr: SocketAddr,
        config: &Config,
        limit: BufferLimit,
        max_chunk_len: Option<usize>,
        timeout: Duration,
    ) -> io::Result<Self> {
        let mut stream = connect(addr, timeout)?;
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        stream.set_write_timeout(Some(config.connection_timeout))?;

        write_frame(
            &mut stream,
            &Request::Feed {
                max_samples: limit.max_samples,
                max_duration: limit.max_duration,
                max_chunk_len,
            },
        )?;

        let mut reader = FrameReader::new(stream, config.max_frame_len);

        let uid = match reader.read_frame()? {
            Response::FeedAccepted { uid } => uid,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected answer to a feed request: {other:?}"),
                ));
            }
        };

        reader.get_ref().set_read_timeout(Some(POLL_INTERVAL))?;

        Ok(Self { reader, uid })
    }

    /// The uid of the outlet instance serving this feed.
    #[inline(always)]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Receives the next message, waiting a short while for it.
    ///
    /// Fails with a timeout error (see [`io_err_is_timeout`](crate::io_err_is_timeout)) if
    /// nothing arrived in time, in which case the call can simply be retried.
    #[inline(always)]
    pub fn recv(&mut self) -> io::Result<Response> {
        self.reader.read_frame()
    }

    /// Closes the connection.
    pub fn close(&self) {
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
    }
}
