//! Implementation of the message model defined in the `strata_proto` crate.
//!
//! This crate provides the runtime machinery needed to send and receive protocol
//! messages over network sockets: discovery and clock probes over UDP, stream data and
//! full descriptors over TCP.
//!
//! ## Scope
//!
//! - Encoding and decoding protocol messages using [`serde`] and [`postcard`].
//! - The outlet side: answering queries and probes ([`server::udp`]), and serving
//!   descriptors and sample feeds to consumers ([`server::tcp`]).
//! - The inlet side: sending queries and probes ([`client::udp`]), and receiving feeds
//!   ([`client::tcp`]).
//! - Stream resolution ([`resolver`]) and clock offset estimation ([`clock`]).
//!
//! All I/O is blocking, driven by dedicated threads, with socket timeouts used to
//! periodically check for shutdown requests.

pub mod client;
pub mod clock;
pub mod config;
pub mod resolver;
pub mod server;

pub use config::Config;
pub use postcard;
pub use serde;
pub use strata_proto;

use std::io::{self, Read, Write};
use strata_proto::message::Datagram;

/// Size of the stack buffers datagrams are encoded to and received in.
pub const DATAGRAM_BUF_LEN: usize = 16 * 1024;

/// Socket read timeout used by background loops, bounding how long they take to notice
/// a shutdown request.
pub(crate) const POLL_INTERVAL: core::time::Duration = core::time::Duration::from_millis(100);

/// Utility for converting a `postcard` error into a [`std::io::Error`].
///
/// This is used at every receive boundary, where deserialization failures must be
/// reported using I/O–oriented error types.
#[inline(always)]
pub(crate) fn postcard_to_io_err(e: postcard::Error) -> io::Error {
    match e {
        postcard::Error::DeserializeUnexpectedEnd => io::ErrorKind::UnexpectedEof.into(),
        e => io::Error::new(io::ErrorKind::InvalidData, e),
    }
}

/// Returns `true` if the given I/O error kind represents a timeout condition.
///
/// This treats both `WouldBlock` and `TimedOut` as timeout-equivalent, as socket read
/// timeouts report either, depending on the platform.
#[inline(always)]
pub fn io_err_is_timeout(e: io::ErrorKind) -> bool {
    use io::ErrorKind::*;
    [WouldBlock, TimedOut].contains(&e)
}

/// A UDP socket exchanging [`Datagram`]s.
///
/// Used by both sides of the protocol: outlets answer queries and probes on one, while
/// resolvers and clock estimators send from their own.
#[derive(Debug)]
pub struct DatagramSocket {
    sock: std::net::UdpSocket,
}

impl DatagramSocket {
    #[inline(always)]
    pub fn new(sock: std::net::UdpSocket) -> Self {
        Self { sock }
    }

    #[inline(always)]
    pub fn inner(&self) -> &std::net::UdpSocket {
        &self.sock
    }

    #[inline(always)]
    pub fn local_addr(&self) -> io::Result<core::net::SocketAddr> {
        self.sock.local_addr()
    }

    /// Serializes and sends a datagram to the specified destination address.
    ///
    /// The message is encoded using [`postcard`] into the provided buffer and then
    /// sent as a single UDP datagram. The destination address may be unicast, multicast,
    /// or broadcast.
    pub fn send(
        &self,
        message: &Datagram,
        dest_addr: core::net::SocketAddr,
        buf: &mut [u8],
    ) -> io::Result<()> {
        let ser_len = postcard::to_slice(message, buf)
            .map_err(|e| match e {
                postcard::Error::SerializeBufferFull => io::ErrorKind::FileTooLarge.into(),
                e => postcard_to_io_err(e),
            })?
            .len();

        let n = self.sock.send_to(&buf[..ser_len], dest_addr)?;

        (n == ser_len)
            .then_some(())
            .ok_or(io::ErrorKind::FileTooLarge.into())
    }

    /// Receives and deserializes a datagram, waiting at most `timeout`.
    ///
    /// On success, returns the sender's socket address and an optional decoded
    /// protocol message. If a datagram is received but cannot be parsed as a valid
    /// protocol message, the returned `Option` is `None`.
    pub fn recv(
        &self,
        buf: &mut [u8],
        timeout: core::time::Duration,
    ) -> io::Result<(core::net::SocketAddr, Option<Datagram>)> {
        // zero is rejected as a read timeout
        self.sock
            .set_read_timeout(Some(timeout.max(core::time::Duration::from_millis(1))))?;

        self.sock
            .recv_from(buf)
            .map(|(n, peer)| (peer, postcard::from_bytes(&buf[..n]).ok()))
    }
}

/// Writes a length-prefixed frame: the little-endian `u32` length of the payload,
/// followed by the payload, a `postcard`-encoded `message`.
pub fn write_frame<W: Write, T: serde::Serialize>(w: &mut W, message: &T) -> io::Result<()> {
    let payload = postcard::to_stdvec(message).map_err(postcard_to_io_err)?;

    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;

    let mut frame = Vec::with_capacity(payload.len().strict_add(4));
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);

    w.write_all(&frame)?;
    w.flush()
}

/// Reads length-prefixed frames (see [`write_frame`]) from a byte stream.
///
/// Partially received frames are kept across calls, so reads on a stream with a read
/// timeout may fail with a timeout error, then be retried, without losing data.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: Read> FrameReader<R> {
    #[inline(always)]
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max_len,
        }
    }

    #[inline(always)]
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Reads the next frame, decoding its payload.
    ///
    /// Fails with `InvalidData` if the announced payload length exceeds the maximum,
    /// and with `UnexpectedEof` if the stream ends.
    pub fn read_frame<T: serde::de::DeserializeOwned>(&mut self) -> io::Result<T> {
        loop {
            if let Some(len) = self.complete_frame_len()? {
                let message = postcard::from_bytes(&self.buf[4..4 + len]);
                self.buf.drain(..4 + len);
                return message.map_err(postcard_to_io_err);
            }

            let mut chunk = [0; 8192];
            let n = self.inner.read(&mut chunk)?;

            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn complete_frame_len(&self) -> io::Result<Option<usize>> {
        let Some(header) = self.buf.first_chunk::<4>() else {
            return Ok(None);
        };

        let len = u32::from_le_bytes(*header) as usize;

        if len > self.max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the maximum of {}", self.max_len),
            ));
        }

        Ok((self.buf.len() >= len.strict_add(4)).then_some(len))
    }
}
