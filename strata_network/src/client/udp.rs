//! Sending queries and clock probes.

use crate::{Config, DatagramSocket};
use core::net::{IpAddr, Ipv4Addr, SocketAddr};
use core::time::Duration;
use std::{
    io,
    net::UdpSocket,
    sync::atomic::{AtomicU64, Ordering},
};
use strata_proto::{
    Endpoint, StreamInfo,
    message::{Datagram, Query},
};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a request id, unique within this process.
#[inline(always)]
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A socket sending discovery queries and collecting advertisements.
#[derive(Debug)]
pub struct QuerySocket {
    sock: DatagramSocket,
    targets: Vec<SocketAddr>,
}

impl QuerySocket {
    /// Binds an ephemeral socket able to reach every configured destination.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;

        if config.broadcast
            && let Err(e) = sock.set_broadcast(true)
        {
            log::debug!("could not enable broadcast: {e}");
        }

        if let Err(e) = sock.set_multicast_ttl_v4(config.multicast_ttl) {
            log::debug!("could not set the multicast TTL: {e}");
        }

        let hosts = config
            .known_peers
            .iter()
            .copied()
            .chain(config.multicast_groups.iter().copied().map(IpAddr::V4))
            .chain(
                config
                    .broadcast
                    .then_some(IpAddr::V4(Ipv4Addr::BROADCAST)),
            )
            // the socket is IPv4
            .filter(IpAddr::is_ipv4);

        let targets = hosts
            .flat_map(|host| config.service_ports().map(move |port| SocketAddr::new(host, port)))
            .collect();

        Ok(Self {
            sock: DatagramSocket::new(sock),
            targets,
        })
    }

    /// Sends a query to every destination. Returns the id the answers will carry.
    ///
    /// Destinations that can't be reached are skipped.
    pub fn send_wave(&self, query: &Query) -> u64 {
        let id = next_request_id();
        let message = Datagram::Query {
            id,
            query: query.clone(),
        };

        let mut buf = [0; crate::DATAGRAM_BUF_LEN];

        for target in &self.targets {
            if let Err(e) = self.sock.send(&message, *target, &mut buf) {
                log::debug!("query to {target} failed: {e}");
            }
        }

        id
    }

    /// Waits up to `timeout` for an advertisement answering one of the given waves.
    ///
    /// Returns `Ok(None)` if something else was received. Timeouts are reported as errors
    /// (see [`io_err_is_timeout`](crate::io_err_is_timeout)).
    pub fn recv_advertisement(
        &self,
        waves: impl Fn(u64) -> bool,
        timeout: Duration,
    ) -> io::Result<Option<StreamInfo>> {
        let mut buf = [0; crate::DATAGRAM_BUF_LEN];

        let (peer, message) = self.sock.recv(&mut buf, timeout)?;

        Ok(match message {
            Some(Datagram::Advertisement { id, ad }) if waves(id) => Some(StreamInfo::from_core(
                ad.core,
                Some(Endpoint {
                    addr: peer.ip(),
                    data_port: ad.data_port,
                    service_port: ad.service_port,
                }),
            )),
            _ => None,
        })
    }
}

/// A time probe's outcome, all times in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReply {
    /// Local time at which the probe was sent.
    pub t0: f64,
    /// Remote time at which the probe was received.
    pub t_recv: f64,
    /// Remote time at which the reply was sent.
    pub t_send: f64,
    /// Local time at which the reply was received.
    pub t1: f64,
}

impl ProbeReply {
    /// Time spent on the network, excluding the remote processing time.
    #[inline(always)]
    pub fn rtt(&self) -> f64 {
        (self.t1 - self.t0) - (self.t_send - self.t_recv)
    }

    /// The value to add to a remote time to map it onto the local clock.
    #[inline(always)]
    pub fn offset(&self) -> f64 {
        (self.t0 + self.t1) / 2. - self.remote_time()
    }

    /// The remote time matching the middle of the local round-trip.
    #[inline(always)]
    pub fn remote_time(&self) -> f64 {
        (self.t_recv + self.t_send) / 2.
    }
}

/// A socket exchanging clock probes with one outlet.
#[derive(Debug)]
pub struct ProbeSocket {
    sock: DatagramSocket,
}

impl ProbeSocket {
    pub fn bind() -> io::Result<Self> {
        Ok(Self {
            sock: DatagramSocket::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?),
        })
    }

    /// Sends a probe, stamped with the current local time. Returns its id.
    pub fn send_probe(&self, target: SocketAddr) -> io::Result<u64> {
        let id = next_request_id();
        let mut buf = [0; 256];

        self.sock.send(
            &Datagram::TimeProbe {
                id,
                t0: strata_utils::local_clock(),
            },
            target,
            &mut buf,
        )?;

        Ok(id)
    }

    /// Waits up to `timeout` for a probe reply.
    ///
    /// Returns the reply's id, its timings, and the uid of the outlet that answered,
    /// or `Ok(None)` if something else was received.
    pub fn recv_reply(&self, timeout: Duration) -> io::Result<Option<(u64, ProbeReply, String)>> {
        let mut buf = [0; 1024];
        let (_, message) = self.sock.recv(&mut buf, timeout)?;
        let t1 = strata_utils::local_clock();

        Ok(match message {
            Some(Datagram::TimeReply {
                id,
                t0,
                t_recv,
                t_send,
                uid,
            }) => Some((
                id,
                ProbeReply {
                    t0,
                    t_recv,
                    t_send,
                    t1,
                },
                uid,
            )),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_arithmetic() {
        // remote clock 10s ahead, 2ms each way, 1ms processing
        let reply = ProbeReply {
            t0: 100.,
            t_recv: 110.002,
            t_send: 110.003,
            t1: 100.005,
        };

        assert!((reply.rtt() - 0.004).abs() < 1e-9);
        assert!((reply.offset() + 10.).abs() < 1e-9);
        assert!((reply.remote_time() - 110.0025).abs() < 1e-9);
    }

    #[test]
    fn query_targets_cover_every_port() {
        let config = Config {
            known_peers: vec![IpAddr::V4(Ipv4Addr::LOCALHOST), "::1".parse().unwrap()],
            multicast_groups: vec![Ipv4Addr::new(239, 255, 172, 215)],
            broadcast: false,
            port_range: 4,
            ..Config::default()
        };

        let sock = QuerySocket::bind(&config).unwrap();

        assert_eq!(sock.targets.len(), 8);
        assert!(sock.targets.iter().all(|t| t.is_ipv4()));
    }

    #[test]
    fn request_ids_are_unique() {
        let a = next_request_id();
        let b = next_request_id();
        assert_ne!(a, b);
    }
}
