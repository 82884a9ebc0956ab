//! Outlet service socket.
//!
//! Every outlet binds one UDP socket, on which it answers discovery queries (with an
//! advertisement of its stream) and clock probes (with its local time).

use crate::{Config, DatagramSocket};
use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::{
    io,
    net::UdpSocket,
    sync::atomic::{AtomicBool, Ordering},
};
use strata_proto::{
    StreamInfo,
    message::{Advertisement, Datagram},
};

/// Binds an outlet service socket.
///
/// The socket is bound on the first free port of the configured range, so that
/// resolvers scanning the range can reach it. If every port is taken, an ephemeral port is
/// used instead, and the outlet is only reachable through multicast groups it joined on
/// that port, which in practice means not at all.
///
/// Failures to join multicast groups are logged and otherwise ignored.
pub fn bind_service_socket(config: &Config) -> io::Result<DatagramSocket> {
    let bound = config
        .service_ports()
        .find_map(|port| UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).ok());

    let sock = match bound {
        Some(sock) => sock,
        None => {
            log::warn!(
                "no free service port in {}..{}, falling back to an ephemeral port",
                config.base_port,
                config.base_port.saturating_add(config.port_range),
            );
            UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?
        }
    };

    for group in &config.multicast_groups {
        if let Err(e) = sock.join_multicast_v4(group, &Ipv4Addr::UNSPECIFIED) {
            log::debug!("could not join multicast group {group}: {e}");
        }
    }

    Ok(DatagramSocket::new(sock))
}

/// Encapsulates the handling of datagrams received on a service socket.
///
/// The provided [`serve`](DatagramHandler::serve) method runs a blocking receive loop
/// and dispatches datagrams to [`on_datagram`](DatagramHandler::on_datagram).
pub trait DatagramHandler {
    /// Called on every received datagram.
    ///
    /// The `message` parameter is `None` if the datagram could not be decoded as a
    /// valid protocol message. `received_at` is the local clock time at reception.
    fn on_datagram(
        &mut self,
        sock: &DatagramSocket,
        peer: SocketAddr,
        message: Option<Datagram>,
        received_at: f64,
    ) -> io::Result<()>;

    /// Runs the receive loop until `stop` is set.
    ///
    /// Errors raised while handling a single datagram are logged, and don't stop the loop.
    /// Only non-recoverable socket errors make it return early.
    fn serve(&mut self, sock: &DatagramSocket, stop: &AtomicBool) -> io::Result<()> {
        let mut buf = [0; crate::DATAGRAM_BUF_LEN];

        while !stop.load(Ordering::Relaxed) {
            let (peer, message) = match sock.recv(&mut buf, crate::POLL_INTERVAL) {
                Ok(r) => r,
                // don't return on timeout errors...
                Err(e) if crate::io_err_is_timeout(e.kind()) => continue,
                // ...nor on ICMP errors caused by earlier replies
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            };

            let received_at = strata_utils::local_clock();

            if let Err(e) = self.on_datagram(sock, peer, message, received_at) {
                log::debug!("failed to answer {peer}: {e}");
            }
        }

        Ok(())
    }
}

/// Answers queries and clock probes on behalf of one outlet.
#[derive(Debug)]
pub struct Responder {
    info: StreamInfo,
    data_port: u16,
    service_port: u16,
}

impl Responder {
    /// Creates a responder for a stream, given its full descriptor (queries are evaluated
    /// against the metadata tree too) and the ports it is reachable on.
    #[inline(always)]
    pub fn new(info: StreamInfo, data_port: u16, service_port: u16) -> Self {
        Self {
            info,
            data_port,
            service_port,
        }
    }
}

impl DatagramHandler for Responder {
    fn on_datagram(
        &mut self,
        sock: &DatagramSocket,
        peer: SocketAddr,
        message: Option<Datagram>,
        received_at: f64,
    ) -> io::Result<()> {
        let mut buf = [0; crate::DATAGRAM_BUF_LEN];

        match message {
            Some(Datagram::Query { id, query }) => {
                if !query.matches(&self.info) {
                    return Ok(());
                }

                let reply = Datagram::Advertisement {
                    id,
                    ad: Advertisement {
                        core: self.info.core().clone(),
                        data_port: self.data_port,
                        service_port: self.service_port,
                    },
                };

                sock.send(&reply, peer, &mut buf)
            }
            Some(Datagram::TimeProbe { id, t0 }) => {
                let reply = Datagram::TimeReply {
                    id,
                    t0,
                    t_recv: received_at,
                    t_send: strata_utils::local_clock(),
                    uid: self.info.uid().to_owned(),
                };

                sock.send(&reply, peer, &mut buf)
            }
            // answers and garbage
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::sync::Arc;
    use strata_proto::{
        SampleFormat,
        message::{Match, Query},
    };

    fn test_config() -> Config {
        Config {
            base_port: 0,
            port_range: 1,
            multicast_groups: vec![],
            ..Config::default().with_session("responder-test")
        }
    }

    #[test]
    fn answers_matching_queries_and_probes() {
        let config = test_config();

        let mut info = StreamInfo::new("Gaze", "Eyes", 2, 60., SampleFormat::Float32, "").unwrap();
        info.desc_mut().append_child_value("tracker", "T1");
        info.assign_identity(&config.session_id, 0.);

        let service = bind_service_socket(&config).unwrap();
        let service_port = service.local_addr().unwrap().port();
        let stop = Arc::new(AtomicBool::new(false));

        let server = {
            let stop = stop.clone();
            let info = info.clone();
            std::thread::spawn(move || {
                Responder::new(info, 4242, service_port).serve(&service, &stop)
            })
        };

        let client = DatagramSocket::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, service_port));
        let mut buf = [0; crate::DATAGRAM_BUF_LEN];

        let query = |matching| Datagram::Query {
            id: 1,
            query: Query {
                session_id: "responder-test".into(),
                matching,
                minimum: 1,
                deadline_ms: None,
            },
        };

        // not matching, no answer
        client
            .send(
                &query(Match::Predicate("desc/tracker='T2'".parse().unwrap())),
                target,
                &mut buf,
            )
            .unwrap();
        client
            .send(
                &query(Match::Predicate("desc/tracker='T1'".parse().unwrap())),
                target,
                &mut buf,
            )
            .unwrap();

        let (_, reply) = client.recv(&mut buf, Duration::from_secs(2)).unwrap();
        let Some(Datagram::Advertisement { id: 1, ad }) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(ad.core, *info.core());
        assert_eq!(ad.data_port, 4242);

        client
            .send(&Datagram::TimeProbe { id: 9, t0: 1. }, target, &mut buf)
            .unwrap();

        let (_, reply) = client.recv(&mut buf, Duration::from_secs(2)).unwrap();
        let Some(Datagram::TimeReply { id: 9, t0, t_recv, t_send, uid }) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(t0, 1.);
        assert!(t_send >= t_recv);
        assert_eq!(uid, info.uid());

        stop.store(true, Ordering::Relaxed);
        server.join().unwrap().unwrap();
    }
}
