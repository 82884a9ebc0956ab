//! Clock offset estimation.
//!
//! An inlet maps its outlet's timestamps onto its own clock by adding an offset, measured
//! by exchanging round-trip probes with the outlet's service socket. Each measurement sends
//! a burst of probes and keeps the fastest round trip, the one least disturbed by network
//! jitter. Measurements are repeated periodically, in the background, and smoothed.

use crate::{
    Config,
    client::udp::{ProbeReply, ProbeSocket},
    io_err_is_timeout,
};
use arrayvec::ArrayVec;
use core::{net::SocketAddr, time::Duration};
use parking_lot::{Condvar, Mutex};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};
use strata_utils::Deadline;

/// Maximum number of probes per measurement.
const MAX_PROBES: usize = 32;

/// Delay before retrying a measurement that got no replies.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// An estimate of how a remote clock maps onto the local clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeCorrection {
    /// The value to add to a remote timestamp to map it onto the local clock, in seconds.
    pub offset: f64,
    /// The remote time at which the offset was measured.
    pub remote_time: f64,
    /// Maximum error of the offset, half the round-trip time.
    pub uncertainty: f64,
}

impl From<ProbeReply> for TimeCorrection {
    #[inline(always)]
    fn from(reply: ProbeReply) -> Self {
        Self {
            offset: reply.offset(),
            remote_time: reply.remote_time(),
            uncertainty: reply.rtt() / 2.,
        }
    }
}

impl TimeCorrection {
    /// Moves this estimate towards `next`. `alpha` is the weight of the new estimate.
    fn smoothed(self, next: Self, alpha: f64) -> Self {
        Self {
            offset: self.offset + alpha * (next.offset - self.offset),
            remote_time: next.remote_time,
            uncertainty: self.uncertainty + alpha * (next.uncertainty - self.uncertainty),
        }
    }
}

#[derive(Debug, Default)]
struct ClockState {
    target: Option<SocketAddr>,
    /// Bumped on every target change, so that measurements started before are discarded.
    generation: u64,
    /// The uid of the outlet instance whose clock is being measured.
    epoch: Option<String>,
    estimate: Option<TimeCorrection>,
    measured_at: Option<Instant>,
    reset: bool,
}

#[derive(Debug)]
struct Shared {
    config: Arc<Config>,
    state: Mutex<ClockState>,
    changed: Condvar,
    stop: AtomicBool,
}

/// Estimates the clock offset of one outlet, in the background.
///
/// The background thread only starts when an estimate is first requested.
#[derive(Debug)]
pub struct ClockSync {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClockSync {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ClockState::default()),
                changed: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Points the estimator at an outlet's service socket.
    ///
    /// `uid` identifies the outlet instance. Switching to a different instance discards
    /// the current estimate and raises the clock reset flag.
    pub fn set_target(&self, service_addr: SocketAddr, uid: &str) {
        let mut state = self.shared.state.lock();

        let other_instance = state.epoch.as_deref().is_some_and(|e| e != uid);

        if other_instance {
            log::info!("clock source changed to instance {uid}, resetting the time correction");
            state.reset = true;
        }

        if other_instance || state.target != Some(service_addr) {
            state.estimate = None;
            state.measured_at = None;
        }

        state.epoch = Some(uid.to_owned());
        state.target = Some(service_addr);
        state.generation = state.generation.wrapping_add(1);

        drop(state);
        self.shared.changed.notify_all();
    }

    /// Raises the clock reset flag, keeping the current estimate.
    ///
    /// Used when a connection to the same instance is re-established, as its clock may
    /// have jumped in between.
    pub fn mark_reset(&self) {
        self.shared.state.lock().reset = true;
    }

    /// Starts the background thread, if not already running.
    pub fn start(&self) -> io::Result<()> {
        let mut worker = self.worker.lock();

        if worker.is_none() {
            let shared = self.shared.clone();
            *worker = Some(
                std::thread::Builder::new()
                    .name("strata-clock".into())
                    .spawn(move || run(&shared))?,
            );
        }

        Ok(())
    }

    /// Returns the current estimate, waiting up to `timeout` (forever if `None`) for a
    /// first one.
    ///
    /// Fails with `TimedOut` if no estimate is available in time.
    pub fn time_correction(&self, timeout: Option<Duration>) -> io::Result<TimeCorrection> {
        self.start()?;

        let deadline = Deadline::after(timeout);
        let mut state = self.shared.state.lock();

        loop {
            if let Some(estimate) = state.estimate {
                return Ok(estimate);
            }

            match deadline.instant() {
                None => self.shared.changed.wait(&mut state),
                Some(at) => {
                    if self.shared.changed.wait_until(&mut state, at).timed_out() {
                        return state.estimate.ok_or(io::ErrorKind::TimedOut.into());
                    }
                }
            }
        }
    }

    /// The current estimate, if any, without waiting.
    #[inline(always)]
    pub fn latest(&self) -> Option<TimeCorrection> {
        self.shared.state.lock().estimate
    }

    /// Returns whether the clock source changed since the last call.
    pub fn was_clock_reset(&self) -> bool {
        core::mem::take(&mut self.shared.state.lock().reset)
    }
}

impl Drop for ClockSync {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.changed.notify_all();

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn run(shared: &Shared) {
    let sock = match ProbeSocket::bind() {
        Ok(s) => s,
        Err(e) => {
            log::warn!("could not bind a clock probe socket: {e}");
            return;
        }
    };

    while !shared.stop.load(Ordering::Relaxed) {
        let (target, generation) = {
            let mut state = shared.state.lock();

            match state.target {
                Some(target) => (target, state.generation),
                None => {
                    shared.changed.wait_for(&mut state, crate::POLL_INTERVAL);
                    continue;
                }
            }
        };

        let measured = match measure(&sock, target, &shared.config) {
            Ok(Some((best, uid))) => {
                update(shared, best.into(), &uid, generation);
                true
            }
            Ok(None) => {
                log::debug!("no clock probe replies from {target}");
                false
            }
            Err(e) => {
                log::debug!("clock probe to {target} failed: {e}");
                false
            }
        };

        let pause = if measured {
            shared.config.time_update_interval
        } else {
            RETRY_DELAY
        };

        let until = Instant::now() + pause;
        let mut state = shared.state.lock();

        while !shared.stop.load(Ordering::Relaxed)
            && state.generation == generation
            && Instant::now() < until
        {
            shared.changed.wait_until(&mut state, until);
        }
    }
}

/// Sends a burst of probes, returning the reply with the fastest round trip, and the uid
/// of the instance that sent it.
fn measure(
    sock: &ProbeSocket,
    target: SocketAddr,
    config: &Config,
) -> io::Result<Option<(ProbeReply, String)>> {
    let count = config.probe_count.clamp(1, MAX_PROBES);

    let mut ids = ArrayVec::<u64, MAX_PROBES>::new();
    let mut replies = ArrayVec::<(ProbeReply, String), MAX_PROBES>::new();

    let mut collect = |ids: &ArrayVec<u64, MAX_PROBES>, until: Instant| -> io::Result<()> {
        while replies.len() < ids.len() {
            let remaining = until.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                break;
            }

            match sock.recv_reply(remaining) {
                Ok(Some((id, reply, uid))) if ids.contains(&id) => replies.push((reply, uid)),
                Ok(_) => {}
                Err(e) if io_err_is_timeout(e.kind()) => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => break,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    };

    for _ in 0..count {
        ids.push(sock.send_probe(target)?);
        collect(&ids, Instant::now() + config.probe_interval)?;
    }

    collect(&ids, Instant::now() + config.probe_timeout)?;

    Ok(replies
        .into_iter()
        .min_by(|(a, _), (b, _)| a.rtt().total_cmp(&b.rtt())))
}

fn update(shared: &Shared, next: TimeCorrection, uid: &str, generation: u64) {
    let mut state = shared.state.lock();

    if state.generation != generation {
        return;
    }

    if state.epoch.as_deref().is_some_and(|e| e != uid) {
        log::info!("clock source restarted as instance {uid}, resetting the time correction");
        state.reset = true;
        state.estimate = None;
    }

    state.epoch = Some(uid.to_owned());

    let now = Instant::now();
    let halflife = shared.config.smoothing_halflife;

    state.estimate = Some(match (state.estimate, state.measured_at) {
        (Some(prev), Some(at)) if halflife > 0. => {
            let dt = now.duration_since(at).as_secs_f64();
            prev.smoothed(next, 1. - 0.5f64.powf(dt / halflife))
        }
        _ => next,
    });

    state.measured_at = Some(now);

    drop(state);
    shared.changed.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::udp::{DatagramHandler, Responder, bind_service_socket};
    use strata_proto::{SampleFormat, StreamInfo};

    #[test]
    fn smoothing_weights() {
        let a = TimeCorrection {
            offset: 0.,
            remote_time: 1.,
            uncertainty: 0.002,
        };
        let b = TimeCorrection {
            offset: 1.,
            remote_time: 2.,
            uncertainty: 0.004,
        };

        let half = a.smoothed(b, 0.5);
        assert_eq!(half.offset, 0.5);
        assert_eq!(half.remote_time, 2.);
        assert!((half.uncertainty - 0.003).abs() < 1e-12);

        assert_eq!(a.smoothed(b, 1.), b);
    }

    #[test]
    fn same_machine_offset_is_near_zero() {
        let config = Arc::new(Config {
            base_port: 0,
            port_range: 1,
            multicast_groups: vec![],
            ..Config::default()
        });

        let mut info = StreamInfo::new("c", "c", 1, 0., SampleFormat::Int8, "").unwrap();
        info.assign_identity("clock-test", 0.);

        let service = bind_service_socket(&config).unwrap();
        let port = service.local_addr().unwrap().port();
        let stop = Arc::new(AtomicBool::new(false));

        let responder = {
            let stop = stop.clone();
            let info = info.clone();
            std::thread::spawn(move || Responder::new(info, 0, port).serve(&service, &stop))
        };

        let clock = ClockSync::new(config);

        // no target yet
        assert_eq!(
            clock.time_correction(Some(Duration::from_millis(50))).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );

        clock.set_target(SocketAddr::from(([127, 0, 0, 1], port)), info.uid());

        let tc = clock.time_correction(Some(Duration::from_secs(5))).unwrap();
        assert!(tc.offset.abs() < 0.01, "{tc:?}");
        assert!(tc.uncertainty >= 0.);
        assert!(!clock.was_clock_reset());

        // same instance, reached again
        clock.set_target(SocketAddr::from(([127, 0, 0, 1], port)), info.uid());
        assert!(!clock.was_clock_reset());
        clock.mark_reset();
        assert!(clock.was_clock_reset());
        assert!(!clock.was_clock_reset());

        // a different instance, which never answers
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        clock.set_target(silent.local_addr().unwrap(), "another-instance");
        assert!(clock.was_clock_reset());
        assert!(!clock.was_clock_reset());
        assert_eq!(clock.latest(), None);

        drop(clock);
        stop.store(true, Ordering::Relaxed);
        responder.join().unwrap().unwrap();
    }
}
