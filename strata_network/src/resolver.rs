//! Stream resolution.
//!
//! Resolvers periodically send query waves (see [`QuerySocket`]) and collect the
//! advertisements outlets answer with. Results are deduplicated by stream uid.

use crate::{Config, client::udp::QuerySocket, io_err_is_timeout};
use core::{cmp, time::Duration};
use parking_lot::RwLock;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};
use strata_proto::{
    StreamInfo,
    message::{Match, Query},
};
use strata_utils::Deadline;

/// Priority queue keyed by stream uid, with the stream's expiry instant as priority.
type ExpiryPQ = priority_queue::PriorityQueue<String, cmp::Reverse<Instant>, FxBuildHasher>;

/// When a one-shot resolution is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wanted {
    /// Once this many distinct streams answered.
    AtLeast(usize),
    /// Once at least one stream answered, and no new stream answered for a while (see
    /// [`Config::resolve_settle`]).
    Settled,
    /// Once no new stream answered for a while, counting from the first wave. The results
    /// may be empty.
    Window,
}

/// Resolves streams matching `matching`, blocking until the wanted results are found or
/// `timeout` elapses (forever if `None`).
///
/// Returns every distinct stream found, possibly none on timeout.
pub fn resolve(
    config: &Config,
    matching: Match,
    wanted: Wanted,
    timeout: Option<Duration>,
) -> io::Result<Vec<StreamInfo>> {
    let deadline = Deadline::after(timeout);
    let sock = QuerySocket::bind(config)?;

    let minimum = match wanted {
        Wanted::AtLeast(n) => n,
        Wanted::Settled => 1,
        Wanted::Window => 0,
    };

    let query = Query {
        session_id: config.session_id.clone(),
        matching,
        minimum: u32::try_from(minimum).unwrap_or(u32::MAX),
        deadline_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
    };

    let mut results = Vec::new();
    let mut seen = FxHashSet::default();
    let mut waves = FxHashSet::default();
    let mut next_wave = Instant::now();
    let mut last_new = Instant::now();

    loop {
        let now = Instant::now();

        if now >= next_wave {
            waves.insert(sock.send_wave(&query));
            next_wave = now + config.wave_interval;
        }

        let done = match wanted {
            Wanted::AtLeast(n) => results.len() >= n,
            Wanted::Settled => !results.is_empty() && last_new.elapsed() >= config.resolve_settle,
            Wanted::Window => last_new.elapsed() >= config.resolve_settle,
        };

        if done || deadline.expired() {
            break;
        }

        let mut wait = next_wave.saturating_duration_since(now);
        wait = deadline.remaining_or(wait);
        if wanted == Wanted::Window || (wanted == Wanted::Settled && !results.is_empty()) {
            wait = wait.min(config.resolve_settle.saturating_sub(last_new.elapsed()));
        }

        match sock.recv_advertisement(|id| waves.contains(&id), wait) {
            Ok(Some(info)) => {
                if seen.insert(info.uid().to_owned()) {
                    log::debug!("resolved {} ({})", info.name(), info.uid());
                    results.push(info);
                    last_new = Instant::now();
                }
            }
            Ok(None) => {}
            Err(e) if io_err_is_timeout(e.kind()) => {}
            // e.g. ICMP errors from unreachable destinations of earlier waves
            Err(e) => log::debug!("resolver receive failed: {e}"),
        }
    }

    Ok(results)
}

#[derive(Debug, Default)]
struct Shared {
    table: RwLock<FxHashMap<String, StreamInfo>>,
    stop: AtomicBool,
}

/// Keeps an up-to-date list of the streams matching a query, in the background.
///
/// Streams are listed for as long as they keep answering, and forgotten once they stay
/// silent for `forget_after`.
#[derive(Debug)]
pub struct ContinuousResolver {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ContinuousResolver {
    /// Starts resolving in the background.
    pub fn start(config: Arc<Config>, matching: Match, forget_after: Duration) -> io::Result<Self> {
        let sock = QuerySocket::bind(&config)?;
        let shared = Arc::new(Shared::default());

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("strata-resolver".into())
                .spawn(move || {
                    resolve_continuously(&sock, &config, matching, forget_after, &shared)
                })?
        };

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// A snapshot of the streams currently listed.
    pub fn results(&self) -> Vec<StreamInfo> {
        self.shared.table.read().values().cloned().collect()
    }
}

impl Drop for ContinuousResolver {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn resolve_continuously(
    sock: &QuerySocket,
    config: &Config,
    matching: Match,
    forget_after: Duration,
    shared: &Shared,
) {
    let query = Query {
        session_id: config.session_id.clone(),
        matching,
        minimum: 0,
        deadline_ms: None,
    };

    // a stream must get a chance to answer at least twice before being forgotten
    let interval = config.wave_interval.min(forget_after / 2).max(Duration::from_millis(10));

    // answers to waves older than the forget horizon are stale
    let mut waves = FxHashMap::<u64, Instant>::default();
    let mut expiries = ExpiryPQ::with_hasher(FxBuildHasher);
    let mut next_wave = Instant::now();

    while !shared.stop.load(Ordering::Relaxed) {
        let now = Instant::now();

        if now >= next_wave {
            waves.retain(|_, sent| now.duration_since(*sent) < forget_after);
            waves.insert(sock.send_wave(&query), now);
            next_wave = now + interval;
        }

        let wait = next_wave
            .saturating_duration_since(now)
            .min(crate::POLL_INTERVAL);

        match sock.recv_advertisement(|id| waves.contains_key(&id), wait) {
            Ok(Some(info)) => {
                let uid = info.uid().to_owned();

                expiries.push(uid.clone(), cmp::Reverse(Instant::now() + forget_after));

                if shared.table.write().insert(uid, info).is_none() {
                    log::debug!("continuous resolver found a new stream");
                }
            }
            Ok(None) => {}
            Err(e) if io_err_is_timeout(e.kind()) => {}
            Err(e) => log::debug!("resolver receive failed: {e}"),
        }

        let now = Instant::now();

        while expiries
            .peek()
            .is_some_and(|(_, cmp::Reverse(at))| *at <= now)
        {
            if let Some((uid, _)) = expiries.pop() {
                shared.table.write().remove(&uid);
                log::debug!("continuous resolver forgot stream {uid}");
            }
        }
    }
}
