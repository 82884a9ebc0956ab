//! Network-wide settings.

use core::net::{IpAddr, Ipv4Addr};
use core::time::Duration;
use std::sync::{Arc, OnceLock};

/// Settings shared by every outlet, inlet and resolver of a process.
///
/// [`Config::default`] gives settings suitable for a single local network.
/// [`Config::from_env`] overrides them with `STRATA_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Outlets only answer queries from resolvers of the same session.
    pub session_id: String,
    /// Unicast addresses queried by resolvers, in addition to multicast groups.
    pub known_peers: Vec<IpAddr>,
    /// Multicast groups joined by outlets and queried by resolvers.
    pub multicast_groups: Vec<Ipv4Addr>,
    pub multicast_ttl: u32,
    /// Whether resolvers also query the local broadcast address.
    pub broadcast: bool,
    /// First port of the range outlets bind their service sockets in.
    pub base_port: u16,
    pub port_range: u16,
    /// Time between two consecutive query waves.
    pub wave_interval: Duration,
    /// How long a resolver collecting every visible stream waits for stragglers once it
    /// has received a first answer.
    pub resolve_settle: Duration,
    /// Number of round-trip probes per clock offset measurement.
    pub probe_count: usize,
    pub probe_interval: Duration,
    /// How long a clock offset measurement waits for probe replies.
    pub probe_timeout: Duration,
    /// Time between two clock offset measurements.
    pub time_update_interval: Duration,
    /// Half-life of the exponential smoothing of clock offsets, in seconds. Zero disables
    /// smoothing.
    pub smoothing_halflife: f64,
    /// Connections silent for longer than this are considered lost.
    pub connection_timeout: Duration,
    /// Time after which an idle feed sends a heartbeat.
    pub heartbeat_interval: Duration,
    /// Default number of samples per chunk when neither side asks for one.
    pub chunk_len: usize,
    /// Frames announcing a larger payload are rejected.
    pub max_frame_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_id: "default".to_owned(),
            known_peers: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            multicast_groups: vec![Ipv4Addr::new(239, 255, 172, 215)],
            multicast_ttl: 1,
            broadcast: true,
            base_port: 16572,
            port_range: 32,
            wave_interval: Duration::from_millis(250),
            resolve_settle: Duration::from_millis(300),
            probe_count: 8,
            probe_interval: Duration::from_millis(2),
            probe_timeout: Duration::from_millis(500),
            time_update_interval: Duration::from_secs(2),
            smoothing_halflife: 90.,
            connection_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(500),
            chunk_len: 512,
            max_frame_len: 64 << 20,
        }
    }
}

/// Reads and parses an environment variable, warning about unparseable values.
fn env_var<T: core::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;

    let parsed = raw.trim().parse().ok();

    if parsed.is_none() {
        log::warn!("ignoring invalid value {raw:?} for {name}");
    }

    parsed
}

fn env_list<T: core::str::FromStr>(name: &str) -> Option<Vec<T>> {
    let raw = std::env::var(name).ok()?;

    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| {
                let parsed = s.parse().ok();
                if parsed.is_none() {
                    log::warn!("ignoring invalid entry {s:?} in {name}");
                }
                parsed
            })
            .collect(),
    )
}

fn env_millis(name: &str) -> Option<Duration> {
    env_var(name).map(Duration::from_millis)
}

static GLOBAL: OnceLock<Arc<Config>> = OnceLock::new();

impl Config {
    /// Builds settings from the defaults, overridden by the following environment
    /// variables, when set:
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `STRATA_SESSION_ID` | `session_id` |
    /// | `STRATA_KNOWN_PEERS` | `known_peers` (comma separated) |
    /// | `STRATA_MULTICAST_GROUPS` | `multicast_groups` (comma separated) |
    /// | `STRATA_BROADCAST` | `broadcast` |
    /// | `STRATA_BASE_PORT` | `base_port` |
    /// | `STRATA_PORT_RANGE` | `port_range` |
    /// | `STRATA_CONNECTION_TIMEOUT_MS` | `connection_timeout` |
    /// | `STRATA_TIME_UPDATE_INTERVAL_MS` | `time_update_interval` |
    /// | `STRATA_SMOOTHING_HALFLIFE` | `smoothing_halflife` (seconds) |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_var("STRATA_SESSION_ID") {
            config.session_id = v;
        }
        if let Some(v) = env_list("STRATA_KNOWN_PEERS") {
            config.known_peers = v;
        }
        if let Some(v) = env_list("STRATA_MULTICAST_GROUPS") {
            config.multicast_groups = v;
        }
        if let Some(v) = env_var("STRATA_BROADCAST") {
            config.broadcast = v;
        }
        if let Some(v) = env_var("STRATA_BASE_PORT") {
            config.base_port = v;
        }
        if let Some(v) = env_var("STRATA_PORT_RANGE") {
            config.port_range = v;
        }
        if let Some(v) = env_millis("STRATA_CONNECTION_TIMEOUT_MS") {
            config.connection_timeout = v;
        }
        if let Some(v) = env_millis("STRATA_TIME_UPDATE_INTERVAL_MS") {
            config.time_update_interval = v;
        }
        if let Some(v) = env_var::<f64>("STRATA_SMOOTHING_HALFLIFE") {
            config.smoothing_halflife = v.max(0.);
        }

        config
    }

    /// The process-wide settings, read from the environment on first use.
    pub fn global() -> Arc<Config> {
        GLOBAL.get_or_init(|| Arc::new(Self::from_env())).clone()
    }

    /// Returns these settings, with another session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// The ports outlets bind their service sockets in.
    pub fn service_ports(&self) -> impl Iterator<Item = u16> + Clone + use<> {
        let end = self.base_port.saturating_add(self.port_range);
        self.base_port..end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_saturates() {
        let config = Config {
            base_port: u16::MAX - 2,
            port_range: 10,
            ..Default::default()
        };

        assert_eq!(config.service_ports().count(), 2);
        assert_eq!(Config::default().service_ports().count(), 32);
    }

    #[test]
    fn session_override() {
        let config = Config::default().with_session("lab-1");
        assert_eq!(config.session_id, "lab-1");
        assert_eq!(config.base_port, Config::default().base_port);
    }
}
