#![allow(dead_code)]

use core::net::Ipv4Addr;
use core::time::Duration;
use std::sync::Arc;
use strata::{Config, Outlet, OutletConfig, SampleFormat, StreamInfo};

pub const LONG: Option<Duration> = Some(Duration::from_secs(10));

/// Settings isolated from every other test: a fresh session, its own port range, and
/// loopback-only discovery.
pub fn config() -> Arc<Config> {
    let id = uuid::Uuid::new_v4();
    let base_port = 20_000 + (id.as_u128() % 30_000) as u16;

    Arc::new(Config {
        known_peers: vec![Ipv4Addr::LOCALHOST.into()],
        multicast_groups: vec![],
        broadcast: false,
        base_port,
        port_range: 4,
        connection_timeout: Duration::from_secs(2),
        ..Config::default().with_session(id.to_string())
    })
}

pub fn info(name: &str, channels: u32, rate: f64, format: SampleFormat, source_id: &str) -> StreamInfo {
    StreamInfo::new(name, "Test", channels, rate, format, source_id).unwrap()
}

pub fn outlet(config: &Arc<Config>, info: StreamInfo, outlet_config: OutletConfig) -> Outlet {
    Outlet::new_with_config(info, outlet_config, config.clone()).unwrap()
}

/// Resolves the one stream called `name`.
pub fn resolve_one(config: &Config, name: &str) -> StreamInfo {
    let mut found =
        strata::resolve_by_property_with_config("name", name, 1, LONG, config).unwrap();
    assert_eq!(found.len(), 1, "{found:?}");
    found.remove(0)
}

/// Polls `cond` until it holds, or panics after `timeout`.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let start = std::time::Instant::now();

    while !cond() {
        assert!(start.elapsed() < timeout, "condition not met in {timeout:?}");
        std::thread::sleep(Duration::from_millis(20));
    }
}
