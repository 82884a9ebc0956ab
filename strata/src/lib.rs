//! Real-time distribution of multi-channel measurement streams on a local network.
//!
//! Producers publish a stream through an [`Outlet`], which advertises it on the network.
//! Consumers find streams with the [`resolver`] functions, then receive their samples
//! through an [`Inlet`], which also estimates how the producer's clock maps onto the
//! consumer's.
//!
//! ```no_run
//! use strata::{Inlet, InletConfig, Outlet, OutletConfig, SampleFormat, StreamInfo, FOREVER};
//!
//! # fn main() -> strata::Result<()> {
//! let info = StreamInfo::new("Accel", "Motion", 3, 100., SampleFormat::Float32, "imu-7")?;
//! let outlet = Outlet::new(info, OutletConfig::default())?;
//!
//! let found = strata::resolve_by_property("name", "Accel", 1, FOREVER)?;
//! let inlet = Inlet::new(&found[0], InletConfig::default())?;
//!
//! outlet.push_sample(&[0.1f32, 0.2, 9.8], None, true)?;
//!
//! if let Some(sample) = inlet.pull_sample::<f32>(FOREVER)? {
//!     println!("{:?} at {}", sample.values, sample.timestamp);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Timeouts
//!
//! Blocking operations take an `Option<Duration>` timeout. `None` ([`FOREVER`]) waits
//! indefinitely, and [`IMMEDIATE`] doesn't wait at all.
//!
//! ## Configuration
//!
//! Network-wide settings (session id, discovery ports and peers, clock synchronization
//! and watchdog timings) come from [`Config::global`], itself read from `STRATA_*`
//! environment variables. Every constructor has a `*_with_config` variant taking explicit
//! settings instead.

use core::time::Duration;

mod error;
pub mod inlet;
pub mod outlet;
pub mod resolver;

pub use error::{Error, Result};
pub use inlet::{Inlet, InletConfig, InletState, Postprocessing, Sample};
pub use outlet::{Outlet, OutletConfig};
pub use resolver::{
    ContinuousResolver, resolve_all, resolve_all_with_config, resolve_by_predicate,
    resolve_by_predicate_with_config, resolve_by_property, resolve_by_property_with_config,
    resolve_first, resolve_first_with_config,
};

pub use strata_network::Config;
pub use strata_network::clock::TimeCorrection;
pub use strata_proto::{ChannelValue, Expr, MetaNode, SampleFormat, StreamInfo, Values};
pub use strata_utils::{local_clock, queue::BufferLimit};

/// Wait indefinitely.
pub const FOREVER: Option<Duration> = None;

/// Don't wait.
pub const IMMEDIATE: Option<Duration> = Some(Duration::ZERO);

/// Version of the protocol implemented by this library.
pub const PROTOCOL_VERSION: u32 = strata_proto::PROTOCOL_VERSION;
