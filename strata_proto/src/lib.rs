//! Data model and message definitions for a low-latency protocol distributing
//! multi-channel measurement streams on a local network.
//!
//! ## Roles
//!
//! Each endpoint acts as either an **outlet** or an **inlet**:
//!
//! - **Outlets** produce a single stream. They advertise it and serve its data to any
//!   number of consumers.
//! - **Inlets** consume a single stream from one outlet, and estimate how the outlet's
//!   clock maps onto their own.
//!
//! ## Protocol model
//!
//! The protocol is defined in terms of typed messages. They fall into three categories:
//!
//! - **Discovery messages**: queries sent by resolvers and the advertisements outlets
//!   reply with.
//! - **Clock messages**: round-trip time probes used for clock alignment.
//! - **Stream messages**: requests and responses exchanged on a dedicated stream
//!   connection, carrying the full descriptor or the sample data itself.
//!
//! See the [`message`] module for the complete message definitions.
//!
//! ## Descriptors
//!
//! A stream is described by a [`StreamInfo`](info::StreamInfo). Its core fields (name,
//! content type, channel count, rate, format, identifiers) are small and travel with every
//! advertisement. Its metadata tree ([`MetaNode`](meta::MetaNode)) may be arbitrarily large,
//! and is only ever transferred on request, as a canonical XML document.
//!
//! ## Matching
//!
//! Queries select streams either exhaustively, by exact equality on one core field, or
//! with a small predicate language (see [`predicate`]). Outlets evaluate queries against
//! their _full_ descriptor, so predicates may look into the metadata tree even though
//! the advertisement sent back does not carry it.
//!
//! The types in this crate implement `serde`'s `Serialize` and `Deserialize` traits,
//! so they can be plugged into any `serde` backend.

pub mod format;
pub mod info;
pub mod message;
pub mod meta;
pub mod predicate;

pub use format::{ChannelCount, ChannelValue, NominalRate, SampleFormat, Values};
pub use info::{Endpoint, StreamCore, StreamInfo};
pub use meta::MetaNode;
pub use predicate::Expr;

/// Version of the protocol implemented by this crate, recorded in every descriptor.
pub const PROTOCOL_VERSION: u32 = 100;

/// Errors raised while building, parsing or validating protocol data.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("channel count must be at least 1")]
    ChannelCount,

    #[error("nominal rate must be finite and non-negative, got {0}")]
    NominalRate(f64),

    #[error("unknown sample format `{0}`")]
    UnknownFormat(String),

    #[error("unknown stream property `{0}`")]
    UnknownProperty(String),

    #[error("invalid predicate at byte {position}: {message}")]
    Predicate { position: usize, message: String },

    #[error("malformed metadata document: {0}")]
    Xml(String),

    #[error("missing descriptor field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for descriptor field `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}
