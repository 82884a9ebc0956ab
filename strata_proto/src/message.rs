//! All protocol message types exchanged between endpoints.
//!
//! Discovery and clock messages travel as single [`Datagram`]s on UDP. Stream messages
//! ([`Request`], [`Response`]) travel as frames on a dedicated stream connection.

use crate::{
    format::Values,
    info::{StreamCore, StreamInfo},
    predicate::Expr,
};
use serde::{Deserialize, Serialize};

// As with any enum going over the wire, these are kept flat: nested enums have their
// discriminants encoded individually, which adds up for chunk-carrying messages.

/// How a query selects streams.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Match {
    /// Every stream of the session.
    All,
    /// Exact equality on one core field.
    Property { name: String, value: String },
    /// A predicate expression, evaluated against the full descriptor.
    Predicate(Expr),
}

impl Match {
    pub fn matches(&self, info: &StreamInfo) -> bool {
        match self {
            Self::All => true,
            Self::Property { name, value } => info.core().field(name).is_some_and(|v| v == *value),
            Self::Predicate(expr) => expr.eval(info),
        }
    }
}

/// A discovery query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Only outlets of the same session answer.
    pub session_id: String,
    pub matching: Match,
    /// The number of results the querying side is waiting for.
    pub minimum: u32,
    /// How long the querying side waits for answers, in milliseconds. `None` if it waits
    /// indefinitely.
    pub deadline_ms: Option<u64>,
}

impl Query {
    #[inline(always)]
    pub fn matches(&self, info: &StreamInfo) -> bool {
        self.session_id == info.session_id() && self.matching.matches(info)
    }
}

/// An outlet's answer to a matching query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    pub core: StreamCore,
    pub data_port: u16,
    pub service_port: u16,
}

/// Messages exchanged as single UDP datagrams.
///
/// Each request carries an `id`, echoed back in the response, so that responses can be
/// matched with the request that caused them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Datagram {
    /// Sent by resolvers.
    Query { id: u64, query: Query },
    /// Sent by outlets in response to a matching [`Datagram::Query`].
    Advertisement { id: u64, ad: Advertisement },
    /// Sent by inlets. `t0` is the send time, on the inlet's clock.
    TimeProbe { id: u64, t0: f64 },
    /// Sent by outlets in response to a [`Datagram::TimeProbe`].
    ///
    /// `t_recv` and `t_send` are the times, on the outlet's clock, at which the probe was
    /// received and the reply sent. `uid` identifies the outlet instance whose clock was
    /// read.
    TimeReply {
        id: u64,
        t0: f64,
        t_recv: f64,
        t_send: f64,
        uid: String,
    },
}

/// Messages sent by inlets on a stream connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Requests the full descriptor, metadata tree included.
    FullInfo,
    /// Requests the sample feed. The connection is dedicated to it from then on.
    Feed {
        /// Bounds of the outlet-side buffer for this consumer, in samples.
        max_samples: Option<usize>,
        /// Bounds of the outlet-side buffer for this consumer, in seconds of data.
        max_duration: Option<f64>,
        /// Maximum number of samples per chunk. `None` lets the outlet decide.
        max_chunk_len: Option<usize>,
    },
}

/// Messages sent by outlets on a stream connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The full descriptor, as an XML document.
    FullInfo(String),
    /// Acknowledges a feed request. `uid` identifies the outlet instance.
    FeedAccepted { uid: String },
    Chunk(WireChunk),
    /// Sent on idle feeds so that consumers can tell a quiet stream from a dead one.
    Heartbeat,
}

/// Samples, as carried over the wire.
///
/// Values are stored sample-major: `values.len() == timestamps.len() * channel_count`.
/// A `None` timestamp is exactly the previous timestamp plus the nominal sampling period.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireChunk {
    pub timestamps: Vec<Option<f64>>,
    pub values: Values,
    /// Samples dropped by the outlet for this consumer since the previous chunk.
    pub dropped: u64,
}

impl WireChunk {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Compresses explicit timestamps, omitting those that can be deduced from the
    /// previous one, given a sampling period. `prev` is the last timestamp sent on this
    /// feed, and is updated.
    pub fn compress(timestamps: &[f64], period: Option<f64>, prev: &mut Option<f64>) -> Vec<Option<f64>> {
        timestamps
            .iter()
            .map(|&t| {
                let deducible = matches!((period, *prev), (Some(p), Some(last)) if last + p == t);
                *prev = Some(t);
                (!deducible).then_some(t)
            })
            .collect()
    }

    /// Restores the explicit timestamps of this chunk. `prev` is the last timestamp
    /// received on this feed, and is updated.
    ///
    /// Returns `None` if a timestamp is missing without any way to deduce it.
    pub fn expand(&self, period: Option<f64>, prev: &mut Option<f64>) -> Option<Vec<f64>> {
        self.timestamps
            .iter()
            .map(|t| {
                let t = match (*t, period, *prev) {
                    (Some(t), ..) => t,
                    (None, Some(p), Some(last)) => last + p,
                    _ => return None,
                };
                *prev = Some(t);
                Some(t)
            })
            .collect()
    }
}
