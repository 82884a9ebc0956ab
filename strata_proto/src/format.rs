//! Sample format definitions.

use core::{fmt, num, str};
use serde::{Deserialize, Serialize};

/// Supported sample formats.
///
/// The format of a stream is fixed when its descriptor is created, and every sample of the
/// stream carries values of exactly that format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum SampleFormat {
    Float32,
    Float64,
    String,
    Int32,
    Int16,
    Int8,
    Int64,
    /// Placeholder for descriptors whose format is not known yet.
    ///
    /// Never valid for data transport.
    Undefined,
}

impl SampleFormat {
    /// Every format that can be transported, in declaration order.
    pub const TRANSPORTABLE: [SampleFormat; 7] = [
        Self::Float32,
        Self::Float64,
        Self::String,
        Self::Int32,
        Self::Int16,
        Self::Int8,
        Self::Int64,
    ];

    /// Returns whether samples of this format can be sent over the network.
    #[inline(always)]
    pub const fn is_transportable(self) -> bool {
        !matches!(self, Self::Undefined)
    }

    /// The canonical name of this format, as used in descriptor documents and predicates.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "double64",
            Self::String => "string",
            Self::Int32 => "int32",
            Self::Int16 => "int16",
            Self::Int8 => "int8",
            Self::Int64 => "int64",
            Self::Undefined => "undefined",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl str::FromStr for SampleFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "float32" => Self::Float32,
            "double64" | "float64" => Self::Float64,
            "string" => Self::String,
            "int32" => Self::Int32,
            "int16" => Self::Int16,
            "int8" => Self::Int8,
            "int64" => Self::Int64,
            "undefined" => Self::Undefined,
            other => return Err(crate::Error::UnknownFormat(other.to_owned())),
        })
    }
}

/// A validated nominal sampling rate, in Hz.
///
/// The inner value is guaranteed to be finite and non-negative. A rate of zero denotes an
/// irregular stream, whose samples each carry their own timestamp.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct NominalRate(f64);

impl NominalRate {
    /// The rate of irregular (asynchronous) streams.
    pub const IRREGULAR: Self = Self(0.);

    /// Creates a new rate if the value is finite and non-negative.
    #[inline(always)]
    pub const fn new(val: f64) -> Option<Self> {
        if val.is_finite() && val >= 0. {
            Some(Self(val))
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn get(self) -> f64 {
        self.0
    }

    #[inline(always)]
    pub const fn is_irregular(self) -> bool {
        self.0 == 0.
    }

    /// Returns the nominal time between two consecutive samples, in seconds.
    ///
    /// Irregular streams have no such period.
    #[inline(always)]
    pub fn period(self) -> Option<f64> {
        (!self.is_irregular()).then(|| self.0.recip())
    }
}

impl TryFrom<f64> for NominalRate {
    type Error = crate::Error;

    #[inline(always)]
    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(crate::Error::NominalRate(value))
    }
}

impl From<NominalRate> for f64 {
    #[inline(always)]
    fn from(value: NominalRate) -> Self {
        value.0
    }
}

/// Number of channels of a stream. Always at least one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ChannelCount(pub num::NonZeroU32);

impl ChannelCount {
    #[inline(always)]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// The channel count as a `usize`, convenient for slicing.
    #[inline(always)]
    pub fn as_usize(self) -> usize {
        // u32 always fits on the targets we support
        self.0.get() as usize
    }
}

impl TryFrom<u32> for ChannelCount {
    type Error = crate::Error;

    #[inline(always)]
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        num::NonZeroU32::new(value)
            .map(Self)
            .ok_or(crate::Error::ChannelCount)
    }
}

/// A flat run of channel values, all of one format.
///
/// Depending on context, this holds the values of a single sample (one per channel), or
/// the interleaved values of several consecutive samples.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum Values {
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
    Int32(Vec<i32>),
    Int16(Vec<i16>),
    Int8(Vec<i8>),
    Int64(Vec<i64>),
}

/// Applies the same expression to the inner vector of any [`Values`] variant.
macro_rules! dispatch {
    ($values:expr, $inner:ident => $body:expr) => {
        match $values {
            Values::Float32($inner) => $body,
            Values::Float64($inner) => $body,
            Values::String($inner) => $body,
            Values::Int32($inner) => $body,
            Values::Int16($inner) => $body,
            Values::Int8($inner) => $body,
            Values::Int64($inner) => $body,
        }
    };
}

/// Like [`dispatch`], but also binds `$wrap` to the tuple constructor of the matched variant.
macro_rules! dispatch_wrap {
    ($values:expr, $inner:ident, $wrap:ident => $body:expr) => {
        match $values {
            Values::Float32($inner) => {
                let $wrap = Values::Float32;
                $body
            }
            Values::Float64($inner) => {
                let $wrap = Values::Float64;
                $body
            }
            Values::String($inner) => {
                let $wrap = Values::String;
                $body
            }
            Values::Int32($inner) => {
                let $wrap = Values::Int32;
                $body
            }
            Values::Int16($inner) => {
                let $wrap = Values::Int16;
                $body
            }
            Values::Int8($inner) => {
                let $wrap = Values::Int8;
                $body
            }
            Values::Int64($inner) => {
                let $wrap = Values::Int64;
                $body
            }
        }
    };
}

impl Values {
    /// Creates an empty run of the given format, with room for `capacity` values.
    ///
    /// Returns `None` for [`SampleFormat::Undefined`].
    pub fn with_capacity(format: SampleFormat, capacity: usize) -> Option<Self> {
        Some(match format {
            SampleFormat::Float32 => Self::Float32(Vec::with_capacity(capacity)),
            SampleFormat::Float64 => Self::Float64(Vec::with_capacity(capacity)),
            SampleFormat::String => Self::String(Vec::with_capacity(capacity)),
            SampleFormat::Int32 => Self::Int32(Vec::with_capacity(capacity)),
            SampleFormat::Int16 => Self::Int16(Vec::with_capacity(capacity)),
            SampleFormat::Int8 => Self::Int8(Vec::with_capacity(capacity)),
            SampleFormat::Int64 => Self::Int64(Vec::with_capacity(capacity)),
            SampleFormat::Undefined => return None,
        })
    }

    /// Returns the format of the values held.
    pub const fn format(&self) -> SampleFormat {
        match self {
            Self::Float32(_) => SampleFormat::Float32,
            Self::Float64(_) => SampleFormat::Float64,
            Self::String(_) => SampleFormat::String,
            Self::Int32(_) => SampleFormat::Int32,
            Self::Int16(_) => SampleFormat::Int16,
            Self::Int8(_) => SampleFormat::Int8,
            Self::Int64(_) => SampleFormat::Int64,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends all values of `other` to `self`.
    ///
    /// Returns `false`, leaving `self` untouched, if the formats differ.
    pub fn extend_from(&mut self, other: &Values) -> bool {
        match (self, other) {
            (Self::Float32(a), Self::Float32(b)) => a.extend_from_slice(b),
            (Self::Float64(a), Self::Float64(b)) => a.extend_from_slice(b),
            (Self::String(a), Self::String(b)) => a.extend_from_slice(b),
            (Self::Int32(a), Self::Int32(b)) => a.extend_from_slice(b),
            (Self::Int16(a), Self::Int16(b)) => a.extend_from_slice(b),
            (Self::Int8(a), Self::Int8(b)) => a.extend_from_slice(b),
            (Self::Int64(a), Self::Int64(b)) => a.extend_from_slice(b),
            _ => return false,
        }

        true
    }

    /// Splits interleaved values into consecutive runs of `width` values each.
    ///
    /// A trailing run shorter than `width` is discarded.
    pub fn split(self, width: num::NonZeroUsize) -> Vec<Values> {
        dispatch_wrap!(self, v, wrap => split_vec(v, width.get()).into_iter().map(wrap).collect())
    }
}

fn split_vec<T>(values: Vec<T>, width: usize) -> Vec<Vec<T>> {
    let n = values.len() / width;
    let mut iter = values.into_iter();

    (0..n)
        .map(|_| iter.by_ref().take(width).collect())
        .collect()
}

/// A type that can be used as the value of a single channel.
///
/// Each implementor maps onto exactly one [`SampleFormat`], which is how typed push and
/// pull operations check that they agree with the stream they operate on.
pub trait ChannelValue: Clone + Send + Sized + 'static {
    /// The sample format matching this type.
    const FORMAT: SampleFormat;

    /// Wraps a run of values.
    fn into_values(values: Vec<Self>) -> Values;

    /// Unwraps a run of values, giving them back if the format doesn't match.
    fn from_values(values: Values) -> Result<Vec<Self>, Values>;
}

macro_rules! impl_channel_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl ChannelValue for $ty {
                const FORMAT: SampleFormat = SampleFormat::$variant;

                #[inline(always)]
                fn into_values(values: Vec<Self>) -> Values {
                    Values::$variant(values)
                }

                #[inline(always)]
                fn from_values(values: Values) -> Result<Vec<Self>, Values> {
                    match values {
                        Values::$variant(v) => Ok(v),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

impl_channel_value! {
    f32 => Float32,
    f64 => Float64,
    String => String,
    i32 => Int32,
    i16 => Int16,
    i8 => Int8,
    i64 => Int64,
}
