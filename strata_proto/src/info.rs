//! Stream descriptors.

use crate::format::{ChannelCount, NominalRate, SampleFormat};
use crate::meta::MetaNode;
use serde::{Deserialize, Serialize};

/// Core fields of a stream descriptor.
///
/// This is everything a resolver learns about a stream: small enough to fit in a single
/// advertisement datagram. The metadata tree is deliberately absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamCore {
    pub name: String,
    pub content_type: String,
    pub channel_count: ChannelCount,
    pub nominal_rate: NominalRate,
    pub format: SampleFormat,
    pub source_id: String,
    /// Assigned when the stream starts being advertised.
    pub uid: String,
    pub hostname: String,
    pub session_id: String,
    pub version: u32,
    /// Creation time, on the producer's local clock.
    pub created_at: f64,
}

/// Names of the core fields, as used in predicates and descriptor documents.
pub const CORE_FIELDS: [&str; 11] = [
    "name",
    "type",
    "channel_count",
    "nominal_srate",
    "channel_format",
    "source_id",
    "uid",
    "hostname",
    "session_id",
    "version",
    "created_at",
];

impl StreamCore {
    /// Returns the textual value of a core field, by its canonical name.
    pub fn field(&self, name: &str) -> Option<String> {
        Some(match name {
            "name" => self.name.clone(),
            "type" => self.content_type.clone(),
            "channel_count" => self.channel_count.get().to_string(),
            "nominal_srate" => self.nominal_rate.get().to_string(),
            "channel_format" => self.format.as_str().to_owned(),
            "source_id" => self.source_id.clone(),
            "uid" => self.uid.clone(),
            "hostname" => self.hostname.clone(),
            "session_id" => self.session_id.clone(),
            "version" => self.version.to_string(),
            "created_at" => self.created_at.to_string(),
            _ => return None,
        })
    }
}

/// Where an advertised stream can be reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: core::net::IpAddr,
    /// Port of the stream (TCP) server, serving data and full descriptors.
    pub data_port: u16,
    /// Port of the service (UDP) socket, answering queries and time probes.
    pub service_port: u16,
}

impl Endpoint {
    #[inline(always)]
    pub fn data_addr(&self) -> core::net::SocketAddr {
        core::net::SocketAddr::new(self.addr, self.data_port)
    }

    #[inline(always)]
    pub fn service_addr(&self) -> core::net::SocketAddr {
        core::net::SocketAddr::new(self.addr, self.service_port)
    }
}

/// A stream descriptor.
///
/// Producers build one with [`StreamInfo::new`] and fill in its metadata tree before
/// creating an outlet. Consumers receive independent copies from resolvers (core fields
/// only) or from a connected inlet (including the metadata tree).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    core: StreamCore,
    desc: MetaNode,
    endpoint: Option<Endpoint>,
}

impl StreamInfo {
    /// Creates a new descriptor.
    ///
    /// Fails if `channel_count` is zero, or if `nominal_rate` is negative or not finite.
    /// System-assigned fields are left empty until the stream is advertised.
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        channel_count: u32,
        nominal_rate: f64,
        format: SampleFormat,
        source_id: impl Into<String>,
    ) -> Result<Self, crate::Error> {
        Ok(Self {
            core: StreamCore {
                name: name.into(),
                content_type: content_type.into(),
                channel_count: ChannelCount::try_from(channel_count)?,
                nominal_rate: NominalRate::try_from(nominal_rate)?,
                format,
                source_id: source_id.into(),
                uid: String::new(),
                hostname: String::new(),
                session_id: String::new(),
                version: crate::PROTOCOL_VERSION,
                created_at: 0.,
            },
            desc: MetaNode::new("desc"),
            endpoint: None,
        })
    }

    /// Rebuilds a descriptor from core fields received over the network.
    #[inline(always)]
    pub fn from_core(core: StreamCore, endpoint: Option<Endpoint>) -> Self {
        Self {
            core,
            desc: MetaNode::new("desc"),
            endpoint,
        }
    }

    /// Assigns the system fields of a stream about to be advertised: a fresh unique id,
    /// the local host name, the session and the creation time.
    pub fn assign_identity(&mut self, session_id: &str, created_at: f64) {
        self.core.uid = uuid::Uuid::new_v4().to_string();
        self.core.hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_owned());
        self.core.session_id = session_id.to_owned();
        self.core.created_at = created_at;
    }

    #[inline(always)]
    pub fn core(&self) -> &StreamCore {
        &self.core
    }

    #[inline(always)]
    pub fn into_core(self) -> StreamCore {
        self.core
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    #[inline(always)]
    pub fn content_type(&self) -> &str {
        &self.core.content_type
    }

    #[inline(always)]
    pub fn channel_count(&self) -> u32 {
        self.core.channel_count.get()
    }

    #[inline(always)]
    pub fn nominal_rate(&self) -> f64 {
        self.core.nominal_rate.get()
    }

    #[inline(always)]
    pub fn format(&self) -> SampleFormat {
        self.core.format
    }

    #[inline(always)]
    pub fn source_id(&self) -> &str {
        &self.core.source_id
    }

    #[inline(always)]
    pub fn uid(&self) -> &str {
        &self.core.uid
    }

    #[inline(always)]
    pub fn hostname(&self) -> &str {
        &self.core.hostname
    }

    #[inline(always)]
    pub fn session_id(&self) -> &str {
        &self.core.session_id
    }

    #[inline(always)]
    pub fn version(&self) -> u32 {
        self.core.version
    }

    #[inline(always)]
    pub fn created_at(&self) -> f64 {
        self.core.created_at
    }

    /// The metadata tree, rooted at a node named `desc`.
    #[inline(always)]
    pub fn desc(&self) -> &MetaNode {
        &self.desc
    }

    #[inline(always)]
    pub fn desc_mut(&mut self) -> &mut MetaNode {
        &mut self.desc
    }

    /// Where the stream can be reached, if it was obtained from the network.
    #[inline(always)]
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    #[inline(always)]
    pub fn set_endpoint(&mut self, endpoint: Option<Endpoint>) {
        self.endpoint = endpoint;
    }

    /// Returns the textual value designated by a predicate path: a core field name, or a
    /// path into the metadata tree starting with `desc`.
    pub fn field(&self, path: &str) -> Option<String> {
        match path.split_once('/') {
            Some(("desc", rest)) => self.desc.lookup(rest).map(|n| n.value().to_owned()),
            None if path == "desc" => Some(self.desc.value().to_owned()),
            None => self.core.field(path),
            Some(_) => None,
        }
    }

    /// Counts the nodes designated by a predicate path.
    pub fn count(&self, path: &str) -> usize {
        match path.split_once('/') {
            Some(("desc", rest)) => self.desc.lookup_all(rest).len(),
            None if path == "desc" => 1,
            None => usize::from(self.core.field(path).is_some()),
            Some(_) => 0,
        }
    }

    /// Serializes the full descriptor (core fields and metadata tree) as an XML document.
    pub fn to_xml(&self) -> String {
        let mut root = MetaNode::new("info");

        for name in CORE_FIELDS {
            if let Some(value) = self.core.field(name) {
                root.append_child_value(name, value);
            }
        }

        root.append(self.desc.clone());

        root.to_xml()
    }

    /// Parses a full descriptor from its XML document.
    pub fn from_xml(text: &str) -> Result<Self, crate::Error> {
        let mut root = MetaNode::from_xml(text)?;

        if root.name() != "info" {
            return Err(crate::Error::Xml(format!(
                "expected an `info` root element, found `{}`",
                root.name()
            )));
        }

        let desc = root
            .remove_child("desc")
            .unwrap_or_else(|| MetaNode::new("desc"));

        let text_field = |name: &'static str| {
            root.child_value(name)
                .map(str::to_owned)
                .ok_or(crate::Error::MissingField(name))
        };

        fn parsed<T: core::str::FromStr>(name: &'static str, value: String) -> Result<T, crate::Error> {
            value
                .parse()
                .map_err(|_| crate::Error::InvalidField { field: name, value })
        }

        let channel_count: u32 = parsed("channel_count", text_field("channel_count")?)?;
        let nominal_rate: f64 = parsed("nominal_srate", text_field("nominal_srate")?)?;

        let core = StreamCore {
            name: text_field("name")?,
            content_type: text_field("type")?,
            channel_count: ChannelCount::try_from(channel_count)?,
            nominal_rate: NominalRate::try_from(nominal_rate)?,
            format: text_field("channel_format")?.parse()?,
            source_id: text_field("source_id")?,
            uid: text_field("uid")?,
            hostname: text_field("hostname")?,
            session_id: text_field("session_id")?,
            version: parsed("version", text_field("version")?)?,
            created_at: parsed("created_at", text_field("created_at")?)?,
        };

        Ok(Self {
            core,
            desc,
            endpoint: None,
        })
    }

    /// Returns a copy of this descriptor without its metadata tree.
    pub fn without_desc(&self) -> Self {
        Self::from_core(self.core.clone(), self.endpoint)
    }
}
