//! Shared configuration.

use core::fmt;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{self, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration as StdDuration;

/// The kind of a stored configuration object.
///
/// The numeric value of each kind is the type flag used in storage keys
/// (`<namespace>/<type-flag>/<name>`), and is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceKind {
    Upstream = 0,
    VirtualService = 1,
    Report = 2,
    File = 3,
    UpstreamGroup = 4,
    Secret = 5,
}

impl ResourceKind {
    pub fn all() -> &'static [Self] {
        &[
            Self::Upstream,
            Self::VirtualService,
            Self::Report,
            Self::File,
            Self::UpstreamGroup,
            Self::Secret,
        ]
    }

    pub fn type_flag(&self) -> u8 {
        *self as u8
    }

    pub fn from_type_flag(flag: u8) -> Option<Self> {
        Self::all().iter().find(|k| k.type_flag() == flag).copied()
    }

    /// A short, plural, lowercase name for this kind. Used as a directory name
    /// by file-backed storage.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Upstream => "upstreams",
            ResourceKind::VirtualService => "virtualservices",
            ResourceKind::Report => "reports",
            ResourceKind::File => "artifacts",
            ResourceKind::UpstreamGroup => "upstreamgroups",
            ResourceKind::Secret => "secrets",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Upstream => "Upstream",
            ResourceKind::VirtualService => "VirtualService",
            ResourceKind::Report => "Report",
            ResourceKind::File => "Artifact",
            ResourceKind::UpstreamGroup => "UpstreamGroup",
            ResourceKind::Secret => "Secret",
        };
        f.write_str(name)
    }
}

/// A reference to a named object in a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceRef {
    pub name: String,

    #[serde(default)]
    pub namespace: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Object metadata common to every stored configuration object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    /// An opaque version assigned by storage on every write. Updates must
    /// carry the version they were read at.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

// the resource version changes on every write, even when nothing else does.
// leave it out of the hash so that rewriting an object with the same content
// hashes the same.
impl std::hash::Hash for Metadata {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.namespace.hash(state);
        self.labels.hash(state);
        self.annotations.hash(state);
    }
}

impl Metadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(&self.namespace, &self.name)
    }
}

/// A configuration object that can be stored, watched and reported on.
pub trait Resource:
    Clone
    + fmt::Debug
    + PartialEq
    + std::hash::Hash
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: ResourceKind;

    fn metadata(&self) -> &Metadata;

    fn metadata_mut(&mut self) -> &mut Metadata;

    fn resource_ref(&self) -> ResourceRef {
        self.metadata().resource_ref()
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl $crate::shared::Resource for $ty {
            const KIND: $crate::shared::ResourceKind = $kind;

            fn metadata(&self) -> &$crate::shared::Metadata {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut $crate::shared::Metadata {
                &mut self.metadata
            }
        }
    };
}

pub(crate) use impl_resource;

/// A regular expression.
///
/// `Regex` has same syntax and semantics as Rust's [`regex` crate](https://docs.rs/regex/latest/regex/).
#[derive(Clone)]
pub struct Regex(regex::Regex);

impl std::fmt::Debug for Regex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str(self.0.as_str())
    }
}

impl std::ops::Deref for Regex {
    type Target = regex::Regex;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Regex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match regex::Regex::try_from(s) {
            Ok(e) => Ok(Self(e)),
            Err(e) => Err(e.to_string()),
        }
    }
}

impl serde::Serialize for Regex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.0.as_str())
    }
}

struct RegexVisitor;

impl<'de> Visitor<'de> for RegexVisitor {
    type Value = Regex;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a Regex")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match Regex::from_str(value) {
            Ok(s) => Ok(s),
            Err(e) => Err(E::custom(format!("could not parse {}: {}", value, e))),
        }
    }
}

impl<'de> Deserialize<'de> for Regex {
    fn deserialize<D>(deserializer: D) -> Result<Regex, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_string(RegexVisitor)
    }
}

impl PartialEq for Regex {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Eq for Regex {}

impl std::hash::Hash for Regex {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.as_str().hash(state)
    }
}

/// A wrapper around [std::time::Duration] that serializes to and from a f64
/// number of seconds.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Duration(StdDuration);

impl Duration {
    pub const fn new(secs: u64, nanos: u32) -> Duration {
        Duration(StdDuration::new(secs, nanos))
    }

    pub const fn from_secs(secs: u64) -> Duration {
        Duration(StdDuration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Duration {
        Duration(StdDuration::from_millis(millis))
    }

    pub fn from_secs_f64(secs: f64) -> Duration {
        Duration(StdDuration::from_secs_f64(secs))
    }
}

impl std::ops::Deref for Duration {
    type Target = StdDuration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs_f64())
    }
}

impl From<Duration> for StdDuration {
    fn from(val: Duration) -> Self {
        val.0
    }
}

impl From<StdDuration> for Duration {
    fn from(duration: StdDuration) -> Self {
        Duration(duration)
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(self.as_secs_f64())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        // deserialize as a number of seconds, may be any int or float
        //
        // https://serde.rs/string-or-struct.html
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a Duration expressed as a number of seconds")
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if v.is_sign_negative() || !v.is_finite() {
                    return Err(E::custom("Duration must be a positive number of seconds"));
                }
                Ok(Duration::from(StdDuration::from_secs_f64(v)))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Duration::from(StdDuration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let v: u64 = v
                    .try_into()
                    .map_err(|_| E::custom("Duration cannot be negative"))?;

                Ok(Duration::from(StdDuration::from_secs(v)))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
