use std::ops::Deref;
use std::sync::Arc;

use smol_str::SmolStr;
use xds_api::pb::google::protobuf;
use xds_api::WellKnownTypes;

/// An opaque string used to version a list of xDS resources.
///
/// `ResourceVersion`s are immutable and cheap to `clone` and share.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceVersion(SmolStr);

impl Deref for ResourceVersion {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl serde::Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl AsRef<str> for ResourceVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! impl_resource_version_from {
    ($from_ty:ty) => {
        impl From<$from_ty> for ResourceVersion {
            fn from(s: $from_ty) -> ResourceVersion {
                ResourceVersion(s.into())
            }
        }
    };
}

impl_resource_version_from!(&str);
impl_resource_version_from!(String);
impl_resource_version_from!(&String);
impl_resource_version_from!(Arc<str>);

/// The xDS resource types served to proxies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, enum_map::Enum, Hash)]
pub enum ResourceType {
    Listener,
    RouteConfiguration,
    Cluster,
    ClusterLoadAssignment,
}

impl ResourceType {
    fn as_well_known(&self) -> WellKnownTypes {
        match self {
            ResourceType::Listener => WellKnownTypes::Listener,
            ResourceType::RouteConfiguration => WellKnownTypes::RouteConfiguration,
            ResourceType::Cluster => WellKnownTypes::Cluster,
            ResourceType::ClusterLoadAssignment => WellKnownTypes::ClusterLoadAssignment,
        }
    }

    fn from_well_known(wkt: WellKnownTypes) -> Option<Self> {
        match wkt {
            WellKnownTypes::Listener => Some(Self::Listener),
            WellKnownTypes::RouteConfiguration => Some(Self::RouteConfiguration),
            WellKnownTypes::Cluster => Some(Self::Cluster),
            WellKnownTypes::ClusterLoadAssignment => Some(Self::ClusterLoadAssignment),
            _ => None,
        }
    }

    /// Every resource type, in the order a proxy should receive updates:
    /// clusters and endpoints before the listeners and routes that refer to
    /// them.
    pub fn all() -> &'static [Self] {
        &[
            Self::Cluster,
            Self::ClusterLoadAssignment,
            Self::Listener,
            Self::RouteConfiguration,
        ]
    }

    pub fn type_url(&self) -> &'static str {
        self.as_well_known().type_url()
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::from_well_known(WellKnownTypes::from_type_url(type_url)?)
    }

    /// Returns `true` if a request that names no resources is a wildcard
    /// subscription for this type.
    ///
    /// LDS and CDS are wildcard by default. RDS and EDS are never wildcard.
    pub(crate) fn is_wildcard(&self) -> bool {
        matches!(self, ResourceType::Listener | ResourceType::Cluster)
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceType::Listener => "Listener",
            ResourceType::RouteConfiguration => "RouteConfiguration",
            ResourceType::Cluster => "Cluster",
            ResourceType::ClusterLoadAssignment => "ClusterLoadAssignment",
        };
        f.write_str(name)
    }
}

/// Decode a list of `Any` into a concrete message type.
#[cfg(test)]
pub(crate) fn from_any_vec<M: Default + prost::Name>(
    any: Vec<protobuf::Any>,
) -> Result<Vec<M>, prost::DecodeError> {
    let mut ms = Vec::with_capacity(any.len());
    for a in any {
        ms.push(a.to_msg()?);
    }

    Ok(ms)
}

/// Encode a list of messages as `Any`.
pub(crate) fn to_any_vec<'a, M, I>(messages: I) -> Result<Vec<protobuf::Any>, prost::EncodeError>
where
    M: prost::Name + 'a,
    I: IntoIterator<Item = &'a M>,
{
    messages.into_iter().map(protobuf::Any::from_msg).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_type_url_round_trip() {
        for rtype in ResourceType::all() {
            assert_eq!(ResourceType::from_type_url(rtype.type_url()), Some(*rtype));
        }

        assert_eq!(
            ResourceType::Listener.type_url(),
            "type.googleapis.com/envoy.config.listener.v3.Listener"
        );
        assert_eq!(
            ResourceType::from_type_url("type.googleapis.com/envoy.config.core.v3.Node"),
            None
        );
    }

    #[test]
    fn test_resource_version() {
        let v = ResourceVersion::from("abc123");
        assert_eq!(&*v, "abc123");
        assert_eq!(v.to_string(), "abc123");
        assert_eq!(serde_json::to_value(&v).unwrap(), serde_json::json!("abc123"));
    }
}
