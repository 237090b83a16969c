use crate::shared::{Metadata, ResourceRef};
use serde::{Deserialize, Serialize};

/// A resolved network address for zero or more Upstreams.
///
/// Endpoints are produced by endpoint discovery and only ever live in
/// memory. Labels are used for subset matching and end up as load balancer
/// metadata on the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    pub metadata: Metadata,

    /// The upstreams this endpoint belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<ResourceRef>,

    pub address: String,
    pub port: u32,
}

impl Endpoint {
    pub fn belongs_to(&self, upstream: &ResourceRef) -> bool {
        self.upstreams.contains(upstream)
    }
}
