use crate::http::WeightedDestination;
use crate::shared::{impl_resource, Metadata, ResourceKind, ResourceRef};
use serde::{Deserialize, Serialize};

/// A named, weighted set of destinations that routes can share.
///
/// Every Upstream an UpstreamGroup references must exist when the group is
/// translated, or the group is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamGroup {
    pub metadata: Metadata,
    pub destinations: Vec<WeightedDestination>,
}

impl_resource!(UpstreamGroup, ResourceKind::UpstreamGroup);

impl UpstreamGroup {
    pub fn upstream_refs(&self) -> impl Iterator<Item = &ResourceRef> {
        self.destinations.iter().map(|d| &d.destination.upstream)
    }
}
