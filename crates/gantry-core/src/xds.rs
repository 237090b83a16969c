//! Envoy xDS: per-role snapshots, the snapshot cache, and the gRPC servers
//! that serve them.

mod cache;
pub(crate) mod extensions;
pub(crate) mod node;
mod resources;
mod server;
mod snapshot;

pub use cache::{CacheEntry, RoleDump, SnapshotCache, TypeDump};
pub use node::ROLE_METADATA_KEY;
pub use resources::{ResourceType, ResourceVersion};
pub use server::XdsServer;
pub use snapshot::XdsSnapshot;

pub(crate) use snapshot::{router_filter, HCM_FILTER_NAME, ROUTER_FILTER_NAME};

#[cfg(test)]
pub(crate) use resources::from_any_vec;
