// A per-role snapshot cache.
//
// The cache is single-writer and multi-reader. The event loop is the only
// writer and installs a complete XdsSnapshot for a role at a time. Every
// connected stream holds a reader for exactly one role and gets woken up when
// that role's snapshot is replaced.
//
// Snapshots are immutable and installed by swapping an Arc, so readers always
// see either the old snapshot or the new one and never a mix of the two.
// Roles are never removed from the cache. A role with no VirtualServices gets
// an empty snapshot installed instead, so that proxies serving it drop their
// old listeners.

use std::sync::Arc;

use crossbeam_skiplist::{map::Entry, SkipMap};
use serde::Serialize;
use tokio::sync::watch;

use crate::xds::{ResourceType, ResourceVersion, XdsSnapshot};

/// The current state of a role in the cache.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    /// The number of times a snapshot has been installed for this role.
    pub generation: u64,

    /// The most recently installed snapshot, if any.
    pub snapshot: Option<Arc<XdsSnapshot>>,
}

#[derive(Debug, Default)]
struct Inner {
    roles: SkipMap<String, watch::Sender<CacheEntry>>,
}

/// A shared, per-role store of xDS snapshots.
///
/// `SnapshotCache` is cheap to clone. Clones share the same underlying cache.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCache {
    inner: Arc<Inner>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically install a snapshot for a role, waking every stream
    /// currently serving that role.
    pub fn set_snapshot(&self, role: &str, snapshot: XdsSnapshot) {
        let snapshot = Arc::new(snapshot);
        let entry = self.sender(role);
        entry.value().send_modify(|entry| {
            entry.generation += 1;
            entry.snapshot = Some(snapshot);
        });
    }

    /// Get the current state of a role.
    pub fn get(&self, role: &str) -> CacheEntry {
        match self.inner.roles.get(role) {
            Some(entry) => entry.value().borrow().clone(),
            None => CacheEntry::default(),
        }
    }

    /// Subscribe to changes to a role. The role doesn't need to have a
    /// snapshot yet.
    pub fn subscribe(&self, role: &str) -> watch::Receiver<CacheEntry> {
        self.sender(role).value().subscribe()
    }

    /// Every role that has ever been subscribed to or had a snapshot
    /// installed, sorted by name.
    pub fn roles(&self) -> Vec<String> {
        self.inner.roles.iter().map(|e| e.key().clone()).collect()
    }

    /// A summary of the cache contents: versions and resource names per role.
    pub fn dump(&self) -> Vec<RoleDump> {
        self.inner
            .roles
            .iter()
            .map(|e| {
                let entry = e.value().borrow().clone();
                RoleDump::new(e.key(), &entry)
            })
            .collect()
    }

    fn sender(&self, role: &str) -> Entry<'_, String, watch::Sender<CacheEntry>> {
        self.inner
            .roles
            .get_or_insert_with(role.to_string(), || watch::Sender::new(CacheEntry::default()))
    }
}

#[derive(Debug, Serialize)]
pub struct RoleDump {
    pub role: String,
    pub generation: u64,
    pub resources: Vec<TypeDump>,
}

#[derive(Debug, Serialize)]
pub struct TypeDump {
    pub type_url: &'static str,
    pub version: ResourceVersion,
    pub names: Vec<String>,
}

impl RoleDump {
    fn new(role: &str, entry: &CacheEntry) -> Self {
        let resources = match &entry.snapshot {
            Some(snapshot) => ResourceType::all()
                .iter()
                .map(|rtype| TypeDump {
                    type_url: rtype.type_url(),
                    version: snapshot.version(*rtype).clone(),
                    names: snapshot
                        .resource_names(*rtype)
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                })
                .collect(),
            None => Vec::new(),
        };

        Self {
            role: role.to_string(),
            generation: entry.generation,
            resources,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use xds_api::pb::envoy::config::cluster::v3::Cluster;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn assert_cache_send_sync() {
        assert_send::<SnapshotCache>();
        assert_sync::<SnapshotCache>();
    }

    fn snapshot_with_cluster(name: &str) -> XdsSnapshot {
        XdsSnapshot::new(
            vec![],
            vec![],
            vec![Cluster {
                name: name.to_string(),
                ..Default::default()
            }],
            vec![],
        )
    }

    #[test]
    fn test_set_and_get() {
        let cache = SnapshotCache::new();
        assert_eq!(cache.get("ingress").generation, 0);
        assert!(cache.get("ingress").snapshot.is_none());

        cache.set_snapshot("ingress", snapshot_with_cluster("a"));
        let entry = cache.get("ingress");
        assert_eq!(entry.generation, 1);
        assert_eq!(
            entry.snapshot.unwrap().resource_names(ResourceType::Cluster),
            vec!["a"]
        );

        // roles are isolated
        assert!(cache.get("edge").snapshot.is_none());
        assert_eq!(cache.roles(), vec!["ingress".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_before_set() {
        let cache = SnapshotCache::new();
        let mut rx = cache.subscribe("edge");
        assert!(rx.borrow_and_update().snapshot.is_none());

        cache.set_snapshot("edge", snapshot_with_cluster("a"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().generation, 1);

        cache.set_snapshot("edge", snapshot_with_cluster("b"));
        rx.changed().await.unwrap();
        let entry = rx.borrow_and_update().clone();
        assert_eq!(entry.generation, 2);
        assert_eq!(
            entry.snapshot.unwrap().resource_names(ResourceType::Cluster),
            vec!["b"]
        );
    }

    #[test]
    fn test_dump() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("ingress", snapshot_with_cluster("a"));
        let _rx = cache.subscribe("empty");

        let dump = cache.dump();
        assert_eq!(dump.len(), 2);
        assert_eq!(dump[0].role, "empty");
        assert!(dump[0].resources.is_empty());
        assert_eq!(dump[1].role, "ingress");

        let clusters = dump[1]
            .resources
            .iter()
            .find(|t| t.type_url == ResourceType::Cluster.type_url())
            .unwrap();
        assert_eq!(clusters.names, vec!["a".to_string()]);
    }
}
