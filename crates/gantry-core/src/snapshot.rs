//! The translator's input.

use std::collections::BTreeSet;

use gantry_api::{
    endpoint::Endpoint,
    http::VirtualService,
    secret::{Artifact, Secret, REDACTED},
    upstream::Upstream,
    upstream_group::UpstreamGroup,
    Metadata, Resource, ResourceRef,
};
use serde::Serialize;

use crate::hash::thread_local_xxhash;

/// The annotation `kubectl apply` uses to store the last applied version of
/// an object. It contains a full copy of the object, so it gets redacted
/// along with everything else.
pub const LAST_APPLIED_CONFIG_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// User configuration.
#[derive(Debug, Clone, Default, PartialEq, Hash, Serialize)]
pub struct Config {
    pub upstreams: Vec<Upstream>,
    pub upstream_groups: Vec<UpstreamGroup>,
    pub virtual_services: Vec<VirtualService>,
}

impl Config {
    pub fn find_upstream(&self, target: &ResourceRef) -> Option<&Upstream> {
        find(&self.upstreams, target)
    }

    pub fn find_upstream_group(&self, target: &ResourceRef) -> Option<&UpstreamGroup> {
        find(&self.upstream_groups, target)
    }

    /// Sort every list by namespace and name.
    pub(crate) fn sort(&mut self) {
        sort_resources(&mut self.upstreams);
        sort_resources(&mut self.upstream_groups);
        sort_resources(&mut self.virtual_services);
    }
}

/// Everything the translator needs to produce xDS, taken at a single point in
/// time.
///
/// Two snapshots with the same [hash][InputSnapshot::hash] are treated as
/// identical. Resource versions assigned by storage don't contribute to the
/// hash.
#[derive(Debug, Clone, Default, PartialEq, Hash, Serialize)]
pub struct InputSnapshot {
    pub config: Config,
    pub secrets: Vec<Secret>,
    pub artifacts: Vec<Artifact>,
    pub endpoints: Vec<Endpoint>,

    /// Set once every required source has delivered its initial state.
    #[serde(skip)]
    pub(crate) ready: bool,
}

impl InputSnapshot {
    /// Create a snapshot that's ready for translation.
    pub fn new(
        config: Config,
        secrets: Vec<Secret>,
        artifacts: Vec<Artifact>,
        endpoints: Vec<Endpoint>,
    ) -> Self {
        let mut snapshot = Self {
            config,
            secrets,
            artifacts,
            endpoints,
            ready: true,
        };
        snapshot.sort();
        snapshot
    }

    /// A 64-bit content hash of this snapshot.
    pub fn hash(&self) -> u64 {
        thread_local_xxhash::hash(self)
    }

    /// Returns `true` when every required input has been observed at least
    /// once.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn sort(&mut self) {
        self.config.sort();
        sort_resources(&mut self.secrets);
        sort_resources(&mut self.artifacts);
        self.endpoints.sort_by(|a, b| {
            let a = (&a.metadata.namespace, &a.metadata.name);
            let b = (&b.metadata.namespace, &b.metadata.name);
            a.cmp(&b)
        });
    }

    /// Every role that has at least one VirtualService bound to it.
    pub fn roles(&self) -> BTreeSet<String> {
        self.config
            .virtual_services
            .iter()
            .flat_map(|vs| vs.roles())
            .map(str::to_string)
            .collect()
    }

    /// Project this snapshot onto a single role.
    ///
    /// The projection keeps only the VirtualServices bound to `role`, the
    /// UpstreamGroups they reference, and every Upstream they reference either
    /// directly or through a group. Endpoints are narrowed to the kept
    /// Upstreams. Secrets and Artifacts are kept as-is.
    pub fn for_role(&self, role: &str) -> InputSnapshot {
        let virtual_services: Vec<_> = self
            .config
            .virtual_services
            .iter()
            .filter(|vs| vs.roles().contains(&role))
            .cloned()
            .collect();

        let group_refs: BTreeSet<_> = virtual_services
            .iter()
            .flat_map(|vs| vs.upstream_group_refs())
            .collect();
        let upstream_groups: Vec<_> = self
            .config
            .upstream_groups
            .iter()
            .filter(|g| group_refs.contains(&g.resource_ref()))
            .cloned()
            .collect();

        let mut upstream_refs: BTreeSet<_> = virtual_services
            .iter()
            .flat_map(|vs| vs.upstream_refs())
            .cloned()
            .collect();
        upstream_refs.extend(upstream_groups.iter().flat_map(|g| g.upstream_refs()).cloned());

        let upstreams: Vec<_> = self
            .config
            .upstreams
            .iter()
            .filter(|u| upstream_refs.contains(&u.resource_ref()))
            .cloned()
            .collect();

        let endpoints = self
            .endpoints
            .iter()
            .filter(|e| e.upstreams.iter().any(|u| upstream_refs.contains(u)))
            .cloned()
            .collect();

        InputSnapshot {
            config: Config {
                upstreams,
                upstream_groups,
                virtual_services,
            },
            secrets: self.secrets.clone(),
            artifacts: self.artifacts.clone(),
            endpoints,
            ready: self.ready,
        }
    }

    pub fn find_secret(&self, target: &ResourceRef) -> Option<&Secret> {
        find(&self.secrets, target)
    }

    pub fn find_artifact(&self, target: &ResourceRef) -> Option<&Artifact> {
        find(&self.artifacts, target)
    }

    /// The endpoints that belong to an upstream.
    pub fn endpoints_for<'a>(
        &'a self,
        upstream: &'a ResourceRef,
    ) -> impl Iterator<Item = &'a Endpoint> + 'a {
        self.endpoints.iter().filter(move |e| e.belongs_to(upstream))
    }

    /// A copy of this snapshot that's safe to show to humans.
    ///
    /// Secret and Artifact contents are replaced with `<redacted>`, as is the
    /// `last-applied-configuration` annotation on every object.
    pub fn redacted(&self) -> InputSnapshot {
        let mut snapshot = self.clone();
        snapshot.secrets = self.secrets.iter().map(Secret::redacted).collect();
        snapshot.artifacts = self.artifacts.iter().map(Artifact::redacted).collect();

        let config = &mut snapshot.config;
        let metadata = config
            .upstreams
            .iter_mut()
            .map(Resource::metadata_mut)
            .chain(config.upstream_groups.iter_mut().map(Resource::metadata_mut))
            .chain(config.virtual_services.iter_mut().map(Resource::metadata_mut))
            .chain(snapshot.secrets.iter_mut().map(Resource::metadata_mut))
            .chain(snapshot.artifacts.iter_mut().map(Resource::metadata_mut))
            .chain(snapshot.endpoints.iter_mut().map(|e| &mut e.metadata));
        for m in metadata {
            redact_metadata(m);
        }

        snapshot
    }

    /// A copy of this snapshot with only objects in `namespaces`.
    pub fn in_namespaces(&self, namespaces: &[String]) -> InputSnapshot {
        fn keep<T: Resource>(items: &[T], namespaces: &[String]) -> Vec<T> {
            items
                .iter()
                .filter(|i| namespaces.contains(&i.metadata().namespace))
                .cloned()
                .collect()
        }

        InputSnapshot {
            config: Config {
                upstreams: keep(&self.config.upstreams, namespaces),
                upstream_groups: keep(&self.config.upstream_groups, namespaces),
                virtual_services: keep(&self.config.virtual_services, namespaces),
            },
            secrets: keep(&self.secrets, namespaces),
            artifacts: keep(&self.artifacts, namespaces),
            endpoints: self
                .endpoints
                .iter()
                .filter(|e| namespaces.contains(&e.metadata.namespace))
                .cloned()
                .collect(),
            ready: self.ready,
        }
    }
}

fn redact_metadata(metadata: &mut Metadata) {
    if let Some(value) = metadata.annotations.get_mut(LAST_APPLIED_CONFIG_ANNOTATION) {
        *value = REDACTED.to_string();
    }
}

fn find<'a, T: Resource>(items: &'a [T], target: &ResourceRef) -> Option<&'a T> {
    items.iter().find(|i| {
        let m = i.metadata();
        m.name == target.name && m.namespace == target.namespace
    })
}

pub(crate) fn sort_resources<T: Resource>(items: &mut [T]) {
    items.sort_by(|a, b| {
        let (a, b) = (a.metadata(), b.metadata());
        (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name))
    });
}
