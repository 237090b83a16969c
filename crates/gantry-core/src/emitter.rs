//! The snapshot emitter.
//!
//! The emitter watches every input the translator needs and fuses them into
//! a single [InputSnapshot] stream. Storage watches deliver full lists, so the
//! emitter only ever keeps the latest list from each source and rebuilds the
//! snapshot from scratch when anything changes. Snapshots are only emitted
//! once every source has delivered its initial state, and a snapshot that
//! hashes the same as the last one emitted is dropped.
//!
//! Secrets and artifacts are narrowed to the ones the current configuration
//! depends on, as declared by the registry's dependency plugins. Endpoints
//! come from the registry's endpoint discovery plugins, which are restarted
//! whenever the set of Upstreams they discover for changes.

use std::collections::{BTreeMap, BTreeSet};

use gantry_api::{
    endpoint::Endpoint,
    http::VirtualService,
    secret::{Artifact, Secret},
    upstream::Upstream,
    upstream_group::UpstreamGroup,
    Resource,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::hash::thread_local_xxhash;
use crate::plugins::{Dependency, EndpointWatch, Registry};
use crate::settings::Settings;
use crate::snapshot::{sort_resources, Config, InputSnapshot};
use crate::storage::{Storage, Watcher};

const UPDATE_BUFFER: usize = 64;
const ERROR_BUFFER: usize = 16;

/// The output of a running [SnapshotEmitter]. Both channels close when the
/// emitter shuts down.
#[derive(Debug)]
pub struct EmitterChannels {
    pub snapshots: mpsc::Receiver<InputSnapshot>,
    pub errors: mpsc::Receiver<Error>,
}

/// Fuses storage watches and endpoint discovery into input snapshots.
pub struct SnapshotEmitter {
    storage: Storage,
    registry: Registry,
    write_namespace: String,
    watch_namespaces: Vec<String>,
}

impl SnapshotEmitter {
    pub fn new(storage: Storage, registry: Registry, settings: &Settings) -> Self {
        Self {
            storage,
            registry,
            write_namespace: settings.write_namespace.clone(),
            watch_namespaces: settings.watch_namespaces.clone(),
        }
    }

    /// The namespaces to watch. `None` watches every namespace.
    ///
    /// Discovered Upstreams are written to the write namespace, so it's
    /// always watched.
    fn namespaces(&self) -> Vec<Option<String>> {
        if self.watch_namespaces.is_empty() {
            return vec![None];
        }

        let mut namespaces: BTreeSet<&str> =
            self.watch_namespaces.iter().map(String::as_str).collect();
        namespaces.insert(&self.write_namespace);
        namespaces.into_iter().map(|ns| Some(ns.to_string())).collect()
    }

    /// Start every watch and run until `cancel` is cancelled.
    ///
    /// Fails if any storage watch can't be started.
    pub async fn start(self, cancel: CancellationToken) -> crate::Result<EmitterChannels> {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let (snapshots_tx, snapshots_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_BUFFER);

        let namespaces = self.namespaces();
        let watches = cancel.child_token();
        for namespace in &namespaces {
            let ns = namespace.as_deref();
            let storage = &self.storage;
            let upstreams = storage.upstreams.watch(ns).await?;
            forward(upstreams, namespace, &updates_tx, Update::Upstreams, &watches);
            let groups = storage.upstream_groups.watch(ns).await?;
            forward(groups, namespace, &updates_tx, Update::UpstreamGroups, &watches);
            let virtual_services = storage.virtual_services.watch(ns).await?;
            forward(
                virtual_services,
                namespace,
                &updates_tx,
                Update::VirtualServices,
                &watches,
            );
            let secrets = storage.secrets.watch(ns).await?;
            forward(secrets, namespace, &updates_tx, Update::Secrets, &watches);
            let artifacts = storage.artifacts.watch(ns).await?;
            forward(artifacts, namespace, &updates_tx, Update::Artifacts, &watches);
        }

        tracing::debug!(namespaces = ?namespaces, "started snapshot emitter");

        let emitter = Emitter {
            registry: self.registry,
            write_namespace: self.write_namespace,
            inputs: Inputs::new(namespaces.len()),
            updates_tx,
            snapshots_tx,
            errors_tx,
            endpoint_watches: cancel.child_token(),
            endpoint_key: None,
            generation: 0,
            last_hash: None,
        };
        tokio::spawn(emitter.run(updates_rx, cancel));

        Ok(EmitterChannels {
            snapshots: snapshots_rx,
            errors: errors_rx,
        })
    }
}

#[derive(Debug)]
enum Update {
    Upstreams(Option<String>, Vec<Upstream>),
    UpstreamGroups(Option<String>, Vec<UpstreamGroup>),
    VirtualServices(Option<String>, Vec<VirtualService>),
    Secrets(Option<String>, Vec<Secret>),
    Artifacts(Option<String>, Vec<Artifact>),
    Endpoints {
        plugin: usize,
        generation: u64,
        endpoints: Vec<Endpoint>,
    },
    Error(Error),
}

/// Forward every list from a storage watch until the watch stops or `cancel`
/// is cancelled.
fn forward<T: Resource>(
    mut watcher: Watcher<T>,
    namespace: &Option<String>,
    updates: &mpsc::Sender<Update>,
    wrap: fn(Option<String>, Vec<T>) -> Update,
    cancel: &CancellationToken,
) {
    let namespace = namespace.clone();
    let updates = updates.clone();
    let cancel = cancel.clone();

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = watcher.next() => next,
            };

            let update = match next {
                Some(Ok(update)) => wrap(namespace.clone(), update.list),
                Some(Err(e)) => Update::Error(e.into()),
                None => return,
            };
            if updates.send(update).await.is_err() {
                return;
            }
        }
    });
}

fn forward_endpoints(
    mut watch: EndpointWatch,
    plugin: usize,
    generation: u64,
    updates: mpsc::Sender<Update>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                Some(endpoints) = watch.endpoints.recv() => Update::Endpoints {
                    plugin,
                    generation,
                    endpoints,
                },
                Some(e) = watch.errors.recv() => Update::Error(e.into()),
                else => return,
            };
            if updates.send(update).await.is_err() {
                return;
            }
        }
    });
}

/// The latest lists from every watched namespace of a single kind.
#[derive(Debug)]
struct Collection<T> {
    namespaces: usize,
    lists: BTreeMap<Option<String>, Vec<T>>,
}

impl<T: Resource> Collection<T> {
    fn new(namespaces: usize) -> Self {
        Self {
            namespaces,
            lists: BTreeMap::new(),
        }
    }

    fn set(&mut self, namespace: Option<String>, list: Vec<T>) {
        self.lists.insert(namespace, list);
    }

    fn is_synced(&self) -> bool {
        self.lists.len() == self.namespaces
    }

    fn all(&self) -> Vec<T> {
        let mut all: Vec<_> = self.lists.values().flatten().cloned().collect();
        sort_resources(&mut all);
        all
    }
}

#[derive(Debug)]
struct Inputs {
    upstreams: Collection<Upstream>,
    upstream_groups: Collection<UpstreamGroup>,
    virtual_services: Collection<VirtualService>,
    secrets: Collection<Secret>,
    artifacts: Collection<Artifact>,

    /// The latest endpoints from each discovery plugin, by registry index.
    endpoints: BTreeMap<usize, Vec<Endpoint>>,

    /// Plugins in the current endpoint generation that haven't sent anything.
    endpoints_pending: BTreeSet<usize>,

    /// Set once every endpoint watch has sent its first list. Restarting the
    /// watches keeps the old endpoints around until they're replaced.
    endpoints_synced: bool,
}

impl Inputs {
    fn new(namespaces: usize) -> Self {
        Self {
            upstreams: Collection::new(namespaces),
            upstream_groups: Collection::new(namespaces),
            virtual_services: Collection::new(namespaces),
            secrets: Collection::new(namespaces),
            artifacts: Collection::new(namespaces),
            endpoints: BTreeMap::new(),
            endpoints_pending: BTreeSet::new(),
            endpoints_synced: false,
        }
    }

    fn storage_synced(&self) -> bool {
        self.upstreams.is_synced()
            && self.upstream_groups.is_synced()
            && self.virtual_services.is_synced()
            && self.secrets.is_synced()
            && self.artifacts.is_synced()
    }
}

struct Emitter {
    registry: Registry,
    write_namespace: String,
    inputs: Inputs,

    updates_tx: mpsc::Sender<Update>,
    snapshots_tx: mpsc::Sender<InputSnapshot>,
    errors_tx: mpsc::Sender<Error>,

    endpoint_watches: CancellationToken,
    endpoint_key: Option<u64>,
    generation: u64,

    last_hash: Option<u64>,
}

impl Emitter {
    async fn run(mut self, mut updates: mpsc::Receiver<Update>, cancel: CancellationToken) {
        loop {
            let update = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };

            // coalesce everything that's already queued into one snapshot
            self.apply(update);
            while let Ok(update) = updates.try_recv() {
                self.apply(update);
            }

            if self.inputs.upstreams.is_synced() {
                self.restart_endpoint_watches();
            }

            let Some(snapshot) = self.snapshot() else {
                continue;
            };
            let hash = snapshot.hash();
            if self.last_hash == Some(hash) {
                tracing::trace!(hash, "input snapshot unchanged");
                continue;
            }

            tracing::debug!(
                hash,
                upstreams = snapshot.config.upstreams.len(),
                virtual_services = snapshot.config.virtual_services.len(),
                endpoints = snapshot.endpoints.len(),
                "emitting input snapshot",
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.snapshots_tx.send(snapshot) => {
                    if res.is_err() {
                        break;
                    }
                    self.last_hash = Some(hash);
                }
            }
        }

        self.endpoint_watches.cancel();
        tracing::debug!("snapshot emitter stopped");
    }

    fn apply(&mut self, update: Update) {
        let inputs = &mut self.inputs;
        match update {
            Update::Upstreams(ns, list) => inputs.upstreams.set(ns, list),
            Update::UpstreamGroups(ns, list) => inputs.upstream_groups.set(ns, list),
            Update::VirtualServices(ns, list) => inputs.virtual_services.set(ns, list),
            Update::Secrets(ns, list) => inputs.secrets.set(ns, list),
            Update::Artifacts(ns, list) => inputs.artifacts.set(ns, list),
            Update::Endpoints {
                plugin,
                generation,
                endpoints,
            } => {
                if generation != self.generation {
                    return;
                }
                inputs.endpoints.insert(plugin, endpoints);
                inputs.endpoints_pending.remove(&plugin);
                if inputs.endpoints_pending.is_empty() {
                    inputs.endpoints_synced = true;
                }
            }
            Update::Error(e) => forward_error(&self.errors_tx, e),
        }
    }

    /// Restart endpoint discovery if the set of Upstreams any plugin
    /// discovers for has changed.
    fn restart_endpoint_watches(&mut self) {
        let upstreams = self.inputs.upstreams.all();
        let discovered: Vec<(usize, Vec<Upstream>)> = self
            .registry
            .endpoint_discovery()
            .iter()
            .enumerate()
            .map(|(i, plugin)| {
                let upstreams = upstreams
                    .iter()
                    .filter(|u| plugin.discovers(u))
                    .cloned()
                    .collect::<Vec<_>>();
                (i, upstreams)
            })
            .filter(|(_, upstreams)| !upstreams.is_empty())
            .collect();

        let key = thread_local_xxhash::hash(&discovered);
        if self.endpoint_key == Some(key) {
            return;
        }
        self.endpoint_key = Some(key);

        self.endpoint_watches.cancel();
        self.endpoint_watches = CancellationToken::new();
        self.generation += 1;

        let plugins: BTreeSet<usize> = discovered.iter().map(|(i, _)| *i).collect();
        self.inputs.endpoints.retain(|i, _| plugins.contains(i));
        self.inputs.endpoints_pending = plugins;

        for (i, upstreams) in discovered {
            let plugin = &self.registry.endpoint_discovery()[i];
            tracing::debug!(
                plugin = i,
                upstreams = upstreams.len(),
                generation = self.generation,
                "starting endpoint discovery",
            );

            let watch = plugin.watch_endpoints(
                &self.write_namespace,
                upstreams,
                self.endpoint_watches.clone(),
            );
            match watch {
                Ok(watch) => forward_endpoints(
                    watch,
                    i,
                    self.generation,
                    self.updates_tx.clone(),
                    self.endpoint_watches.clone(),
                ),
                Err(e) => {
                    // don't hold up the whole snapshot on a watch that will
                    // never report
                    forward_error(&self.errors_tx, e);
                    self.inputs.endpoints.insert(i, Vec::new());
                    self.inputs.endpoints_pending.remove(&i);
                }
            }
        }

        if self.inputs.endpoints_pending.is_empty() {
            self.inputs.endpoints_synced = true;
        }
    }

    /// Build a snapshot from the latest inputs, or `None` if some input
    /// hasn't been seen yet.
    fn snapshot(&self) -> Option<InputSnapshot> {
        let inputs = &self.inputs;
        if !inputs.storage_synced() || !inputs.endpoints_synced || self.endpoint_key.is_none() {
            return None;
        }

        let config = Config {
            upstreams: inputs.upstreams.all(),
            upstream_groups: inputs.upstream_groups.all(),
            virtual_services: inputs.virtual_services.all(),
        };

        let dependencies = self.registry.dependencies(&config);
        let secrets = inputs
            .secrets
            .all()
            .into_iter()
            .filter(|s| dependencies.contains(&Dependency::Secret(s.resource_ref())))
            .collect();
        let artifacts = inputs
            .artifacts
            .all()
            .into_iter()
            .filter(|a| dependencies.contains(&Dependency::Artifact(a.resource_ref())))
            .collect();
        let endpoints = inputs.endpoints.values().flatten().cloned().collect();

        Some(InputSnapshot::new(config, secrets, artifacts, endpoints))
    }
}

/// Forward an error without blocking. Errors are dropped with a warning if
/// nobody is keeping up with them.
fn forward_error(errors: &mpsc::Sender<Error>, e: Error) {
    match errors.try_send(e) {
        Ok(()) => (),
        Err(TrySendError::Full(e)) => {
            tracing::warn!(err = %e, "error channel is full, dropping error");
        }
        Err(TrySendError::Closed(_)) => (),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::discovery::test::{consul_upstream, instance, FakeCatalog};
    use crate::plugins::{ConsulPlugin, InitParams, StaticPlugin, UpstreamSslPlugin};
    use crate::test::{static_upstream, virtual_service};
    use gantry_api::{
        secret::SecretKind,
        upstream::UpstreamSslConfig,
        Metadata, ResourceRef,
    };

    async fn start(storage: &Storage, settings: &Settings) -> (EmitterChannels, CancellationToken) {
        let registry = Registry::with_defaults(settings).unwrap();
        start_with(storage, registry, settings).await
    }

    async fn start_with(
        storage: &Storage,
        registry: Registry,
        settings: &Settings,
    ) -> (EmitterChannels, CancellationToken) {
        let cancel = CancellationToken::new();
        let channels = SnapshotEmitter::new(storage.clone(), registry, settings)
            .start(cancel.clone())
            .await
            .unwrap();
        (channels, cancel)
    }

    async fn next_snapshot(channels: &mut EmitterChannels) -> InputSnapshot {
        tokio::time::timeout(Duration::from_secs(5), channels.snapshots.recv())
            .await
            .expect("timed out waiting for a snapshot")
            .expect("emitter stopped")
    }

    fn generic_secret(ns: &str, name: &str) -> Secret {
        Secret {
            metadata: Metadata::new(ns, name),
            kind: SecretKind::Generic {
                data: [("token".to_string(), "hunter2".to_string())].into(),
            },
        }
    }

    #[tokio::test]
    async fn test_initial_snapshot() {
        let storage = Storage::memory();
        let mut upstream = static_upstream("ns", "u1", "1.2.3.4", 443);
        upstream.ssl_config = Some(UpstreamSslConfig {
            secret_ref: Some(ResourceRef::new("ns", "used")),
            sni: None,
        });
        storage.upstreams.create(upstream).await.unwrap();
        storage
            .virtual_services
            .create(virtual_service("ns", "vs", &["*"], "ns", "u1"))
            .await
            .unwrap();
        storage.secrets.create(generic_secret("ns", "used")).await.unwrap();
        storage.secrets.create(generic_secret("ns", "unused")).await.unwrap();

        let (mut channels, cancel) = start(&storage, &Settings::default()).await;
        let snapshot = next_snapshot(&mut channels).await;

        assert!(snapshot.is_ready());
        assert_eq!(snapshot.config.upstreams.len(), 1);
        assert_eq!(snapshot.config.virtual_services.len(), 1);
        let secrets: Vec<_> = snapshot
            .secrets
            .iter()
            .map(|s| s.metadata.name.as_str())
            .collect();
        assert_eq!(secrets, vec!["used"]);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unchanged_content_is_suppressed() {
        let storage = Storage::memory();
        storage
            .upstreams
            .create(static_upstream("ns", "u1", "1.2.3.4", 80))
            .await
            .unwrap();

        let (mut channels, cancel) = start(&storage, &Settings::default()).await;
        let first = next_snapshot(&mut channels).await;

        // rewriting an object only bumps its resource version
        let u1 = storage.upstreams.get("ns", "u1").await.unwrap();
        storage.upstreams.update(u1).await.unwrap();
        let quiet =
            tokio::time::timeout(Duration::from_millis(200), channels.snapshots.recv()).await;
        assert!(quiet.is_err(), "unexpected snapshot");

        storage
            .upstreams
            .create(static_upstream("ns", "u2", "1.2.3.5", 80))
            .await
            .unwrap();
        let second = next_snapshot(&mut channels).await;
        assert_ne!(first.hash(), second.hash());
        assert_eq!(second.config.upstreams.len(), 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_watch_namespaces() {
        let storage = Storage::memory();
        for ns in ["a", "b", "gantry-system"] {
            storage
                .upstreams
                .create(static_upstream(ns, "u1", "1.2.3.4", 80))
                .await
                .unwrap();
        }

        let settings = Settings {
            watch_namespaces: vec!["a".to_string()],
            ..Default::default()
        };
        let (mut channels, cancel) = start(&storage, &settings).await;
        let snapshot = next_snapshot(&mut channels).await;

        let namespaces: Vec<_> = snapshot
            .config
            .upstreams
            .iter()
            .map(|u| u.metadata.namespace.as_str())
            .collect();
        assert_eq!(namespaces, vec!["a", "gantry-system"]);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_endpoint_discovery() {
        let catalog = Arc::new(FakeCatalog::new(&["dc1"]));
        catalog.register("dc1", "web", &[], vec![instance("web", "10.0.0.1", 8080)]);

        let settings = Settings {
            endpoint_poll_interval: gantry_api::Duration::from_millis(50),
            ..Default::default()
        };
        let registry = Registry::new(
            vec![
                Box::new(StaticPlugin),
                Box::new(ConsulPlugin::with_catalog(catalog.clone(), None)),
                Box::new(UpstreamSslPlugin),
            ],
            &InitParams {
                settings: &settings,
            },
        )
        .unwrap();

        let storage = Storage::memory();
        storage
            .upstreams
            .create(consul_upstream("ns", "web", "web"))
            .await
            .unwrap();

        let (mut channels, cancel) = start_with(&storage, registry, &settings).await;
        let snapshot = next_snapshot(&mut channels).await;
        assert_eq!(snapshot.endpoints.len(), 1);
        assert_eq!(snapshot.endpoints[0].address, "10.0.0.1");
        assert_eq!(
            snapshot.endpoints[0].upstreams,
            vec![ResourceRef::new("ns", "web")]
        );

        // a new instance shows up without any storage change
        catalog.register(
            "dc1",
            "web",
            &[],
            vec![
                instance("web", "10.0.0.1", 8080),
                instance("web", "10.0.0.2", 8080),
            ],
        );
        let snapshot = next_snapshot(&mut channels).await;
        assert_eq!(snapshot.endpoints.len(), 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_closes_channels() {
        let storage = Storage::memory();
        let (mut channels, cancel) = start(&storage, &Settings::default()).await;

        // an empty store is still a complete snapshot
        let snapshot = next_snapshot(&mut channels).await;
        assert!(snapshot.config.upstreams.is_empty());

        cancel.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(1), channels.snapshots.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }
}
