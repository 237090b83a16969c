//! The storage port.
//!
//! Every stored kind is reached through a [ResourceClient]: CRUD plus a
//! [Watcher] that streams the full list of objects every time it changes.
//! Backends only need to store objects and signal that *something* changed.
//! Working out what changed is shared by every backend, so a watch looks
//! the same whichever backend is behind it.
//!
//! Two backends are built in: [MemoryStorage], which keeps serialized objects
//! in a map keyed by `<namespace>/<type-flag>/<name>`, and [FileStorage],
//! which keeps one YAML file per object.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use gantry_api::{
    http::VirtualService,
    report::Report,
    secret::{Artifact, Secret},
    upstream::Upstream,
    upstream_group::UpstreamGroup,
    Resource, ResourceRef,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::StorageError;
use crate::settings::StorageSettings;

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// CRUD and watch access to a single kind of object.
///
/// Lists are always sorted by namespace and then name.
#[async_trait]
pub trait ResourceClient<T: Resource>: Send + Sync + 'static {
    /// Store a new object. Fails with [StorageError::AlreadyExists] if an
    /// object with the same namespace and name exists.
    async fn create(&self, resource: T) -> Result<T, StorageError>;

    /// Replace an existing object. The object's resource version must match
    /// the stored version or the update fails with [StorageError::Outdated].
    async fn update(&self, resource: T) -> Result<T, StorageError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StorageError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<T, StorageError>;

    /// List every object in `namespace`, or in every namespace.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<T>, StorageError>;

    /// Watch every object in `namespace`, or in every namespace.
    async fn watch(&self, namespace: Option<&str>) -> Result<Watcher<T>, StorageError>;
}

/// What triggered a [WatchUpdate].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    /// The initial state of storage, sent once when a watch starts.
    Synced,
    Added(T),
    Updated(T),
    /// The object that was deleted, as it was last seen.
    Deleted(T),
}

/// A change to a watched collection and the full list after the change.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchUpdate<T> {
    pub event: WatchEvent<T>,
    pub list: Vec<T>,
}

/// Callbacks for [Watcher::run].
pub trait WatchHandler<T>: Send {
    fn on_sync(&mut self, _list: &[T]) {}

    fn on_add(&mut self, list: &[T], added: &T);

    fn on_update(&mut self, list: &[T], updated: &T);

    fn on_delete(&mut self, list: &[T], deleted: &T);

    fn on_error(&mut self, error: StorageError) {
        tracing::warn!(err = %error, "storage watch failed");
    }
}

/// A live watch on a collection. The watch stops when the Watcher is
/// dropped.
pub struct Watcher<T> {
    updates: mpsc::Receiver<Result<WatchUpdate<T>, StorageError>>,
    _guard: DropGuard,
}

impl<T> std::fmt::Debug for Watcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").finish_non_exhaustive()
    }
}

impl<T: Resource> Watcher<T> {
    /// The next update, or `None` once the watch has stopped.
    pub async fn next(&mut self) -> Option<Result<WatchUpdate<T>, StorageError>> {
        self.updates.recv().await
    }

    /// Feed every update to `handler` until the watch stops.
    pub async fn run<H: WatchHandler<T>>(mut self, handler: &mut H) {
        while let Some(update) = self.next().await {
            match update {
                Ok(WatchUpdate { event, list }) => match &event {
                    WatchEvent::Synced => handler.on_sync(&list),
                    WatchEvent::Added(added) => handler.on_add(&list, added),
                    WatchEvent::Updated(updated) => handler.on_update(&list, updated),
                    WatchEvent::Deleted(deleted) => handler.on_delete(&list, deleted),
                },
                Err(e) => handler.on_error(e),
            }
        }
    }
}

/// Start a watch driven by a change signal.
///
/// Every time `changes` ticks the collection is listed again with `list` and
/// compared to the previous listing. Each difference is sent as its own
/// update. `keep_alive` is held until the watch stops.
pub(crate) fn spawn_watch<T, F, Fut, K>(
    mut changes: watch::Receiver<u64>,
    list: F,
    keep_alive: K,
) -> Watcher<T>
where
    T: Resource,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>, StorageError>> + Send + 'static,
    K: Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    tokio::spawn(async move {
        let _keep_alive = keep_alive;
        let mut last: Option<Vec<T>> = None;

        loop {
            changes.borrow_and_update();

            let updates = match list().await {
                Ok(current) => {
                    let updates = match &last {
                        None => vec![WatchUpdate {
                            event: WatchEvent::Synced,
                            list: current.clone(),
                        }],
                        Some(previous) => diff(previous, &current),
                    };
                    last = Some(current);
                    updates.into_iter().map(Ok).collect()
                }
                Err(e) => vec![Err(e)],
            };

            for update in updates {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    res = tx.send(update) => if res.is_err() { return },
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = changes.changed() => if res.is_err() { return },
            }
        }
    });

    Watcher {
        updates: rx,
        _guard: guard,
    }
}

fn diff<T: Resource>(previous: &[T], current: &[T]) -> Vec<WatchUpdate<T>> {
    let mut previous: BTreeMap<ResourceRef, &T> =
        previous.iter().map(|r| (r.resource_ref(), r)).collect();

    let mut events = Vec::new();
    for resource in current {
        match previous.remove(&resource.resource_ref()) {
            Some(old) if old == resource => (),
            Some(_) => events.push(WatchEvent::Updated(resource.clone())),
            None => events.push(WatchEvent::Added(resource.clone())),
        }
    }
    events.extend(previous.into_values().cloned().map(WatchEvent::Deleted));

    events
        .into_iter()
        .map(|event| WatchUpdate {
            event,
            list: current.to_vec(),
        })
        .collect()
}

/// A client for every stored kind.
#[derive(Clone)]
pub struct Storage {
    pub upstreams: Arc<dyn ResourceClient<Upstream>>,
    pub upstream_groups: Arc<dyn ResourceClient<UpstreamGroup>>,
    pub virtual_services: Arc<dyn ResourceClient<VirtualService>>,
    pub reports: Arc<dyn ResourceClient<Report>>,
    pub secrets: Arc<dyn ResourceClient<Secret>>,
    pub artifacts: Arc<dyn ResourceClient<Artifact>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    pub fn memory() -> Self {
        Self::from_memory(&MemoryStorage::new())
    }

    pub fn from_memory(storage: &MemoryStorage) -> Self {
        Self {
            upstreams: storage.client(),
            upstream_groups: storage.client(),
            virtual_services: storage.client(),
            reports: storage.client(),
            secrets: storage.client(),
            artifacts: storage.client(),
        }
    }

    pub fn from_file(storage: &FileStorage) -> Self {
        Self {
            upstreams: storage.client(),
            upstream_groups: storage.client(),
            virtual_services: storage.client(),
            reports: storage.client(),
            secrets: storage.client(),
            artifacts: storage.client(),
        }
    }

    /// Open the backend named in settings. File storage fails if its root
    /// directory can't be created.
    pub async fn from_settings(settings: &StorageSettings) -> Result<Self, StorageError> {
        match settings {
            StorageSettings::Memory => Ok(Self::memory()),
            StorageSettings::File { root } => {
                let storage = FileStorage::open(root).await?;
                Ok(Self::from_file(&storage))
            }
        }
    }
}

/// Lock a std mutex, recovering the data from a poisoned lock.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::static_upstream;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl WatchHandler<Upstream> for Recorder {
        fn on_sync(&mut self, list: &[Upstream]) {
            self.events.push(format!("sync:{}", list.len()));
        }

        fn on_add(&mut self, list: &[Upstream], added: &Upstream) {
            self.events
                .push(format!("add:{}:{}", added.metadata.name, list.len()));
        }

        fn on_update(&mut self, list: &[Upstream], updated: &Upstream) {
            self.events
                .push(format!("update:{}:{}", updated.metadata.name, list.len()));
        }

        fn on_delete(&mut self, list: &[Upstream], deleted: &Upstream) {
            self.events
                .push(format!("delete:{}:{}", deleted.metadata.name, list.len()));
        }
    }

    #[test]
    fn test_diff() {
        let a = static_upstream("ns", "a", "1.2.3.4", 80);
        let b = static_upstream("ns", "b", "1.2.3.4", 80);
        let c = static_upstream("ns", "c", "1.2.3.4", 80);
        let mut b2 = b.clone();
        b2.metadata.resource_version = "2".to_string();

        let updates = diff(&[a.clone(), b.clone()], &[b2.clone(), c.clone()]);
        let events: Vec<_> = updates.iter().map(|u| u.event.clone()).collect();
        assert_eq!(
            events,
            vec![
                WatchEvent::Updated(b2),
                WatchEvent::Added(c),
                WatchEvent::Deleted(a),
            ]
        );
        assert!(updates.iter().all(|u| u.list.len() == 2));

        assert!(diff(&[b.clone()], &[b]).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_run() {
        let storage = MemoryStorage::new();
        let client = storage.client::<Upstream>();
        let watcher = client.watch(None).await.unwrap();

        let writer = client.clone();
        let writes = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let mut u1 = writer
                .create(static_upstream("ns", "u1", "1.2.3.4", 80))
                .await
                .unwrap();
            // let the watch catch up so each write is its own change
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            u1.metadata.labels.insert("a".to_string(), "b".to_string());
            writer.update(u1).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            writer.delete("ns", "u1").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });

        let mut recorder = Recorder::default();
        let run = tokio::time::timeout(
            std::time::Duration::from_millis(1000),
            watcher.run(&mut recorder),
        );
        let _ = run.await;
        writes.await.unwrap();

        assert_eq!(
            recorder.events,
            vec!["sync:0", "add:u1:1", "update:u1:1", "delete:u1:0"]
        );
    }

    #[tokio::test]
    async fn test_from_settings() {
        let storage = Storage::from_settings(&StorageSettings::Memory)
            .await
            .unwrap();
        storage
            .upstreams
            .create(static_upstream("ns", "u1", "1.2.3.4", 80))
            .await
            .unwrap();
        assert_eq!(storage.upstreams.list(None).await.unwrap().len(), 1);
        assert!(storage.virtual_services.list(None).await.unwrap().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::from_settings(&StorageSettings::File {
            root: dir.path().join("config"),
        })
        .await
        .unwrap();
        assert!(storage.reports.list(None).await.unwrap().is_empty());
    }
}
