use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gantry_api::{Resource, ResourceKind, ResourceRef};
use tokio::sync::watch;

use super::{lock, spawn_watch, ResourceClient, Watcher};
use crate::error::StorageError;

/// In-memory storage for every kind.
///
/// Objects are stored as JSON under `<namespace>/<type-flag>/<name>` so that
/// every kind shares one map and one version counter. Clones share the same
/// underlying store.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
}

#[derive(Default)]
struct State {
    version: u64,
    items: BTreeMap<String, serde_json::Value>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("MemoryStorage")
            .field("version", &state.version)
            .field("items", &state.items.len())
            .finish()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
            }),
        }
    }

    /// A client for a single kind.
    pub fn client<T: Resource>(&self) -> Arc<dyn ResourceClient<T>> {
        Arc::new(MemoryClient::<T> {
            storage: self.clone(),
            _kind: PhantomData,
        })
    }

    fn notify(&self, version: u64) {
        self.inner.changes.send_replace(version);
    }
}

fn key(kind: ResourceKind, namespace: &str, name: &str) -> String {
    format!("{namespace}/{}/{name}", kind.type_flag())
}

fn parse_key(key: &str) -> Option<(&str, u8, &str)> {
    let mut parts = key.splitn(3, '/');
    let namespace = parts.next()?;
    let flag = parts.next()?.parse().ok()?;
    let name = parts.next()?;
    Some((namespace, flag, name))
}

struct MemoryClient<T> {
    storage: MemoryStorage,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource> MemoryClient<T> {
    fn encode(resource: &T) -> Result<serde_json::Value, StorageError> {
        serde_json::to_value(resource).map_err(|e| StorageError::Serialization {
            kind: T::KIND,
            message: e.to_string(),
        })
    }

    fn decode(value: &serde_json::Value) -> Result<T, StorageError> {
        T::deserialize(value).map_err(|e| StorageError::Serialization {
            kind: T::KIND,
            message: e.to_string(),
        })
    }

    fn list_now(storage: &MemoryStorage, namespace: Option<&str>) -> Result<Vec<T>, StorageError> {
        let state = lock(&storage.inner.state);
        let flag = T::KIND.type_flag();

        // keys sort by namespace first, but a name can sort before or after
        // the type flag, so sort again.
        let mut items = state
            .items
            .iter()
            .filter(|(key, _)| match parse_key(key) {
                Some((ns, f, _)) => f == flag && namespace.map_or(true, |n| n == ns),
                None => false,
            })
            .map(|(_, value)| Self::decode(value))
            .collect::<Result<Vec<_>, _>>()?;
        crate::snapshot::sort_resources(&mut items);
        Ok(items)
    }

    fn write(&self, mut resource: T, must_exist: bool) -> Result<T, StorageError> {
        let reference = resource.resource_ref();
        let key = key(T::KIND, &reference.namespace, &reference.name);

        let version = {
            let mut state = lock(&self.storage.inner.state);
            let existing = state.items.get(&key);

            match (existing, must_exist) {
                (Some(_), false) => {
                    return Err(StorageError::AlreadyExists {
                        kind: T::KIND,
                        reference,
                    })
                }
                (None, true) => {
                    return Err(StorageError::NotFound {
                        kind: T::KIND,
                        reference,
                    })
                }
                (Some(existing), true) => {
                    let stored = Self::decode(existing)?;
                    let expected = &stored.metadata().resource_version;
                    let found = &resource.metadata().resource_version;
                    if expected != found {
                        return Err(StorageError::Outdated {
                            kind: T::KIND,
                            reference,
                            expected: expected.clone(),
                            found: found.clone(),
                        });
                    }
                }
                (None, false) => (),
            }

            state.version += 1;
            resource.metadata_mut().resource_version = state.version.to_string();
            let value = Self::encode(&resource)?;
            state.items.insert(key, value);
            state.version
        };

        self.storage.notify(version);
        Ok(resource)
    }
}

#[async_trait]
impl<T: Resource> ResourceClient<T> for MemoryClient<T> {
    async fn create(&self, resource: T) -> Result<T, StorageError> {
        self.write(resource, false)
    }

    async fn update(&self, resource: T) -> Result<T, StorageError> {
        self.write(resource, true)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StorageError> {
        let version = {
            let mut state = lock(&self.storage.inner.state);
            if state.items.remove(&key(T::KIND, namespace, name)).is_none() {
                return Err(StorageError::NotFound {
                    kind: T::KIND,
                    reference: ResourceRef::new(namespace, name),
                });
            }
            state.version += 1;
            state.version
        };

        self.storage.notify(version);
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<T, StorageError> {
        let state = lock(&self.storage.inner.state);
        match state.items.get(&key(T::KIND, namespace, name)) {
            Some(value) => Self::decode(value),
            None => Err(StorageError::NotFound {
                kind: T::KIND,
                reference: ResourceRef::new(namespace, name),
            }),
        }
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<T>, StorageError> {
        Self::list_now(&self.storage, namespace)
    }

    async fn watch(&self, namespace: Option<&str>) -> Result<Watcher<T>, StorageError> {
        let storage = self.storage.clone();
        let namespace = namespace.map(str::to_string);
        let changes = self.storage.inner.changes.subscribe();

        Ok(spawn_watch(
            changes,
            move || {
                let res = Self::list_now(&storage, namespace.as_deref());
                std::future::ready(res)
            },
            (),
        ))
    }
}
