use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use gantry_api::{Resource, ResourceRef};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{watch, Mutex};

use super::{spawn_watch, ResourceClient, Watcher};
use crate::error::StorageError;

const EXTENSIONS: &[&str] = &["yml", "yaml"];

/// Storage that keeps one YAML file per object at
/// `<root>/<kind>/<namespace>/<name>.yml`.
///
/// Files may be edited by hand. A missing `metadata.name` or
/// `metadata.namespace` is taken from the file's path, and files that can't
/// be parsed are skipped when listing. Resource versions are integers that
/// increase on every write through storage.
#[derive(Clone)]
pub struct FileStorage {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    writes: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("root", &self.inner.root)
            .finish()
    }
}

impl FileStorage {
    /// Open storage at `root`, creating the directory if it doesn't exist.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root, e))?;

        let (changes, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                writes: Mutex::new(()),
                changes,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// A client for a single kind.
    pub fn client<T: Resource>(&self) -> Arc<dyn ResourceClient<T>> {
        Arc::new(FileClient::<T> {
            storage: self.clone(),
            _kind: PhantomData,
        })
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

struct FileClient<T> {
    storage: FileStorage,
    _kind: PhantomData<fn() -> T>,
}

impl<T: Resource> FileClient<T> {
    fn kind_dir(&self) -> PathBuf {
        self.storage.inner.root.join(T::KIND.plural())
    }

    fn path(&self, namespace: &str, name: &str, extension: &str) -> PathBuf {
        self.kind_dir()
            .join(namespace)
            .join(format!("{name}.{extension}"))
    }

    /// Find an object by name, checking every extension.
    async fn find(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(PathBuf, T)>, StorageError> {
        for extension in EXTENSIONS {
            let path = self.path(namespace, name, extension);
            if let Some(resource) = read_file(&path, namespace, name).await? {
                return Ok(Some((path, resource)));
            }
        }
        Ok(None)
    }

    async fn write(&self, path: &Path, resource: &T) -> Result<(), StorageError> {
        let contents = serde_yml::to_string(resource).map_err(|e| StorageError::Serialization {
            kind: T::KIND,
            message: e.to_string(),
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| io_error(path, e))?;

        self.storage.notify();
        Ok(())
    }

    async fn list_dir(dir: PathBuf, namespace: Option<String>) -> Result<Vec<T>, StorageError> {
        let namespaces = match namespace {
            Some(namespace) => vec![namespace],
            None => subdirectories(&dir).await?,
        };

        let mut items = Vec::new();
        for namespace in namespaces {
            let ns_dir = dir.join(&namespace);
            let mut entries = match tokio::fs::read_dir(&ns_dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&ns_dir, e)),
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&ns_dir, e))? {
                let path = entry.path();
                let Some(name) = object_name(&path) else {
                    continue;
                };

                match read_file::<T>(&path, &namespace, name).await {
                    Ok(Some(resource)) => items.push(resource),
                    Ok(None) => (),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), err = %e, "skipping invalid file");
                    }
                }
            }
        }

        crate::snapshot::sort_resources(&mut items);
        Ok(items)
    }
}

/// The object name for a path, if it has a YAML extension.
fn object_name(path: &Path) -> Option<&str> {
    let extension = path.extension()?.to_str()?;
    if !EXTENSIONS.contains(&extension) {
        return None;
    }
    path.file_stem()?.to_str()
}

async fn subdirectories(dir: &Path) -> Result<Vec<String>, StorageError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(dir, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Read and parse a single object. Returns `Ok(None)` if the file doesn't
/// exist.
async fn read_file<T: Resource>(
    path: &Path,
    namespace: &str,
    name: &str,
) -> Result<Option<T>, StorageError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };

    let invalid = |message: String| StorageError::Serialization {
        kind: T::KIND,
        message: format!("{}: {message}", path.display()),
    };

    let mut value: serde_yml::Value =
        serde_yml::from_str(&contents).map_err(|e| invalid(e.to_string()))?;
    let serde_yml::Value::Mapping(object) = &mut value else {
        return Err(invalid("expected a mapping".to_string()));
    };

    let metadata = object
        .entry("metadata".into())
        .or_insert_with(|| serde_yml::Value::Mapping(Default::default()));
    let serde_yml::Value::Mapping(metadata) = metadata else {
        return Err(invalid("metadata must be a mapping".to_string()));
    };
    for (key, default) in [("name", name), ("namespace", namespace)] {
        let missing = match metadata.get(key) {
            None | Some(serde_yml::Value::Null) => true,
            Some(serde_yml::Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if missing {
            metadata.insert(key.into(), default.into());
        }
    }

    serde_yml::from_value(value)
        .map(Some)
        .map_err(|e| invalid(e.to_string()))
}

#[async_trait]
impl<T: Resource> ResourceClient<T> for FileClient<T> {
    async fn create(&self, mut resource: T) -> Result<T, StorageError> {
        let reference = resource.resource_ref();
        let _lock = self.storage.inner.writes.lock().await;

        if self.find(&reference.namespace, &reference.name).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                kind: T::KIND,
                reference,
            });
        }

        resource.metadata_mut().resource_version = "1".to_string();
        let path = self.path(&reference.namespace, &reference.name, EXTENSIONS[0]);
        self.write(&path, &resource).await?;
        Ok(resource)
    }

    async fn update(&self, mut resource: T) -> Result<T, StorageError> {
        let reference = resource.resource_ref();
        let _lock = self.storage.inner.writes.lock().await;

        let Some((path, stored)) = self.find(&reference.namespace, &reference.name).await? else {
            return Err(StorageError::NotFound {
                kind: T::KIND,
                reference,
            });
        };

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

        // hand-written files have no version yet
        let version = expected.parse::<u64>().unwrap_or(0) + 1;
        resource.metadata_mut().resource_version = version.to_string();
        self.write(&path, &resource).await?;
        Ok(resource)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StorageError> {
        let _lock = self.storage.inner.writes.lock().await;

        let mut removed = false;
        for extension in EXTENSIONS {
            let path = self.path(namespace, name, extension);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => (),
                Err(e) => return Err(io_error(&path, e)),
            }
        }

        if !removed {
            return Err(StorageError::NotFound {
                kind: T::KIND,
                reference: ResourceRef::new(namespace, name),
            });
        }
        self.storage.notify();
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<T, StorageError> {
        match self.find(namespace, name).await? {
            Some((_, resource)) => Ok(resource),
            None => Err(StorageError::NotFound {
                kind: T::KIND,
                reference: ResourceRef::new(namespace, name),
            }),
        }
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<T>, StorageError> {
        Self::list_dir(self.kind_dir(), namespace.map(str::to_string)).await
    }

    async fn watch(&self, namespace: Option<&str>) -> Result<Watcher<T>, StorageError> {
        let dir = self.kind_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        // edits made outside of storage show up through the filesystem
        let storage = self.storage.clone();
        let mut fs_watcher = RecommendedWatcher::new(
            move |event: Result<Event, notify::Error>| match event {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        storage.notify();
                    }
                }
                Err(e) => tracing::warn!(err = %e, "file watch error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| StorageError::Watch(e.to_string()))?;
        fs_watcher
            .watch(&dir, RecursiveMode::Recursive)
            .map_err(|e| StorageError::Watch(e.to_string()))?;

        let namespace = namespace.map(str::to_string);
        Ok(spawn_watch(
            self.storage.inner.changes.subscribe(),
            move || Self::list_dir(dir.clone(), namespace.clone()),
            fs_watcher,
        ))
    }
}
