use std::path::PathBuf;

use gantry_api::{ResourceKind, ResourceRef};

/// A `Result` alias where the `Err` case is `gantry_core::Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("failed to initialize plugin {plugin}: {message}")]
    PluginInit {
        plugin: &'static str,
        message: String,
    },

    #[error("xds server failed: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("failed to encode xds resource: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` if retrying the operation that caused this error might
    /// succeed.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Storage(e) => e.is_temporary(),
            Error::Catalog(_) => true,
            _ => false,
        }
    }
}

/// An error from the storage port.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{kind} {reference} already exists")]
    AlreadyExists {
        kind: ResourceKind,
        reference: ResourceRef,
    },

    #[error("{kind} {reference} not found")]
    NotFound {
        kind: ResourceKind,
        reference: ResourceRef,
    },

    #[error(
        "{kind} {reference} is outdated: update has resource version {found:?} but the stored version is {expected:?}"
    )]
    Outdated {
        kind: ResourceKind,
        reference: ResourceRef,
        expected: String,
        found: String,
    },

    #[error("invalid {kind}: {message}")]
    Serialization { kind: ResourceKind, message: String },

    #[error("storage io failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watch failed: {0}")]
    Watch(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    fn is_temporary(&self) -> bool {
        matches!(self, StorageError::Io { .. } | StorageError::Watch(_))
    }
}

/// An error talking to a service catalog or resolving catalog addresses.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("dns lookup for {host} failed: {message}")]
    Dns { host: String, message: String },

    #[error("{0}")]
    Other(String),
}
