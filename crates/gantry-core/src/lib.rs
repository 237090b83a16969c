//! The Gantry control plane.
//!
//! Gantry reads Upstreams, UpstreamGroups, and VirtualServices from a
//! [Storage] backend, translates them into Envoy configuration once per proxy
//! role, and serves the result to proxies over the xDS APIs.
//!
//! The moving parts:
//!
//! - The [SnapshotEmitter] watches storage and every endpoint discovery
//!   plugin, and emits a consistent [InputSnapshot] whenever anything changes.
//! - The [EventLoop] translates each snapshot with a [Translator], writes
//!   reports back to storage with a [Reporter], and installs the resulting
//!   xDS in a [SnapshotCache].
//! - The [XdsServer] serves the cache over ADS and the per-type discovery
//!   services. The [AdminServer] exposes the latest input and xDS snapshots
//!   for debugging.
//!
//! Translation is extended with [plugins]. Every built-in plugin is available
//! through [Registry::with_defaults].

mod error;
pub use crate::error::{CatalogError, Error, Result, StorageError};

pub(crate) mod hash;

pub mod admin;
pub mod discovery;
pub mod emitter;
pub mod event_loop;
pub mod plugins;
pub mod reporter;
pub mod settings;
pub mod snapshot;
pub mod storage;
pub mod translator;
pub mod xds;

pub use admin::{AdminServer, LatestInput};
pub use emitter::{EmitterChannels, SnapshotEmitter};
pub use event_loop::EventLoop;
pub use plugins::Registry;
pub use reporter::Reporter;
pub use settings::Settings;
pub use snapshot::InputSnapshot;
pub use storage::Storage;
pub use translator::Translator;
pub use xds::{SnapshotCache, XdsServer, XdsSnapshot};
