//! Gantry configuration API.
//!
//! These types describe the routing intent that operators write: [Upstream]s,
//! [VirtualService]s, [UpstreamGroup]s, and the [Secret]s and [Artifact]s
//! they depend on. The control plane reads these, plus the [Endpoint]s it
//! discovers, and writes back a [Report] for every object it translates.
//!
//! The `xds` feature of this crate adds conversions from configuration types
//! to the equivalent Envoy xDS protobufs.
//!
//! [Upstream]: upstream::Upstream
//! [VirtualService]: http::VirtualService
//! [UpstreamGroup]: upstream_group::UpstreamGroup
//! [Secret]: secret::Secret
//! [Artifact]: secret::Artifact
//! [Endpoint]: endpoint::Endpoint
//! [Report]: report::Report

mod error;
pub use error::{Error, ErrorContext};

pub mod endpoint;
pub mod http;
pub mod report;
pub mod secret;
pub mod upstream;
pub mod upstream_group;

mod shared;
pub use shared::{Duration, Metadata, Regex, Resource, ResourceKind, ResourceRef};

#[cfg(feature = "xds")]
pub mod xds;

#[cfg(feature = "xds")]
macro_rules! value_or_default {
    ($value:expr, $default:expr) => {
        $value.as_ref().map(|v| v.value).unwrap_or($default)
    };
}

#[cfg(feature = "xds")]
pub(crate) use value_or_default;
