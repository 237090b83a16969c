//! The plugin contract.
//!
//! A [Plugin] declares the set of [Capability]s it implements once, when it's
//! added to a [Registry]. The translator never asks a plugin what it can do at
//! translation time: it walks the registry's typed capability lists in
//! registration order.
//!
//! Every capability callback gets [Params] describing the translation in
//! progress, an input fragment and an output fragment to mutate. Callbacks
//! fail a single object by returning a [PluginError].
//!
//! HTTP and network filters contributed by plugins carry a [FilterStage] that
//! decides their position in the final filter chain. See [sort_http_filters].

use std::collections::BTreeSet;
use std::sync::Arc;

use gantry_api::{
    endpoint::Endpoint,
    http::{Route, VirtualService, WeightedDestination},
    upstream::Upstream,
    ResourceRef,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use xds_api::pb::envoy::{
    config::{
        cluster::v3::Cluster,
        endpoint::v3::ClusterLoadAssignment,
        listener::v3::{self as xds_listener, Listener},
        route::v3::{self as xds_route, RouteConfiguration},
    },
    extensions::filters::network::http_connection_manager::v3 as xds_http,
};

use crate::error::{CatalogError, Error};
use crate::settings::Settings;
use crate::snapshot::{Config, InputSnapshot};

mod cluster_options;
mod consul;
mod kube;
mod route_options;
mod ssl;
mod static_upstream;

pub use cluster_options::ClusterOptionsPlugin;
pub use consul::ConsulPlugin;
pub use kube::KubePlugin;
pub use route_options::RouteOptionsPlugin;
pub use ssl::UpstreamSslPlugin;
pub use static_upstream::StaticPlugin;

pub(crate) use ssl::{downstream_tls_context, transport_socket};

/// The prefix every generated resource name must start with.
pub const GENERATED_PREFIX: &str = "generated~";

/// Parameters passed to [Plugin::init].
#[derive(Debug, Clone, Copy)]
pub struct InitParams<'a> {
    pub settings: &'a Settings,
}

/// Parameters passed to every capability callback.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    /// The role being translated.
    pub role: &'a str,

    /// The role's projection of the input snapshot.
    pub snapshot: &'a InputSnapshot,

    pub settings: &'a Settings,
}

/// A listener the translator is building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: ListenerProtocol,

    /// The VirtualServices served on this listener.
    pub virtual_services: Vec<ResourceRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListenerProtocol {
    Http,
    Https,
    Tcp,
}

impl ListenerProtocol {
    pub fn is_http(&self) -> bool {
        matches!(self, ListenerProtocol::Http | ListenerProtocol::Https)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginErrorKind {
    /// The object can't be translated and must be rejected.
    Configuration,

    /// Something is off, but the object can still be translated.
    Warning,
}

/// An error from a plugin callback, scoped to the object being processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct PluginError {
    pub kind: PluginErrorKind,
    pub error: gantry_api::Error,
}

impl PluginError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self {
            kind: PluginErrorKind::Configuration,
            error: gantry_api::Error::new(message),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: PluginErrorKind::Warning,
            error: gantry_api::Error::new(message),
        }
    }

    pub fn is_warning(&self) -> bool {
        self.kind == PluginErrorKind::Warning
    }

    pub fn with_field(mut self, field: &'static str) -> Self {
        self.error = self.error.with_field(field);
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.error = self.error.with_index(index);
        self
    }

    pub(crate) fn with_field_index(self, field: &'static str, index: usize) -> Self {
        self.with_index(index).with_field(field)
    }
}

impl From<gantry_api::Error> for PluginError {
    fn from(error: gantry_api::Error) -> Self {
        Self {
            kind: PluginErrorKind::Configuration,
            error,
        }
    }
}

/// The well known stages of an HTTP filter chain, in the order requests pass
/// through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WellKnownStage {
    Fault,
    AuthN,
    AuthZ,
    RateLimit,
    /// The request passed every check and will be forwarded upstream.
    Accepted,
    /// Add auth for the upstream.
    OutAuth,
    /// The request is going upstream.
    Route,
}

/// The position of a filter relative to a [WellKnownStage].
///
/// Stages order by `relative_to` and then by `weight`. Filters with equal
/// stages keep the order they were contributed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterStage {
    pub relative_to: WellKnownStage,
    pub weight: i32,
}

impl FilterStage {
    pub const fn during(stage: WellKnownStage) -> Self {
        Self {
            relative_to: stage,
            weight: 0,
        }
    }

    pub const fn before(stage: WellKnownStage) -> Self {
        Self {
            relative_to: stage,
            weight: -1,
        }
    }

    pub const fn after(stage: WellKnownStage) -> Self {
        Self {
            relative_to: stage,
            weight: 1,
        }
    }

    /// The last position in a stage. Filters configured per route, virtual
    /// host or listener go here.
    pub const fn last_in(stage: WellKnownStage) -> Self {
        Self {
            relative_to: stage,
            weight: i32::MAX,
        }
    }
}

/// An HTTP filter and the stage it belongs in.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedHttpFilter {
    pub filter: xds_http::HttpFilter,
    pub stage: FilterStage,

    /// Drop this filter when the `remove_unused_filters` feature flag is on
    /// and no route or virtual host configures it.
    pub remove_if_unused: bool,
}

impl StagedHttpFilter {
    pub fn new(filter: xds_http::HttpFilter, stage: FilterStage) -> Self {
        Self {
            filter,
            stage,
            remove_if_unused: false,
        }
    }
}

/// A network filter and the stage it belongs in. Network filters are placed
/// before the terminal HTTP connection manager or TCP proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedNetworkFilter {
    pub filter: xds_listener::Filter,
    pub stage: FilterStage,
}

/// Sort filters by stage. The sort is stable.
pub fn sort_http_filters(mut filters: Vec<StagedHttpFilter>) -> Vec<StagedHttpFilter> {
    filters.sort_by_key(|f| f.stage);
    filters
}

/// Sort network filters by stage. The sort is stable.
pub fn sort_network_filters(mut filters: Vec<StagedNetworkFilter>) -> Vec<xds_listener::Filter> {
    filters.sort_by_key(|f| f.stage);
    filters.into_iter().map(|f| f.filter).collect()
}

/// Something the current configuration needs from the secret or artifact
/// stores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dependency {
    Secret(ResourceRef),
    Artifact(ResourceRef),
}

/// The xDS resources a [GeneratedResourcesPlugin] sees and produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XdsResources {
    pub clusters: Vec<Cluster>,
    pub endpoints: Vec<ClusterLoadAssignment>,
    pub route_configurations: Vec<RouteConfiguration>,
    pub listeners: Vec<Listener>,
}

/// A live endpoint watch started by an [EndpointDiscoveryPlugin].
///
/// Both channels close when the watch stops.
#[derive(Debug)]
pub struct EndpointWatch {
    /// Every discovered endpoint, sorted by name, sent on every change.
    pub endpoints: mpsc::Receiver<Vec<Endpoint>>,
    pub errors: mpsc::Receiver<CatalogError>,
}

pub trait UpstreamPlugin: Send + Sync {
    fn process_upstream(
        &self,
        params: &Params,
        upstream: &Upstream,
        out: &mut Cluster,
    ) -> Result<(), PluginError>;
}

pub trait RoutePlugin: Send + Sync {
    fn process_route(
        &self,
        params: &Params,
        virtual_service: &VirtualService,
        route: &Route,
        out: &mut xds_route::Route,
    ) -> Result<(), PluginError>;
}

pub trait VirtualHostPlugin: Send + Sync {
    fn process_virtual_host(
        &self,
        params: &Params,
        virtual_service: &VirtualService,
        out: &mut xds_route::VirtualHost,
    ) -> Result<(), PluginError>;
}

pub trait ListenerPlugin: Send + Sync {
    fn process_listener(
        &self,
        params: &Params,
        listener: &ListenerSpec,
        out: &mut Listener,
    ) -> Result<(), PluginError>;
}

/// Mutates the HTTP connection manager of an HTTP listener.
pub trait HttpConnectionManagerPlugin: Send + Sync {
    fn process_hcm(
        &self,
        params: &Params,
        listener: &ListenerSpec,
        out: &mut xds_http::HttpConnectionManager,
    ) -> Result<(), PluginError>;
}

pub trait WeightedDestinationPlugin: Send + Sync {
    fn process_weighted_destination(
        &self,
        params: &Params,
        destination: &WeightedDestination,
        out: &mut xds_route::weighted_cluster::ClusterWeight,
    ) -> Result<(), PluginError>;
}

pub trait HttpFilterPlugin: Send + Sync {
    fn http_filters(
        &self,
        params: &Params,
        listener: &ListenerSpec,
    ) -> Result<Vec<StagedHttpFilter>, PluginError>;
}

pub trait NetworkFilterPlugin: Send + Sync {
    fn network_filters(
        &self,
        params: &Params,
        listener: &ListenerSpec,
    ) -> Result<Vec<StagedNetworkFilter>, PluginError>;
}

pub trait GeneratedResourcesPlugin: Send + Sync {
    /// Generate extra resources given everything translated so far. Every
    /// generated resource name must start with [GENERATED_PREFIX].
    fn generated_resources(
        &self,
        params: &Params,
        input: &XdsResources,
    ) -> Result<XdsResources, PluginError>;
}

pub trait EndpointDiscoveryPlugin: Send + Sync {
    /// Returns `true` if this plugin discovers endpoints for `upstream`.
    fn discovers(&self, upstream: &Upstream) -> bool;

    /// Start watching endpoints for `upstreams` until `cancel` is cancelled.
    fn watch_endpoints(
        &self,
        write_namespace: &str,
        upstreams: Vec<Upstream>,
        cancel: CancellationToken,
    ) -> Result<EndpointWatch, Error>;
}

pub trait DependenciesPlugin: Send + Sync {
    /// The secrets and artifacts `config` needs.
    fn dependencies(&self, config: &Config) -> Vec<Dependency>;
}

/// A single capability of a plugin.
#[derive(Clone)]
pub enum Capability {
    Upstream(Arc<dyn UpstreamPlugin>),
    Route(Arc<dyn RoutePlugin>),
    VirtualHost(Arc<dyn VirtualHostPlugin>),
    Listener(Arc<dyn ListenerPlugin>),
    HttpConnectionManager(Arc<dyn HttpConnectionManagerPlugin>),
    WeightedDestination(Arc<dyn WeightedDestinationPlugin>),
    HttpFilters(Arc<dyn HttpFilterPlugin>),
    NetworkFilters(Arc<dyn NetworkFilterPlugin>),
    EndpointDiscovery(Arc<dyn EndpointDiscoveryPlugin>),
    GeneratedResources(Arc<dyn GeneratedResourcesPlugin>),
    Dependencies(Arc<dyn DependenciesPlugin>),
}

pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Called once, before the plugin is added to a registry.
    fn init(&mut self, _params: &InitParams) -> Result<(), PluginError> {
        Ok(())
    }

    /// Every capability this plugin implements.
    fn capabilities(self: Arc<Self>) -> Vec<Capability>;
}

/// An explicit, immutable set of initialized plugins, grouped by capability.
#[derive(Default, Clone)]
pub struct Registry {
    names: Vec<&'static str>,
    pub(crate) upstream: Vec<Arc<dyn UpstreamPlugin>>,
    pub(crate) route: Vec<Arc<dyn RoutePlugin>>,
    pub(crate) virtual_host: Vec<Arc<dyn VirtualHostPlugin>>,
    pub(crate) listener: Vec<Arc<dyn ListenerPlugin>>,
    pub(crate) hcm: Vec<Arc<dyn HttpConnectionManagerPlugin>>,
    pub(crate) weighted_destination: Vec<Arc<dyn WeightedDestinationPlugin>>,
    pub(crate) http_filters: Vec<Arc<dyn HttpFilterPlugin>>,
    pub(crate) network_filters: Vec<Arc<dyn NetworkFilterPlugin>>,
    pub(crate) endpoint_discovery: Vec<Arc<dyn EndpointDiscoveryPlugin>>,
    pub(crate) generated_resources: Vec<Arc<dyn GeneratedResourcesPlugin>>,
    pub(crate) dependencies: Vec<Arc<dyn DependenciesPlugin>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.names)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Initialize every plugin and build a registry. Plugins are consulted in
    /// the order they're passed in.
    pub fn new(plugins: Vec<Box<dyn Plugin>>, params: &InitParams) -> crate::Result<Self> {
        let mut registry = Registry::default();

        for mut plugin in plugins {
            plugin.init(params).map_err(|e| Error::PluginInit {
                plugin: plugin.name(),
                message: e.to_string(),
            })?;

            let plugin: Arc<dyn Plugin> = Arc::from(plugin);
            registry.names.push(plugin.name());
            for capability in plugin.capabilities() {
                registry.add(capability);
            }
        }

        Ok(registry)
    }

    /// A registry with every built-in plugin.
    pub fn with_defaults(settings: &Settings) -> crate::Result<Self> {
        Self::new(default_plugins(), &InitParams { settings })
    }

    fn add(&mut self, capability: Capability) {
        match capability {
            Capability::Upstream(p) => self.upstream.push(p),
            Capability::Route(p) => self.route.push(p),
            Capability::VirtualHost(p) => self.virtual_host.push(p),
            Capability::Listener(p) => self.listener.push(p),
            Capability::HttpConnectionManager(p) => self.hcm.push(p),
            Capability::WeightedDestination(p) => self.weighted_destination.push(p),
            Capability::HttpFilters(p) => self.http_filters.push(p),
            Capability::NetworkFilters(p) => self.network_filters.push(p),
            Capability::EndpointDiscovery(p) => self.endpoint_discovery.push(p),
            Capability::GeneratedResources(p) => self.generated_resources.push(p),
            Capability::Dependencies(p) => self.dependencies.push(p),
        }
    }

    /// The names of every registered plugin, in registration order.
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    /// Every secret and artifact `config` depends on.
    pub fn dependencies(&self, config: &Config) -> BTreeSet<Dependency> {
        self.dependencies
            .iter()
            .flat_map(|p| p.dependencies(config))
            .collect()
    }

    pub fn endpoint_discovery(&self) -> &[Arc<dyn EndpointDiscoveryPlugin>] {
        &self.endpoint_discovery
    }
}

/// The built-in plugins, in the order the translator runs them.
pub fn default_plugins() -> Vec<Box<dyn Plugin>> {
    vec![
        Box::new(StaticPlugin),
        Box::new(ConsulPlugin::default()),
        Box::new(KubePlugin),
        Box::new(UpstreamSslPlugin),
        Box::new(ClusterOptionsPlugin),
        Box::new(RouteOptionsPlugin),
    ]
}
