use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use gantry_api::upstream::{ConsulUpstream, Upstream};
use tokio_util::sync::CancellationToken;
use xds_api::pb::envoy::config::cluster::v3::{
    cluster::{
        lb_subset_config::{LbSubsetFallbackPolicy, LbSubsetSelector},
        ClusterDiscoveryType, DiscoveryType, LbSubsetConfig,
    },
    Cluster,
};

use super::{
    kube::eds_cluster_config, Capability, EndpointDiscoveryPlugin, EndpointWatch, InitParams,
    Params, Plugin, PluginError, UpstreamPlugin,
};
use crate::discovery::{
    ConsulCatalog, ConsulClient, DnsResolver, EndpointWatcher, SystemResolver, DC_LABEL_PREFIX,
    TAG_LABEL_PREFIX,
};
use crate::error::Error;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// EDS clusters for upstreams backed by a Consul service, and endpoint
/// discovery for them.
///
/// Endpoint discovery is only available when a catalog is configured, either
/// through the `consul` settings or with [ConsulPlugin::with_catalog].
pub struct ConsulPlugin {
    catalog: Option<Arc<dyn ConsulCatalog>>,
    resolver: Option<Arc<dyn DnsResolver>>,
    poll_interval: Duration,
}

impl Default for ConsulPlugin {
    fn default() -> Self {
        Self {
            catalog: None,
            resolver: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ConsulPlugin {
    /// Use an existing catalog client instead of building one from settings.
    pub fn with_catalog(
        catalog: Arc<dyn ConsulCatalog>,
        resolver: Option<Arc<dyn DnsResolver>>,
    ) -> Self {
        Self {
            catalog: Some(catalog),
            resolver,
            ..Default::default()
        }
    }
}

impl Plugin for ConsulPlugin {
    fn name(&self) -> &'static str {
        "consul"
    }

    fn init(&mut self, params: &InitParams) -> Result<(), PluginError> {
        self.poll_interval = *params.settings.endpoint_poll_interval;

        let Some(consul) = &params.settings.consul else {
            return Ok(());
        };
        consul
            .validate()
            .map_err(|e| PluginError::configuration(e.to_string()))?;

        if self.catalog.is_none() {
            let client = ConsulClient::new(consul)
                .map_err(|e| PluginError::configuration(e.to_string()))?;
            self.catalog = Some(Arc::new(client));
        }
        if self.resolver.is_none() {
            self.resolver = Some(Arc::new(SystemResolver));
        }

        Ok(())
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        match self.catalog {
            Some(_) => vec![
                Capability::Upstream(self.clone()),
                Capability::EndpointDiscovery(self),
            ],
            None => vec![Capability::Upstream(self)],
        }
    }
}

impl UpstreamPlugin for ConsulPlugin {
    fn process_upstream(
        &self,
        _params: &Params,
        upstream: &Upstream,
        out: &mut Cluster,
    ) -> Result<(), PluginError> {
        let Some(spec) = upstream.consul() else {
            return Ok(());
        };

        if spec.service_name.is_empty() {
            return Err(PluginError::configuration("service_name is required")
                .with_field("service_name")
                .with_field("spec"));
        }

        out.cluster_discovery_type = Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
        out.eds_cluster_config = Some(eds_cluster_config());
        out.lb_subset_config = lb_subset_config(spec);
        Ok(())
    }
}

/// Let routes select endpoints by the tag and datacenter labels that
/// discovery puts on every endpoint.
fn lb_subset_config(spec: &ConsulUpstream) -> Option<LbSubsetConfig> {
    let keys: BTreeSet<String> = spec
        .service_tags
        .iter()
        .map(|t| format!("{TAG_LABEL_PREFIX}{t}"))
        .chain(
            spec.data_centers
                .iter()
                .map(|dc| format!("{DC_LABEL_PREFIX}{dc}")),
        )
        .collect();

    if keys.is_empty() {
        return None;
    }

    Some(LbSubsetConfig {
        fallback_policy: LbSubsetFallbackPolicy::AnyEndpoint as i32,
        subset_selectors: vec![LbSubsetSelector {
            keys: keys.into_iter().collect(),
            ..Default::default()
        }],
        ..Default::default()
    })
}

impl EndpointDiscoveryPlugin for ConsulPlugin {
    fn discovers(&self, upstream: &Upstream) -> bool {
        upstream.consul().is_some()
    }

    fn watch_endpoints(
        &self,
        write_namespace: &str,
        upstreams: Vec<Upstream>,
        cancel: CancellationToken,
    ) -> Result<EndpointWatch, Error> {
        let Some(catalog) = &self.catalog else {
            return Err(Error::Settings(
                "consul endpoint discovery needs a consul catalog".to_string(),
            ));
        };

        let watcher = EndpointWatcher {
            catalog: catalog.clone(),
            resolver: self.resolver.clone(),
            poll_interval: self.poll_interval,
        };
        Ok(watcher.watch(write_namespace, upstreams, cancel))
    }
}
