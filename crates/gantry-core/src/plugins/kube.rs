use std::sync::Arc;

use gantry_api::{
    upstream::{Upstream, UpstreamSpec},
    xds::ads_config_source,
};
use xds_api::pb::envoy::config::cluster::v3::{
    cluster::{ClusterDiscoveryType, DiscoveryType, EdsClusterConfig},
    Cluster,
};

use super::{Capability, Params, Plugin, PluginError, UpstreamPlugin};

/// EDS clusters for upstreams that point at a Kubernetes Service.
pub struct KubePlugin;

impl Plugin for KubePlugin {
    fn name(&self) -> &'static str {
        "kube"
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![Capability::Upstream(self)]
    }
}

impl UpstreamPlugin for KubePlugin {
    fn process_upstream(
        &self,
        _params: &Params,
        upstream: &Upstream,
        out: &mut Cluster,
    ) -> Result<(), PluginError> {
        let UpstreamSpec::Kube(spec) = &upstream.spec else {
            return Ok(());
        };

        if spec.service_name.is_empty() {
            return Err(PluginError::configuration("service_name is required")
                .with_field("service_name")
                .with_field("spec"));
        }
        if spec.service_port == 0 {
            return Err(PluginError::configuration("service_port must be non-zero")
                .with_field("service_port")
                .with_field("spec"));
        }

        out.cluster_discovery_type = Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
        out.eds_cluster_config = Some(eds_cluster_config());
        Ok(())
    }
}

/// EDS over the proxy's existing ADS stream.
pub(super) fn eds_cluster_config() -> EdsClusterConfig {
    EdsClusterConfig {
        eds_config: Some(ads_config_source()),
        service_name: String::new(),
    }
}
