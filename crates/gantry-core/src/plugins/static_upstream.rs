use std::net::IpAddr;
use std::sync::Arc;

use gantry_api::{
    upstream::{StaticUpstream, Upstream, UpstreamSpec},
    xds::socket_address,
};
use xds_api::pb::envoy::{
    config::{
        cluster::v3::{
            cluster::{ClusterDiscoveryType, DiscoveryType},
            Cluster,
        },
        endpoint::v3 as xds_endpoint,
    },
};

use super::{transport_socket, Capability, Params, Plugin, PluginError, UpstreamPlugin};
use crate::xds::extensions::tls::UpstreamTlsContext;

/// Clusters for upstreams with a fixed list of hosts.
///
/// A cluster is `STATIC` when every host is an IP address and `STRICT_DNS`
/// when any host is a name. Hosts are written inline as the cluster's load
/// assignment.
pub struct StaticPlugin;

impl Plugin for StaticPlugin {
    fn name(&self) -> &'static str {
        "static"
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![Capability::Upstream(self)]
    }
}

impl UpstreamPlugin for StaticPlugin {
    fn process_upstream(
        &self,
        _params: &Params,
        upstream: &Upstream,
        out: &mut Cluster,
    ) -> Result<(), PluginError> {
        let UpstreamSpec::Static(spec) = &upstream.spec else {
            return Ok(());
        };

        if spec.hosts.is_empty() {
            return Err(PluginError::configuration("must have at least one host")
                .with_field("hosts")
                .with_field("spec"));
        }

        let discovery_type = if all_ips(spec) {
            DiscoveryType::Static
        } else {
            DiscoveryType::StrictDns
        };
        out.cluster_discovery_type = Some(ClusterDiscoveryType::Type(discovery_type as i32));

        let lb_endpoints = spec
            .hosts
            .iter()
            .map(|host| xds_endpoint::LbEndpoint {
                host_identifier: Some(xds_endpoint::lb_endpoint::HostIdentifier::Endpoint(
                    xds_endpoint::Endpoint {
                        address: Some(socket_address(&host.addr, host.port as u32)),
                        ..Default::default()
                    },
                )),
                ..Default::default()
            })
            .collect();

        out.load_assignment = Some(xds_endpoint::ClusterLoadAssignment {
            cluster_name: out.name.clone(),
            endpoints: vec![xds_endpoint::LocalityLbEndpoints {
                lb_endpoints,
                ..Default::default()
            }],
            ..Default::default()
        });

        // an explicit ssl_config is handled by the upstream_ssl plugin
        if spec.use_tls && upstream.ssl_config.is_none() {
            let tls = UpstreamTlsContext {
                sni: sni(spec),
                ..Default::default()
            };
            out.transport_socket = Some(transport_socket(&tls)?);
        }

        Ok(())
    }
}

fn all_ips(spec: &StaticUpstream) -> bool {
    spec.hosts.iter().all(|h| h.addr.parse::<IpAddr>().is_ok())
}

// the first host with an explicit SNI name wins. without one, fall back to
// the first hostname. IP addresses are never valid SNI.
fn sni(spec: &StaticUpstream) -> String {
    if let Some(sni) = spec.hosts.iter().find_map(|h| h.sni.as_ref()) {
        return sni.clone();
    }

    spec.hosts
        .iter()
        .find(|h| h.addr.parse::<IpAddr>().is_err())
        .map(|h| h.addr.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::settings::Settings;
    use crate::snapshot::InputSnapshot;
    use crate::test::static_upstream;
    use gantry_api::upstream::Host;

    fn process(upstream: &Upstream) -> Result<Cluster, PluginError> {
        let snapshot = InputSnapshot::default();
        let settings = Settings::default();
        let params = Params {
            role: "ingress",
            snapshot: &snapshot,
            settings: &settings,
        };

        let mut cluster = Cluster {
            name: "u1_ns".to_string(),
            ..Default::default()
        };
        StaticPlugin.process_upstream(&params, upstream, &mut cluster)?;
        Ok(cluster)
    }

    #[test]
    fn test_static_cluster() {
        let cluster = process(&static_upstream("ns", "u1", "1.2.3.4", 80)).unwrap();

        assert_eq!(
            cluster.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::Static as i32))
        );
        let cla = cluster.load_assignment.unwrap();
        assert_eq!(cla.cluster_name, "u1_ns");
        assert_eq!(cla.endpoints[0].lb_endpoints.len(), 1);
        assert!(cluster.transport_socket.is_none());
    }

    #[test]
    fn test_dns_cluster_with_tls() {
        let mut upstream = static_upstream("ns", "u1", "1.2.3.4", 443);
        if let UpstreamSpec::Static(spec) = &mut upstream.spec {
            spec.hosts.push(Host::new("api.example.com", 443));
            spec.use_tls = true;
        }

        let cluster = process(&upstream).unwrap();
        assert_eq!(
            cluster.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32))
        );

        let Some(socket) = cluster.transport_socket else {
            panic!("expected a tls transport socket");
        };
        let Some(xds_api::pb::envoy::config::core::v3::transport_socket::ConfigType::TypedConfig(
            any,
        )) = socket.config_type
        else {
            panic!("missing typed config");
        };
        let tls: UpstreamTlsContext = any.to_msg().unwrap();
        assert_eq!(tls.sni, "api.example.com");
    }

    #[test]
    fn test_no_hosts() {
        let mut upstream = static_upstream("ns", "u1", "1.2.3.4", 80);
        upstream.spec = UpstreamSpec::Static(StaticUpstream::default());

        let err = process(&upstream).unwrap_err();
        assert_eq!(err.error.path(), "spec.hosts");
    }

    #[test]
    fn test_ignores_other_upstreams() {
        let mut upstream = static_upstream("ns", "u1", "1.2.3.4", 80);
        upstream.spec = UpstreamSpec::Consul(Default::default());

        let cluster = process(&upstream).unwrap();
        assert!(cluster.cluster_discovery_type.is_none());
    }
}
