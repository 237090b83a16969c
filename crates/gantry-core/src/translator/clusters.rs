use gantry_api::{
    xds::{socket_address, MAX_WINDOW_SIZE, MIN_WINDOW_SIZE},
    Duration, Resource, ResourceKind,
};
use xds_api::pb::envoy::config::{
    cluster::v3::Cluster,
    endpoint::v3::{self as xds_endpoint, ClusterLoadAssignment},
};

use super::{cluster_name, lb_metadata, Reports};
use crate::plugins::{Params, PluginError, Registry};
use crate::snapshot::InputSnapshot;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a cluster for every Upstream.
///
/// Upstream plugins run in registration order. Any configuration error
/// rejects the Upstream and leaves its cluster out, but every plugin still
/// runs so that the report has every problem at once.
pub(super) fn translate_clusters(
    registry: &Registry,
    params: &Params,
    reports: &mut Reports,
) -> Vec<Cluster> {
    let mut clusters = Vec::with_capacity(params.snapshot.config.upstreams.len());

    for upstream in &params.snapshot.config.upstreams {
        let upstream_ref = upstream.resource_ref();
        let mut cluster = Cluster {
            name: cluster_name(&upstream_ref),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT.to_xds()),
            ..Default::default()
        };

        let mut rejected = false;
        for plugin in &registry.upstream {
            if let Err(e) = plugin.process_upstream(params, upstream, &mut cluster) {
                rejected |= reports.plugin_error(ResourceKind::Upstream, &upstream_ref, e);
            }
        }

        if cluster.cluster_discovery_type.is_none() {
            rejected = true;
            reports.reject(
                ResourceKind::Upstream,
                &upstream_ref,
                "no plugin can translate this upstream type",
            );
        }

        if let Err(e) = validate_protocol_options(&cluster) {
            rejected = true;
            reports.reject(ResourceKind::Upstream, &upstream_ref, e);
        }

        if !rejected {
            clusters.push(cluster);
        }
    }

    clusters
}

// plugins are free to set protocol options however they like, so check the
// final cluster rather than any single plugin's input.
#[allow(deprecated)]
fn validate_protocol_options(cluster: &Cluster) -> Result<(), PluginError> {
    let Some(http2) = &cluster.http2_protocol_options else {
        return Ok(());
    };

    let windows = [
        ("initial_stream_window_size", &http2.initial_stream_window_size),
        ("initial_connection_window_size", &http2.initial_connection_window_size),
    ];
    for (field, size) in windows {
        let Some(size) = size.as_ref().map(|s| s.value) else {
            continue;
        };
        if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&size) {
            return Err(PluginError::configuration(format!(
                "window size {size} must be between {MIN_WINDOW_SIZE} and {MAX_WINDOW_SIZE}"
            ))
            .with_field(field)
            .with_field("http2_protocol_options"));
        }
    }

    Ok(())
}

/// Build a load assignment for every translated cluster whose Upstream uses
/// endpoint discovery.
///
/// An assignment is produced even when there are no endpoints, so that the
/// cluster finishes warming and fails fast instead of hanging.
pub(super) fn translate_endpoints(
    snapshot: &InputSnapshot,
    clusters: &[Cluster],
) -> Vec<ClusterLoadAssignment> {
    let has_cluster = |name: &str| clusters.iter().any(|c| c.name == name);

    snapshot
        .config
        .upstreams
        .iter()
        .filter(|u| u.uses_endpoint_discovery())
        .filter_map(|upstream| {
            let upstream_ref = upstream.resource_ref();
            let name = cluster_name(&upstream_ref);
            if !has_cluster(&name) {
                return None;
            }

            let lb_endpoints = snapshot
                .endpoints_for(&upstream_ref)
                .map(|endpoint| xds_endpoint::LbEndpoint {
                    metadata: lb_metadata(&endpoint.metadata.labels),
                    host_identifier: Some(xds_endpoint::lb_endpoint::HostIdentifier::Endpoint(
                        xds_endpoint::Endpoint {
                            address: Some(socket_address(&endpoint.address, endpoint.port)),
                            ..Default::default()
                        },
                    )),
                    ..Default::default()
                })
                .collect();

            Some(ClusterLoadAssignment {
                cluster_name: name,
                endpoints: vec![xds_endpoint::LocalityLbEndpoints {
                    lb_endpoints,
                    ..Default::default()
                }],
                ..Default::default()
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::discovery::test::consul_upstream;
    use crate::settings::Settings;
    use crate::snapshot::Config;
    use crate::test::static_upstream;
    use gantry_api::{endpoint::Endpoint, Metadata, ResourceRef};
    use xds_api::pb::envoy::config::cluster::v3::cluster::{ClusterDiscoveryType, DiscoveryType};

    fn endpoint(name: &str, address: &str, upstream: &ResourceRef) -> Endpoint {
        let mut metadata = Metadata::new("gantry-system", name);
        metadata.labels.insert("dc:dc1".to_string(), "1".to_string());
        Endpoint {
            metadata,
            upstreams: vec![upstream.clone()],
            address: address.to_string(),
            port: 8080,
        }
    }

    fn translate(snapshot: &InputSnapshot) -> (Vec<Cluster>, Reports) {
        let settings = Settings::default();
        let registry = Registry::with_defaults(&settings).unwrap();
        let params = Params {
            role: "ingress",
            snapshot,
            settings: &settings,
        };
        let mut reports = Reports::default();
        let clusters = translate_clusters(&registry, &params, &mut reports);
        (clusters, reports)
    }

    #[test]
    fn test_cluster_names() {
        let snapshot = InputSnapshot::new(
            Config {
                upstreams: vec![
                    static_upstream("ns", "u1", "1.2.3.4", 80),
                    static_upstream("other", "u1", "1.2.3.4", 80),
                ],
                ..Default::default()
            },
            vec![],
            vec![],
            vec![],
        );

        let (clusters, _) = translate(&snapshot);
        let names: Vec<_> = clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["u1_ns", "u1_other"]);
        assert!(clusters.iter().all(|c| c.connect_timeout.is_some()));
    }

    #[test]
    fn test_eds_assignments() {
        let upstream = consul_upstream("gantry-system", "web", "web");
        let upstream_ref = upstream.resource_ref();
        let snapshot = InputSnapshot::new(
            Config {
                upstreams: vec![upstream, static_upstream("ns", "static", "1.2.3.4", 80)],
                ..Default::default()
            },
            vec![],
            vec![],
            vec![
                endpoint("web-1", "10.0.0.1", &upstream_ref),
                endpoint("web-2", "10.0.0.2", &upstream_ref),
                endpoint("other", "10.0.0.3", &ResourceRef::new("ns", "other")),
            ],
        );

        let (clusters, reports) = translate(&snapshot);
        assert!(!reports.is_rejected(ResourceKind::Upstream, &upstream_ref));
        let web = clusters.iter().find(|c| c.name == "web_gantry-system").unwrap();
        assert_eq!(
            web.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32))
        );

        // static upstreams carry their own assignment
        let assignments = translate_endpoints(&snapshot, &clusters);
        assert_eq!(assignments.len(), 1);
        let assignment = &assignments[0];
        assert_eq!(assignment.cluster_name, "web_gantry-system");
        assert_eq!(assignment.endpoints.len(), 1);
        assert!(assignment.endpoints[0].locality.is_none());

        let lb_endpoints = &assignment.endpoints[0].lb_endpoints;
        assert_eq!(lb_endpoints.len(), 2);
        let metadata = lb_endpoints[0].metadata.as_ref().unwrap();
        let labels = &metadata.filter_metadata[super::super::ENVOY_LB];
        assert!(labels.fields.contains_key("dc:dc1"));
    }

    #[test]
    fn test_no_endpoints_still_assigned() {
        let upstream = consul_upstream("gantry-system", "web", "web");
        let snapshot = InputSnapshot::new(
            Config {
                upstreams: vec![upstream],
                ..Default::default()
            },
            vec![],
            vec![],
            vec![],
        );

        let (clusters, _) = translate(&snapshot);
        let assignments = translate_endpoints(&snapshot, &clusters);
        assert_eq!(assignments.len(), 1);
        assert!(assignments[0].endpoints[0].lb_endpoints.is_empty());
    }

    #[test]
    fn test_window_size_validation() {
        let mut cluster = Cluster::default();
        assert!(validate_protocol_options(&cluster).is_ok());

        #[allow(deprecated)]
        {
            cluster.http2_protocol_options = Some(Default::default());
            cluster
                .http2_protocol_options
                .as_mut()
                .unwrap()
                .initial_connection_window_size = Some(MAX_WINDOW_SIZE.into());
            assert!(validate_protocol_options(&cluster).is_ok());

            cluster
                .http2_protocol_options
                .as_mut()
                .unwrap()
                .initial_stream_window_size = Some(1024.into());
        }
        let err = validate_protocol_options(&cluster).unwrap_err();
        assert_eq!(
            err.error.path(),
            "http2_protocol_options.initial_stream_window_size"
        );
    }
}
