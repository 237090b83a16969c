use std::sync::Arc;

use gantry_api::{upstream::Upstream, ErrorContext};
use xds_api::pb::envoy::config::cluster::v3::Cluster;

use super::{Capability, Params, Plugin, PluginError, UpstreamPlugin};

/// Per-upstream cluster tuning: load balancing, health checks, connection
/// limits and HTTP/2.
pub struct ClusterOptionsPlugin;

impl Plugin for ClusterOptionsPlugin {
    fn name(&self) -> &'static str {
        "cluster_options"
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![Capability::Upstream(self)]
    }
}

impl UpstreamPlugin for ClusterOptionsPlugin {
    // deprecated cluster fields are still the only way to set these without
    // typed extension protocol options
    #[allow(deprecated)]
    fn process_upstream(
        &self,
        _params: &Params,
        upstream: &Upstream,
        out: &mut Cluster,
    ) -> Result<(), PluginError> {
        if let Some(lb) = &upstream.load_balancer {
            let (policy, config) = lb.to_xds();
            out.lb_policy = policy as i32;
            out.lb_config = config;
        }

        if !upstream.health_checks.is_empty() {
            out.health_checks = upstream.health_checks.iter().map(|h| h.to_xds()).collect();
        }

        if let Some(circuit_breakers) = &upstream.circuit_breakers {
            out.circuit_breakers = Some(circuit_breakers.to_xds());
        }

        if let Some(conn) = &upstream.connection_config {
            if let Some(timeout) = &conn.connect_timeout {
                if timeout.is_zero() {
                    return Err(PluginError::configuration("connect_timeout must be positive")
                        .with_field("connect_timeout")
                        .with_field("connection_config"));
                }
                out.connect_timeout = Some(timeout.to_xds());
            }
            if let Some(max) = conn.max_requests_per_connection {
                out.max_requests_per_connection = Some(max.into());
            }
        }

        if let Some(http2) = &upstream.http2_protocol_options {
            let options = http2
                .to_xds()
                .with_field("http2_protocol_options")?;
            out.http2_protocol_options = Some(options);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::settings::Settings;
    use crate::snapshot::InputSnapshot;
    use crate::test::static_upstream;
    use gantry_api::upstream::{
        CircuitBreakers, ConnectionConfig, HealthCheck, HealthCheckKind, Http2ProtocolOptions,
        LoadBalancer,
    };
    use gantry_api::Duration;
    use xds_api::pb::envoy::config::cluster::v3::cluster::{LbConfig, LbPolicy};

    fn process(upstream: &Upstream) -> Result<Cluster, PluginError> {
        let snapshot = InputSnapshot::default();
        let settings = Settings::default();
        let params = Params {
            role: "ingress",
            snapshot: &snapshot,
            settings: &settings,
        };

        let mut cluster = Cluster::default();
        ClusterOptionsPlugin.process_upstream(&params, upstream, &mut cluster)?;
        Ok(cluster)
    }

    #[test]
    fn test_no_options() {
        let cluster = process(&static_upstream("ns", "u1", "1.2.3.4", 80)).unwrap();
        assert_eq!(cluster, Cluster::default());
    }

    #[test]
    #[allow(deprecated)]
    fn test_all_options() {
        let mut upstream = static_upstream("ns", "u1", "1.2.3.4", 80);
        upstream.load_balancer = Some(LoadBalancer::LeastRequest {
            choice_count: Some(3),
        });
        upstream.health_checks = vec![HealthCheck {
            timeout: Duration::from_secs(1),
            interval: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            check: HealthCheckKind::Http {
                path: "/healthz".to_string(),
                host: None,
            },
        }];
        upstream.circuit_breakers = Some(CircuitBreakers {
            max_connections: Some(128),
            ..Default::default()
        });
        upstream.connection_config = Some(ConnectionConfig {
            connect_timeout: Some(Duration::from_millis(250)),
            max_requests_per_connection: Some(10),
        });
        upstream.http2_protocol_options = Some(Http2ProtocolOptions {
            max_concurrent_streams: Some(100),
            ..Default::default()
        });

        let cluster = process(&upstream).unwrap();
        assert_eq!(cluster.lb_policy, LbPolicy::LeastRequest as i32);
        assert!(matches!(
            cluster.lb_config,
            Some(LbConfig::LeastRequestLbConfig(_))
        ));
        assert_eq!(cluster.health_checks.len(), 1);
        assert_eq!(
            cluster.circuit_breakers.unwrap().thresholds[0].max_connections,
            Some(128.into())
        );
        assert_eq!(
            cluster.connect_timeout,
            Some(Duration::from_millis(250).to_xds())
        );
        assert_eq!(cluster.max_requests_per_connection, Some(10.into()));
        assert_eq!(
            cluster.http2_protocol_options.unwrap().max_concurrent_streams,
            Some(100.into())
        );
    }

    #[test]
    fn test_invalid_window_size() {
        let mut upstream = static_upstream("ns", "u1", "1.2.3.4", 80);
        upstream.http2_protocol_options = Some(Http2ProtocolOptions {
            initial_stream_window_size: Some(1024),
            ..Default::default()
        });

        let err = process(&upstream).unwrap_err();
        assert!(!err.is_warning());
        assert_eq!(
            err.error.path(),
            "http2_protocol_options.initial_stream_window_size"
        );
    }

    #[test]
    fn test_zero_connect_timeout() {
        let mut upstream = static_upstream("ns", "u1", "1.2.3.4", 80);
        upstream.connection_config = Some(ConnectionConfig {
            connect_timeout: Some(Duration::from_secs(0)),
            ..Default::default()
        });

        let err = process(&upstream).unwrap_err();
        assert_eq!(err.error.path(), "connection_config.connect_timeout");
    }
}
