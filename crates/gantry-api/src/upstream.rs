//! Upstreams are logical backends.
//!
//! An [Upstream] names a set of network endpoints and describes how the proxy
//! should connect to them. How endpoints are found is determined by the
//! [UpstreamSpec]: static upstreams list their hosts inline, while catalog
//! and in-cluster upstreams get their endpoints from endpoint discovery.

use crate::shared::{impl_resource, Duration, Metadata, ResourceKind, ResourceRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A logical backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Upstream {
    pub metadata: Metadata,

    /// How the endpoints for this upstream are discovered.
    pub spec: UpstreamSpec,

    /// Originate TLS to this upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_config: Option<UpstreamSslConfig>,

    /// Active health checks for this upstream's endpoints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheck>,

    /// The load balancing policy used to pick an endpoint for each request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_config: Option<ConnectionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breakers: Option<CircuitBreakers>,

    /// Speak HTTP/2 to this upstream, with these options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2_protocol_options: Option<Http2ProtocolOptions>,
}

impl_resource!(Upstream, ResourceKind::Upstream);

impl Upstream {
    pub fn new(metadata: Metadata, spec: UpstreamSpec) -> Self {
        Self {
            metadata,
            spec,
            ssl_config: None,
            health_checks: Vec::new(),
            load_balancer: None,
            connection_config: None,
            circuit_breakers: None,
            http2_protocol_options: None,
        }
    }

    /// Returns `true` if this upstream's endpoints come from endpoint
    /// discovery instead of being listed inline.
    pub fn uses_endpoint_discovery(&self) -> bool {
        !matches!(self.spec, UpstreamSpec::Static(_))
    }

    /// Returns the Consul spec for this upstream, if it is a Consul upstream.
    pub fn consul(&self) -> Option<&ConsulUpstream> {
        match &self.spec {
            UpstreamSpec::Consul(consul) => Some(consul),
            _ => None,
        }
    }
}

/// The backend-type discriminator for an [Upstream].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamSpec {
    /// A fixed list of hosts.
    Static(StaticUpstream),

    /// A service registered in a Consul catalog.
    Consul(ConsulUpstream),

    /// A service running in a Kubernetes cluster.
    Kube(KubeUpstream),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticUpstream {
    pub hosts: Vec<Host>,

    /// Connect to every host with TLS, even without an explicit
    /// [UpstreamSslConfig].
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_tls: bool,
}

/// A single statically configured host. The address may be an IP address or
/// a DNS name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Host {
    pub addr: String,
    pub port: u16,

    /// The SNI name to use when connecting to this host with TLS. Defaults to
    /// the host address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
}

impl Host {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            sni: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulUpstream {
    /// The name of the service in the Consul catalog.
    pub service_name: String,

    /// Every tag seen on instances of this service. Used to build the
    /// `tag:` labels on discovered endpoints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_tags: Vec<String>,

    /// Only instances carrying all of these tags belong to this upstream. An
    /// empty list matches every instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_tags: Vec<String>,

    /// The datacenters to look for instances in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_centers: Vec<String>,
}

impl ConsulUpstream {
    /// Returns `true` if an instance with `tags` belongs to this upstream.
    pub fn matches_instance_tags(&self, tags: &[String]) -> bool {
        self.instance_tags.iter().all(|t| tags.contains(t))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubeUpstream {
    pub service_name: String,
    pub service_namespace: String,
    pub service_port: u16,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
}

/// TLS settings for connecting to an upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSslConfig {
    /// A TLS secret holding the client certificate, key and root CA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<ResourceRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
}

/// An active health check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheck {
    pub timeout: Duration,
    pub interval: Duration,

    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,

    pub check: HealthCheckKind,
}

fn default_threshold() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum HealthCheckKind {
    Http {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
    Tcp,
}

/// A load balancing policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum LoadBalancer {
    RoundRobin,
    LeastRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        choice_count: Option<u32>,
    },
    Random,
    RingHash {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_ring_size: Option<u64>,
    },
    Maglev,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_connection: Option<u32>,
}

/// Connection limits for an upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_requests: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// HTTP/2 settings. Window sizes must be between 65535 and 2147483647.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Http2ProtocolOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_stream_window_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_connection_window_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_streams: Option<u32>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shared::Resource;

    #[test]
    fn test_upstream_yaml() {
        let upstream: Upstream = serde_yml::from_str(
            r#"
metadata:
  name: u1
  namespace: ns
spec:
  type: static
  hosts:
  - addr: 1.2.3.4
    port: 80
load_balancer:
  type: least_request
  choice_count: 3
"#,
        )
        .unwrap();

        assert_eq!(upstream.resource_ref(), ResourceRef::new("ns", "u1"));
        assert_eq!(
            upstream.spec,
            UpstreamSpec::Static(StaticUpstream {
                hosts: vec![Host::new("1.2.3.4", 80)],
                use_tls: false,
            })
        );
        assert_eq!(
            upstream.load_balancer,
            Some(LoadBalancer::LeastRequest {
                choice_count: Some(3)
            })
        );
        assert!(!upstream.uses_endpoint_discovery());
    }

    #[test]
    fn test_consul_instance_tags() {
        let consul = ConsulUpstream {
            service_name: "svc".to_string(),
            instance_tags: vec!["primary".to_string()],
            ..Default::default()
        };

        assert!(consul.matches_instance_tags(&["primary".to_string(), "v1".to_string()]));
        assert!(!consul.matches_instance_tags(&["v1".to_string()]));

        let any = ConsulUpstream::default();
        assert!(any.matches_instance_tags(&[]));
    }

    #[test]
    fn test_unknown_spec_type() {
        let res = serde_json::from_value::<UpstreamSpec>(serde_json::json!({
            "type": "lambda",
            "function": "f",
        }));
        assert!(res.is_err());
    }
}
