//! HTTP routing configuration.
//!
//! A [VirtualService] becomes a single virtual host on the proxy: a set of
//! domains and an ordered list of [Route]s. Each route has exactly one
//! [Matcher] and exactly one [RouteAction].

use crate::shared::{impl_resource, Duration, Metadata, Regex, ResourceKind, ResourceRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The role that VirtualServices without an explicit role are bound to.
pub const DEFAULT_ROLE: &str = "ingress";

/// A set of domains and the routes that handle traffic for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualService {
    pub metadata: Metadata,

    /// The domains (Host/Authority header values) this VirtualService serves.
    /// Wildcards are allowed. An empty list serves every domain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,

    /// Routes, in the order they were written. The translator re-orders them
    /// most-specific-matcher first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    /// Serve this VirtualService over TLS on the secure listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_config: Option<SslConfig>,

    /// The proxy roles that serve this VirtualService. An empty list binds it
    /// to [DEFAULT_ROLE].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    /// Serve this VirtualService as a plain TCP proxy instead of with HTTP
    /// routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpHost>,

    #[serde(default, skip_serializing_if = "VirtualHostOptions::is_empty")]
    pub options: VirtualHostOptions,
}

impl_resource!(VirtualService, ResourceKind::VirtualService);

impl VirtualService {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            domains: Vec::new(),
            routes: Vec::new(),
            ssl_config: None,
            roles: Vec::new(),
            tcp: None,
            options: VirtualHostOptions::default(),
        }
    }

    /// The roles this VirtualService is bound to.
    pub fn roles(&self) -> Vec<&str> {
        if self.roles.is_empty() {
            return vec![DEFAULT_ROLE];
        }
        self.roles.iter().map(String::as_str).collect()
    }

    /// The domains this VirtualService serves, with the empty list expanded
    /// to the wildcard domain.
    pub fn domains(&self) -> Vec<&str> {
        if self.domains.is_empty() {
            return vec!["*"];
        }
        self.domains.iter().map(String::as_str).collect()
    }

    pub fn is_secure(&self) -> bool {
        self.ssl_config.is_some()
    }

    /// Every Upstream referenced directly by this VirtualService's routes or
    /// TCP destination.
    pub fn upstream_refs(&self) -> impl Iterator<Item = &ResourceRef> {
        let route_refs = self.routes.iter().flat_map(|r| r.action.upstream_refs());
        let tcp_refs = self.tcp.iter().flat_map(|t| t.destination.upstream_refs());
        route_refs.chain(tcp_refs)
    }

    /// Every UpstreamGroup referenced by this VirtualService.
    pub fn upstream_group_refs(&self) -> impl Iterator<Item = &ResourceRef> {
        let route_refs = self.routes.iter().filter_map(|r| r.action.upstream_group());
        let tcp_refs = self.tcp.iter().filter_map(|t| t.destination.upstream_group());
        route_refs.chain(tcp_refs)
    }
}

/// Downstream TLS configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslConfig {
    /// A TLS secret holding the certificate chain and private key.
    pub secret_ref: ResourceRef,

    /// The SNI names this certificate is served for. Defaults to the
    /// VirtualService's domains.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sni_domains: Vec<String>,
}

/// A TCP proxy bound to its own port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpHost {
    pub port: u16,
    pub destination: RouteAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualHostOptions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers_to_add: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers_to_add: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_remove: Vec<String>,
}

impl VirtualHostOptions {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A matcher and the action to take when it matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub matcher: Matcher,

    pub action: RouteAction,

    #[serde(default, skip_serializing_if = "RouteOptions::is_empty")]
    pub options: RouteOptions,
}

impl Route {
    pub fn new(matcher: Matcher, action: RouteAction) -> Self {
        Self {
            name: None,
            matcher,
            action,
            options: RouteOptions::default(),
        }
    }
}

/// Describes the requests a [Route] applies to. Every condition must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Matcher {
    #[serde(default)]
    pub path: PathMatcher,

    /// HTTP methods, in upper case. An empty list matches any method.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatcher>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_parameters: Vec<QueryParameterMatcher>,
}

impl Matcher {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            path: PathMatcher::Prefix {
                value: prefix.into(),
            },
            ..Default::default()
        }
    }

    pub fn exact(path: impl Into<String>) -> Self {
        Self {
            path: PathMatcher::Exact { value: path.into() },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PathMatcher {
    Exact { value: String },
    Prefix { value: String },
    Regex { value: Regex },
}

impl Default for PathMatcher {
    fn default() -> Self {
        PathMatcher::Prefix {
            value: "/".to_string(),
        }
    }
}

impl PathMatcher {
    /// The path string or regular expression source for this matcher.
    pub fn value(&self) -> &str {
        match self {
            PathMatcher::Exact { value } | PathMatcher::Prefix { value } => value,
            PathMatcher::Regex { value } => value.as_str(),
        }
    }
}

/// Match a request header. With no value, matches on the header being present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderMatcher {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Treat `value` as a regular expression.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub regex: bool,

    /// Match requests that do NOT satisfy this matcher.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub invert_match: bool,
}

/// Match a query parameter. With no value, matches on the parameter being
/// present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryParameterMatcher {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub regex: bool,
}

/// What to do with a request that matched a [Route].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteAction {
    /// Send all traffic to a single upstream.
    Single(Destination),

    /// Split traffic between upstreams by weight. Weights are relative and
    /// are passed to the proxy exactly as written.
    Multi { destinations: Vec<WeightedDestination> },

    /// Split traffic using the destinations of an [UpstreamGroup].
    ///
    /// [UpstreamGroup]: crate::upstream_group::UpstreamGroup
    UpstreamGroup(ResourceRef),

    /// Respond directly without contacting an upstream.
    DirectResponse {
        status: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },

    /// Respond with an HTTP redirect.
    Redirect(RedirectAction),
}

impl RouteAction {
    pub fn single(upstream: ResourceRef) -> Self {
        RouteAction::Single(Destination {
            upstream,
            subset: BTreeMap::new(),
        })
    }

    /// Upstreams referenced directly by this action. Upstreams referenced
    /// through an upstream group are not included.
    pub fn upstream_refs(&self) -> Vec<&ResourceRef> {
        match self {
            RouteAction::Single(dest) => vec![&dest.upstream],
            RouteAction::Multi { destinations } => {
                destinations.iter().map(|d| &d.destination.upstream).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn upstream_group(&self) -> Option<&ResourceRef> {
        match self {
            RouteAction::UpstreamGroup(group) => Some(group),
            _ => None,
        }
    }
}

/// A reference to an Upstream, optionally narrowed to the endpoints with a
/// set of labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Destination {
    pub upstream: ResourceRef,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subset: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightedDestination {
    pub destination: Destination,
    pub weight: u32,

    #[serde(default, skip_serializing_if = "WeightedDestinationOptions::is_empty")]
    pub options: WeightedDestinationOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightedDestinationOptions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers_to_add: BTreeMap<String, String>,
}

impl WeightedDestinationOptions {
    pub fn is_empty(&self) -> bool {
        self.request_headers_to_add.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_redirect: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_redirect: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub https_redirect: bool,

    /// One of 301, 302, 303, 307 or 308. Defaults to 301.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u32>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub strip_query: bool,
}

/// Per-route options, consumed by route plugins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_rewrite: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_rewrite: Option<String>,
}

impl RouteOptions {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Envoy `retry_on` conditions, e.g. `5xx,connect-failure`.
    pub retry_on: String,

    #[serde(default = "default_num_retries")]
    pub num_retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<Duration>,
}

fn default_num_retries() -> u32 {
    1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_virtual_service_yaml() {
        let vs: VirtualService = serde_yml::from_str(
            r#"
metadata:
  name: vs1
  namespace: default
domains: ["example.com"]
routes:
- matcher:
    path:
      type: exact
      value: /api/v1
    methods: [GET]
  action:
    type: single
    upstream:
      name: u1
      namespace: ns
- action:
    type: upstream_group
    name: ug1
    namespace: ns
- matcher:
    path:
      type: prefix
      value: /static
  action:
    type: direct_response
    status: 200
    body: ok
"#,
        )
        .unwrap();

        assert_eq!(vs.roles(), vec![DEFAULT_ROLE]);
        assert_eq!(vs.domains(), vec!["example.com"]);
        assert_eq!(vs.routes.len(), 3);
        assert_eq!(vs.routes[0].matcher.methods, vec!["GET"]);
        assert_eq!(vs.routes[1].matcher.path, PathMatcher::default());
        assert_eq!(
            vs.routes[1].action,
            RouteAction::UpstreamGroup(ResourceRef::new("ns", "ug1"))
        );

        let upstreams: Vec<_> = vs.upstream_refs().cloned().collect();
        assert_eq!(upstreams, vec![ResourceRef::new("ns", "u1")]);
        let groups: Vec<_> = vs.upstream_group_refs().cloned().collect();
        assert_eq!(groups, vec![ResourceRef::new("ns", "ug1")]);
    }

    #[test]
    fn test_default_domains_and_roles() {
        let mut vs = VirtualService::new(Metadata::new("default", "vs"));
        assert_eq!(vs.domains(), vec!["*"]);

        vs.roles = vec!["edge".to_string(), "internal".to_string()];
        assert_eq!(vs.roles(), vec!["edge", "internal"]);
    }

    #[test]
    fn test_multi_destination_refs() {
        let action = RouteAction::Multi {
            destinations: vec![
                WeightedDestination {
                    destination: Destination {
                        upstream: ResourceRef::new("ns", "a"),
                        subset: BTreeMap::new(),
                    },
                    weight: 1,
                    options: Default::default(),
                },
                WeightedDestination {
                    destination: Destination {
                        upstream: ResourceRef::new("ns", "b"),
                        subset: BTreeMap::new(),
                    },
                    weight: 3,
                    options: Default::default(),
                },
            ],
        };

        assert_eq!(
            action.upstream_refs(),
            vec![&ResourceRef::new("ns", "a"), &ResourceRef::new("ns", "b")]
        );
        assert_eq!(action.upstream_group(), None);
    }
}
