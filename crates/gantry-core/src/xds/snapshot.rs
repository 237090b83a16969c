use enum_map::EnumMap;
use gantry_api::xds::socket_address;
use xds_api::pb::envoy::{
    config::{
        cluster::v3::Cluster,
        core::v3::{data_source::Specifier, DataSource},
        endpoint::v3::ClusterLoadAssignment,
        listener::v3::{self as xds_listener, Listener},
        route::v3::{self as xds_route, RouteConfiguration},
    },
    extensions::filters::{
        http::router::v3::Router, network::http_connection_manager::v3 as xds_http,
    },
};
use xds_api::pb::google::protobuf;

use crate::hash::resource_version;
use crate::xds::resources::{to_any_vec, ResourceType, ResourceVersion};

/// The status code served to proxies that can't be mapped to a role.
pub(crate) const BAD_NODE_STATUS: u32 = 500;

const BAD_NODE_BODY: &str = "gantry: this proxy did not identify a role. \
    set node.metadata.role to one of the configured roles.";

pub(crate) const HCM_FILTER_NAME: &str = "envoy.filters.network.http_connection_manager";
pub(crate) const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";

/// A complete, versioned set of xDS resources for a single role.
///
/// Every list is kept sorted by resource name, and every list has its own
/// version. A version only changes when its own list changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XdsSnapshot {
    listeners: Vec<Listener>,
    route_configurations: Vec<RouteConfiguration>,
    clusters: Vec<Cluster>,
    endpoints: Vec<ClusterLoadAssignment>,
    versions: EnumMap<ResourceType, ResourceVersion>,
}

impl XdsSnapshot {
    pub fn new(
        mut listeners: Vec<Listener>,
        mut route_configurations: Vec<RouteConfiguration>,
        mut clusters: Vec<Cluster>,
        mut endpoints: Vec<ClusterLoadAssignment>,
    ) -> Self {
        listeners.sort_by(|a, b| a.name.cmp(&b.name));
        route_configurations.sort_by(|a, b| a.name.cmp(&b.name));
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));

        let mut versions = EnumMap::default();
        versions[ResourceType::Listener] = resource_version(&listeners).into();
        versions[ResourceType::RouteConfiguration] = resource_version(&route_configurations).into();
        versions[ResourceType::Cluster] = resource_version(&clusters).into();
        versions[ResourceType::ClusterLoadAssignment] = resource_version(&endpoints).into();

        Self {
            listeners,
            route_configurations,
            clusters,
            endpoints,
            versions,
        }
    }

    /// The snapshot served to proxies that don't identify a role.
    ///
    /// It has a single listener on the default bind address that answers
    /// every request with an error, so that a misconfigured proxy fails
    /// loudly instead of silently serving nothing.
    pub fn bad_node(bind_address: &str, bind_port: u16) -> Result<Self, prost::EncodeError> {
        let route = xds_route::Route {
            name: "bad-node".to_string(),
            r#match: Some(xds_route::RouteMatch {
                path_specifier: Some(xds_route::route_match::PathSpecifier::Prefix(
                    "/".to_string(),
                )),
                ..Default::default()
            }),
            action: Some(xds_route::route::Action::DirectResponse(
                xds_route::DirectResponseAction {
                    status: BAD_NODE_STATUS,
                    body: Some(DataSource {
                        specifier: Some(Specifier::InlineString(BAD_NODE_BODY.to_string())),
                        ..Default::default()
                    }),
                },
            )),
            ..Default::default()
        };

        let route_config = RouteConfiguration {
            name: "bad-node-routes".to_string(),
            virtual_hosts: vec![xds_route::VirtualHost {
                name: "bad-node".to_string(),
                domains: vec!["*".to_string()],
                routes: vec![route],
                ..Default::default()
            }],
            ..Default::default()
        };

        let hcm = xds_http::HttpConnectionManager {
            stat_prefix: "bad-node".to_string(),
            route_specifier: Some(xds_http::http_connection_manager::RouteSpecifier::RouteConfig(
                route_config,
            )),
            http_filters: vec![router_filter()?],
            ..Default::default()
        };

        let listener = Listener {
            name: format!("listener-{bind_address}-{bind_port}"),
            address: Some(socket_address(bind_address, bind_port as u32)),
            filter_chains: vec![xds_listener::FilterChain {
                filters: vec![xds_listener::Filter {
                    name: HCM_FILTER_NAME.to_string(),
                    config_type: Some(xds_listener::filter::ConfigType::TypedConfig(
                        protobuf::Any::from_msg(&hcm)?,
                    )),
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self::new(vec![listener], vec![], vec![], vec![]))
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn route_configurations(&self) -> &[RouteConfiguration] {
        &self.route_configurations
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn endpoints(&self) -> &[ClusterLoadAssignment] {
        &self.endpoints
    }

    pub fn version(&self, resource_type: ResourceType) -> &ResourceVersion {
        &self.versions[resource_type]
    }

    /// The names of every resource of a type.
    pub fn resource_names(&self, resource_type: ResourceType) -> Vec<&str> {
        match resource_type {
            ResourceType::Listener => self.listeners.iter().map(|l| l.name.as_str()).collect(),
            ResourceType::RouteConfiguration => self
                .route_configurations
                .iter()
                .map(|r| r.name.as_str())
                .collect(),
            ResourceType::Cluster => self.clusters.iter().map(|c| c.name.as_str()).collect(),
            ResourceType::ClusterLoadAssignment => self
                .endpoints
                .iter()
                .map(|e| e.cluster_name.as_str())
                .collect(),
        }
    }

    /// Encode resources of a type as `Any`. An empty list of names selects
    /// every resource.
    pub fn resources(
        &self,
        resource_type: ResourceType,
        names: &[String],
    ) -> Result<Vec<protobuf::Any>, prost::EncodeError> {
        let wanted = |name: &str| names.is_empty() || names.iter().any(|n| n == name);

        match resource_type {
            ResourceType::Listener => to_any_vec(self.listeners.iter().filter(|l| wanted(&l.name))),
            ResourceType::RouteConfiguration => {
                to_any_vec(self.route_configurations.iter().filter(|r| wanted(&r.name)))
            }
            ResourceType::Cluster => to_any_vec(self.clusters.iter().filter(|c| wanted(&c.name))),
            ResourceType::ClusterLoadAssignment => {
                to_any_vec(self.endpoints.iter().filter(|e| wanted(&e.cluster_name)))
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
            && self.route_configurations.is_empty()
            && self.clusters.is_empty()
            && self.endpoints.is_empty()
    }
}

/// The terminal router filter for an HTTP connection manager.
pub(crate) fn router_filter() -> Result<xds_http::HttpFilter, prost::EncodeError> {
    Ok(xds_http::HttpFilter {
        name: ROUTER_FILTER_NAME.to_string(),
        config_type: Some(xds_http::http_filter::ConfigType::TypedConfig(
            protobuf::Any::from_msg(&Router::default())?,
        )),
        ..Default::default()
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn cluster(name: &str) -> Cluster {
        Cluster {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sorted_by_name() {
        let snapshot = XdsSnapshot::new(vec![], vec![], vec![cluster("b"), cluster("a")], vec![]);
        assert_eq!(snapshot.resource_names(ResourceType::Cluster), vec!["a", "b"]);
    }

    #[test]
    fn test_versions_are_independent() {
        let a = XdsSnapshot::new(vec![], vec![], vec![cluster("a")], vec![]);
        let b = XdsSnapshot::new(vec![], vec![], vec![cluster("a"), cluster("b")], vec![]);

        assert_ne!(a.version(ResourceType::Cluster), b.version(ResourceType::Cluster));
        assert_eq!(a.version(ResourceType::Listener), b.version(ResourceType::Listener));

        let a_again = XdsSnapshot::new(vec![], vec![], vec![cluster("a")], vec![]);
        assert_eq!(a, a_again);
    }

    #[test]
    fn test_resources_by_name() {
        let snapshot = XdsSnapshot::new(vec![], vec![], vec![cluster("a"), cluster("b")], vec![]);

        let all = snapshot.resources(ResourceType::Cluster, &[]).unwrap();
        assert_eq!(all.len(), 2);

        let some = snapshot
            .resources(ResourceType::Cluster, &["b".to_string(), "c".to_string()])
            .unwrap();
        let some: Vec<Cluster> = crate::xds::resources::from_any_vec(some).unwrap();
        assert_eq!(some, vec![cluster("b")]);

        assert!(snapshot
            .resources(ResourceType::Listener, &[])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_bad_node() {
        let snapshot = XdsSnapshot::bad_node("0.0.0.0", 8080).unwrap();
        assert_eq!(
            snapshot.resource_names(ResourceType::Listener),
            vec!["listener-0.0.0.0-8080"]
        );
        assert!(snapshot.clusters().is_empty());

        let listener = &snapshot.listeners()[0];
        let Some(xds_listener::filter::ConfigType::TypedConfig(any)) =
            &listener.filter_chains[0].filters[0].config_type
        else {
            panic!("missing hcm config");
        };
        let hcm: xds_http::HttpConnectionManager = any.to_msg().unwrap();
        let Some(xds_http::http_connection_manager::RouteSpecifier::RouteConfig(routes)) =
            hcm.route_specifier
        else {
            panic!("expected inline routes");
        };
        let action = routes.virtual_hosts[0].routes[0].action.as_ref().unwrap();
        assert!(matches!(
            action,
            xds_route::route::Action::DirectResponse(d) if d.status == BAD_NODE_STATUS
        ));
    }

    #[test]
    fn test_router_filter() {
        let filter = router_filter().unwrap();
        assert_eq!(filter.name, ROUTER_FILTER_NAME);

        let Some(xds_http::http_filter::ConfigType::TypedConfig(any)) = &filter.config_type else {
            panic!("missing router config");
        };
        assert!(any.type_url.ends_with("envoy.extensions.filters.http.router.v3.Router"));
        assert_eq!(any.to_msg::<Router>().unwrap(), Router::default());
    }
}
