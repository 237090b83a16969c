use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_api::http::{Route, VirtualService, WeightedDestination};
use xds_api::pb::envoy::config::{
    core::v3::{HeaderValue, HeaderValueOption},
    route::v3::{self as xds_route, route_action::HostRewriteSpecifier},
};

use super::{
    Capability, Params, Plugin, PluginError, RoutePlugin, VirtualHostPlugin,
    WeightedDestinationPlugin,
};

/// Route, virtual host and weighted destination options that map directly
/// onto Envoy route configuration.
pub struct RouteOptionsPlugin;

impl Plugin for RouteOptionsPlugin {
    fn name(&self) -> &'static str {
        "route_options"
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![
            Capability::Route(self.clone()),
            Capability::VirtualHost(self.clone()),
            Capability::WeightedDestination(self),
        ]
    }
}

impl RoutePlugin for RouteOptionsPlugin {
    fn process_route(
        &self,
        _params: &Params,
        _virtual_service: &VirtualService,
        route: &Route,
        out: &mut xds_route::Route,
    ) -> Result<(), PluginError> {
        let options = &route.options;
        if options.is_empty() {
            return Ok(());
        }

        let Some(xds_route::route::Action::Route(action)) = &mut out.action else {
            return Err(PluginError::warning(
                "options only apply to routes that forward to an upstream",
            )
            .with_field("options"));
        };

        if let Some(timeout) = &options.timeout {
            action.timeout = Some(timeout.to_xds());
        }
        if let Some(retries) = &options.retries {
            action.retry_policy = Some(retries.to_xds());
        }
        if let Some(prefix) = &options.prefix_rewrite {
            if !prefix.starts_with('/') {
                return Err(PluginError::configuration("must start with '/'")
                    .with_field("prefix_rewrite")
                    .with_field("options"));
            }
            action.prefix_rewrite.clone_from(prefix);
        }
        if let Some(host) = &options.host_rewrite {
            action.host_rewrite_specifier =
                Some(HostRewriteSpecifier::HostRewriteLiteral(host.clone()));
        }

        Ok(())
    }
}

impl VirtualHostPlugin for RouteOptionsPlugin {
    fn process_virtual_host(
        &self,
        _params: &Params,
        virtual_service: &VirtualService,
        out: &mut xds_route::VirtualHost,
    ) -> Result<(), PluginError> {
        let options = &virtual_service.options;

        out.request_headers_to_add
            .extend(header_options(&options.request_headers_to_add));
        out.response_headers_to_add
            .extend(header_options(&options.response_headers_to_add));
        out.request_headers_to_remove
            .extend(options.request_headers_to_remove.iter().cloned());

        Ok(())
    }
}

impl WeightedDestinationPlugin for RouteOptionsPlugin {
    fn process_weighted_destination(
        &self,
        _params: &Params,
        destination: &WeightedDestination,
        out: &mut xds_route::weighted_cluster::ClusterWeight,
    ) -> Result<(), PluginError> {
        out.request_headers_to_add.extend(header_options(
            &destination.options.request_headers_to_add,
        ));
        Ok(())
    }
}

fn header_options(
    headers: &BTreeMap<String, String>,
) -> impl Iterator<Item = HeaderValueOption> + '_ {
    headers.iter().map(|(key, value)| HeaderValueOption {
        header: Some(HeaderValue {
            key: key.clone(),
            value: value.clone(),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::settings::Settings;
    use crate::snapshot::InputSnapshot;
    use gantry_api::http::{Matcher, RetryPolicy, RouteAction};
    use gantry_api::{Duration, Metadata, ResourceRef};

    fn route_with(options: gantry_api::http::RouteOptions) -> Route {
        let mut route = Route::new(
            Matcher::prefix("/"),
            RouteAction::single(ResourceRef::new("ns", "u1")),
        );
        route.options = options;
        route
    }

    fn forwarding_route() -> xds_route::Route {
        xds_route::Route {
            action: Some(xds_route::route::Action::Route(Default::default())),
            ..Default::default()
        }
    }

    fn process_route(route: &Route, out: &mut xds_route::Route) -> Result<(), PluginError> {
        let snapshot = InputSnapshot::default();
        let settings = Settings::default();
        let params = Params {
            role: "ingress",
            snapshot: &snapshot,
            settings: &settings,
        };
        let vs = VirtualService::new(Metadata::new("ns", "vs"));
        RouteOptionsPlugin.process_route(&params, &vs, route, out)
    }

    #[test]
    fn test_route_options() {
        let route = route_with(gantry_api::http::RouteOptions {
            timeout: Some(Duration::from_secs(3)),
            retries: Some(RetryPolicy {
                retry_on: "5xx".to_string(),
                num_retries: 2,
                per_try_timeout: None,
            }),
            prefix_rewrite: Some("/v2/".to_string()),
            host_rewrite: Some("api.internal".to_string()),
        });

        let mut out = forwarding_route();
        process_route(&route, &mut out).unwrap();

        let Some(xds_route::route::Action::Route(action)) = out.action else {
            panic!("expected a route action");
        };
        assert_eq!(action.timeout, Some(Duration::from_secs(3).to_xds()));
        assert_eq!(action.retry_policy.unwrap().retry_on, "5xx");
        assert_eq!(action.prefix_rewrite, "/v2/");
        assert_eq!(
            action.host_rewrite_specifier,
            Some(HostRewriteSpecifier::HostRewriteLiteral("api.internal".to_string()))
        );
    }

    #[test]
    fn test_options_on_direct_response() {
        let route = route_with(gantry_api::http::RouteOptions {
            timeout: Some(Duration::from_secs(3)),
            ..Default::default()
        });

        let mut out = xds_route::Route {
            action: Some(xds_route::route::Action::DirectResponse(Default::default())),
            ..Default::default()
        };
        let err = process_route(&route, &mut out).unwrap_err();
        assert!(err.is_warning());
    }

    #[test]
    fn test_invalid_prefix_rewrite() {
        let route = route_with(gantry_api::http::RouteOptions {
            prefix_rewrite: Some("v2".to_string()),
            ..Default::default()
        });

        let err = process_route(&route, &mut forwarding_route()).unwrap_err();
        assert!(!err.is_warning());
        assert_eq!(err.error.path(), "options.prefix_rewrite");
    }

    #[test]
    fn test_virtual_host_headers() {
        let snapshot = InputSnapshot::default();
        let settings = Settings::default();
        let params = Params {
            role: "ingress",
            snapshot: &snapshot,
            settings: &settings,
        };

        let mut vs = VirtualService::new(Metadata::new("ns", "vs"));
        vs.options
            .request_headers_to_add
            .insert("x-gantry".to_string(), "1".to_string());
        vs.options.request_headers_to_remove = vec!["cookie".to_string()];

        let mut out = xds_route::VirtualHost::default();
        RouteOptionsPlugin
            .process_virtual_host(&params, &vs, &mut out)
            .unwrap();

        assert_eq!(out.request_headers_to_add.len(), 1);
        let header = out.request_headers_to_add[0].header.as_ref().unwrap();
        assert_eq!((header.key.as_str(), header.value.as_str()), ("x-gantry", "1"));
        assert!(out.response_headers_to_add.is_empty());
        assert_eq!(out.request_headers_to_remove, vec!["cookie"]);
    }
}
