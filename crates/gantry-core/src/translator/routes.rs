use std::cmp::Reverse;

use gantry_api::{
    http::{Destination, PathMatcher, Route, RouteAction, VirtualService},
    Resource, ResourceKind,
};
use once_cell::sync::Lazy;
use regex::Regex;
use xds_api::pb::envoy::config::{
    core::v3 as xds_core,
    route::v3::{self as xds_route, route_action::ClusterSpecifier},
};

use super::{check_weights, cluster_name, forward, lb_metadata, Forward, Reports};
use crate::plugins::{Params, PluginError, Registry};
use crate::snapshot::InputSnapshot;

// RFC 3986 pchar, plus '/' as the segment separator. percent-encoded bytes
// must be complete.
const PATH_PATTERN: &str = r"^(?:[A-Za-z0-9\-._~!$&'()*+,;=:@/]|%[0-9A-Fa-f]{2})*$";

/// Returns `true` if every character in `path` is an unreserved path
/// character or part of a valid percent-encoding.
pub fn validate_path(path: &str) -> bool {
    static RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(PATH_PATTERN)
            .unwrap_or_else(|e| panic!("path regex {PATH_PATTERN:?} did not compile: {e}"))
    });

    RE.is_match(path)
}

/// Percent-encode every character that isn't valid in a path.
fn escape_path(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    let mut buf = [0; 4];
    let chars: Vec<char> = path.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        let valid_escape = *c == '%'
            && chars.get(i + 1).is_some_and(char::is_ascii_hexdigit)
            && chars.get(i + 2).is_some_and(char::is_ascii_hexdigit);

        if valid_escape || (*c != '%' && validate_path(c.encode_utf8(&mut buf))) {
            escaped.push(*c);
        } else {
            for b in c.encode_utf8(&mut buf).bytes() {
                escaped.push_str(&format!("%{b:02X}"));
            }
        }
    }

    escaped
}

// exact < regex < prefix
fn path_priority(path: &PathMatcher) -> u8 {
    match path {
        PathMatcher::Exact { .. } => 0,
        PathMatcher::Regex { .. } => 1,
        PathMatcher::Prefix { .. } => 2,
    }
}

/// Order routes most-specific matcher first.
///
/// Routes with more method constraints sort first, then exact paths before
/// regexes before prefixes, then longer paths before shorter ones. The sort
/// is stable, so routes that compare equal keep their original order. Each
/// route is returned with its original index.
pub fn sort_routes(routes: &[Route]) -> Vec<(usize, &Route)> {
    let mut sorted: Vec<_> = routes.iter().enumerate().collect();
    sorted.sort_by(|(_, a), (_, b)| {
        let key = |r: &Route| {
            (
                Reverse(r.matcher.methods.len()),
                path_priority(&r.matcher.path),
            )
        };
        key(a)
            .cmp(&key(b))
            .then_with(|| b.matcher.path.value().cmp(a.matcher.path.value()))
    });
    sorted
}

/// Check that every UpstreamGroup has a usable set of destinations, and that
/// every Upstream it references exists.
pub(super) fn validate_upstream_groups(snapshot: &InputSnapshot, reports: &mut Reports) {
    for group in &snapshot.config.upstream_groups {
        let group_ref = group.resource_ref();

        if let Err(e) = check_weights(&group.destinations) {
            reports.reject(
                ResourceKind::UpstreamGroup,
                &group_ref,
                e.with_field("destinations"),
            );
        }

        for (i, destination) in group.destinations.iter().enumerate() {
            let upstream = &destination.destination.upstream;
            if snapshot.config.find_upstream(upstream).is_none() {
                let err = PluginError::configuration(format!("upstream {upstream} not found"))
                    .with_field("upstream")
                    .with_field("destination")
                    .with_field_index("destinations", i);
                reports.reject(ResourceKind::UpstreamGroup, &group_ref, err);
            }
        }
    }
}

/// Build a virtual host for every HTTP VirtualService.
///
/// VirtualServices that fail are rejected and left out. TCP VirtualServices
/// are handled by the listener translator.
pub(super) fn translate_virtual_hosts<'a>(
    registry: &Registry,
    params: &Params<'a>,
    reports: &mut Reports,
) -> Vec<(&'a VirtualService, xds_route::VirtualHost)> {
    let mut hosts = Vec::new();

    for vs in &params.snapshot.config.virtual_services {
        if vs.tcp.is_some() {
            continue;
        }

        let vs_ref = vs.resource_ref();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let mut routes = Vec::with_capacity(vs.routes.len());
        for (i, route) in sort_routes(&vs.routes) {
            match translate_route(registry, params, vs, route, &mut warnings) {
                Ok(route) => routes.push(route),
                Err(e) => {
                    let e = e.with_field_index("routes", i);
                    if params.settings.invalid_config_policy.replace_invalid_routes {
                        warnings.push(PluginError::warning(format!(
                            "{e} (replaced with a direct response)"
                        )));
                        routes.push(replacement_route(params, route));
                    } else {
                        errors.push(e);
                    }
                }
            }
        }

        let mut virtual_host = xds_route::VirtualHost {
            name: virtual_host_name(vs),
            domains: vs.domains().into_iter().map(str::to_string).collect(),
            routes,
            ..Default::default()
        };

        for plugin in &registry.virtual_host {
            if let Err(e) = plugin.process_virtual_host(params, vs, &mut virtual_host) {
                if e.is_warning() {
                    warnings.push(e);
                } else {
                    errors.push(e);
                }
            }
        }

        for warning in warnings {
            reports.warn(ResourceKind::VirtualService, &vs_ref, warning);
        }
        if errors.is_empty() {
            hosts.push((vs, virtual_host));
        } else {
            for e in errors {
                reports.reject(ResourceKind::VirtualService, &vs_ref, e);
            }
        }
    }

    hosts
}

fn virtual_host_name(vs: &VirtualService) -> String {
    format!("{}_{}", vs.metadata.name, vs.metadata.namespace)
}

fn translate_route(
    registry: &Registry,
    params: &Params,
    vs: &VirtualService,
    route: &Route,
    warnings: &mut Vec<PluginError>,
) -> Result<xds_route::Route, PluginError> {
    let path = &route.matcher.path;
    if !matches!(path, PathMatcher::Regex { .. }) && !validate_path(path.value()) {
        return Err(
            PluginError::configuration(format!("invalid path {:?}", path.value()))
                .with_field("path")
                .with_field("matcher"),
        );
    }

    let route_match = route.matcher.to_xds().map_err(|e| {
        PluginError::from(e).with_field("matcher")
    })?;
    let action = translate_action(registry, params, &route.action, warnings)
        .map_err(|e| e.with_field("action"))?;

    let mut out = xds_route::Route {
        name: route.name.clone().unwrap_or_default(),
        r#match: Some(route_match),
        action: Some(action),
        ..Default::default()
    };

    for plugin in &registry.route {
        match plugin.process_route(params, vs, route, &mut out) {
            Ok(()) => (),
            Err(e) if e.is_warning() => warnings.push(e),
            Err(e) => return Err(e),
        }
    }

    Ok(out)
}

fn translate_action(
    registry: &Registry,
    params: &Params,
    action: &RouteAction,
    warnings: &mut Vec<PluginError>,
) -> Result<xds_route::route::Action, PluginError> {
    match forward(params.snapshot, action)? {
        Some(Forward::Single(destination)) => Ok(xds_route::route::Action::Route(
            xds_route::RouteAction {
                cluster_specifier: Some(ClusterSpecifier::Cluster(cluster_name(
                    &destination.upstream,
                ))),
                metadata_match: subset_metadata(destination),
                ..Default::default()
            },
        )),
        Some(Forward::Weighted(destinations)) => {
            let mut clusters = Vec::with_capacity(destinations.len());
            for (i, destination) in destinations.iter().enumerate() {
                // weights are passed through as written. Envoy normalizes
                // them against their sum.
                let mut cluster = xds_route::weighted_cluster::ClusterWeight {
                    name: cluster_name(&destination.destination.upstream),
                    weight: Some(destination.weight.into()),
                    metadata_match: subset_metadata(&destination.destination),
                    ..Default::default()
                };

                for plugin in &registry.weighted_destination {
                    match plugin.process_weighted_destination(params, destination, &mut cluster) {
                        Ok(()) => (),
                        Err(e) if e.is_warning() => warnings.push(e),
                        Err(e) => return Err(e.with_field_index("destinations", i)),
                    }
                }
                clusters.push(cluster);
            }

            Ok(xds_route::route::Action::Route(xds_route::RouteAction {
                cluster_specifier: Some(ClusterSpecifier::WeightedClusters(
                    xds_route::WeightedCluster {
                        clusters,
                        ..Default::default()
                    },
                )),
                ..Default::default()
            }))
        }
        None => match action {
            RouteAction::DirectResponse { status, body } => {
                if !(100..=599).contains(status) {
                    return Err(PluginError::configuration(format!(
                        "status {status} must be between 100 and 599"
                    ))
                    .with_field("status"));
                }
                Ok(direct_response(*status, body.as_deref()))
            }
            RouteAction::Redirect(redirect) => {
                Ok(xds_route::route::Action::Redirect(redirect.to_xds()?))
            }
            _ => Err(PluginError::configuration("unsupported route action")),
        },
    }
}

fn subset_metadata(destination: &Destination) -> Option<xds_core::Metadata> {
    lb_metadata(&destination.subset)
}

fn direct_response(status: u32, body: Option<&str>) -> xds_route::route::Action {
    let body = body.map(|body| xds_core::DataSource {
        specifier: Some(xds_core::data_source::Specifier::InlineString(
            body.to_string(),
        )),
        ..Default::default()
    });

    xds_route::route::Action::DirectResponse(xds_route::DirectResponseAction { status, body })
}

/// A route that answers with the configured invalid route response instead
/// of the route's action.
fn replacement_route(params: &Params, route: &Route) -> xds_route::Route {
    use xds_route::route_match::PathSpecifier;

    let path_specifier = match &route.matcher.path {
        PathMatcher::Exact { value } => PathSpecifier::Path(escape_path(value)),
        PathMatcher::Prefix { value } => PathSpecifier::Prefix(escape_path(value)),
        path @ PathMatcher::Regex { .. } => path.to_xds(),
    };

    let policy = &params.settings.invalid_config_policy;
    xds_route::Route {
        name: route.name.clone().unwrap_or_default(),
        r#match: Some(xds_route::RouteMatch {
            path_specifier: Some(path_specifier),
            ..Default::default()
        }),
        action: Some(direct_response(
            policy.invalid_route_response_code,
            Some(&policy.invalid_route_response_body),
        )),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::settings::Settings;
    use crate::snapshot::Config;
    use crate::test::{static_upstream, upstream_group, virtual_service, weighted};
    use gantry_api::http::{Matcher, RedirectAction};
    use gantry_api::{Metadata, ResourceRef};
    use std::collections::BTreeMap;

    fn route(matcher: Matcher) -> Route {
        Route::new(matcher, RouteAction::single(ResourceRef::new("ns", "u1")))
    }

    fn with_methods(mut matcher: Matcher, methods: &[&str]) -> Matcher {
        matcher.methods = methods.iter().map(|m| m.to_string()).collect();
        matcher
    }

    fn paths(routes: &[(usize, &Route)]) -> Vec<String> {
        routes
            .iter()
            .map(|(_, r)| r.matcher.path.value().to_string())
            .collect()
    }

    #[test]
    fn test_sort_by_specificity() {
        let routes = vec![
            route(Matcher::prefix("/")),
            route(Matcher::prefix("/api")),
            route(Matcher::exact("/api/v1")),
        ];
        let sorted = sort_routes(&routes);
        assert_eq!(paths(&sorted), vec!["/api/v1", "/api", "/"]);
        assert_eq!(
            sorted.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![2, 1, 0]
        );
    }

    #[test]
    fn test_sort_methods_first() {
        let routes = vec![
            route(Matcher::exact("/a")),
            route(with_methods(Matcher::prefix("/"), &["GET", "POST"])),
            route(with_methods(Matcher::prefix("/b"), &["GET"])),
        ];
        let sorted = sort_routes(&routes);
        assert_eq!(paths(&sorted), vec!["/", "/b", "/a"]);
    }

    #[test]
    fn test_sort_regex_between_exact_and_prefix() {
        let regex = Matcher {
            path: PathMatcher::Regex {
                value: "/items/[0-9]+".parse().unwrap(),
            },
            ..Default::default()
        };
        let routes = vec![
            route(Matcher::prefix("/items")),
            route(regex),
            route(Matcher::exact("/items")),
        ];
        let sorted = sort_routes(&routes);
        assert_eq!(paths(&sorted), vec!["/items", "/items/[0-9]+", "/items"]);
        assert_eq!(
            sorted.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![2, 1, 0]
        );
    }

    #[test]
    fn test_sort_is_permutation_invariant() {
        let routes = vec![
            route(Matcher::prefix("/")),
            route(Matcher::prefix("/api")),
            route(Matcher::exact("/api/v1")),
            route(with_methods(Matcher::prefix("/admin"), &["GET"])),
            route(Matcher::exact("/health")),
        ];
        let expected = paths(&sort_routes(&routes));

        let mut reversed = routes.clone();
        reversed.reverse();
        assert_eq!(paths(&sort_routes(&reversed)), expected);

        let mut rotated = routes.clone();
        rotated.rotate_left(2);
        assert_eq!(paths(&sort_routes(&rotated)), expected);
    }

    #[test]
    fn test_sort_is_stable() {
        let mut a = route(Matcher::prefix("/same"));
        a.name = Some("a".to_string());
        let mut b = route(Matcher::prefix("/same"));
        b.name = Some("b".to_string());

        let routes = vec![a, b];
        let names: Vec<_> = sort_routes(&routes)
            .iter()
            .map(|(_, r)| r.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_validate_path() {
        let valid = [
            "/",
            "/api/v1",
            "/a-b_c.d~e",
            "/!$&'()*+,;=:@",
            "/caf%C3%A9",
            "",
        ];
        for path in valid {
            assert!(validate_path(path), "{path:?} should be valid");
        }

        let invalid = ["/foo<bar", "/a b", "/%zz", "/%4", "/q?x=1", "/frag#x", "/café"];
        for path in invalid {
            assert!(!validate_path(path), "{path:?} should be invalid");
        }
    }

    #[test]
    fn test_escape_path() {
        assert_eq!(escape_path("/foo<bar"), "/foo%3Cbar");
        assert_eq!(escape_path("/a%20b"), "/a%20b");
        assert_eq!(escape_path("/100%"), "/100%25");
        assert_eq!(escape_path("/café"), "/caf%C3%A9");
        assert!(validate_path(&escape_path("/a b<c>%zz")));
    }

    fn params_for<'a>(snapshot: &'a InputSnapshot, settings: &'a Settings) -> Params<'a> {
        Params {
            role: "ingress",
            snapshot,
            settings,
        }
    }

    fn translate(
        snapshot: &InputSnapshot,
        settings: &Settings,
    ) -> (Vec<xds_route::VirtualHost>, Reports) {
        let registry = Registry::with_defaults(settings).unwrap();
        let params = params_for(snapshot, settings);
        let mut reports = Reports::default();
        let hosts = translate_virtual_hosts(&registry, &params, &mut reports)
            .into_iter()
            .map(|(_, h)| h)
            .collect();
        (hosts, reports)
    }

    fn snapshot_with(vs: VirtualService) -> InputSnapshot {
        InputSnapshot::new(
            Config {
                upstreams: vec![
                    static_upstream("ns", "u1", "1.2.3.4", 80),
                    static_upstream("ns", "u2", "1.2.3.5", 80),
                ],
                upstream_groups: vec![upstream_group(
                    "ns",
                    "g",
                    &[("ns", "u1", 3), ("ns", "u2", 1)],
                )],
                virtual_services: vec![vs],
            },
            vec![],
            vec![],
            vec![],
        )
    }

    fn only_action(hosts: &[xds_route::VirtualHost]) -> &xds_route::route::Action {
        hosts[0].routes[0].action.as_ref().unwrap()
    }

    #[test]
    fn test_weights_are_not_normalized() {
        let mut vs = virtual_service("ns", "vs", &["*"], "ns", "u1");
        vs.routes[0].action = RouteAction::Multi {
            destinations: vec![weighted("ns", "u1", 7), weighted("ns", "u2", 5)],
        };

        let (hosts, _) = translate(&snapshot_with(vs), &Settings::default());
        let xds_route::route::Action::Route(action) = only_action(&hosts) else {
            panic!("expected a forwarding route");
        };
        let Some(ClusterSpecifier::WeightedClusters(weighted)) = &action.cluster_specifier else {
            panic!("expected weighted clusters");
        };
        let weights: Vec<_> = weighted
            .clusters
            .iter()
            .map(|c| (c.name.as_str(), c.weight.as_ref().unwrap().value))
            .collect();
        assert_eq!(weights, vec![("u1_ns", 7), ("u2_ns", 5)]);
    }

    #[test]
    fn test_upstream_group_expansion() {
        let mut vs = virtual_service("ns", "vs", &["*"], "ns", "u1");
        vs.routes[0].action = RouteAction::UpstreamGroup(ResourceRef::new("ns", "g"));

        let (hosts, _) = translate(&snapshot_with(vs), &Settings::default());
        let xds_route::route::Action::Route(action) = only_action(&hosts) else {
            panic!("expected a forwarding route");
        };
        let Some(ClusterSpecifier::WeightedClusters(weighted)) = &action.cluster_specifier else {
            panic!("expected weighted clusters");
        };
        let names: Vec<_> = weighted.clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["u1_ns", "u2_ns"]);
    }

    #[test]
    fn test_subset_metadata() {
        let mut vs = virtual_service("ns", "vs", &["*"], "ns", "u1");
        let mut subset = BTreeMap::new();
        subset.insert("version".to_string(), "v2".to_string());
        vs.routes[0].action = RouteAction::Single(Destination {
            upstream: ResourceRef::new("ns", "u1"),
            subset,
        });

        let (hosts, _) = translate(&snapshot_with(vs), &Settings::default());
        let xds_route::route::Action::Route(action) = only_action(&hosts) else {
            panic!("expected a forwarding route");
        };
        let metadata = action.metadata_match.as_ref().unwrap();
        assert!(metadata.filter_metadata[super::super::ENVOY_LB]
            .fields
            .contains_key("version"));
    }

    #[test]
    fn test_direct_response_and_redirect() {
        let mut vs = VirtualService::new(Metadata::new("ns", "vs"));
        vs.routes = vec![
            Route::new(
                Matcher::exact("/teapot"),
                RouteAction::DirectResponse {
                    status: 418,
                    body: Some("short and stout".to_string()),
                },
            ),
            Route::new(
                Matcher::prefix("/"),
                RouteAction::Redirect(RedirectAction {
                    https_redirect: true,
                    ..Default::default()
                }),
            ),
        ];

        let (hosts, reports) = translate(&snapshot_with(vs), &Settings::default());
        assert!(!reports.is_rejected(ResourceKind::VirtualService, &ResourceRef::new("ns", "vs")));
        let routes = &hosts[0].routes;
        assert!(matches!(
            routes[0].action,
            Some(xds_route::route::Action::DirectResponse(ref d)) if d.status == 418
        ));
        assert!(matches!(
            routes[1].action,
            Some(xds_route::route::Action::Redirect(_))
        ));
    }

    #[test]
    fn test_missing_upstream_rejects() {
        let vs = virtual_service("ns", "vs", &["*"], "ns", "missing");
        let (hosts, reports) = translate(&snapshot_with(vs), &Settings::default());

        assert!(hosts.is_empty());
        let reports = reports.into_reports();
        let reason = reports[0].reason.as_ref().unwrap();
        assert_eq!(reason, "routes[0].action.upstream: upstream ns.missing not found");
    }

    #[test]
    fn test_replace_invalid_routes() {
        let mut vs = virtual_service("ns", "vs", &["*"], "ns", "u1");
        vs.routes.push(route(Matcher::prefix("/foo<bar")));
        vs.routes.push(Route::new(
            Matcher::prefix("/gone"),
            RouteAction::single(ResourceRef::new("ns", "missing")),
        ));

        let mut settings = Settings::default();
        settings.invalid_config_policy.replace_invalid_routes = true;
        let (hosts, reports) = translate(&snapshot_with(vs), &settings);

        let vs_ref = ResourceRef::new("ns", "vs");
        assert!(!reports.is_rejected(ResourceKind::VirtualService, &vs_ref));
        let reports = reports.into_reports();
        assert_eq!(reports[0].warnings.len(), 2);

        let routes = &hosts[0].routes;
        assert_eq!(routes.len(), 3);
        let replaced: Vec<_> = routes
            .iter()
            .filter_map(|r| match &r.action {
                Some(xds_route::route::Action::DirectResponse(d)) => Some((
                    d.status,
                    r.r#match.as_ref().unwrap().path_specifier.clone(),
                )),
                _ => None,
            })
            .collect();
        assert_eq!(
            replaced,
            vec![
                (
                    404,
                    Some(xds_route::route_match::PathSpecifier::Prefix("/gone".to_string()))
                ),
                (
                    404,
                    Some(xds_route::route_match::PathSpecifier::Prefix("/foo%3Cbar".to_string()))
                ),
            ]
        );
    }

    #[test]
    fn test_tcp_virtual_services_are_skipped() {
        let mut vs = virtual_service("ns", "vs", &["*"], "ns", "u1");
        vs.tcp = Some(gantry_api::http::TcpHost {
            port: 9000,
            destination: RouteAction::single(ResourceRef::new("ns", "u1")),
        });

        let (hosts, _) = translate(&snapshot_with(vs), &Settings::default());
        assert!(hosts.is_empty());
    }

    #[test]
    fn test_group_validation() {
        let snapshot = InputSnapshot::new(
            Config {
                upstreams: vec![static_upstream("ns", "u1", "1.2.3.4", 80)],
                upstream_groups: vec![
                    upstream_group("ns", "ok", &[("ns", "u1", 1)]),
                    upstream_group("ns", "empty", &[]),
                    upstream_group("ns", "zero", &[("ns", "u1", 0)]),
                ],
                virtual_services: vec![],
            },
            vec![],
            vec![],
            vec![],
        );

        let mut reports = Reports::default();
        validate_upstream_groups(&snapshot, &mut reports);
        let rejected = |name: &str| {
            reports.is_rejected(ResourceKind::UpstreamGroup, &ResourceRef::new("ns", name))
        };
        assert!(!rejected("ok"));
        assert!(rejected("empty"));
        assert!(rejected("zero"));
    }
}
