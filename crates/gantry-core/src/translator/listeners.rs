use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use gantry_api::{
    http::VirtualService,
    xds::{ads_config_source, socket_address},
    Resource, ResourceKind,
};
use xds_api::pb::envoy::{
    config::{
        core::v3 as xds_core,
        listener::v3::{self as xds_listener, Listener},
        route::v3::{self as xds_route, RouteConfiguration},
    },
    extensions::filters::network::http_connection_manager::v3 as xds_http,
};
use xds_api::pb::google::protobuf;

use super::{cluster_name, forward, lb_metadata, Forward, Reports};
use crate::plugins::{
    downstream_tls_context, sort_http_filters, sort_network_filters, transport_socket,
    ListenerProtocol, ListenerSpec, Params, PluginError, Registry,
};
use crate::xds::extensions::{
    tcp_proxy as xds_tcp, tls::DownstreamTlsContext, tls_inspector::TlsInspector,
};
use crate::xds::{router_filter, HCM_FILTER_NAME};

const TCP_PROXY_FILTER_NAME: &str = "envoy.filters.network.tcp_proxy";
const TLS_INSPECTOR_FILTER_NAME: &str = "envoy.filters.listener.tls_inspector";

type TcpClusterSpecifier = xds_tcp::tcp_proxy::ClusterSpecifier;

#[derive(Debug, Default)]
pub(super) struct TranslatedListeners {
    pub listeners: Vec<Listener>,
    pub route_configurations: Vec<RouteConfiguration>,
}

/// Resolve the destination of every TCP VirtualService.
pub(super) fn translate_tcp_hosts<'a>(
    params: &Params<'a>,
    reports: &mut Reports,
) -> Vec<(&'a VirtualService, TcpClusterSpecifier)> {
    let mut hosts = Vec::new();

    for vs in &params.snapshot.config.virtual_services {
        let Some(tcp) = &vs.tcp else {
            continue;
        };
        let vs_ref = vs.resource_ref();

        if !vs.routes.is_empty() {
            reports.warn(
                ResourceKind::VirtualService,
                &vs_ref,
                "routes are ignored when tcp is set",
            );
        }

        let specifier = match forward(params.snapshot, &tcp.destination) {
            Ok(Some(Forward::Single(destination))) => {
                TcpClusterSpecifier::Cluster(cluster_name(&destination.upstream))
            }
            Ok(Some(Forward::Weighted(destinations))) => {
                let clusters = destinations
                    .iter()
                    .map(|d| xds_tcp::tcp_proxy::weighted_cluster::ClusterWeight {
                        name: cluster_name(&d.destination.upstream),
                        weight: d.weight,
                        metadata_match: lb_metadata(&d.destination.subset).map(Into::into),
                    })
                    .collect();
                TcpClusterSpecifier::WeightedClusters(xds_tcp::tcp_proxy::WeightedCluster {
                    clusters,
                })
            }
            Ok(None) => {
                reports.reject(
                    ResourceKind::VirtualService,
                    &vs_ref,
                    PluginError::configuration("tcp destinations must forward to an upstream")
                        .with_field("destination")
                        .with_field("tcp"),
                );
                continue;
            }
            Err(e) => {
                reports.reject(
                    ResourceKind::VirtualService,
                    &vs_ref,
                    e.with_field("destination").with_field("tcp"),
                );
                continue;
            }
        };

        hosts.push((vs, specifier));
    }

    hosts
}

/// Assemble listeners and route configurations.
///
/// All plain HTTP virtual hosts share a single listener on the bind port and
/// all TLS virtual hosts share a single listener on the secure bind port,
/// with one filter chain per VirtualService selected by SNI. Every TCP
/// VirtualService gets a listener of its own.
pub(super) fn translate_listeners<'a>(
    registry: &Registry,
    params: &Params<'a>,
    hosts: Vec<(&'a VirtualService, xds_route::VirtualHost)>,
    tcp_hosts: Vec<(&'a VirtualService, TcpClusterSpecifier)>,
    reports: &mut Reports,
) -> TranslatedListeners {
    let settings = params.settings;
    let mut out = TranslatedListeners::default();

    let mut insecure = Vec::new();
    let mut secure = Vec::new();
    for (vs, virtual_host) in hosts {
        match &vs.ssl_config {
            None => insecure.push((vs, virtual_host)),
            Some(ssl_config) => {
                match downstream_tls_context(params.snapshot, &ssl_config.secret_ref) {
                    Ok(tls_context) => secure.push(((vs, virtual_host), tls_context)),
                    Err(e) => reports.reject(
                        ResourceKind::VirtualService,
                        &vs.resource_ref(),
                        e.with_field("secret_ref").with_field("ssl_config"),
                    ),
                }
            }
        }
    }

    let insecure = reject_domain_conflicts(insecure, |(vs, _)| vs, reports);
    if !insecure.is_empty() {
        let name = listener_name(&settings.bind_address, settings.bind_port);
        let (virtual_services, virtual_hosts): (Vec<_>, Vec<_>) = insecure.into_iter().unzip();
        let route_config = route_configuration(&name, virtual_hosts);
        let spec = listener_spec(
            params,
            name,
            settings.bind_port,
            ListenerProtocol::Http,
            &virtual_services,
        );

        let filters = http_filters(
            registry,
            params,
            &spec,
            &route_config,
            reports,
            &virtual_services,
        );
        let listener = filters.map(|filters| Listener {
            name: spec.name.clone(),
            address: Some(listener_address(params, spec.port)),
            filter_chains: vec![xds_listener::FilterChain {
                filters,
                ..Default::default()
            }],
            ..Default::default()
        });

        let listener = listener.and_then(|listener| {
            run_listener_plugins(registry, params, &spec, listener, reports, &virtual_services)
        });
        if let Some(listener) = listener {
            out.listeners.push(listener);
            out.route_configurations.push(route_config);
        }
    }

    let secure = reject_domain_conflicts(secure, |((vs, _), _)| vs, reports);
    if !secure.is_empty() {
        let name = listener_name(&settings.bind_address, settings.secure_bind_port);
        let mut virtual_services = Vec::with_capacity(secure.len());
        let mut virtual_hosts = Vec::with_capacity(secure.len());
        let mut tls_contexts = Vec::with_capacity(secure.len());
        for ((vs, virtual_host), tls_context) in secure {
            virtual_services.push(vs);
            virtual_hosts.push(virtual_host);
            tls_contexts.push(tls_context);
        }

        let route_config = route_configuration(&name, virtual_hosts);
        let spec = listener_spec(
            params,
            name,
            settings.secure_bind_port,
            ListenerProtocol::Https,
            &virtual_services,
        );

        let filters = http_filters(
            registry,
            params,
            &spec,
            &route_config,
            reports,
            &virtual_services,
        );
        let listener = filters.and_then(|filters| {
            let mut filter_chains = Vec::with_capacity(virtual_services.len());
            for (vs, tls_context) in virtual_services.iter().zip(&tls_contexts) {
                match tls_filter_chain(vs, tls_context, filters.clone()) {
                    Ok(chain) => filter_chains.push(chain),
                    Err(e) => {
                        reject_all(reports, &virtual_services, e);
                        return None;
                    }
                }
            }

            let inspector = match tls_inspector() {
                Ok(inspector) => inspector,
                Err(e) => {
                    reject_all(reports, &virtual_services, e);
                    return None;
                }
            };

            Some(Listener {
                name: spec.name.clone(),
                address: Some(listener_address(params, spec.port)),
                filter_chains,
                listener_filters: vec![inspector],
                ..Default::default()
            })
        });

        let listener = listener.and_then(|listener| {
            run_listener_plugins(registry, params, &spec, listener, reports, &virtual_services)
        });
        if let Some(listener) = listener {
            out.listeners.push(listener);
            out.route_configurations.push(route_config);
        }
    }

    for (vs, cluster_specifier) in reject_port_conflicts(params, tcp_hosts, reports) {
        if let Some(listener) = tcp_listener(registry, params, vs, cluster_specifier, reports) {
            out.listeners.push(listener);
        }
    }

    out
}

fn listener_name(address: &str, port: u16) -> String {
    format!("listener-{address}-{port}")
}

fn listener_spec(
    params: &Params,
    name: String,
    port: u16,
    protocol: ListenerProtocol,
    virtual_services: &[&VirtualService],
) -> ListenerSpec {
    ListenerSpec {
        name,
        address: params.settings.bind_address.clone(),
        port,
        protocol,
        virtual_services: virtual_services.iter().map(|vs| vs.resource_ref()).collect(),
    }
}

/// The socket address a listener binds to. With dual stack enabled, IPv4
/// addresses are mapped into IPv6 so the listener accepts both.
fn listener_address(params: &Params, port: u16) -> xds_core::Address {
    let mut address = params.settings.bind_address.clone();
    let mut ipv4_compat = false;

    if params.settings.feature_flags.dual_stack {
        if let Ok(IpAddr::V4(ip)) = address.parse::<IpAddr>() {
            address = if ip.is_unspecified() {
                "::".to_string()
            } else {
                format!("::ffff:{ip}")
            };
            ipv4_compat = true;
        }
    }

    let mut out = socket_address(&address, port as u32);
    if let Some(xds_core::address::Address::SocketAddress(socket)) = &mut out.address {
        socket.ipv4_compat = ipv4_compat;
    }
    out
}

fn route_configuration(
    listener_name: &str,
    virtual_hosts: Vec<xds_route::VirtualHost>,
) -> RouteConfiguration {
    RouteConfiguration {
        name: format!("{listener_name}-routes"),
        virtual_hosts,
        ..Default::default()
    }
}

/// Drop every VirtualService that shares a domain with another one. All
/// of the VirtualServices involved are rejected, not just the later ones,
/// since there's no way to tell which one the user meant.
fn reject_domain_conflicts<'a, T>(
    hosts: Vec<T>,
    virtual_service: impl Fn(&T) -> &&'a VirtualService,
    reports: &mut Reports,
) -> Vec<T> {
    let mut owners: BTreeMap<&str, Vec<&VirtualService>> = BTreeMap::new();
    for host in &hosts {
        let vs = *virtual_service(host);
        for domain in vs.domains() {
            owners.entry(domain).or_default().push(vs);
        }
    }

    let mut conflicted = BTreeSet::new();
    for (domain, owners) in &owners {
        if owners.len() < 2 {
            continue;
        }
        for vs in owners {
            let vs_ref = vs.resource_ref();
            let others: Vec<_> = owners
                .iter()
                .map(|o| o.resource_ref())
                .filter(|o| *o != vs_ref)
                .map(|o| o.to_string())
                .collect();
            reports.reject(
                ResourceKind::VirtualService,
                &vs_ref,
                format!("domain {domain:?} is also used by {}", others.join(", ")),
            );
            conflicted.insert(vs_ref);
        }
    }

    hosts
        .into_iter()
        .filter(|h| !conflicted.contains(&virtual_service(h).resource_ref()))
        .collect()
}

/// Drop every TCP VirtualService whose port is already taken, either by
/// another TCP VirtualService or by one of the HTTP listeners.
fn reject_port_conflicts<'a>(
    params: &Params,
    hosts: Vec<(&'a VirtualService, TcpClusterSpecifier)>,
    reports: &mut Reports,
) -> Vec<(&'a VirtualService, TcpClusterSpecifier)> {
    let settings = params.settings;
    let mut by_port: BTreeMap<u16, Vec<&VirtualService>> = BTreeMap::new();
    for (vs, _) in &hosts {
        if let Some(tcp) = &vs.tcp {
            by_port.entry(tcp.port).or_default().push(vs);
        }
    }

    let mut conflicted = BTreeSet::new();
    for (port, owners) in &by_port {
        let reserved = *port == settings.bind_port || *port == settings.secure_bind_port;
        if owners.len() < 2 && !reserved {
            continue;
        }
        for vs in owners {
            let vs_ref = vs.resource_ref();
            let reason = if reserved {
                PluginError::configuration(format!("port {port} is reserved for http listeners"))
            } else {
                PluginError::configuration(format!(
                    "port {port} is used by more than one virtual service"
                ))
            };
            reports.reject(
                ResourceKind::VirtualService,
                &vs_ref,
                reason.with_field("port").with_field("tcp"),
            );
            conflicted.insert(vs_ref);
        }
    }

    hosts
        .into_iter()
        .filter(|(vs, _)| !conflicted.contains(&vs.resource_ref()))
        .collect()
}

fn reject_all(reports: &mut Reports, virtual_services: &[&VirtualService], error: PluginError) {
    for vs in virtual_services {
        reports.reject(ResourceKind::VirtualService, &vs.resource_ref(), &error);
    }
}

fn warn_all(reports: &mut Reports, virtual_services: &[&VirtualService], error: PluginError) {
    for vs in virtual_services {
        reports.warn(ResourceKind::VirtualService, &vs.resource_ref(), &error);
    }
}

/// Record a listener-wide error against every VirtualService on the listener.
/// Returns `true` if the listener can't be built.
fn listener_error(
    reports: &mut Reports,
    virtual_services: &[&VirtualService],
    error: PluginError,
) -> bool {
    if error.is_warning() {
        warn_all(reports, virtual_services, error);
        false
    } else {
        reject_all(reports, virtual_services, error);
        true
    }
}

/// The network filters for an HTTP listener, ending in an HTTP connection
/// manager that fetches `route_config` over RDS.
fn http_filters(
    registry: &Registry,
    params: &Params,
    spec: &ListenerSpec,
    route_config: &RouteConfiguration,
    reports: &mut Reports,
    virtual_services: &[&VirtualService],
) -> Option<Vec<xds_listener::Filter>> {
    let mut staged = Vec::new();
    for plugin in &registry.http_filters {
        match plugin.http_filters(params, spec) {
            Ok(filters) => staged.extend(filters),
            Err(e) => {
                if listener_error(reports, virtual_services, e) {
                    return None;
                }
            }
        }
    }

    let used = if params.settings.feature_flags.remove_unused_filters {
        configured_filters(route_config)
    } else {
        BTreeSet::new()
    };
    let mut http_filters: Vec<_> = sort_http_filters(staged)
        .into_iter()
        .filter(|f| !f.remove_if_unused || used.contains(f.filter.name.as_str()))
        .map(|f| f.filter)
        .collect();
    match router_filter() {
        Ok(router) => http_filters.push(router),
        Err(e) => {
            let err = PluginError::configuration(format!("failed to encode router filter: {e}"));
            reject_all(reports, virtual_services, err);
            return None;
        }
    }

    let mut hcm = xds_http::HttpConnectionManager {
        stat_prefix: spec.name.clone(),
        route_specifier: Some(xds_http::http_connection_manager::RouteSpecifier::Rds(
            xds_http::Rds {
                config_source: Some(ads_config_source()),
                route_config_name: route_config.name.clone(),
            },
        )),
        http_filters,
        ..Default::default()
    };

    for plugin in &registry.hcm {
        if let Err(e) = plugin.process_hcm(params, spec, &mut hcm) {
            if listener_error(reports, virtual_services, e) {
                return None;
            }
        }
    }

    let hcm_filter = match typed_config(&hcm) {
        Ok(typed_config) => xds_listener::Filter {
            name: HCM_FILTER_NAME.to_string(),
            config_type: Some(xds_listener::filter::ConfigType::TypedConfig(typed_config)),
        },
        Err(e) => {
            reject_all(reports, virtual_services, e);
            return None;
        }
    };

    let mut filters = network_filters(registry, params, spec, reports, virtual_services)?;
    filters.push(hcm_filter);
    Some(filters)
}

/// The names of every HTTP filter configured on a virtual host, route or
/// weighted cluster in `route_config`.
fn configured_filters(route_config: &RouteConfiguration) -> BTreeSet<&str> {
    let mut names = BTreeSet::new();

    for vhost in &route_config.virtual_hosts {
        names.extend(vhost.typed_per_filter_config.keys().map(String::as_str));
        for route in &vhost.routes {
            names.extend(route.typed_per_filter_config.keys().map(String::as_str));

            let Some(xds_route::route::Action::Route(action)) = &route.action else {
                continue;
            };
            if let Some(xds_route::route_action::ClusterSpecifier::WeightedClusters(weighted)) =
                &action.cluster_specifier
            {
                for cluster in &weighted.clusters {
                    names.extend(cluster.typed_per_filter_config.keys().map(String::as_str));
                }
            }
        }
    }

    names
}

fn network_filters(
    registry: &Registry,
    params: &Params,
    spec: &ListenerSpec,
    reports: &mut Reports,
    virtual_services: &[&VirtualService],
) -> Option<Vec<xds_listener::Filter>> {
    let mut staged = Vec::new();
    for plugin in &registry.network_filters {
        match plugin.network_filters(params, spec) {
            Ok(filters) => staged.extend(filters),
            Err(e) => {
                if listener_error(reports, virtual_services, e) {
                    return None;
                }
            }
        }
    }
    Some(sort_network_filters(staged))
}

fn typed_config<M: prost::Name>(msg: &M) -> Result<protobuf::Any, PluginError> {
    protobuf::Any::from_msg(msg)
        .map_err(|e| PluginError::configuration(format!("failed to encode {}: {e}", M::NAME)))
}

/// A filter chain that serves `vs` to clients that present one of its
/// domains over SNI.
fn tls_filter_chain(
    vs: &VirtualService,
    tls_context: &DownstreamTlsContext,
    filters: Vec<xds_listener::Filter>,
) -> Result<xds_listener::FilterChain, PluginError> {
    Ok(xds_listener::FilterChain {
        name: format!("{}_{}", vs.metadata.name, vs.metadata.namespace),
        filter_chain_match: Some(xds_listener::FilterChainMatch {
            server_names: server_names(vs),
            ..Default::default()
        }),
        filters,
        transport_socket: Some(transport_socket(tls_context)?),
        ..Default::default()
    })
}

// explicit SNI domains win. without them, match every domain that isn't a
// wildcard, and with nothing left match any client.
fn server_names(vs: &VirtualService) -> Vec<String> {
    if let Some(ssl_config) = &vs.ssl_config {
        if !ssl_config.sni_domains.is_empty() {
            return ssl_config.sni_domains.clone();
        }
    }

    vs.domains()
        .into_iter()
        .filter(|d| *d != "*")
        .map(str::to_string)
        .collect()
}

fn tls_inspector() -> Result<xds_listener::ListenerFilter, PluginError> {
    Ok(xds_listener::ListenerFilter {
        name: TLS_INSPECTOR_FILTER_NAME.to_string(),
        config_type: Some(xds_listener::listener_filter::ConfigType::TypedConfig(
            typed_config(&TlsInspector::default())?,
        )),
        ..Default::default()
    })
}

fn tcp_listener(
    registry: &Registry,
    params: &Params,
    vs: &VirtualService,
    cluster_specifier: TcpClusterSpecifier,
    reports: &mut Reports,
) -> Option<Listener> {
    let port = vs.tcp.as_ref()?.port;
    let name = listener_name(&params.settings.bind_address, port);
    let virtual_services = [vs];
    let spec = listener_spec(params, name, port, ListenerProtocol::Tcp, &virtual_services);

    let tcp_proxy = xds_tcp::TcpProxy {
        stat_prefix: spec.name.clone(),
        cluster_specifier: Some(cluster_specifier),
    };
    let tcp_proxy = match typed_config(&tcp_proxy) {
        Ok(typed_config) => xds_listener::Filter {
            name: TCP_PROXY_FILTER_NAME.to_string(),
            config_type: Some(xds_listener::filter::ConfigType::TypedConfig(typed_config)),
        },
        Err(e) => {
            reject_all(reports, &virtual_services, e);
            return None;
        }
    };

    let mut filters = network_filters(registry, params, &spec, reports, &virtual_services)?;
    filters.push(tcp_proxy);

    let mut filter_chain = xds_listener::FilterChain {
        filters,
        ..Default::default()
    };
    let mut listener_filters = Vec::new();

    if let Some(ssl_config) = &vs.ssl_config {
        let tls = downstream_tls_context(params.snapshot, &ssl_config.secret_ref)
            .map_err(|e| e.with_field("secret_ref").with_field("ssl_config"))
            .and_then(|tls_context| Ok((transport_socket(&tls_context)?, tls_inspector()?)));
        match tls {
            Ok((socket, inspector)) => {
                filter_chain.transport_socket = Some(socket);
                listener_filters.push(inspector);
            }
            Err(e) => {
                reject_all(reports, &virtual_services, e);
                return None;
            }
        }
    }

    let listener = Listener {
        name: spec.name.clone(),
        address: Some(listener_address(params, port)),
        filter_chains: vec![filter_chain],
        listener_filters,
        ..Default::default()
    };

    run_listener_plugins(registry, params, &spec, listener, reports, &virtual_services)
}

fn run_listener_plugins(
    registry: &Registry,
    params: &Params,
    spec: &ListenerSpec,
    mut listener: Listener,
    reports: &mut Reports,
    virtual_services: &[&VirtualService],
) -> Option<Listener> {
    let mut failed = false;
    for plugin in &registry.listener {
        if let Err(e) = plugin.process_listener(params, spec, &mut listener) {
            failed |= listener_error(reports, virtual_services, e);
        }
    }

    if failed {
        tracing::debug!(listener = spec.name, "dropping listener after plugin errors");
        return None;
    }
    Some(listener)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugins::{
        Capability, FilterStage, HttpFilterPlugin, InitParams, ListenerPlugin, Plugin,
        StagedHttpFilter, WellKnownStage,
    };
    use crate::settings::Settings;
    use crate::snapshot::{Config, InputSnapshot};
    use crate::test::{static_upstream, virtual_service};
    use gantry_api::{
        http::{RouteAction, SslConfig, TcpHost},
        secret::{Secret, SecretKind},
        Metadata, ResourceRef,
    };
    use std::sync::Arc;

    fn tls_secret(ns: &str, name: &str) -> Secret {
        Secret {
            metadata: Metadata::new(ns, name),
            kind: SecretKind::Tls {
                cert_chain: "CERT".to_string(),
                private_key: "KEY".to_string(),
                root_ca: String::new(),
            },
        }
    }

    fn secure(mut vs: VirtualService, secret: &str) -> VirtualService {
        vs.ssl_config = Some(SslConfig {
            secret_ref: ResourceRef::new("ns", secret),
            sni_domains: vec![],
        });
        vs
    }

    fn tcp(mut vs: VirtualService, port: u16) -> VirtualService {
        vs.routes.clear();
        vs.tcp = Some(TcpHost {
            port,
            destination: RouteAction::single(ResourceRef::new("ns", "u1")),
        });
        vs
    }

    fn snapshot(virtual_services: Vec<VirtualService>) -> InputSnapshot {
        InputSnapshot::new(
            Config {
                upstreams: vec![static_upstream("ns", "u1", "1.2.3.4", 80)],
                virtual_services,
                ..Default::default()
            },
            vec![tls_secret("ns", "tls")],
            vec![],
            vec![],
        )
    }

    fn translate_with(
        registry: &Registry,
        settings: &Settings,
        snapshot: &InputSnapshot,
    ) -> (TranslatedListeners, Reports) {
        let params = Params {
            role: "ingress",
            snapshot,
            settings,
        };
        let mut reports = Reports::default();
        let hosts = super::super::routes::translate_virtual_hosts(registry, &params, &mut reports);
        let tcp_hosts = translate_tcp_hosts(&params, &mut reports);
        let out = translate_listeners(registry, &params, hosts, tcp_hosts, &mut reports);
        (out, reports)
    }

    fn translate(snapshot: &InputSnapshot) -> (TranslatedListeners, Reports) {
        let settings = Settings::default();
        let registry = Registry::with_defaults(&settings).unwrap();
        translate_with(&registry, &settings, snapshot)
    }

    fn rejected(reports: &Reports, name: &str) -> bool {
        reports.is_rejected(ResourceKind::VirtualService, &ResourceRef::new("ns", name))
    }

    fn hcm(filter_chain: &xds_listener::FilterChain) -> xds_http::HttpConnectionManager {
        let filter = filter_chain.filters.last().unwrap();
        assert_eq!(filter.name, HCM_FILTER_NAME);
        let Some(xds_listener::filter::ConfigType::TypedConfig(any)) = &filter.config_type else {
            panic!("expected a typed config");
        };
        any.to_msg().unwrap()
    }

    fn names(listeners: &TranslatedListeners) -> Vec<&str> {
        listeners.listeners.iter().map(|l| l.name.as_str()).collect()
    }

    #[test]
    fn test_http_listener() {
        let snapshot = snapshot(vec![
            virtual_service("ns", "a", &["a.example.com"], "ns", "u1"),
            virtual_service("ns", "b", &["b.example.com"], "ns", "u1"),
        ]);
        let (out, _) = translate(&snapshot);

        assert_eq!(names(&out), vec!["listener-0.0.0.0-8080"]);
        assert_eq!(out.route_configurations.len(), 1);
        let route_config = &out.route_configurations[0];
        assert_eq!(route_config.name, "listener-0.0.0.0-8080-routes");
        assert_eq!(route_config.virtual_hosts.len(), 2);

        let hcm = hcm(&out.listeners[0].filter_chains[0]);
        assert_eq!(
            hcm.route_specifier,
            Some(xds_http::http_connection_manager::RouteSpecifier::Rds(xds_http::Rds {
                config_source: Some(ads_config_source()),
                route_config_name: route_config.name.clone(),
            }))
        );
        let filter_names: Vec<_> = hcm.http_filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(filter_names, vec![crate::xds::ROUTER_FILTER_NAME]);
    }

    #[test]
    fn test_no_virtual_services_no_listeners() {
        let (out, _) = translate(&snapshot(vec![]));
        assert!(out.listeners.is_empty());
        assert!(out.route_configurations.is_empty());
    }

    #[test]
    fn test_domain_conflicts_reject_both() {
        let snapshot = snapshot(vec![
            virtual_service("ns", "a", &["example.com", "a.example.com"], "ns", "u1"),
            virtual_service("ns", "b", &["example.com"], "ns", "u1"),
            virtual_service("ns", "c", &["c.example.com"], "ns", "u1"),
        ]);
        let (out, reports) = translate(&snapshot);

        assert!(rejected(&reports, "a"));
        assert!(rejected(&reports, "b"));
        assert!(!rejected(&reports, "c"));

        let domains: Vec<_> = out.route_configurations[0]
            .virtual_hosts
            .iter()
            .flat_map(|v| v.domains.iter())
            .collect();
        assert_eq!(domains, vec!["c.example.com"]);
    }

    #[test]
    fn test_same_domain_on_different_listeners() {
        let snapshot = snapshot(vec![
            virtual_service("ns", "plain", &["example.com"], "ns", "u1"),
            secure(virtual_service("ns", "tls", &["example.com"], "ns", "u1"), "tls"),
        ]);
        let (out, reports) = translate(&snapshot);

        assert!(!rejected(&reports, "plain"));
        assert!(!rejected(&reports, "tls"));
        assert_eq!(out.listeners.len(), 2);
    }

    #[test]
    fn test_secure_listener() {
        let snapshot = snapshot(vec![secure(
            virtual_service("ns", "vs", &["secure.example.com", "*"], "ns", "u1"),
            "tls",
        )]);
        let (out, reports) = translate(&snapshot);

        assert!(!rejected(&reports, "vs"));
        assert_eq!(names(&out), vec!["listener-0.0.0.0-8443"]);

        let listener = &out.listeners[0];
        assert_eq!(listener.listener_filters[0].name, TLS_INSPECTOR_FILTER_NAME);
        let chain = &listener.filter_chains[0];
        assert_eq!(
            chain.filter_chain_match.as_ref().unwrap().server_names,
            vec!["secure.example.com"]
        );
        assert!(chain.transport_socket.is_some());
        assert_eq!(out.route_configurations[0].name, "listener-0.0.0.0-8443-routes");
    }

    #[test]
    fn test_sni_domains_override_domains() {
        let mut vs = secure(virtual_service("ns", "vs", &["example.com"], "ns", "u1"), "tls");
        vs.ssl_config.as_mut().unwrap().sni_domains = vec!["sni.example.com".to_string()];
        assert_eq!(server_names(&vs), vec!["sni.example.com"]);
    }

    #[test]
    fn test_missing_secret_rejects() {
        let snapshot = snapshot(vec![
            secure(virtual_service("ns", "vs", &["example.com"], "ns", "u1"), "missing"),
            virtual_service("ns", "plain", &["plain.example.com"], "ns", "u1"),
        ]);
        let (out, reports) = translate(&snapshot);

        assert!(rejected(&reports, "vs"));
        assert!(!rejected(&reports, "plain"));
        assert_eq!(names(&out), vec!["listener-0.0.0.0-8080"]);
    }

    #[test]
    fn test_tcp_listener() {
        let snapshot = snapshot(vec![tcp(virtual_service("ns", "db", &["*"], "ns", "u1"), 5432)]);
        let (out, reports) = translate(&snapshot);

        assert!(!rejected(&reports, "db"));
        assert_eq!(names(&out), vec!["listener-0.0.0.0-5432"]);
        assert!(out.route_configurations.is_empty());

        let filter = &out.listeners[0].filter_chains[0].filters[0];
        assert_eq!(filter.name, TCP_PROXY_FILTER_NAME);
        let Some(xds_listener::filter::ConfigType::TypedConfig(any)) = &filter.config_type else {
            panic!("expected a typed config");
        };
        let proxy: xds_tcp::TcpProxy = any.to_msg().unwrap();
        assert_eq!(
            proxy.cluster_specifier,
            Some(TcpClusterSpecifier::Cluster("u1_ns".to_string()))
        );
    }

    #[test]
    fn test_tcp_port_conflicts() {
        let snapshot = snapshot(vec![
            tcp(virtual_service("ns", "a", &["*"], "ns", "u1"), 5432),
            tcp(virtual_service("ns", "b", &["*"], "ns", "u1"), 5432),
            tcp(virtual_service("ns", "c", &["*"], "ns", "u1"), 8080),
            tcp(virtual_service("ns", "d", &["*"], "ns", "u1"), 6379),
        ]);
        let (out, reports) = translate(&snapshot);

        assert!(rejected(&reports, "a"));
        assert!(rejected(&reports, "b"));
        assert!(rejected(&reports, "c"));
        assert!(!rejected(&reports, "d"));
        assert_eq!(names(&out), vec!["listener-0.0.0.0-6379"]);
    }

    #[test]
    fn test_tcp_direct_response_rejected() {
        let mut vs = tcp(virtual_service("ns", "vs", &["*"], "ns", "u1"), 5432);
        vs.tcp.as_mut().unwrap().destination = RouteAction::DirectResponse {
            status: 200,
            body: None,
        };
        let (out, reports) = translate(&snapshot(vec![vs]));

        assert!(rejected(&reports, "vs"));
        assert!(out.listeners.is_empty());
    }

    #[test]
    fn test_dual_stack() {
        let mut settings = Settings::default();
        settings.feature_flags.dual_stack = true;
        let snapshot = snapshot(vec![]);

        let address = |settings: &Settings| {
            let params = Params {
                role: "ingress",
                snapshot: &snapshot,
                settings,
            };
            match listener_address(&params, 8080).address {
                Some(xds_core::address::Address::SocketAddress(socket)) => {
                    (socket.address, socket.ipv4_compat)
                }
                other => panic!("unexpected address: {other:?}"),
            }
        };

        assert_eq!(address(&settings), ("::".to_string(), true));

        settings.bind_address = "10.0.0.1".to_string();
        assert_eq!(address(&settings), ("::ffff:10.0.0.1".to_string(), true));

        settings.bind_address = "::1".to_string();
        assert_eq!(address(&settings), ("::1".to_string(), false));

        settings.feature_flags.dual_stack = false;
        settings.bind_address = "10.0.0.1".to_string();
        assert_eq!(address(&settings), ("10.0.0.1".to_string(), false));
    }

    struct CorsFilter;

    impl Plugin for CorsFilter {
        fn name(&self) -> &'static str {
            "cors"
        }

        fn capabilities(self: Arc<Self>) -> Vec<Capability> {
            vec![Capability::HttpFilters(self)]
        }
    }

    impl HttpFilterPlugin for CorsFilter {
        fn http_filters(
            &self,
            _params: &Params,
            _listener: &ListenerSpec,
        ) -> Result<Vec<StagedHttpFilter>, PluginError> {
            let mut filter = StagedHttpFilter::new(
                xds_http::HttpFilter {
                    name: "envoy.filters.http.cors".to_string(),
                    ..Default::default()
                },
                FilterStage::during(WellKnownStage::Fault),
            );
            filter.remove_if_unused = true;
            Ok(vec![filter])
        }
    }

    fn http_filter_names(out: &TranslatedListeners) -> Vec<String> {
        hcm(&out.listeners[0].filter_chains[0])
            .http_filters
            .into_iter()
            .map(|f| f.name)
            .collect()
    }

    #[test]
    fn test_remove_unused_filters() {
        let mut settings = Settings::default();
        let snapshot = snapshot(vec![virtual_service("ns", "vs", &["*"], "ns", "u1")]);

        let init = InitParams {
            settings: &settings,
        };
        let registry = Registry::new(vec![Box::new(CorsFilter)], &init).unwrap();
        let (out, _) = translate_with(&registry, &settings, &snapshot);
        assert_eq!(
            http_filter_names(&out),
            vec!["envoy.filters.http.cors", crate::xds::ROUTER_FILTER_NAME]
        );

        settings.feature_flags.remove_unused_filters = true;
        let (out, _) = translate_with(&registry, &settings, &snapshot);
        assert_eq!(http_filter_names(&out), vec![crate::xds::ROUTER_FILTER_NAME]);
    }

    struct FailingListener;

    impl Plugin for FailingListener {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn capabilities(self: Arc<Self>) -> Vec<Capability> {
            vec![Capability::Listener(self)]
        }
    }

    impl ListenerPlugin for FailingListener {
        fn process_listener(
            &self,
            _params: &Params,
            listener: &ListenerSpec,
            _out: &mut Listener,
        ) -> Result<(), PluginError> {
            match listener.protocol {
                ListenerProtocol::Https => Err(PluginError::configuration("no https allowed")),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_listener_plugin_errors_drop_listener() {
        let settings = Settings::default();
        let snapshot = snapshot(vec![
            virtual_service("ns", "plain", &["plain.example.com"], "ns", "u1"),
            secure(virtual_service("ns", "tls", &["tls.example.com"], "ns", "u1"), "tls"),
        ]);

        let init = InitParams {
            settings: &settings,
        };
        let registry = Registry::new(vec![Box::new(FailingListener)], &init).unwrap();
        let (out, reports) = translate_with(&registry, &settings, &snapshot);

        assert!(!rejected(&reports, "plain"));
        assert!(rejected(&reports, "tls"));
        assert_eq!(names(&out), vec!["listener-0.0.0.0-8080"]);
        assert_eq!(out.route_configurations.len(), 1);
    }
}
