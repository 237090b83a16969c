//! Translation from configuration to xDS.
//!
//! The [Translator] turns the projection of an [InputSnapshot] onto a single
//! role into an [XdsSnapshot] for that role, plus a [Report] for every
//! Upstream, UpstreamGroup and VirtualService it examined. Translation is
//! synchronous and deterministic: the same snapshot and registry always
//! produce the same resources and the same versions.
//!
//! Errors never abort a translation. An Upstream that fails translation is
//! left out of the cluster list and rejected, a VirtualService that fails is
//! left out of its listener and rejected, and everything else is translated
//! as usual. Whether the result is safe to push is up to the caller, see
//! [TranslationResult::invalid_config].

use std::collections::{BTreeMap, BTreeSet};

use gantry_api::{
    http::{Destination, RouteAction, WeightedDestination},
    report::Report,
    Resource, ResourceKind, ResourceRef,
};
use xds_api::pb::envoy::config::core::v3 as xds_core;
use xds_api::pb::google::protobuf;

use crate::plugins::{Params, PluginError, Registry, XdsResources, GENERATED_PREFIX};
use crate::settings::Settings;
use crate::snapshot::{Config, InputSnapshot};
use crate::xds::XdsSnapshot;

mod clusters;
mod listeners;
mod routes;

pub use routes::{sort_routes, validate_path};

/// The filter metadata namespace Envoy uses for load balancer subset
/// matching.
pub(crate) const ENVOY_LB: &str = "envoy.lb";

/// The name of the cluster generated for an Upstream.
pub fn cluster_name(upstream: &ResourceRef) -> String {
    format!("{}_{}", upstream.name, upstream.namespace)
}

/// Translates input snapshots into xDS. A translator is cheap to clone and
/// holds no state between translations.
#[derive(Debug, Clone)]
pub struct Translator {
    registry: Registry,
    settings: Settings,
}

/// The output of a single translation.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationResult {
    pub snapshot: XdsSnapshot,

    /// One report for every object that was examined. Reports are not
    /// qualified by role.
    pub reports: Vec<Report>,

    /// Set when an accepted VirtualService depends on an Upstream or
    /// UpstreamGroup that was rejected. Pushing a snapshot like this would
    /// send traffic to clusters that don't exist.
    pub invalid_config: bool,
}

impl TranslationResult {
    /// Every report of a single kind.
    pub fn reports_for(&self, kind: ResourceKind) -> impl Iterator<Item = &Report> {
        self.reports.iter().filter(move |r| r.kind == kind)
    }
}

impl Translator {
    pub fn new(registry: Registry, settings: Settings) -> Self {
        Self { registry, settings }
    }

    pub fn translate(&self, role: &str, snapshot: &InputSnapshot) -> TranslationResult {
        let params = Params {
            role,
            snapshot,
            settings: &self.settings,
        };

        let config = &snapshot.config;
        let mut reports = Reports::default();
        for upstream in &config.upstreams {
            reports.examined(ResourceKind::Upstream, upstream.resource_ref());
        }
        for group in &config.upstream_groups {
            reports.examined(ResourceKind::UpstreamGroup, group.resource_ref());
        }
        for vs in &config.virtual_services {
            reports.examined(ResourceKind::VirtualService, vs.resource_ref());
        }

        let clusters = clusters::translate_clusters(&self.registry, &params, &mut reports);
        let endpoints = clusters::translate_endpoints(snapshot, &clusters);
        routes::validate_upstream_groups(snapshot, &mut reports);

        let hosts = routes::translate_virtual_hosts(&self.registry, &params, &mut reports);
        let tcp_hosts = listeners::translate_tcp_hosts(&params, &mut reports);
        let listeners = listeners::translate_listeners(
            &self.registry,
            &params,
            hosts,
            tcp_hosts,
            &mut reports,
        );

        let mut resources = XdsResources {
            clusters,
            endpoints,
            route_configurations: listeners.route_configurations,
            listeners: listeners.listeners,
        };
        self.generate_resources(&params, &mut resources);

        let invalid_config = invalid_config(snapshot, &reports);
        let reports = reports.into_reports();

        tracing::debug!(
            role,
            listeners = resources.listeners.len(),
            routes = resources.route_configurations.len(),
            clusters = resources.clusters.len(),
            endpoints = resources.endpoints.len(),
            rejected = reports.iter().filter(|r| r.is_rejected()).count(),
            invalid_config,
            "translated snapshot",
        );

        TranslationResult {
            snapshot: XdsSnapshot::new(
                resources.listeners,
                resources.route_configurations,
                resources.clusters,
                resources.endpoints,
            ),
            reports,
            invalid_config,
        }
    }

    /// Validate every Upstream and UpstreamGroup in `snapshot`, referenced or
    /// not, and report on each of them.
    ///
    /// Upstream and UpstreamGroup reports don't depend on the role, so these
    /// are the global reports for the whole snapshot. Clusters built along
    /// the way are thrown away, so endpoints aren't needed.
    pub fn validate_upstreams(&self, snapshot: &InputSnapshot) -> Vec<Report> {
        let upstreams = InputSnapshot {
            config: Config {
                upstreams: snapshot.config.upstreams.clone(),
                upstream_groups: snapshot.config.upstream_groups.clone(),
                virtual_services: vec![],
            },
            secrets: snapshot.secrets.clone(),
            artifacts: snapshot.artifacts.clone(),
            endpoints: vec![],
            ready: snapshot.ready,
        };
        let params = Params {
            role: "",
            snapshot: &upstreams,
            settings: &self.settings,
        };

        let mut reports = Reports::default();
        for upstream in &upstreams.config.upstreams {
            reports.examined(ResourceKind::Upstream, upstream.resource_ref());
        }
        for group in &upstreams.config.upstream_groups {
            reports.examined(ResourceKind::UpstreamGroup, group.resource_ref());
        }

        clusters::translate_clusters(&self.registry, &params, &mut reports);
        routes::validate_upstream_groups(&upstreams, &mut reports);

        reports.into_reports()
    }

    /// Run every generated resources plugin and fold its output in.
    ///
    /// Each plugin sees everything translated so far, including the output
    /// of earlier plugins. Output that uses a name without
    /// [GENERATED_PREFIX], or a name that's already taken, is dropped.
    fn generate_resources(&self, params: &Params, resources: &mut XdsResources) {
        for plugin in &self.registry.generated_resources {
            let generated = match plugin.generated_resources(params, resources) {
                Ok(generated) => generated,
                Err(e) => {
                    tracing::warn!(role = params.role, err = %e, "failed to generate resources");
                    continue;
                }
            };

            if let Err(name) = check_generated_names(resources, &generated) {
                tracing::warn!(
                    role = params.role,
                    name,
                    "dropping generated resources with an invalid name",
                );
                continue;
            }

            resources.clusters.extend(generated.clusters);
            resources.endpoints.extend(generated.endpoints);
            resources
                .route_configurations
                .extend(generated.route_configurations);
            resources.listeners.extend(generated.listeners);
        }
    }
}

fn check_generated_names(existing: &XdsResources, generated: &XdsResources) -> Result<(), String> {
    fn names(resources: &XdsResources) -> impl Iterator<Item = &str> {
        let clusters = resources.clusters.iter().map(|c| c.name.as_str());
        let endpoints = resources.endpoints.iter().map(|e| e.cluster_name.as_str());
        let routes = resources
            .route_configurations
            .iter()
            .map(|r| r.name.as_str());
        let listeners = resources.listeners.iter().map(|l| l.name.as_str());
        clusters.chain(endpoints).chain(routes).chain(listeners)
    }

    let taken: BTreeSet<_> = names(existing).collect();
    for name in names(generated) {
        if !name.starts_with(GENERATED_PREFIX) || taken.contains(name) {
            return Err(name.to_string());
        }
    }
    Ok(())
}

fn invalid_config(snapshot: &InputSnapshot, reports: &Reports) -> bool {
    let config = &snapshot.config;

    let upstream_rejected = |r: &ResourceRef| reports.is_rejected(ResourceKind::Upstream, r);
    let group_rejected = |r: &ResourceRef| {
        if reports.is_rejected(ResourceKind::UpstreamGroup, r) {
            return true;
        }
        config
            .find_upstream_group(r)
            .is_some_and(|g| g.upstream_refs().any(upstream_rejected))
    };

    config
        .virtual_services
        .iter()
        .filter(|vs| !reports.is_rejected(ResourceKind::VirtualService, &vs.resource_ref()))
        .any(|vs| {
            vs.upstream_refs().any(upstream_rejected)
                || vs.upstream_group_refs().any(group_rejected)
        })
}

/// Accumulates errors and warnings per object over a translation.
#[derive(Debug, Default)]
pub(crate) struct Reports {
    entries: BTreeMap<(ResourceKind, ResourceRef), ReportEntry>,
}

#[derive(Debug, Default)]
struct ReportEntry {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Reports {
    fn examined(&mut self, kind: ResourceKind, object: ResourceRef) {
        self.entries.entry((kind, object)).or_default();
    }

    pub(crate) fn reject(
        &mut self,
        kind: ResourceKind,
        object: &ResourceRef,
        reason: impl ToString,
    ) {
        let reason = reason.to_string();
        tracing::debug!(%kind, object = %object, reason, "rejecting object");
        self.entries
            .entry((kind, object.clone()))
            .or_default()
            .errors
            .push(reason);
    }

    pub(crate) fn warn(
        &mut self,
        kind: ResourceKind,
        object: &ResourceRef,
        warning: impl ToString,
    ) {
        self.entries
            .entry((kind, object.clone()))
            .or_default()
            .warnings
            .push(warning.to_string());
    }

    /// Record a plugin error against an object. Returns `true` if the error
    /// rejects the object.
    pub(crate) fn plugin_error(
        &mut self,
        kind: ResourceKind,
        object: &ResourceRef,
        error: PluginError,
    ) -> bool {
        if error.is_warning() {
            self.warn(kind, object, error);
            false
        } else {
            self.reject(kind, object, error);
            true
        }
    }

    pub(crate) fn is_rejected(&self, kind: ResourceKind, object: &ResourceRef) -> bool {
        self.entries
            .get(&(kind, object.clone()))
            .is_some_and(|e| !e.errors.is_empty())
    }

    fn into_reports(self) -> Vec<Report> {
        self.entries
            .into_iter()
            .map(|((kind, object), entry)| {
                let mut report = if entry.errors.is_empty() {
                    Report::accepted(kind, object)
                } else {
                    Report::rejected(kind, object, entry.errors.join("; "))
                };
                report.warnings = entry.warnings;
                report
            })
            .collect()
    }
}

/// Where an action sends traffic.
pub(crate) enum Forward<'a> {
    Single(&'a Destination),
    Weighted(&'a [WeightedDestination]),
}

/// Resolve the upstream destinations of an action.
///
/// Returns `Ok(None)` for actions that don't forward to an upstream. Every
/// directly referenced Upstream must exist. Upstreams referenced through a
/// group are checked when the group itself is validated.
pub(crate) fn forward<'a>(
    snapshot: &'a InputSnapshot,
    action: &'a RouteAction,
) -> Result<Option<Forward<'a>>, PluginError> {
    let config = &snapshot.config;
    let check = |upstream: &ResourceRef| match config.find_upstream(upstream) {
        Some(_) => Ok(()),
        None => Err(PluginError::configuration(format!("upstream {upstream} not found"))),
    };

    match action {
        RouteAction::Single(destination) => {
            check(&destination.upstream).map_err(|e| e.with_field("upstream"))?;
            Ok(Some(Forward::Single(destination)))
        }
        RouteAction::Multi { destinations } => {
            for (i, d) in destinations.iter().enumerate() {
                check(&d.destination.upstream).map_err(|e| {
                    e.with_field("upstream")
                        .with_field("destination")
                        .with_field_index("destinations", i)
                })?;
            }
            check_weights(destinations).map_err(|e| e.with_field("destinations"))?;
            Ok(Some(Forward::Weighted(destinations)))
        }
        RouteAction::UpstreamGroup(group_ref) => {
            let Some(group) = config.find_upstream_group(group_ref) else {
                return Err(PluginError::configuration(format!(
                    "upstreamGroup {} not found",
                    group_ref.name
                )));
            };
            Ok(Some(Forward::Weighted(&group.destinations)))
        }
        RouteAction::DirectResponse { .. } | RouteAction::Redirect(_) => Ok(None),
    }
}

pub(crate) fn check_weights(destinations: &[WeightedDestination]) -> Result<(), PluginError> {
    if destinations.is_empty() {
        return Err(PluginError::configuration("must have at least one destination"));
    }

    let total: u64 = destinations.iter().map(|d| d.weight as u64).sum();
    if total == 0 {
        return Err(PluginError::configuration("total weight must be positive"));
    }

    Ok(())
}

/// `envoy.lb` filter metadata with a string value for every label.
pub(crate) fn lb_metadata(labels: &BTreeMap<String, String>) -> Option<xds_core::Metadata> {
    if labels.is_empty() {
        return None;
    }

    let fields = labels
        .iter()
        .map(|(k, v)| {
            let value = protobuf::Value {
                kind: Some(protobuf::value::Kind::StringValue(v.clone())),
            };
            (k.clone(), value)
        })
        .collect();

    Some(xds_core::Metadata {
        filter_metadata: [(ENVOY_LB.to_string(), protobuf::Struct { fields })].into(),
        ..Default::default()
    })
}
