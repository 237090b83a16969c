use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use gantry_api::{endpoint::Endpoint, upstream::Upstream, Metadata, Resource};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::consul::{forward_error, watch_services, CatalogService, ConsulCatalog, ServiceMeta, ServiceWatch};
use super::dns::{resolve_address, DnsResolver};
use super::sanitize_name;
use crate::error::CatalogError;
use crate::plugins::EndpointWatch;

/// The label prefix for instance tags on discovered endpoints.
pub const TAG_LABEL_PREFIX: &str = "tag:";

/// The label prefix for datacenters on discovered endpoints.
pub const DC_LABEL_PREFIX: &str = "dc:";

pub const LABEL_MATCH: &str = "1";
pub const LABEL_NO_MATCH: &str = "0";

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Watches the Consul catalog and turns service instances into [Endpoint]s.
#[derive(Clone)]
pub(crate) struct EndpointWatcher {
    pub(crate) catalog: Arc<dyn ConsulCatalog>,
    pub(crate) resolver: Option<Arc<dyn DnsResolver>>,

    /// How often to rebuild endpoints from the last fetched instances, so
    /// that DNS changes are picked up without a catalog change.
    pub(crate) poll_interval: Duration,
}

/// A service instance, deduplicated across datacenters.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Instance {
    /// The instance with its datacenter cleared.
    service: CatalogService,
    data_centers: BTreeSet<String>,
}

type Fetched = (u64, Vec<Instance>);

impl EndpointWatcher {
    /// Start watching endpoints for the Consul upstreams in `upstreams`.
    /// Endpoints are written to `write_namespace`.
    ///
    /// The returned channels close once `cancel` is cancelled.
    pub(crate) fn watch(
        &self,
        write_namespace: &str,
        upstreams: Vec<Upstream>,
        cancel: CancellationToken,
    ) -> EndpointWatch {
        let mut tracked: BTreeMap<String, Vec<Upstream>> = BTreeMap::new();
        for upstream in upstreams {
            if let Some(consul) = upstream.consul() {
                tracked
                    .entry(consul.service_name.clone())
                    .or_default()
                    .push(upstream);
            }
        }

        let (endpoints_tx, endpoints_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(16);

        let watcher = self.clone();
        let write_namespace = write_namespace.to_string();
        tokio::spawn(async move {
            watcher
                .run(write_namespace, tracked, endpoints_tx, errors_tx, cancel)
                .await
        });

        EndpointWatch {
            endpoints: endpoints_rx,
            errors: errors_rx,
        }
    }

    async fn run(
        self,
        write_namespace: String,
        tracked: BTreeMap<String, Vec<Upstream>>,
        endpoints_tx: mpsc::Sender<Vec<Endpoint>>,
        errors_tx: mpsc::Sender<CatalogError>,
        cancel: CancellationToken,
    ) {
        let Some(mut services) = self.connect(&errors_tx, &cancel).await else {
            return;
        };

        let (fetched_tx, mut fetched_rx) = mpsc::channel::<Fetched>(1);
        let mut generation = 0;
        let mut fetch_cancel = cancel.child_token();

        let mut instances: Option<Vec<Instance>> = None;
        let mut last_sent: Option<Vec<Endpoint>> = None;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            let publish = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(e) = services.errors.recv() => {
                    forward_error(&errors_tx, e);
                    false
                }
                metas = services.services.recv() => {
                    let Some(metas) = metas else { break };

                    // anything still in flight is for an older catalog state
                    fetch_cancel.cancel();
                    fetch_cancel = cancel.child_token();
                    generation += 1;

                    tokio::spawn(fetch_instances(
                        self.catalog.clone(),
                        metas.into_iter().filter(|m| tracked.contains_key(&m.name)).collect(),
                        generation,
                        fetched_tx.clone(),
                        errors_tx.clone(),
                        fetch_cancel.clone(),
                    ));
                    false
                }
                Some((fetched_generation, fetched)) = fetched_rx.recv() => {
                    if fetched_generation == generation {
                        instances = Some(fetched);
                        true
                    } else {
                        false
                    }
                }
                _ = ticker.tick() => instances.is_some(),
            };

            if !publish {
                continue;
            }

            let Some(instances) = &instances else {
                continue;
            };
            let endpoints = self
                .build_endpoints(&write_namespace, instances, &tracked, &errors_tx)
                .await;
            if last_sent.as_ref() == Some(&endpoints) {
                continue;
            }

            tracing::debug!(endpoints = endpoints.len(), "consul endpoints changed");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = endpoints_tx.send(endpoints.clone()) => if res.is_err() { break },
            }
            last_sent = Some(endpoints);
        }

        fetch_cancel.cancel();
    }

    // keep trying to start the services watch until it works or the watch is
    // cancelled. the datacenter list is only read once per watch.
    async fn connect(
        &self,
        errors_tx: &mpsc::Sender<CatalogError>,
        cancel: &CancellationToken,
    ) -> Option<ServiceWatch> {
        loop {
            match watch_services(self.catalog.clone(), cancel.clone()).await {
                Ok(watch) => return Some(watch),
                Err(e) => forward_error(errors_tx, e),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => (),
            }
        }
    }

    async fn build_endpoints(
        &self,
        namespace: &str,
        instances: &[Instance],
        tracked: &BTreeMap<String, Vec<Upstream>>,
        errors_tx: &mpsc::Sender<CatalogError>,
    ) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();

        for instance in instances {
            let Some(upstreams) = tracked.get(&instance.service.service_name) else {
                continue;
            };

            let address = instance.service.effective_address();
            let ips = match resolve_address(self.resolver.as_deref(), address).await {
                Ok(ips) => ips,
                Err(e) => {
                    forward_error(errors_tx, e);
                    continue;
                }
            };

            endpoints.extend(build_endpoints(namespace, instance, upstreams, &ips));
        }

        endpoints.sort_by(|a, b| {
            (&a.metadata.name, &a.address).cmp(&(&b.metadata.name, &b.address))
        });
        endpoints
    }
}

async fn fetch_instances(
    catalog: Arc<dyn ConsulCatalog>,
    services: Vec<ServiceMeta>,
    generation: u64,
    tx: mpsc::Sender<Fetched>,
    errors_tx: mpsc::Sender<CatalogError>,
    cancel: CancellationToken,
) {
    let fetches = services.iter().flat_map(|svc| {
        svc.data_centers
            .iter()
            .map(|dc| catalog.service(&svc.name, dc))
    });

    let results = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        results = futures::future::join_all(fetches) => results,
    };

    // a failed fetch still publishes everything that did succeed
    let mut collector = InstanceCollector::default();
    for result in results {
        match result {
            Ok(services) => collector.add(services),
            Err(e) => forward_error(&errors_tx, e),
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => (),
        _ = tx.send((generation, collector.into_instances())) => (),
    }
}

/// Deduplicates instances returned by more than one datacenter. Instances
/// are keyed by their JSON encoding with the datacenter left out.
#[derive(Default)]
struct InstanceCollector {
    instances: BTreeMap<String, Instance>,
}

impl InstanceCollector {
    fn add(&mut self, services: Vec<CatalogService>) {
        for mut service in services {
            let dc = std::mem::take(&mut service.datacenter);
            let key = match serde_json::to_string(&service) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(err = %e, service = %service.service_name, "failed to encode catalog service");
                    continue;
                }
            };

            let instance = self.instances.entry(key).or_insert_with(|| Instance {
                service,
                data_centers: BTreeSet::new(),
            });
            if !dc.is_empty() {
                instance.data_centers.insert(dc);
            }
        }
    }

    fn into_instances(self) -> Vec<Instance> {
        self.instances.into_values().collect()
    }
}

fn build_endpoints(
    namespace: &str,
    instance: &Instance,
    upstreams: &[Upstream],
    ips: &[std::net::IpAddr],
) -> Vec<Endpoint> {
    let service = &instance.service;
    let name = endpoint_name(service);
    let labels = build_labels(&service.service_tags, &instance.data_centers, upstreams);
    let upstream_refs: Vec<_> = upstreams
        .iter()
        .filter(|u| {
            u.consul()
                .is_some_and(|c| c.matches_instance_tags(&service.service_tags))
        })
        .map(|u| u.resource_ref())
        .collect();

    if upstream_refs.is_empty() {
        return Vec::new();
    }

    ips.iter()
        .map(|ip| {
            // names have to stay unique when a hostname resolves to more
            // than one address
            let name = match ips.len() {
                1 => name.clone(),
                _ => sanitize_name(&format!("{name}-{ip}")),
            };

            Endpoint {
                metadata: Metadata {
                    name,
                    namespace: namespace.to_string(),
                    resource_version: service.modify_index.to_string(),
                    labels: labels.clone(),
                    annotations: BTreeMap::new(),
                },
                upstreams: upstream_refs.clone(),
                address: ip.to_string(),
                port: service.service_port,
            }
        })
        .collect()
}

fn endpoint_name(service: &CatalogService) -> String {
    let name = if service.service_id.is_empty() {
        service.service_name.clone()
    } else {
        format!("{}-{}", service.service_name, service.service_id)
    };
    sanitize_name(&name.replace('_', ""))
}

/// Labels for subset matching: one `tag:` label for every tag any upstream
/// of the service knows about, and one `dc:` label for every datacenter.
/// A label is `1` when the instance has the tag or is in the datacenter.
fn build_labels(
    tags: &[String],
    data_centers: &BTreeSet<String>,
    upstreams: &[Upstream],
) -> BTreeMap<String, String> {
    let known_tags: BTreeSet<_> = upstreams
        .iter()
        .filter_map(|u| u.consul())
        .flat_map(|c| &c.service_tags)
        .collect();
    let known_dcs: BTreeSet<_> = upstreams
        .iter()
        .filter_map(|u| u.consul())
        .flat_map(|c| &c.data_centers)
        .collect();

    let label = |present: bool| if present { LABEL_MATCH } else { LABEL_NO_MATCH }.to_string();

    let mut labels = BTreeMap::new();
    for tag in known_tags {
        labels.insert(format!("{TAG_LABEL_PREFIX}{tag}"), label(tags.contains(tag)));
    }
    for dc in known_dcs {
        labels.insert(format!("{DC_LABEL_PREFIX}{dc}"), label(data_centers.contains(dc)));
    }
    labels
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::discovery::dns::test::StaticResolver;
    use crate::discovery::test::{consul_upstream, instance, FakeCatalog};
    use gantry_api::ResourceRef;

    fn watcher(catalog: &Arc<FakeCatalog>, resolver: Option<StaticResolver>) -> EndpointWatcher {
        EndpointWatcher {
            catalog: catalog.clone(),
            resolver: resolver.map(|r| Arc::new(r) as Arc<dyn DnsResolver>),
            poll_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_endpoint_name() {
        let mut svc = instance("web", "10.0.0.1", 8080);
        svc.service_id = "web_1.node".to_string();
        assert_eq!(endpoint_name(&svc), "web-web1-node");

        svc.service_id = String::new();
        assert_eq!(endpoint_name(&svc), "web");
    }

    #[test]
    fn test_labels() {
        let mut upstream = consul_upstream("gantry-system", "web", "web");
        if let gantry_api::upstream::UpstreamSpec::Consul(spec) = &mut upstream.spec {
            spec.service_tags = vec!["v1".to_string(), "v2".to_string()];
            spec.data_centers = vec!["dc1".to_string(), "dc2".to_string()];
        }

        let labels = build_labels(
            &["v1".to_string(), "other".to_string()],
            &BTreeSet::from(["dc2".to_string()]),
            &[upstream],
        );
        assert_eq!(
            labels,
            BTreeMap::from([
                ("tag:v1".to_string(), "1".to_string()),
                ("tag:v2".to_string(), "0".to_string()),
                ("dc:dc1".to_string(), "0".to_string()),
                ("dc:dc2".to_string(), "1".to_string()),
            ])
        );
    }

    #[test]
    fn test_instance_tag_filter() {
        let all = consul_upstream("ns", "web", "web");
        let mut tls = consul_upstream("ns", "web-tls", "web");
        if let gantry_api::upstream::UpstreamSpec::Consul(spec) = &mut tls.spec {
            spec.instance_tags = vec!["tls".to_string()];
        }

        let plain = Instance {
            service: instance("web", "10.0.0.1", 8080),
            data_centers: BTreeSet::from(["dc1".to_string()]),
        };
        let endpoints = build_endpoints(
            "ns",
            &plain,
            &[all, tls],
            &["10.0.0.1".parse().unwrap()],
        );
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].upstreams, vec![ResourceRef::new("ns", "web")]);
        assert_eq!(endpoints[0].metadata.resource_version, "1");
    }

    #[tokio::test]
    async fn test_dedup_across_datacenters() {
        let catalog = Arc::new(FakeCatalog::new(&["dc1", "dc2"]));
        let web = instance("web", "10.0.0.1", 8080);
        catalog.register("dc1", "web", &[], vec![web.clone()]);
        catalog.register("dc2", "web", &[], vec![web]);

        let mut upstream = consul_upstream("gantry-system", "consul-svc:web", "web");
        if let gantry_api::upstream::UpstreamSpec::Consul(spec) = &mut upstream.spec {
            spec.data_centers = vec!["dc1".to_string(), "dc2".to_string()];
        }

        let cancel = CancellationToken::new();
        let mut watch = watcher(&catalog, None).watch("gantry-system", vec![upstream], cancel.clone());

        // the first update may only have one datacenter's services in it
        let mut endpoints = watch.endpoints.recv().await.unwrap();
        let in_both = |endpoints: &[Endpoint]| {
            endpoints.len() == 1
                && endpoints[0].metadata.labels.get("dc:dc1").map(String::as_str) == Some("1")
                && endpoints[0].metadata.labels.get("dc:dc2").map(String::as_str) == Some("1")
        };
        while !in_both(&endpoints) {
            endpoints = watch.endpoints.recv().await.unwrap();
        }

        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].metadata.labels["dc:dc1"], "1");
        assert_eq!(endpoints[0].metadata.labels["dc:dc2"], "1");
        assert_eq!(endpoints[0].address, "10.0.0.1");
        assert_eq!(endpoints[0].port, 8080);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_hostnames_are_resolved() {
        let catalog = Arc::new(FakeCatalog::new(&["dc1"]));
        catalog.register("dc1", "db", &[], vec![instance("db", "db.internal", 5432)]);

        let cancel = CancellationToken::new();
        let resolver = StaticResolver::with("db.internal", &["10.0.0.2", "10.0.0.3"]);
        let mut watch = watcher(&catalog, Some(resolver)).watch(
            "ns",
            vec![consul_upstream("ns", "db", "db")],
            cancel.clone(),
        );

        let endpoints = watch.endpoints.recv().await.unwrap();
        let addresses: Vec<_> = endpoints.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.2", "10.0.0.3"]);
        assert_ne!(endpoints[0].metadata.name, endpoints[1].metadata.name);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let catalog = Arc::new(FakeCatalog::new(&["dc1", "dc2"]));
        catalog.register("dc1", "web", &[], vec![instance("web", "10.0.0.1", 80)]);
        catalog.register("dc2", "web", &[], vec![instance("web", "10.0.0.9", 80)]);
        catalog.fail_service("dc2");

        let cancel = CancellationToken::new();
        let mut watch = watcher(&catalog, None).watch(
            "ns",
            vec![consul_upstream("ns", "web", "web")],
            cancel.clone(),
        );

        // dc2's services may show up first, and fail to fetch
        let mut endpoints = watch.endpoints.recv().await.unwrap();
        while endpoints.is_empty() {
            endpoints = watch.endpoints.recv().await.unwrap();
        }
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].address, "10.0.0.1");

        let err = watch.errors.recv().await.unwrap();
        assert!(err.to_string().contains("dc2"), "{err}");

        cancel.cancel();
    }
}
