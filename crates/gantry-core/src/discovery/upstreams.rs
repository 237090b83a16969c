use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gantry_api::{
    upstream::{ConsulUpstream, Upstream, UpstreamSpec, UpstreamSslConfig},
    Metadata, ResourceRef,
};
use tokio_util::sync::CancellationToken;

use super::consul::{watch_services, ConsulCatalog, ServiceMeta};
use crate::error::StorageError;
use crate::settings::ConsulSettings;
use crate::storage::ResourceClient;

/// The name prefix of every Upstream created from the Consul catalog.
pub const CONSUL_UPSTREAM_PREFIX: &str = "consul-svc:";

/// The label set on every discovered Upstream, naming what discovered it.
pub const DISCOVERED_BY_LABEL: &str = "discovered_by";

const DISCOVERED_BY_CONSUL: &str = "consul";

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Keeps one Upstream per Consul service in storage.
///
/// Discovered Upstreams live in the write namespace and are labelled
/// `discovered_by: consul`. Upstreams with that label whose service has left
/// the catalog are deleted. Nothing without the label is ever touched.
pub struct UpstreamDiscovery {
    catalog: Arc<dyn ConsulCatalog>,
    settings: ConsulSettings,
    write_namespace: String,
    upstreams: Arc<dyn ResourceClient<Upstream>>,
}

impl UpstreamDiscovery {
    pub fn new(
        catalog: Arc<dyn ConsulCatalog>,
        settings: ConsulSettings,
        write_namespace: impl Into<String>,
        upstreams: Arc<dyn ResourceClient<Upstream>>,
    ) -> Self {
        Self {
            catalog,
            settings,
            write_namespace: write_namespace.into(),
            upstreams,
        }
    }

    /// Run until `cancel` is cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let mut watch = match watch_services(self.catalog.clone(), cancel.clone()).await {
                Ok(watch) => watch,
                Err(e) => {
                    tracing::warn!(err = %e, "failed to start consul upstream discovery");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(RETRY_INTERVAL) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    Some(e) = watch.errors.recv() => {
                        tracing::warn!(err = %e, "consul upstream discovery error");
                    }
                    services = watch.services.recv() => {
                        let Some(services) = services else { break };
                        let desired =
                            to_upstreams(&self.write_namespace, &self.settings, &services);
                        if let Err(e) = self.reconcile(desired).await {
                            tracing::warn!(err = %e, "failed to write discovered upstreams");
                        }
                    }
                }
            }
        }
    }

    /// Make the discovered Upstreams in storage match `desired`. Every write
    /// is attempted and the first error is returned.
    pub(crate) async fn reconcile(&self, desired: Vec<Upstream>) -> Result<(), StorageError> {
        let mut existing: BTreeMap<_, _> = self
            .upstreams
            .list(Some(&self.write_namespace))
            .await?
            .into_iter()
            .filter(is_discovered)
            .map(|u| (u.metadata.name.clone(), u))
            .collect();

        let mut first_error = None;
        let mut record = |res: Result<(), StorageError>| {
            if let Err(e) = res {
                tracing::debug!(err = %e, "discovered upstream write failed");
                first_error.get_or_insert(e);
            }
        };

        for mut upstream in desired {
            match existing.remove(&upstream.metadata.name) {
                Some(current) => {
                    upstream
                        .metadata
                        .resource_version
                        .clone_from(&current.metadata.resource_version);
                    if upstream != current {
                        tracing::debug!(
                            upstream = %upstream.metadata.name,
                            "updating discovered upstream",
                        );
                        record(self.upstreams.update(upstream).await.map(drop));
                    }
                }
                None => {
                    tracing::debug!(
                        upstream = %upstream.metadata.name,
                        "creating discovered upstream",
                    );
                    record(self.upstreams.create(upstream).await.map(drop));
                }
            }
        }

        for name in existing.into_keys() {
            tracing::debug!(upstream = %name, "deleting discovered upstream");
            record(self.upstreams.delete(&self.write_namespace, &name).await);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn is_discovered(upstream: &Upstream) -> bool {
    upstream.metadata.labels.get(DISCOVERED_BY_LABEL).map(String::as_str)
        == Some(DISCOVERED_BY_CONSUL)
}

/// The Upstreams for a list of catalog services.
///
/// Services tagged with the TLS tag get a `-tls` Upstream that verifies
/// instances against the root CA. When TLS services are split, the TLS
/// Upstream only selects instances with the TLS tag and a second, plaintext
/// Upstream selects instances with the no-TLS tag.
pub(crate) fn to_upstreams(
    write_namespace: &str,
    settings: &ConsulSettings,
    services: &[ServiceMeta],
) -> Vec<Upstream> {
    let mut upstreams = Vec::with_capacity(services.len());

    for service in services {
        let uses_tls =
            settings.use_tls_tagging && service.tags.iter().any(|t| *t == settings.tls_tag_name);

        if uses_tls {
            let instance_tags = match settings.split_tls_services {
                true => vec![settings.tls_tag_name.clone()],
                false => vec![],
            };
            let mut upstream = discovered_upstream(
                write_namespace,
                &format!("{}-tls", service.name),
                service,
                instance_tags,
            );
            upstream.ssl_config = Some(UpstreamSslConfig {
                secret_ref: Some(ResourceRef::new(
                    &settings.root_ca_namespace,
                    &settings.root_ca_name,
                )),
                sni: None,
            });
            upstreams.push(upstream);

            if !settings.split_tls_services {
                continue;
            }
        }

        let instance_tags = match uses_tls {
            true => vec![settings.no_tls_tag_name.clone()],
            false => vec![],
        };
        upstreams.push(discovered_upstream(
            write_namespace,
            &service.name,
            service,
            instance_tags,
        ));
    }

    upstreams
}

fn discovered_upstream(
    write_namespace: &str,
    name: &str,
    service: &ServiceMeta,
    instance_tags: Vec<String>,
) -> Upstream {
    let mut metadata = Metadata::new(write_namespace, format!("{CONSUL_UPSTREAM_PREFIX}{name}"));
    metadata
        .labels
        .insert(DISCOVERED_BY_LABEL.to_string(), DISCOVERED_BY_CONSUL.to_string());

    Upstream::new(
        metadata,
        UpstreamSpec::Consul(ConsulUpstream {
            service_name: service.name.clone(),
            service_tags: service.tags.clone(),
            instance_tags,
            data_centers: service.data_centers.clone(),
        }),
    )
}
