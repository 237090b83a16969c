use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CatalogError;
use crate::settings::ConsulSettings;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// How long a blocking query waits for a change before Consul returns the
/// current state anyway.
const BLOCKING_WAIT: Duration = Duration::from_secs(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A single service instance, as returned by `/v1/catalog/service/:name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogService {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(default)]
    pub node: String,

    /// The address of the node the service is registered on.
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub datacenter: String,

    #[serde(rename = "ServiceID", default)]
    pub service_id: String,

    #[serde(default)]
    pub service_name: String,

    /// The address of the service itself. Empty when the service uses its
    /// node's address.
    #[serde(default)]
    pub service_address: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub service_tags: Vec<String>,

    #[serde(default)]
    pub service_port: u32,

    #[serde(default)]
    pub modify_index: u64,
}

impl CatalogService {
    /// The address to send traffic to.
    pub fn effective_address(&self) -> &str {
        if self.service_address.is_empty() {
            &self.address
        } else {
            &self.service_address
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A catalog response and the index it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexed<T> {
    pub value: T,
    pub index: u64,
}

/// The parts of the Consul catalog API discovery uses.
#[async_trait]
pub trait ConsulCatalog: Send + Sync + 'static {
    async fn datacenters(&self) -> Result<Vec<String>, CatalogError>;

    /// Every service name in a datacenter and the tags of its instances.
    ///
    /// With a non-zero `index` this is a blocking query: it returns once the
    /// catalog index moves past `index` or the wait time runs out.
    async fn services(
        &self,
        datacenter: &str,
        index: u64,
    ) -> Result<Indexed<BTreeMap<String, Vec<String>>>, CatalogError>;

    /// Every instance of a service in a datacenter.
    async fn service(
        &self,
        name: &str,
        datacenter: &str,
    ) -> Result<Vec<CatalogService>, CatalogError>;
}

/// A Consul HTTP API client.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    client: reqwest::Client,
    base_url: String,
}

impl ConsulClient {
    pub fn new(settings: &ConsulSettings) -> Result<Self, CatalogError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &settings.token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| CatalogError::Other(format!("invalid consul token: {e}")))?;
            headers.insert(TOKEN_HEADER, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| CatalogError::Other(format!("failed to build consul client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.address.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<Indexed<T>, CatalogError> {
        let url = format!("{}{path}", self.base_url);
        let request_error = |e: reqwest::Error| CatalogError::Request {
            url: url.clone(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(&url)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(request_error)?;

        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let value = response.json().await.map_err(request_error)?;

        Ok(Indexed { value, index })
    }
}

#[async_trait]
impl ConsulCatalog for ConsulClient {
    async fn datacenters(&self) -> Result<Vec<String>, CatalogError> {
        let dcs: Indexed<Vec<String>> = self
            .get("/v1/catalog/datacenters", &[], REQUEST_TIMEOUT)
            .await?;
        Ok(dcs.value)
    }

    async fn services(
        &self,
        datacenter: &str,
        index: u64,
    ) -> Result<Indexed<BTreeMap<String, Vec<String>>>, CatalogError> {
        let mut query = vec![("dc", datacenter.to_string()), ("consistent", String::new())];
        let mut timeout = REQUEST_TIMEOUT;
        if index > 0 {
            query.push(("index", index.to_string()));
            query.push(("wait", format!("{}s", BLOCKING_WAIT.as_secs())));
            // consul adds up to wait/16 of jitter to a blocking query
            timeout += BLOCKING_WAIT + BLOCKING_WAIT / 16;
        }

        let services: Indexed<BTreeMap<String, Option<Vec<String>>>> =
            self.get("/v1/catalog/services", &query, timeout).await?;

        Ok(Indexed {
            value: services
                .value
                .into_iter()
                .map(|(name, tags)| (name, tags.unwrap_or_default()))
                .collect(),
            index: services.index,
        })
    }

    async fn service(
        &self,
        name: &str,
        datacenter: &str,
    ) -> Result<Vec<CatalogService>, CatalogError> {
        let path = format!("/v1/catalog/service/{name}");
        let query = [("dc", datacenter.to_string()), ("consistent", String::new())];
        let services: Indexed<Vec<CatalogService>> =
            self.get(&path, &query, REQUEST_TIMEOUT).await?;
        Ok(services.value)
    }
}

/// A service and every datacenter it's registered in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceMeta {
    pub name: String,

    /// Sorted.
    pub data_centers: Vec<String>,

    /// The union of every instance's tags across datacenters. Sorted.
    pub tags: Vec<String>,
}

/// A live watch on the services in every datacenter.
pub struct ServiceWatch {
    /// The full list of services, sorted by name, sent whenever any
    /// datacenter changes.
    pub services: mpsc::Receiver<Vec<ServiceMeta>>,
    pub errors: mpsc::Receiver<CatalogError>,
}

/// Watch the service list of every datacenter with blocking queries until
/// `cancel` is cancelled.
pub(crate) async fn watch_services(
    catalog: Arc<dyn ConsulCatalog>,
    cancel: CancellationToken,
) -> Result<ServiceWatch, CatalogError> {
    let datacenters = catalog.datacenters().await?;

    let (services_tx, services_rx) = mpsc::channel(1);
    let (errors_tx, errors_rx) = mpsc::channel(16);
    let (dc_tx, mut dc_rx) = mpsc::channel(datacenters.len().max(1));

    for dc in datacenters {
        tokio::spawn(watch_datacenter(
            catalog.clone(),
            dc,
            dc_tx.clone(),
            errors_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(dc_tx);

    tokio::spawn(async move {
        let mut by_dc = BTreeMap::new();
        let mut last_sent = None;

        loop {
            let (dc, services) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = dc_rx.recv() => match next {
                    Some(next) => next,
                    None => return,
                },
            };
            by_dc.insert(dc, services);

            let metas = to_service_metas(&by_dc);
            if last_sent.as_ref() == Some(&metas) {
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = services_tx.send(metas.clone()) => if res.is_err() { return },
            }
            last_sent = Some(metas);
        }
    });

    Ok(ServiceWatch {
        services: services_rx,
        errors: errors_rx,
    })
}

type DatacenterServices = (String, BTreeMap<String, Vec<String>>);

async fn watch_datacenter(
    catalog: Arc<dyn ConsulCatalog>,
    dc: String,
    tx: mpsc::Sender<DatacenterServices>,
    errors: mpsc::Sender<CatalogError>,
    cancel: CancellationToken,
) {
    let mut index = 0;
    let mut backoff = MIN_BACKOFF;

    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            res = catalog.services(&dc, index) => res,
        };

        match res {
            Ok(services) => {
                backoff = MIN_BACKOFF;

                // an index that goes backwards means the catalog was reset.
                // start over with a non-blocking query.
                if services.index < index {
                    index = 0;
                    continue;
                }
                if services.index == index && index > 0 {
                    continue;
                }

                index = services.index;
                if tx.send((dc.clone(), services.value)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(%dc, err = %e, "consul services query failed");
                forward_error(&errors, e);

                let sleep = jittered(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(sleep) => (),
                }
            }
        }
    }
}

fn jittered(d: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    d.mul_f64(1.0 + jitter)
}

/// Send an error without waiting. A full channel drops the error with a
/// warning instead of stalling the watch.
pub(crate) fn forward_error(errors: &mpsc::Sender<CatalogError>, e: CatalogError) {
    if let Err(mpsc::error::TrySendError::Full(e)) = errors.try_send(e) {
        tracing::warn!(err = %e, "catalog error channel is full, dropping error");
    }
}

/// Merge per-datacenter service lists into one entry per service.
pub(crate) fn to_service_metas(
    by_dc: &BTreeMap<String, BTreeMap<String, Vec<String>>>,
) -> Vec<ServiceMeta> {
    let mut merged: BTreeMap<&str, (BTreeSet<&str>, BTreeSet<&str>)> = BTreeMap::new();

    for (dc, services) in by_dc {
        for (name, tags) in services {
            let (dcs, all_tags) = merged.entry(name).or_default();
            dcs.insert(dc);
            all_tags.extend(tags.iter().map(String::as_str));
        }
    }

    merged
        .into_iter()
        .map(|(name, (dcs, tags))| ServiceMeta {
            name: name.to_string(),
            data_centers: dcs.into_iter().map(str::to_string).collect(),
            tags: tags.into_iter().map(str::to_string).collect(),
        })
        .collect()
}
