//! State-of-the-world xDS servers.
//!
//! A single [XdsServer] implements ADS and the standalone LDS, RDS, CDS and
//! EDS services. Every stream is handled by its own task, which reads
//! requests from the proxy and watches the [SnapshotCache] for the proxy's
//! role. Delta xDS is not supported.

use std::{net::SocketAddr, pin::Pin, sync::Arc};

use enum_map::EnumMap;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use xds_api::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::{
        ClusterDiscoveryService, ClusterDiscoveryServiceServer,
    },
    discovery::v3::{
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
    endpoint::v3::endpoint_discovery_service_server::{
        EndpointDiscoveryService, EndpointDiscoveryServiceServer,
    },
    listener::v3::listener_discovery_service_server::{
        ListenerDiscoveryService, ListenerDiscoveryServiceServer,
    },
    route::v3::route_discovery_service_server::{
        RouteDiscoveryService, RouteDiscoveryServiceServer,
    },
};

use crate::xds::cache::{CacheEntry, SnapshotCache};
use crate::xds::node::{self, NodeInfo};
use crate::xds::{ResourceType, ResourceVersion, XdsSnapshot};

macro_rules! log_request {
    ($node:expr, $request:expr) => {
        tracing::debug!(
            node = $node,
            nack = $request.error_detail.is_some(),
            "DiscoveryRequest(v={:?}, n={:?}, ty={:?}, r={:?})",
            $request.version_info,
            $request.response_nonce,
            $request.type_url,
            $request.resource_names,
        );
    };
}

macro_rules! log_response {
    ($node:expr, $response:expr) => {
        tracing::debug!(
            node = $node,
            "DiscoveryResponse(v={:?}, n={:?}, ty={:?}, count={})",
            $response.version_info,
            $response.nonce,
            $response.type_url,
            $response.resources.len(),
        );
    };
}

type DiscoveryResponseStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;

type DeltaDiscoveryResponseStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

/// An xDS server that serves snapshots from a [SnapshotCache].
#[derive(Clone)]
pub struct XdsServer {
    cache: SnapshotCache,
    bad_node: Arc<XdsSnapshot>,
}

impl XdsServer {
    pub fn new(cache: SnapshotCache, bad_node: XdsSnapshot) -> Self {
        Self {
            cache,
            bad_node: Arc::new(bad_node),
        }
    }

    /// Serve ADS, the per-type discovery services and gRPC reflection until
    /// `cancel` is cancelled.
    pub async fn serve(self, addr: SocketAddr, cancel: CancellationToken) -> crate::Result<()> {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(xds_api::FILE_DESCRIPTOR_SET)
            .build()?;

        info!(%addr, "starting xds server");
        tonic::transport::Server::builder()
            .add_service(reflection)
            .add_service(AggregatedDiscoveryServiceServer::new(self.clone()))
            .add_service(ListenerDiscoveryServiceServer::new(self.clone()))
            .add_service(RouteDiscoveryServiceServer::new(self.clone()))
            .add_service(ClusterDiscoveryServiceServer::new(self.clone()))
            .add_service(EndpointDiscoveryServiceServer::new(self))
            .serve_with_shutdown(addr, cancel.cancelled())
            .await?;

        info!("xds server stopped");
        Ok(())
    }

    fn stream<S>(&self, requests: S, type_filter: Option<ResourceType>) -> DiscoveryResponseStream
    where
        S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let conn = Connection::new(self.cache.clone(), self.bad_node.clone(), type_filter);
        tokio::spawn(conn.run(requests, tx));
        Box::pin(ReceiverStream::new(rx))
    }

    fn fetch(
        &self,
        request: DiscoveryRequest,
        resource_type: ResourceType,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let Some(node) = &request.node else {
            return Err(Status::invalid_argument("request has no node"));
        };
        log_request!(node.id.as_str(), request);

        let snapshot = match node::role(node) {
            Some(role) => self.cache.get(&role).snapshot.ok_or_else(|| {
                Status::unavailable(format!("no configuration for role {role:?} yet"))
            })?,
            None => self.bad_node.clone(),
        };

        let resources = snapshot
            .resources(resource_type, &request.resource_names)
            .map_err(|e| Status::internal(format!("failed to encode resources: {e}")))?;

        let response = DiscoveryResponse {
            version_info: snapshot.version(resource_type).to_string(),
            resources,
            type_url: resource_type.type_url().to_string(),
            ..Default::default()
        };
        log_response!(node.id.as_str(), response);
        Ok(Response::new(response))
    }
}

fn delta_unimplemented() -> Status {
    Status::unimplemented("delta xDS is not supported")
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for XdsServer {
    type StreamAggregatedResourcesStream = DiscoveryResponseStream;
    type DeltaAggregatedResourcesStream = DeltaDiscoveryResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(Response::new(self.stream(request.into_inner(), None)))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(delta_unimplemented())
    }
}

macro_rules! impl_discovery_service {
    (
        $service:ident,
        $resource_type:expr,
        $stream:ident: $stream_ty:ident,
        $delta:ident: $delta_ty:ident,
        $fetch:ident $(,)?
    ) => {
        #[tonic::async_trait]
        impl $service for XdsServer {
            type $stream_ty = DiscoveryResponseStream;
            type $delta_ty = DeltaDiscoveryResponseStream;

            async fn $stream(
                &self,
                request: Request<Streaming<DiscoveryRequest>>,
            ) -> Result<Response<Self::$stream_ty>, Status> {
                Ok(Response::new(
                    self.stream(request.into_inner(), Some($resource_type)),
                ))
            }

            async fn $delta(
                &self,
                _request: Request<Streaming<DeltaDiscoveryRequest>>,
            ) -> Result<Response<Self::$delta_ty>, Status> {
                Err(delta_unimplemented())
            }

            async fn $fetch(
                &self,
                request: Request<DiscoveryRequest>,
            ) -> Result<Response<DiscoveryResponse>, Status> {
                self.fetch(request.into_inner(), $resource_type)
            }
        }
    };
}

impl_discovery_service!(
    ListenerDiscoveryService,
    ResourceType::Listener,
    stream_listeners: StreamListenersStream,
    delta_listeners: DeltaListenersStream,
    fetch_listeners,
);

impl_discovery_service!(
    RouteDiscoveryService,
    ResourceType::RouteConfiguration,
    stream_routes: StreamRoutesStream,
    delta_routes: DeltaRoutesStream,
    fetch_routes,
);

impl_discovery_service!(
    ClusterDiscoveryService,
    ResourceType::Cluster,
    stream_clusters: StreamClustersStream,
    delta_clusters: DeltaClustersStream,
    fetch_clusters,
);

impl_discovery_service!(
    EndpointDiscoveryService,
    ResourceType::ClusterLoadAssignment,
    stream_endpoints: StreamEndpointsStream,
    delta_endpoints: DeltaEndpointsStream,
    fetch_endpoints,
);

/// Where a stream gets its snapshots from.
enum SnapshotSource {
    Role(watch::Receiver<CacheEntry>),
    BadNode(Arc<XdsSnapshot>),
}

impl SnapshotSource {
    fn current(&self) -> Option<Arc<XdsSnapshot>> {
        match self {
            SnapshotSource::Role(rx) => rx.borrow().snapshot.clone(),
            SnapshotSource::BadNode(snapshot) => Some(snapshot.clone()),
        }
    }
}

/// The state of a single subscription on a stream.
#[derive(Debug, Default)]
struct Subscription {
    names: Vec<String>,
    sent_version: Option<ResourceVersion>,
    sent_nonce: Option<String>,
}

/// A single SotW stream.
///
/// A connection learns its node from the first request, picks a snapshot
/// source from the node's role, and then answers every request and every
/// snapshot change with the resources the proxy subscribed to.
struct Connection {
    cache: SnapshotCache,
    bad_node: Arc<XdsSnapshot>,
    type_filter: Option<ResourceType>,
    node: Option<NodeInfo>,
    source: Option<SnapshotSource>,
    subscriptions: EnumMap<ResourceType, Option<Subscription>>,
    nonce: u64,
}

impl Connection {
    fn new(
        cache: SnapshotCache,
        bad_node: Arc<XdsSnapshot>,
        type_filter: Option<ResourceType>,
    ) -> Self {
        Self {
            cache,
            bad_node,
            type_filter,
            node: None,
            source: None,
            subscriptions: EnumMap::default(),
            nonce: 0,
        }
    }

    fn node_id(&self) -> &str {
        self.node.as_ref().map(|n| n.id.as_str()).unwrap_or_default()
    }

    async fn run<S>(mut self, mut requests: S, tx: mpsc::Sender<Result<DiscoveryResponse, Status>>)
    where
        S: Stream<Item = Result<DiscoveryRequest, Status>> + Unpin,
    {
        loop {
            let responses = tokio::select! {
                request = requests.next() => {
                    let request = match request {
                        Some(Ok(request)) => request,
                        Some(Err(status)) => {
                            debug!(
                                node = self.node_id(),
                                %status,
                                "xds stream closed with an error",
                            );
                            return;
                        }
                        None => {
                            debug!(node = self.node_id(), "xds stream closed");
                            return;
                        }
                    };

                    match self.handle_request(request) {
                        Ok(responses) => responses,
                        Err(status) => {
                            warn!(node = self.node_id(), %status, "closing xds stream");
                            let _ = tx.send(Err(status)).await;
                            return;
                        }
                    }
                }
                changed = wait_for_change(&mut self.source) => {
                    if !changed {
                        return;
                    }
                    self.handle_snapshot_change()
                }
                _ = tx.closed() => return,
            };

            for response in responses {
                if let Ok(r) = &response {
                    log_response!(self.node_id(), r);
                }
                if tx.send(response).await.is_err() {
                    return;
                }
            }
        }
    }

    fn handle_request(
        &mut self,
        request: DiscoveryRequest,
    ) -> Result<Vec<Result<DiscoveryResponse, Status>>, Status> {
        if self.node.is_none() {
            let Some(node) = &request.node else {
                return Err(Status::invalid_argument(
                    "the first request on a stream must identify a node",
                ));
            };
            self.set_node(NodeInfo::from_node(node));
        }
        log_request!(self.node_id(), request);

        let resource_type = self.resource_type(&request.type_url)?;
        let subscription = self.subscriptions[resource_type].get_or_insert_with(Default::default);

        // a response to anything but the most recent nonce is stale and gets
        // ignored. the proxy will ACK or NACK the latest response separately.
        if !request.response_nonce.is_empty()
            && subscription.sent_nonce.as_deref() != Some(request.response_nonce.as_str())
        {
            debug!(
                node = self.node_id(),
                nonce = %request.response_nonce,
                "ignoring stale nonce"
            );
            return Ok(vec![]);
        }

        let names_changed = subscription.names != request.resource_names;
        subscription.names = request.resource_names;

        if let Some(error) = &request.error_detail {
            warn!(
                node = self.node_id(),
                type_url = %request.type_url,
                version = %request.version_info,
                error = %error.message,
                "proxy rejected configuration",
            );
            if !names_changed {
                return Ok(vec![]);
            }
        }

        Ok(self.respond(resource_type, names_changed).into_iter().collect())
    }

    fn handle_snapshot_change(&mut self) -> Vec<Result<DiscoveryResponse, Status>> {
        ResourceType::all()
            .iter()
            .filter_map(|rtype| self.respond(*rtype, false))
            .collect()
    }

    fn set_node(&mut self, info: NodeInfo) {
        let source = match &info.role {
            Some(role) => {
                info!(
                    node = %info.id,
                    pod = ?info.pod_name,
                    namespace = ?info.namespace,
                    %role,
                    "proxy connected"
                );
                let mut rx = self.cache.subscribe(role);
                rx.borrow_and_update();
                SnapshotSource::Role(rx)
            }
            None => {
                warn!(
                    node = %info.id,
                    "proxy did not identify a role, serving the bad node snapshot"
                );
                SnapshotSource::BadNode(self.bad_node.clone())
            }
        };

        self.source = Some(source);
        self.node = Some(info);
    }

    fn resource_type(&self, type_url: &str) -> Result<ResourceType, Status> {
        if type_url.is_empty() {
            return self
                .type_filter
                .ok_or_else(|| Status::invalid_argument("request is missing a type_url"));
        }

        let resource_type = ResourceType::from_type_url(type_url)
            .ok_or_else(|| Status::invalid_argument(format!("unsupported type_url {type_url:?}")))?;

        match self.type_filter {
            Some(expected) if expected != resource_type => Err(Status::invalid_argument(format!(
                "{type_url:?} can't be requested from the {expected} discovery service"
            ))),
            _ => Ok(resource_type),
        }
    }

    /// Build a response for a subscription if the proxy needs one.
    ///
    /// A response is needed when the snapshot version differs from the last
    /// version sent on this subscription, or when `force` is set because the
    /// subscribed names changed.
    fn respond(
        &mut self,
        resource_type: ResourceType,
        force: bool,
    ) -> Option<Result<DiscoveryResponse, Status>> {
        let snapshot = self.source.as_ref()?.current()?;
        let subscription = self.subscriptions[resource_type].as_mut()?;

        if subscription.names.is_empty() && !resource_type.is_wildcard() {
            return None;
        }

        let version = snapshot.version(resource_type);
        if !force && subscription.sent_version.as_ref() == Some(version) {
            return None;
        }

        let resources = match snapshot.resources(resource_type, &subscription.names) {
            Ok(resources) => resources,
            Err(e) => {
                return Some(Err(Status::internal(format!(
                    "failed to encode resources: {e}"
                ))))
            }
        };

        self.nonce += 1;
        let nonce = self.nonce.to_string();
        subscription.sent_version = Some(version.clone());
        subscription.sent_nonce = Some(nonce.clone());

        Some(Ok(DiscoveryResponse {
            version_info: version.to_string(),
            resources,
            type_url: resource_type.type_url().to_string(),
            nonce,
            ..Default::default()
        }))
    }
}

async fn wait_for_change(source: &mut Option<SnapshotSource>) -> bool {
    match source {
        Some(SnapshotSource::Role(rx)) => rx.changed().await.is_ok(),
        _ => std::future::pending().await,
    }
}
