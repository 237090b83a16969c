//! The admin HTTP server.
//!
//! A read-only debugging surface. `/snapshots/input` shows the most recent
//! input snapshot the event loop processed, with secrets redacted.
//! `/snapshots/xds` shows the versions and resource names in the xDS cache
//! for every role, and `/healthz` answers as long as the server is up.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use axum::{
    extract::{RawQuery, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use http::{header, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::snapshot::InputSnapshot;
use crate::xds::SnapshotCache;

/// The last input snapshot the event loop processed, shared with the admin
/// server. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct LatestInput {
    inner: Arc<ArcSwapOption<InputSnapshot>>,
}

impl LatestInput {
    pub fn store(&self, snapshot: InputSnapshot) {
        self.inner.store(Some(Arc::new(snapshot)));
    }

    pub fn load(&self) -> Option<Arc<InputSnapshot>> {
        self.inner.load_full()
    }
}

#[derive(Debug, Clone)]
pub struct AdminServer {
    latest: LatestInput,
    cache: SnapshotCache,
}

impl AdminServer {
    pub fn new(latest: LatestInput, cache: SnapshotCache) -> Self {
        Self { latest, cache }
    }

    /// Serve on `addr` until `cancel` fires.
    pub async fn serve(self, addr: SocketAddr, cancel: CancellationToken) -> crate::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "admin server listening");
        self.serve_on(listener, cancel).await
    }

    async fn serve_on(self, listener: TcpListener, cancel: CancellationToken) -> crate::Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }

    fn router(self) -> Router {
        Router::new()
            .route("/snapshots/input", get(input_snapshot))
            .route("/snapshots/xds", get(xds_snapshot))
            .route("/healthz", get(healthz))
            .with_state(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    JsonCompact,
    Yaml,
}

impl Format {
    fn content_type(&self) -> &'static str {
        match self {
            Format::Json | Format::JsonCompact => "application/json",
            Format::Yaml => "application/yaml",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct InputQuery {
    format: Format,
    namespaces: Option<Vec<String>>,
}

fn parse_query(query: Option<&str>) -> Result<InputQuery, String> {
    let mut parsed = InputQuery {
        format: Format::Json,
        namespaces: None,
    };

    let Some(query) = query else {
        return Ok(parsed);
    };

    for (param, value) in form_urlencoded::parse(query.as_bytes()) {
        match param.as_ref() {
            "format" => {
                parsed.format = match value.as_ref() {
                    "json" => Format::Json,
                    "json_compact" => Format::JsonCompact,
                    "yaml" => Format::Yaml,
                    other => return Err(format!("unknown format {other:?}")),
                }
            }
            "namespaces" => {
                let namespaces = value
                    .split("::")
                    .filter(|ns| !ns.is_empty())
                    .map(str::to_string)
                    .collect();
                parsed.namespaces = Some(namespaces);
            }
            _ => (),
        }
    }

    Ok(parsed)
}

fn encode(snapshot: &InputSnapshot, format: Format) -> Result<String, String> {
    match format {
        Format::Json => serde_json::to_string_pretty(snapshot).map_err(|e| e.to_string()),
        Format::JsonCompact => serde_json::to_string(snapshot).map_err(|e| e.to_string()),
        Format::Yaml => serde_yml::to_string(snapshot).map_err(|e| e.to_string()),
    }
}

async fn input_snapshot(
    State(admin): State<AdminServer>,
    RawQuery(query): RawQuery,
) -> Response {
    let query = match parse_query(query.as_deref()) {
        Ok(query) => query,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };

    let Some(snapshot) = admin.latest.load() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "no snapshot has been processed yet",
        )
            .into_response();
    };

    let encoded = match &query.namespaces {
        Some(namespaces) => encode(&snapshot.in_namespaces(namespaces), query.format),
        None => encode(&snapshot, query.format),
    };

    match encoded {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, query.format.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(err = %e, "failed to encode input snapshot");
            (StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
    }
}

async fn xds_snapshot(State(admin): State<AdminServer>) -> impl IntoResponse {
    Json(admin.cache.dump())
}

async fn healthz() -> &'static str {
    "ok"
}
