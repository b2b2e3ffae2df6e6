//! HTTP API for the coordinator
//!
//! Storage nodes post reports to `/report/:node`; operators and tools use the
//! query, command, config and admin endpoints. Outbound messages for storage
//! nodes (stats acks, PG creation requests) are streamed on `/watch/sse`.

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, METRICS};
use crate::coordinator::monitor::{Ack, Outbound, Query, QueryResponse};
use crate::coordinator::node_map::NodeMap;
use crate::coordinator::ratios::RatioPublisher;
use crate::coordinator::server::MonitorHandle;
use async_stream::stream;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct CoordState {
    pub node_id: String,
    pub monitor: MonitorHandle,
    pub ratios: RatioPublisher,
    pub outbound: broadcast::Sender<Outbound>,
}

/// Error body: `{"error": "..."}` with the status of the error kind
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        let mut body = json!({ "error": self.0.to_string() });
        if let Error::NotLeader(leader) = &self.0 {
            body["leader"] = json!(leader);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn unexpected(response: QueryResponse) -> ApiError {
    ApiError(Error::Internal(format!(
        "unexpected query response: {:?}",
        response
    )))
}

async fn post_report(
    State(state): State<CoordState>,
    Path(node): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Ack>> {
    let ack = state.monitor.report(&node, body.to_vec()).await?;
    Ok(Json(ack))
}

async fn post_query(
    State(state): State<CoordState>,
    body: Bytes,
) -> ApiResult<Json<QueryResponse>> {
    Ok(Json(state.monitor.query(body.to_vec()).await?))
}

async fn post_command(State(state): State<CoordState>, body: Bytes) -> ApiResult<Json<Ack>> {
    Ok(Json(state.monitor.command(body.to_vec()).await?))
}

async fn health(State(state): State<CoordState>) -> ApiResult<Response> {
    let report = state.monitor.health().await?;
    Ok(Json(report).into_response())
}

async fn pg_stat(State(state): State<CoordState>) -> ApiResult<Response> {
    match state.monitor.ask(&Query::PgStat).await? {
        QueryResponse::PgStat(summary) => Ok(Json(summary).into_response()),
        other => Err(unexpected(other)),
    }
}

async fn pg_dump(State(state): State<CoordState>) -> ApiResult<Response> {
    match state.monitor.ask(&Query::PgDump).await? {
        QueryResponse::PgDump(map) => Ok(Json(map).into_response()),
        other => Err(unexpected(other)),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigChange {
    pub key: String,
    pub value: String,
}

/// Live ratio change, picked up by the monitor through its ratio observer
async fn post_config(
    State(state): State<CoordState>,
    Json(change): Json<ConfigChange>,
) -> ApiResult<impl IntoResponse> {
    let ratios = state.ratios.set(&change.key, &change.value)?;
    tracing::info!(key = %change.key, value = %change.value, "config change");
    Ok(Json(json!({
        "full_ratio": ratios.full,
        "nearfull_ratio": ratios.nearfull,
    })))
}

async fn post_node_map(
    State(state): State<CoordState>,
    Json(map): Json<NodeMap>,
) -> ApiResult<impl IntoResponse> {
    let epoch = map.epoch;
    state.monitor.set_node_map(map).await?;
    Ok(Json(json!({ "epoch": epoch })))
}

async fn admin_status(State(state): State<CoordState>) -> ApiResult<impl IntoResponse> {
    let status = state.monitor.status().await?;
    Ok(Json(status))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}

/// Stream of outbound messages, one SSE event per message
async fn watch_sse(
    State(state): State<CoordState>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.outbound.subscribe();
    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let kind = match &message {
                        Outbound::StatsAck { .. } => "stats_ack",
                        Outbound::CreatePgs { .. } => "create_pgs",
                    };
                    match serde_json::to_string(&message) {
                        Ok(data) => yield Ok(Event::default().event(kind).data(data)),
                        Err(e) => tracing::error!(error = %e, "failed to encode outbound message"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "watch subscriber lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn create_router(state: CoordState) -> Router {
    tracing::debug!(node_id = %state.node_id, "building router");
    Router::new()
        .route("/report/:node", post(post_report))
        .route("/query", post(post_query))
        .route("/command", post(post_command))
        .route("/health", get(health))
        .route("/pg/stat", get(pg_stat))
        .route("/pg/dump", get(pg_dump))
        .route("/config", post(post_config))
        .route("/admin/nodemap", post(post_node_map))
        .route("/admin/status", get(admin_status))
        .route("/metrics", get(metrics))
        .route("/watch/sse", get(watch_sse))
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ClusterSeed, Config, PoolSeed};
    use crate::coordinator::server::{Coordinator, MonitorService};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn service() -> MonitorService {
        let mut config = Config::default();
        config.monitor.propose_interval_ms = 0;
        config.cluster = ClusterSeed {
            nodes: vec!["osd.0".into(), "osd.1".into()],
            pools: vec![PoolSeed { id: 1, pg_num: 2 }],
        };
        Coordinator::new(config).start()
    }

    fn router(service: &MonitorService) -> Router {
        create_router(CoordState {
            node_id: "coord-1".into(),
            monitor: service.handle.clone(),
            ratios: service.ratios.clone(),
            outbound: service.outbound.clone(),
        })
    }

    async fn send(router: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    const REPORT: &str = r#"{"epoch":1,"node_stat":{"kb":1000,"kb_used":100,"kb_avail":900}}"#;

    #[tokio::test]
    async fn test_report_routes() {
        let service = service();
        let router = router(&service);

        let (status, body) = send(&router, "POST", "/report/osd.0", REPORT).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ack"], "accepted");

        let (status, body) = send(&router, "POST", "/report/osd.0", REPORT).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ack"], "unchanged");

        let (status, _) = send(&router, "POST", "/report/osd.7", REPORT).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(&router, "POST", "/report/osd.1", "{").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Malformed"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_and_pg_routes() {
        let service = service();
        let router = router(&service);

        let (status, body) = send(&router, "GET", "/pg/stat", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["num_pgs"], 2);

        let (status, body) = send(&router, "GET", "/pg/dump", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["pg_stat"]["1.0"].is_object());

        let (status, body) = send(&router, "POST", "/query", r#"{"query":"statfs"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "statfs");

        let (status, _) = send(
            &router,
            "POST",
            "/query",
            r#"{"query":"pg_map","pgid":"9.0"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let service = service();
        let router = router(&service);

        let (status, body) = send(&router, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        // Freshly registered PGs are still creating
        assert_eq!(body["status"], "HEALTH_WARN");

        let response = router
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("pgmon_map_version"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_and_commands() {
        let service = service();
        let router = router(&service);

        let (status, body) = send(
            &router,
            "POST",
            "/config",
            r#"{"key":"mon_osd_full_ratio","value":"0.9"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!((body["full_ratio"].as_f64().unwrap() - 0.9).abs() < 1e-6);

        let (status, _) = send(&router, "POST", "/config", r#"{"key":"bogus","value":"0.9"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Zero leaves the ratio as it is
        let (status, body) =
            send(&router, "POST", "/config", r#"{"key":"full_ratio","value":"0"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert!((body["full_ratio"].as_f64().unwrap() - 0.9).abs() < 1e-6);

        let (status, body) = send(
            &router,
            "POST",
            "/command",
            r#"{"command":"set_nearfull_ratio","ratio":0.8}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ack"], "accepted");

        let (status, _) = send(
            &router,
            "POST",
            "/command",
            r#"{"command":"force_create_pg","pgid":"5.0"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&router, "GET", "/admin/status", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_leader"], true);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_node_map_route() {
        let service = service();
        let router = router(&service);

        let map = r#"{"epoch":2,"nodes":{"osd.0":"up","osd.1":"up"},"pools":{"1":{"pg_num":2},"2":{"pg_num":1}}}"#;
        let (status, body) = send(&router, "POST", "/admin/nodemap", map).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["epoch"], 2);

        let (_, body) = send(&router, "GET", "/pg/stat", "").await;
        assert_eq!(body["num_pgs"], 3);

        service.shutdown().await;
    }
}
