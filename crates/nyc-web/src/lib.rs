//! JSON API over the housing store plus the manual sync triggers.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nyc_core::AutoSyncConfigUpdate;
use nyc_sync::{AutoSyncManager, BuildingFilter, SyncError, SyncService};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "nyc-web";

const DEFAULT_SYNC_LOG_LIMIT: i64 = 20;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    pub auto_sync: Arc<AutoSyncManager>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>, auto_sync: Arc<AutoSyncManager>) -> Self {
        Self { service, auto_sync }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RecordCount {
    pub records: usize,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SyncLogQuery {
    pub limit: Option<i64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/metrics", get(metrics_handler))
        .route("/api/metrics/{zip}", get(metric_handler))
        .route("/api/building-stats", get(building_stats_handler))
        .route("/api/buildings/{zip}", get(buildings_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/combined", get(combined_handler))
        .route("/api/sync-log", get(sync_log_handler))
        .route("/api/sync/census", post(sync_census_handler))
        .route("/api/sync/buildings", post(sync_buildings_handler))
        .route("/api/sync/all", post(sync_all_handler))
        .route("/api/sync/check", post(sync_check_handler))
        .route(
            "/api/auto-sync",
            get(auto_sync_status_handler).put(auto_sync_update_handler),
        )
        .with_state(Arc::new(state))
}

/// Serve on `port` until Ctrl-C.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving housing API");
    serve_with_shutdown(state, listener, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "listening for Ctrl-C failed");
        }
    })
    .await
}

pub async fn serve_with_shutdown<F>(
    state: AppState,
    listener: TcpListener,
    signal: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app(state))
        .with_graceful_shutdown(signal)
        .await?;
    info!("housing API shut down");
    Ok(())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.store().housing_metrics().await)
}

async fn metric_handler(State(state): State<Arc<AppState>>, Path(zip): Path<String>) -> Response {
    match state.service.store().housing_metric(&zip).await {
        Ok(Some(metric)) => Json(metric).into_response(),
        Ok(None) => not_found(format!("no housing metrics for ZIP {zip}")),
        Err(err) => api_error(err),
    }
}

async fn building_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.store().building_stats().await)
}

async fn buildings_handler(
    State(state): State<Arc<AppState>>,
    Path(zip): Path<String>,
    Query(filter): Query<BuildingFilter>,
) -> Response {
    json_or_error(state.service.store().buildings_by_zip(&zip, &filter).await)
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.store().summary().await)
}

async fn combined_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.store().combined().await)
}

async fn sync_log_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncLogQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_SYNC_LOG_LIMIT);
    json_or_error(state.service.store().recent_sync_logs(limit).await)
}

async fn sync_census_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(
        state
            .service
            .sync_census()
            .await
            .map(|records| RecordCount { records }),
    )
}

async fn sync_buildings_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(
        state
            .service
            .sync_buildings()
            .await
            .map(|records| RecordCount { records }),
    )
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.sync_all().await)
}

async fn sync_check_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.auto_sync.check_and_sync().await).into_response()
}

async fn auto_sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.auto_sync.status().await).into_response()
}

async fn auto_sync_update_handler(
    State(state): State<Arc<AppState>>,
    Json(update): Json<AutoSyncConfigUpdate>,
) -> Response {
    match state.auto_sync.update(update).await {
        Ok(_) => Json(state.auto_sync.status().await).into_response(),
        Err(err) => api_error(err),
    }
}

fn json_or_error<T: Serialize>(result: Result<T, SyncError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => api_error(err),
    }
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn api_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::InProgress(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use nyc_adapters::CachedSource;
    use nyc_storage::CacheDir;
    use nyc_sync::{Store, SyncTarget};
    use serde_json::Value;
    use std::path::{Path as FsPath, PathBuf};
    use std::time::Duration;
    use tower::ServiceExt;

    fn fixture_cache() -> PathBuf {
        FsPath::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/cache")
    }

    async fn state_with_cache(cache: PathBuf, config_dir: &FsPath) -> AppState {
        let store = Store::in_memory().await.unwrap();
        let cache = CacheDir::new(cache);
        let source = Arc::new(CachedSource::new(cache.clone()));
        let service = Arc::new(SyncService::new(store, source.clone(), source, cache));
        let target: Arc<dyn SyncTarget> = service.clone();
        let auto_sync = AutoSyncManager::load(
            target,
            config_dir.join("auto_sync_config.json"),
            Duration::from_secs(60),
        )
        .await;
        AppState::new(service, Arc::new(auto_sync))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn sync_then_read_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state_with_cache(fixture_cache(), dir.path()).await);

        let (status, body) = send(&app, "GET", "/api/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Array(vec![]));

        let (status, body) = send(&app, "POST", "/api/sync/census", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["records"], 4);

        let (_, body) = send(&app, "GET", "/api/metrics", None).await;
        assert_eq!(body.as_array().unwrap().len(), 4);

        let (status, body) = send(&app, "GET", "/api/metrics/10001", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["median_income"], 10000.0);
        assert_eq!(body["vacancy_rate"], 0.1);

        let (status, _) = send(&app, "GET", "/api/metrics/99999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn building_endpoints_after_sync_all() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state_with_cache(fixture_cache(), dir.path()).await);

        let (status, body) = send(&app, "POST", "/api/sync/all", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["census"], 4);
        assert_eq!(body["buildings"], 5);

        let (_, stats) = send(&app, "GET", "/api/building-stats", None).await;
        assert_eq!(stats.as_array().unwrap().len(), 3);

        let (_, buildings) = send(&app, "GET", "/api/buildings/10001?year_min=2000", None).await;
        let buildings = buildings.as_array().unwrap();
        assert_eq!(buildings.len(), 1);
        assert_eq!(buildings[0]["yearbuilt"], 2010);

        let (_, combined) = send(&app, "GET", "/api/combined", None).await;
        assert_eq!(combined.as_array().unwrap().len(), 4);

        let (_, summary) = send(&app, "GET", "/api/summary", None).await;
        assert_eq!(summary["total_zips"], 4);

        let (_, log) = send(&app, "GET", "/api/sync-log?limit=1", None).await;
        assert_eq!(log.as_array().unwrap().len(), 1);
        assert_eq!(log[0]["sync_type"], "pluto_csv_load");
    }

    #[tokio::test]
    async fn missing_cache_files_surface_as_404_with_message() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state_with_cache(dir.path().join("empty"), dir.path()).await);

        let (status, body) = send(&app, "POST", "/api/sync/buildings", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("cached file not found:"));
    }

    #[tokio::test]
    async fn auto_sync_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state_with_cache(fixture_cache(), dir.path()).await);

        let (status, body) = send(&app, "GET", "/api/auto-sync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], false);
        assert_eq!(body["interval_hours"], 24);

        let (status, body) = send(
            &app,
            "PUT",
            "/api/auto-sync",
            Some(serde_json::json!({ "interval_hours": 6, "sync_pluto": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["interval_hours"], 6);
        assert_eq!(body["sync_pluto"], true);
        assert_eq!(body["running"], false);
        assert!(dir.path().join("auto_sync_config.json").exists());

        // Disabled, so nothing is due.
        let (status, body) = send(&app, "POST", "/api/sync/check", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn serve_returns_after_shutdown_signal() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_cache(fixture_cache(), dir.path()).await;
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(serve_with_shutdown(state, listener, async {
            let _ = stopped.await;
        }));
        stop.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
