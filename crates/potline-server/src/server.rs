//! HTTP binding of the coordinator operations.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, put},
    Json, Router,
};
use futures::{Stream, StreamExt};
use potline::{
    Batch, BatchId, Coordinator, CoordinatorError, HardwareNotifier, HttpNotifier, MachineState,
    MachineStatus, MemoryStore, NewBatch, NoOpNotifier, ProgressReport, Store, SupplyReading,
};
use potline_postgres::PgStore;

use crate::config::{HardwareSettings, ServerConfig, StorageSettings};
use crate::error::{ApiError, ServerError};

type ApiResult<T> = Result<T, ApiError>;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    coordinator: Arc<Coordinator>,
}

/// Build the router around an existing coordinator.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    let state = AppState { coordinator };

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(machine_status))
        .route("/events", get(event_stream))
        .route(
            "/machine-state",
            get(get_machine_state).put(update_machine_state),
        )
        .route("/machine-state-update", put(update_machine_state))
        .route("/batches", get(list_batches).post(create_batch))
        .route(
            "/batches/{id}",
            get(get_batch).put(report_progress).delete(delete_batch),
        )
        .route("/batches/{id}/cancel", put(cancel_batch))
        .with_state(state)
}

/// Build the coordinator from configuration and serve until `shutdown`
/// resolves.
pub async fn run(
    config: ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let store = build_store(&config.storage).await?;
    let notifier = build_notifier(&config.hardware)?;
    let coordinator = Arc::new(Coordinator::new(store, notifier));

    // create the singleton up front so the first poll is cheap
    coordinator
        .machine_state()
        .await
        .map_err(|e| ServerError::Storage(e.into()))?;

    let app = router(coordinator);
    let addr = config.server.bind_address;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Potline listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("Potline shutdown complete");
    Ok(())
}

async fn build_store(settings: &StorageSettings) -> Result<Arc<dyn Store>, ServerError> {
    match settings {
        StorageSettings::Memory => {
            tracing::warn!("Using in-memory storage; state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageSettings::Postgres {
            url,
            max_connections,
        } => {
            let store = PgStore::connect(url, *max_connections)
                .await
                .map_err(ServerError::Storage)?;
            store.migrate().await.map_err(ServerError::Storage)?;
            tracing::info!(max_connections, "Using postgres storage");
            Ok(Arc::new(store))
        }
    }
}

fn build_notifier(settings: &HardwareSettings) -> Result<Arc<dyn HardwareNotifier>, ServerError> {
    match &settings.base_url {
        Some(url) => {
            let notifier = HttpNotifier::with_timeout(url.as_str(), settings.timeout())
                .map_err(|e| ServerError::Hardware(e.to_string()))?;
            tracing::info!(
                controller = %notifier.base_url(),
                timeout_ms = settings.timeout_ms,
                "Hardware controller configured"
            );
            Ok(Arc::new(notifier))
        }
        None => {
            tracing::warn!("No hardware controller configured; start/stop commands are skipped");
            Ok(Arc::new(NoOpNotifier))
        }
    }
}

/// Turn an extractor rejection into an `InvalidInput` error.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError(CoordinatorError::InvalidInput(rejection.body_text())))
}

/// Turn a malformed batch id in the URL into an `InvalidInput` error.
fn path_id(id: Result<Path<BatchId>, PathRejection>) -> ApiResult<BatchId> {
    id.map(|Path(id)| id)
        .map_err(|rejection| ApiError(CoordinatorError::InvalidInput(rejection.body_text())))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy"
    }))
}

async fn machine_status(State(state): State<AppState>) -> ApiResult<Json<MachineStatus>> {
    Ok(Json(state.coordinator.machine_status().await?))
}

async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let events = state
        .coordinator
        .event_bus()
        .stream()
        .filter_map(|event| async move {
            match SseEvent::default().event(event.name()).json_data(&event) {
                Ok(sse) => Some(sse),
                Err(err) => {
                    tracing::warn!(error = %err, "Dropping unserializable event");
                    None
                }
            }
        })
        .map(Ok::<_, Infallible>);

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn get_machine_state(State(state): State<AppState>) -> ApiResult<Json<MachineState>> {
    Ok(Json(state.coordinator.machine_state().await?))
}

async fn update_machine_state(
    State(state): State<AppState>,
    payload: Result<Json<SupplyReading>, JsonRejection>,
) -> ApiResult<Json<MachineState>> {
    let reading = body(payload)?;
    Ok(Json(state.coordinator.apply_supply_reading(reading).await?))
}

async fn list_batches(State(state): State<AppState>) -> ApiResult<Json<Vec<Batch>>> {
    Ok(Json(state.coordinator.list_batches().await?))
}

async fn create_batch(
    State(state): State<AppState>,
    payload: Result<Json<NewBatch>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Batch>)> {
    let request = body(payload)?;
    let batch = state.coordinator.create_batch(request).await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

async fn get_batch(
    State(state): State<AppState>,
    id: Result<Path<BatchId>, PathRejection>,
) -> ApiResult<Json<Batch>> {
    let id = path_id(id)?;
    Ok(Json(state.coordinator.get_batch(id).await?))
}

async fn report_progress(
    State(state): State<AppState>,
    id: Result<Path<BatchId>, PathRejection>,
    payload: Result<Json<ProgressReport>, JsonRejection>,
) -> ApiResult<Json<Batch>> {
    let id = path_id(id)?;
    let report = body(payload)?;
    Ok(Json(state.coordinator.report_progress(id, report).await?))
}

async fn cancel_batch(
    State(state): State<AppState>,
    id: Result<Path<BatchId>, PathRejection>,
) -> ApiResult<Json<Batch>> {
    let id = path_id(id)?;
    Ok(Json(state.coordinator.cancel_batch(id).await?))
}

async fn delete_batch(
    State(state): State<AppState>,
    id: Result<Path<BatchId>, PathRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = path_id(id)?;
    state.coordinator.delete_batch(id).await?;
    Ok(Json(serde_json::json!({
        "message": "Batch deleted"
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use potline_testing::{HardwareCall, RecordingNotifier};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn make_app() -> (Router, RecordingNotifier) {
        let (app, notifier, _) = make_app_with_coordinator();
        (app, notifier)
    }

    fn make_app_with_coordinator() -> (Router, RecordingNotifier, Arc<Coordinator>) {
        let notifier = RecordingNotifier::new();
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(notifier.clone()),
        ));
        (router(coordinator.clone()), notifier, coordinator)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create(app: &Router, output_count: u32) -> String {
        let (status, batch) = send(
            app,
            "POST",
            "/batches",
            Some(json!({ "title": "Basil", "seedType": 1, "outputCount": output_count })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        batch["id"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (app, _) = make_app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn machine_state_is_created_on_first_get() {
        let (app, _) = make_app();
        let (status, body) = send(&app, "GET", "/machine-state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["singletonKey"], "main");
        assert_eq!(body["soilLevel"], 1);
        assert_eq!(body["cupLevel"], 1);
        assert!(body["activeBatchId"].is_null());
    }

    #[tokio::test]
    async fn create_then_progress_to_finish() {
        let (app, notifier) = make_app();
        let id = create(&app, 5).await;

        let (status, state) = send(&app, "GET", "/machine-state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state["activeBatchId"], id.as_str());

        let uri = format!("/batches/{id}");
        let (status, batch) = send(&app, "PUT", &uri, Some(json!({ "potsIncrement": 2 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(batch["potsDoneCount"], 2);
        assert_eq!(batch["status"], "Ongoing");

        let (_, batch) = send(&app, "PUT", &uri, Some(json!({ "potsIncrement": 10 }))).await;
        assert_eq!(batch["potsDoneCount"], 5);
        assert_eq!(batch["status"], "Finished");

        let (_, status_view) = send(&app, "GET", "/status", None).await;
        assert_eq!(status_view["isBatchActive"], false);
        assert_eq!(status_view["areSuppliesLow"], false);

        assert_eq!(notifier.calls().len(), 1);
    }

    #[tokio::test]
    async fn supply_updates_pause_and_resume() {
        let (app, _) = make_app();
        let id = create(&app, 5).await;
        let uri = format!("/batches/{id}");

        let (status, state) =
            send(&app, "PUT", "/machine-state", Some(json!({ "soilLevel": 0 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state["soilLevel"], 0);
        let (_, batch) = send(&app, "GET", &uri, None).await;
        assert_eq!(batch["status"], "Paused");

        let (status, _) = send(
            &app,
            "PUT",
            "/machine-state-update",
            Some(json!({ "soilLevel": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, batch) = send(&app, "GET", &uri, None).await;
        assert_eq!(batch["status"], "Ongoing");
    }

    #[tokio::test]
    async fn rule_violations_are_bad_requests() {
        let (app, _) = make_app();
        let id = create(&app, 5).await;

        let (status, body) = send(
            &app,
            "POST",
            "/batches",
            Some(json!({ "title": "Thyme", "seedType": 2, "outputCount": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "already_active");

        let (status, body) = send(&app, "DELETE", &format!("/batches/{id}"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "active_batch_deletion");

        let (status, body) = send(
            &app,
            "PUT",
            &format!("/batches/{id}"),
            Some(json!({ "potsIncrement": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
    }

    #[tokio::test]
    async fn malformed_bodies_are_invalid_input() {
        let (app, _) = make_app();

        let (status, body) = send(&app, "POST", "/batches", Some(json!({ "title": "x" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");

        let (status, body) =
            send(&app, "PUT", "/machine-state", Some(json!({ "cupLevel": 7 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
    }

    #[tokio::test]
    async fn malformed_batch_ids_are_invalid_input() {
        let (app, _) = make_app();

        for (method, uri, body) in [
            ("GET", "/batches/not-a-uuid", None),
            ("DELETE", "/batches/xyz", None),
            ("PUT", "/batches/xyz/cancel", None),
            ("PUT", "/batches/xyz", Some(json!({ "potsIncrement": 1 }))),
        ] {
            let (status, body) = send(&app, method, uri, body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{method} {uri}");
            assert_eq!(body["error"], "invalid_input", "{method} {uri}");
            assert!(body["message"].is_string(), "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn events_stream_committed_changes() {
        let (app, _, coordinator) = make_app_with_coordinator();

        let request = Request::builder()
            .uri("/events")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );

        // the handler has subscribed by the time the response exists
        let batch = coordinator
            .create_batch(NewBatch::new("Basil", 1, 2))
            .await
            .unwrap();

        let mut frames = response.into_body().into_data_stream();
        let chunk = frames.next().await.unwrap().unwrap();
        let frame = String::from_utf8(chunk.to_vec()).unwrap();

        assert!(frame.starts_with("event: batchCreated\n"), "{frame}");
        let data = frame
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        let event: Value = serde_json::from_str(data).unwrap();
        assert_eq!(event["type"], "batchCreated");
        assert_eq!(event["batchId"], batch.id.to_string());
        assert_eq!(event["outputCount"], 2);
    }

    #[tokio::test]
    async fn cancel_then_delete() {
        let (app, notifier) = make_app();
        let id = create(&app, 5).await;

        let (status, batch) = send(&app, "PUT", &format!("/batches/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(batch["status"], "Cancelled");

        let (status, body) = send(&app, "PUT", &format!("/batches/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "already_terminal");

        let (status, _) = send(&app, "DELETE", &format!("/batches/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", &format!("/batches/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        assert_eq!(notifier.calls()[1], HardwareCall::Stop);
    }

    #[tokio::test]
    async fn list_returns_all_batches() {
        let (app, _) = make_app();
        let first = create(&app, 1).await;
        send(
            &app,
            "PUT",
            &format!("/batches/{first}"),
            Some(json!({ "potsIncrement": 1 })),
        )
        .await;
        let second = create(&app, 1).await;

        let (status, list) = send(&app, "GET", "/batches", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<_> = list
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["id"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first));
        assert!(ids.contains(&second));
    }
}
