//! Best-effort commands to the machine's network controller.
//!
//! The controller is an unreliable collaborator. A notifier makes one
//! bounded-time attempt per call and reports the outcome; the
//! [`Coordinator`](crate::Coordinator) logs failures and keeps the logical
//! state change regardless. No retry, no queue.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::model::BatchId;

/// Default bound on a single controller call.
pub const DEFAULT_HARDWARE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the controller could not be told.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("controller unreachable: {0}")]
    Unreachable(String),

    #[error("controller did not answer within {0:?}")]
    Timeout(Duration),

    #[error("controller rejected the command with status {0}")]
    Rejected(u16),
}

/// Capability to start or stop the physical machine.
#[async_trait]
pub trait HardwareNotifier: Send + Sync {
    async fn notify_start(&self, batch_id: BatchId) -> Result<(), NotifyError>;

    async fn notify_stop(&self) -> Result<(), NotifyError>;
}

/// Notifier for deployments without a controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl HardwareNotifier for NoOpNotifier {
    async fn notify_start(&self, batch_id: BatchId) -> Result<(), NotifyError> {
        tracing::debug!(batch_id = %batch_id, "No controller configured, skipping start");
        Ok(())
    }

    async fn notify_stop(&self) -> Result<(), NotifyError> {
        tracing::debug!("No controller configured, skipping stop");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartBatchBody {
    batch_id: BatchId,
}

/// Notifier that POSTs to `{base_url}/start-batch` and `{base_url}/stop-batch`.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpNotifier {
    /// Create a notifier with the default two second timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, DEFAULT_HARDWARE_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, path: &str, body: Option<StartBatchBody>) -> Result<(), NotifyError> {
        let url = format!("{}/{}", self.base_url, path);
        let request = self.client.post(&url);
        let request = match body {
            Some(body) => request.json(&body),
            None => request,
        };

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }

    fn classify(&self, err: reqwest::Error) -> NotifyError {
        if err.is_timeout() {
            NotifyError::Timeout(self.timeout)
        } else {
            NotifyError::Unreachable(err.to_string())
        }
    }
}

#[async_trait]
impl HardwareNotifier for HttpNotifier {
    async fn notify_start(&self, batch_id: BatchId) -> Result<(), NotifyError> {
        self.post("start-batch", Some(StartBatchBody { batch_id }))
            .await?;
        tracing::info!(batch_id = %batch_id, "Sent start command to controller");
        Ok(())
    }

    async fn notify_stop(&self) -> Result<(), NotifyError> {
        self.post("stop-batch", None).await?;
        tracing::info!("Sent stop command to controller");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    type Seen = Arc<Mutex<Vec<(String, Option<serde_json::Value>)>>>;

    async fn spawn_controller(status: StatusCode, delay: Duration) -> (String, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));

        let app = Router::new()
            .route(
                "/start-batch",
                post(
                    move |State(seen): State<Seen>, Json(body): Json<serde_json::Value>| async move {
                        tokio::time::sleep(delay).await;
                        seen.lock().unwrap().push(("start".into(), Some(body)));
                        status
                    },
                ),
            )
            .route(
                "/stop-batch",
                post(move |State(seen): State<Seen>| async move {
                    tokio::time::sleep(delay).await;
                    seen.lock().unwrap().push(("stop".into(), None));
                    status
                }),
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/"), seen)
    }

    #[tokio::test]
    async fn sends_start_with_batch_id() {
        let (url, seen) = spawn_controller(StatusCode::OK, Duration::ZERO).await;
        let notifier = HttpNotifier::new(url).unwrap();
        let id = Uuid::new_v4();

        notifier.notify_start(id).await.unwrap();
        notifier.notify_stop().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "start");
        assert_eq!(seen[0].1.as_ref().unwrap()["batchId"], id.to_string());
        assert_eq!(seen[1].0, "stop");
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (url, _) = spawn_controller(StatusCode::SERVICE_UNAVAILABLE, Duration::ZERO).await;
        let notifier = HttpNotifier::new(url).unwrap();

        let err = notifier.notify_stop().await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected(503)));
    }

    #[tokio::test]
    async fn slow_controller_times_out() {
        let (url, _) = spawn_controller(StatusCode::OK, Duration::from_secs(5)).await;
        let notifier = HttpNotifier::with_timeout(url, Duration::from_millis(100)).unwrap();

        let started = std::time::Instant::now();
        let err = notifier.notify_stop().await.unwrap_err();
        assert!(matches!(err, NotifyError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let notifier = HttpNotifier::new(format!("http://{addr}")).unwrap();
        let err = notifier.notify_start(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Unreachable(_)));
    }
}
