use crate::connection_manager::ConnectionManager;
use crate::device::Device;
use crate::device_store::DeviceStore;
use crate::error::PublishError;
use crate::metrics::Metrics;
use crate::publisher::PublisherPool;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Everything a request handler needs, passed in explicitly.
#[derive(Clone)]
pub struct AppState {
    /// One publisher per in-flight request, drawn from `connection`.
    pub publishers: Arc<PublisherPool>,
    pub store: Arc<dyn DeviceStore>,
    pub connection: Arc<ConnectionManager>,
    pub metrics: Arc<Metrics>,
}

pub struct WebServer {
    bind_address: String,
    port: u16,
    state: AppState,
}

impl WebServer {
    pub fn new(bind_address: impl Into<String>, port: u16, state: AppState) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
            state,
        }
    }

    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = build_router(self.state);

        let addr = format!("{}:{}", self.bind_address, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("HTTP API listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/devices", post(register_device))
        .route("/devices/:id", get(get_device))
        .route("/publish", post(publish_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub routing_key: String,
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.connection.is_connected() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "broker connection closed")
    }
}

async fn render_metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    state
        .metrics
        .open_channels
        .set(state.connection.open_channel_count() as i64);
    let body = state
        .metrics
        .render()
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

async fn register_device(
    State(state): State<AppState>,
    payload: Result<Json<Device>, JsonRejection>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    let device = valid_device(payload)?;
    let stored = state.store.upsert(device).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Device>, AppError> {
    let device = state
        .store
        .get(&id)
        .await?
        .ok_or(AppError::NotFound(id))?;
    Ok(Json(device))
}

// Publish first so the stored state only changes once the broker has the event
async fn publish_event(
    State(state): State<AppState>,
    payload: Result<Json<Device>, JsonRejection>,
) -> Result<Json<PublishResponse>, AppError> {
    let device = valid_device(payload)?;
    let routing_key = state.publishers.publish_device_event(&device).await?;

    if !state.store.update_state(&device.id, &device.state).await? {
        warn!("Device '{}' was not registered, storing it now", device.id);
        state.store.upsert(device).await?;
    }

    Ok(Json(PublishResponse {
        routing_key: routing_key.to_string(),
    }))
}

fn valid_device(payload: Result<Json<Device>, JsonRejection>) -> Result<Device, AppError> {
    let Json(device) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    device
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    Ok(device)
}

// Error handling
enum AppError {
    BadRequest(String),
    NotFound(String),
    Publish(PublishError),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<PublishError> for AppError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::InvalidRoutingKey(e) => AppError::BadRequest(e.to_string()),
            other => AppError::Publish(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::NotFound(id) => (StatusCode::NOT_FOUND, format!("Device '{}' not found", id)),
            AppError::Publish(err) => {
                error!("Publish failed: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Publish failed: {}", err),
                )
            }
            AppError::Internal(err) => {
                error!("Internal error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal error: {}", err),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::device_store::MockDeviceStore;
    use crate::topology::{DeviceSelector, TopologyManager};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn state_with(store: MockDeviceStore) -> AppState {
        let broker = MemoryBroker::new();
        let connection = Arc::new(ConnectionManager::from_connection(
            Arc::new(broker.connect("guest", "guest", "/").unwrap()),
            "memory",
        ));
        TopologyManager::new(connection.open_channel().await.unwrap())
            .ensure_device_queue(&DeviceSelector::for_type("tv"))
            .await
            .unwrap();

        AppState {
            publishers: Arc::new(PublisherPool::new(
                Arc::clone(&connection) as Arc<dyn crate::broker::BrokerConnection>,
                Duration::from_secs(1),
            )),
            store: Arc::new(store),
            connection,
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_failure_is_500() {
        let mut store = MockDeviceStore::new();
        store
            .expect_upsert()
            .returning(|_| Err(anyhow::anyhow!("disk full")));
        let app = build_router(state_with(store).await);

        let response = app
            .oneshot(post_json(
                "/devices",
                r#"{"id":"tv1","type":"tv","state":"off"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_invalid_fields_are_400() {
        let mut store = MockDeviceStore::new();
        store.expect_upsert().never();
        let app = build_router(state_with(store).await);

        let response = app
            .oneshot(post_json(
                "/devices",
                r#"{"id":"tv1","type":"tv.box","state":"off"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_publish_registers_unknown_device() {
        let mut store = MockDeviceStore::new();
        store.expect_update_state().returning(|_, _| Ok(false));
        store
            .expect_upsert()
            .times(1)
            .returning(|device| Ok(device));
        let app = build_router(state_with(store).await);

        let response = app
            .oneshot(post_json(
                "/publish",
                r#"{"id":"tv1","type":"tv","state":"on"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
