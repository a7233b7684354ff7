use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use csched_dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
use csched_queue::HttpQueueAdapter;
use csched_store::{FsObjectStore, ObjectStore};
use csched_telemetry::TelemetryLog;
use csched_types::BackoffPolicy;
use serde::Serialize;
use tower_http::trace::TraceLayer;

struct Config {
    store_root: String,
    queue_url: String,
    queue_token: String,
    telemetry_file: String,
    addr: SocketAddr,
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let store_root = std::env::var("CSCHED_STORE_ROOT")
            .map_err(|_| anyhow::anyhow!("CSCHED_STORE_ROOT is required"))?;
        let queue_url = std::env::var("CSCHED_QUEUE_URL")
            .map_err(|_| anyhow::anyhow!("CSCHED_QUEUE_URL is required"))?;
        let queue_token = std::env::var("CSCHED_QUEUE_TOKEN")
            .map_err(|_| anyhow::anyhow!("CSCHED_QUEUE_TOKEN is required"))?;
        let telemetry_file = std::env::var("CSCHED_TELEMETRY_FILE")
            .unwrap_or_else(|_| "./telemetry.jsonl".into());
        let addr: SocketAddr = std::env::var("CSCHED_DISPATCHER_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8082".into())
            .parse()?;
        Ok(Self {
            store_root,
            queue_url,
            queue_token,
            telemetry_file,
            addr,
        })
    }
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.store_root));
    let queue = Arc::new(HttpQueueAdapter::new(config.queue_url, config.queue_token));
    let telemetry = Arc::new(TelemetryLog::open(&config.telemetry_file)?);

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        queue,
        Some(telemetry),
        BackoffPolicy::default(),
    ));

    let app = Router::new()
        .route("/dispatch/:function_id", post(dispatch_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { dispatcher });

    tracing::info!(addr = %config.addr, "dispatcher listening");
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct DeferredResponse {
    task_id: uuid::Uuid,
    scheduled_for_utc: chrono::DateTime<Utc>,
}

async fn dispatch_handler(
    State(state): State<AppState>,
    Path(function_id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let request_id = headers
        .get("X-Request-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) if body.is_empty() => serde_json::Value::Null,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("malformed JSON body: {e}")).into_response(),
    };

    let result = state
        .dispatcher
        .dispatch(&function_id, payload, request_id.as_deref(), Utc::now())
        .await;

    match result {
        Ok(DispatchOutcome::Forwarded {
            status,
            content_type,
            body,
        }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            let mut response = (status, body).into_response();
            if let Some(ct) = content_type {
                if let Ok(value) = ct.parse() {
                    response.headers_mut().insert(axum::http::header::CONTENT_TYPE, value);
                }
            }
            response
        }
        Ok(DispatchOutcome::Deferred {
            task_id,
            scheduled_for_utc,
        }) => (
            StatusCode::ACCEPTED,
            Json(DeferredResponse {
                task_id,
                scheduled_for_utc,
            }),
        )
            .into_response(),
        Err(DispatchError::UnknownFunction(id)) => {
            (StatusCode::NOT_FOUND, format!("unknown function {id}")).into_response()
        }
        Err(DispatchError::NoViableSlot) => {
            (StatusCode::SERVICE_UNAVAILABLE, "no viable slot within deadline").into_response()
        }
        Err(DispatchError::TargetExhausted) => {
            (StatusCode::BAD_GATEWAY, "target region(s) failed after retries").into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
