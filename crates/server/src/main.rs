use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use shared::{
    domain::DeviceIdentity,
    error::{ApiError, ErrorCode},
    protocol::{
        CreateSessionRequest, CreateSessionResponse, RegisterRequest, RegistrationAck,
        StatusQuery, StatusResponse,
    },
};
use tracing::{info, warn};

mod app_state;
mod config;
mod registry;

use app_state::AppState;
use config::load_settings;
use registry::{RegistryError, RegistryStore};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let store = RegistryStore::new(&settings.registries);
    let app = build_router(Arc::new(AppState { store }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, registries = ?settings.registries, "registry server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", post(create_session))
        .route(
            "/registries/:registry/devices/:identity",
            get(device_status)
                .put(register_device)
                .delete(deregister_device),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn api_error(err: RegistryError) -> (StatusCode, Json<ApiError>) {
    let (status, code) = match &err {
        RegistryError::UnknownRegistry(_) => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
        RegistryError::UnknownSession => (StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized),
        RegistryError::EmptyDeviceName => (StatusCode::BAD_REQUEST, ErrorCode::Validation),
    };
    (status, Json(ApiError::new(code, err.to_string())))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<CreateSessionResponse> {
    let session = state
        .store
        .issue_session(&req.device_name)
        .await
        .map_err(api_error)?;
    info!(device_name = %req.device_name, "session issued");
    Ok(Json(CreateSessionResponse {
        session,
        issued_at: Utc::now(),
    }))
}

async fn device_status(
    State(state): State<Arc<AppState>>,
    Path((registry, identity)): Path<(String, String)>,
    Query(q): Query<StatusQuery>,
) -> ApiResult<StatusResponse> {
    let (status, registered_at) = state
        .store
        .status(&registry, &DeviceIdentity::new(identity), &q.session)
        .await
        .map_err(api_error)?;
    Ok(Json(StatusResponse {
        status,
        registered_at,
    }))
}

async fn register_device(
    State(state): State<Arc<AppState>>,
    Path((registry, identity)): Path<(String, String)>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<RegistrationAck> {
    let identity = DeviceIdentity::new(identity);
    let accepted = state
        .store
        .register(&registry, &identity, &req.session, &req.device_token)
        .await
        .map_err(api_error)?;
    if accepted {
        info!(%registry, %identity, "device registered");
    } else {
        warn!(%registry, %identity, "registration declined: blank device token");
    }
    Ok(Json(RegistrationAck { accepted }))
}

async fn deregister_device(
    State(state): State<Arc<AppState>>,
    Path((registry, identity)): Path<(String, String)>,
) -> ApiResult<RegistrationAck> {
    let identity = DeviceIdentity::new(identity);
    let accepted = state
        .store
        .deregister(&registry, &identity)
        .await
        .map_err(api_error)?;
    info!(%registry, %identity, accepted, "device deregistered");
    Ok(Json(RegistrationAck { accepted }))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
