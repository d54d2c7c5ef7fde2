//! devfleet API Module
//! REST API for operators and devices, with OpenAPI documentation

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi, ToSchema};

use crate::engine::audit::{AuditAction, AuditEntry, AuditLog};
use crate::engine::error::ErrorKind;
use crate::engine::keystore::{Keystore, OperatorKey};
use crate::engine::models::{
    Device, HeartbeatRequest, RegisterRequest, UpdatePolicy, UpdateRecord,
};
use crate::engine::registry::{DeviceRegistry, NewUpdate, RegistryError, UpdateRegistry};
use crate::engine::updater::client::DEVICE_HEADER;

pub const CHECKSUM_HEADER: &str = "x-package-checksum";

#[derive(Clone)]
pub struct ApiState {
    pub devices: DeviceRegistry,
    pub updates: UpdateRegistry,
    pub keystore: Keystore,
    pub audit: Arc<AuditLog>,
    pub max_package_bytes: usize,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        create_update,
        list_updates,
        get_update,
        download_package,
        register_device,
        list_devices,
        get_device,
        heartbeat,
        latest_update,
        deactivate_device,
        reactivate_device,
    ),
    modifiers(&OperatorKeyScheme),
    tags(
        (name = "updates", description = "Published update packages"),
        (name = "devices", description = "Device registry"),
        (name = "system", description = "Server status"),
    )
)]
pub struct ApiDoc;

struct OperatorKeyScheme;

impl Modify for OperatorKeyScheme {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "operator_key",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

pub fn create_router(state: ApiState) -> Router {
    let body_limit = state.max_package_bytes.saturating_add(64 * 1024);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/openapi.json", get(openapi_document))
        .route("/api/updates", get(list_updates).post(create_update))
        .route("/api/updates/{version}", get(get_update))
        .route("/api/updates/{version}/package", get(download_package))
        .route("/api/devices", get(list_devices).post(register_device))
        .route("/api/devices/{uuid}", get(get_device))
        .route("/api/devices/{uuid}/heartbeat", post(heartbeat))
        .route("/api/devices/{uuid}/updates/latest", get(latest_update))
        .route("/api/devices/{uuid}/deactivate", post(deactivate_device))
        .route("/api/devices/{uuid}/reactivate", post(reactivate_device))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handle to a running API server
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl ApiServer {
    /// Bound address, with the real port when 0 was requested
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> std::io::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.map_err(std::io::Error::other)?
    }

    /// Wait until the server stops on its own
    pub async fn wait(self) -> std::io::Result<()> {
        self.task.await.map_err(std::io::Error::other)?
    }
}

pub async fn spawn_server(state: ApiState, addr: SocketAddr) -> std::io::Result<ApiServer> {
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let router = create_router(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        tracing::info!(address = %addr, "api server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .inspect_err(|e| tracing::error!(address = %addr, error = %e, "api server exited"))
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

// ==================== Errors ====================

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid operator key",
        )
    }

    /// The single answer for every device-facing authorization failure
    fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", "forbidden")
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let code = match &e {
            RegistryError::InvalidUuid(_) => "invalid_uuid",
            RegistryError::InvalidTimezone(_) => "invalid_timezone",
            RegistryError::InvalidVersion(_) => "invalid_version",
            RegistryError::InvalidStatus(_) => "invalid_status",
            RegistryError::InvalidPackageList(_) => "invalid_package_list",
            RegistryError::EmptyPackage => "empty_package",
            RegistryError::DuplicateVersion(_) => "duplicate_version",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::UnknownDevice(_) | RegistryError::Forbidden(_) => "forbidden",
            _ => "internal",
        };
        let status = match e.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Transfer | ErrorKind::Install | ErrorKind::Internal => {
                tracing::error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, code, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.code.to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

/// Device-facing calls collapse malformed, unknown and disabled uuids
fn device_error(e: RegistryError) -> ApiError {
    match e.kind() {
        ErrorKind::Validation | ErrorKind::Authorization => {
            tracing::warn!(error = %e, "device request refused");
            ApiError::forbidden()
        }
        _ => e.into(),
    }
}

// ==================== Authentication ====================

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn require_operator(state: &ApiState, headers: &HeaderMap) -> Result<OperatorKey, ApiError> {
    let token = bearer_token(headers).ok_or_else(ApiError::unauthorized)?;
    state
        .keystore
        .validate_api_key(token)
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| {
            tracing::warn!("operator key rejected");
            ApiError::unauthorized()
        })
}

/// The device header, when sent, must name the device in the path
fn require_device(state: &ApiState, headers: &HeaderMap, uuid: &str) -> Result<Device, ApiError> {
    if let Some(claimed) = headers.get(DEVICE_HEADER) {
        let claimed = claimed.to_str().map_err(|_| ApiError::forbidden())?;
        if !claimed.eq_ignore_ascii_case(uuid) {
            return Err(ApiError::forbidden());
        }
    }
    state.devices.authorize(uuid).map_err(device_error)
}

// ==================== System ====================

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Server is up", body = HealthResponse)),
    tag = "system"
)]
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn openapi_document() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// ==================== Updates ====================

/// Multipart fields of `POST /api/updates`
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct UploadForm {
    #[schema(example = "v1.2.0")]
    version: String,
    description: String,
    requires_system_packages: Option<bool>,
    /// JSON array of package names
    #[schema(example = "[\"ffmpeg\"]")]
    system_packages: Option<String>,
    policy: Option<UpdatePolicy>,
    #[schema(value_type = String, format = Binary)]
    package: Vec<u8>,
}

async fn read_upload(mut multipart: Multipart) -> Result<NewUpdate, ApiError> {
    let mut update = NewUpdate {
        version: String::new(),
        description: String::new(),
        requires_system_packages: None,
        system_packages: Vec::new(),
        policy: UpdatePolicy::default(),
        package: Vec::new(),
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "package" {
            update.package = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()))?
                .to_vec();
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        match name.as_str() {
            "version" => update.version = value.trim().to_string(),
            "description" => update.description = value,
            "requires_system_packages" => {
                update.requires_system_packages = match value.trim() {
                    "" => None,
                    "true" => Some(true),
                    "false" => Some(false),
                    other => {
                        return Err(ApiError::bad_request(format!(
                            "requires_system_packages must be true or false, got {other:?}"
                        )))
                    }
                }
            }
            "system_packages" => {
                if !value.trim().is_empty() {
                    update.system_packages = serde_json::from_str(&value).map_err(|e| {
                        ApiError::new(
                            StatusCode::BAD_REQUEST,
                            "invalid_package_list",
                            format!("system_packages must be a JSON array of strings: {e}"),
                        )
                    })?;
                }
            }
            "policy" => {
                update.policy = value.trim().parse::<UpdatePolicy>().map_err(|other| {
                    ApiError::bad_request(format!("unknown policy {other:?}"))
                })?;
            }
            other => tracing::debug!(field = other, "ignoring unknown upload field"),
        }
    }

    Ok(update)
}

#[utoipa::path(
    post,
    path = "/api/updates",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Update published", body = UpdateRecord),
        (status = 400, description = "Invalid version, package list or body", body = ErrorResponse),
        (status = 401, description = "Missing or invalid operator key", body = ErrorResponse),
        (status = 409, description = "Version already published", body = ErrorResponse),
    ),
    security(("operator_key" = [])),
    tag = "updates"
)]
async fn create_update(
    State(state): State<ApiState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UpdateRecord>), ApiError> {
    let operator = require_operator(&state, &headers)?;
    let upload = read_upload(multipart).await?;

    let record = state.updates.create_update(upload).map_err(|e| {
        tracing::warn!(operator = %operator.name, error = %e, "publish rejected");
        ApiError::from(e)
    })?;

    state.audit.record(
        AuditEntry::new(AuditAction::UpdatePublished, &record.version.to_string())
            .with_actor(&operator.name)
            .with_details(json!({
                "checksum": record.package_checksum,
                "size": record.package_size,
                "policy": record.policy,
                "system_packages": record.system_packages,
            })),
    );
    Ok((StatusCode::CREATED, Json(record)))
}

#[utoipa::path(
    get,
    path = "/api/updates",
    responses(
        (status = 200, description = "All updates, newest first", body = Vec<UpdateRecord>),
        (status = 401, description = "Missing or invalid operator key", body = ErrorResponse),
    ),
    security(("operator_key" = [])),
    tag = "updates"
)]
async fn list_updates(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<UpdateRecord>>, ApiError> {
    require_operator(&state, &headers)?;
    Ok(Json(state.updates.list()?))
}

#[utoipa::path(
    get,
    path = "/api/updates/{version}",
    params(("version" = String, Path, description = "Release version, e.g. v1.2.0")),
    responses(
        (status = 200, description = "Update metadata", body = UpdateRecord),
        (status = 400, description = "Malformed version", body = ErrorResponse),
        (status = 404, description = "No such update", body = ErrorResponse),
    ),
    security(("operator_key" = [])),
    tag = "updates"
)]
async fn get_update(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(version): Path<String>,
) -> Result<Json<UpdateRecord>, ApiError> {
    require_operator(&state, &headers)?;
    Ok(Json(state.updates.get_by_version(&version)?))
}

#[utoipa::path(
    get,
    path = "/api/updates/{version}/package",
    params(("version" = String, Path, description = "Release version, e.g. v1.2.0")),
    responses(
        (status = 200, description = "Package archive", content_type = "application/gzip"),
        (status = 403, description = "Device not authorized", body = ErrorResponse),
        (status = 404, description = "No such update", body = ErrorResponse),
    ),
    tag = "updates"
)]
async fn download_package(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(version): Path<String>,
) -> Result<Response, ApiError> {
    if let Some(uuid) = headers.get(DEVICE_HEADER) {
        let uuid = uuid.to_str().map_err(|_| ApiError::forbidden())?;
        state.devices.authorize(uuid).map_err(device_error)?;
    } else if bearer_token(&headers).is_some() {
        require_operator(&state, &headers)?;
    } else {
        return Err(ApiError::forbidden());
    }

    let (record, bytes) = state.updates.read_package(&version)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.tar.gz\"", record.version),
            ),
            (
                header::HeaderName::from_static(CHECKSUM_HEADER),
                record.package_checksum,
            ),
        ],
        bytes,
    )
        .into_response())
}

// ==================== Devices ====================

#[utoipa::path(
    post,
    path = "/api/devices",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Device registered", body = Device),
        (status = 200, description = "Device already registered, existing record returned", body = Device),
        (status = 400, description = "Malformed uuid or timezone", body = ErrorResponse),
    ),
    tag = "devices"
)]
async fn register_device(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let (device, created) = state.devices.register(&request)?;
    if !created {
        return Ok((StatusCode::OK, Json(device)));
    }

    tracing::info!(uuid = %device.uuid, name = %device.display_name, "device registered");
    state.audit.record(
        AuditEntry::new(AuditAction::DeviceRegistered, &device.uuid).with_details(json!({
            "display_name": device.display_name,
            "timezone": device.timezone,
        })),
    );
    Ok((StatusCode::CREATED, Json(device)))
}

#[utoipa::path(
    get,
    path = "/api/devices",
    responses(
        (status = 200, description = "All devices", body = Vec<Device>),
        (status = 401, description = "Missing or invalid operator key", body = ErrorResponse),
    ),
    security(("operator_key" = [])),
    tag = "devices"
)]
async fn list_devices(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Device>>, ApiError> {
    require_operator(&state, &headers)?;
    Ok(Json(state.devices.list()?))
}

#[utoipa::path(
    get,
    path = "/api/devices/{uuid}",
    params(("uuid" = String, Path, description = "Device uuid")),
    responses(
        (status = 200, description = "Device record", body = Device),
        (status = 404, description = "Unknown device", body = ErrorResponse),
    ),
    security(("operator_key" = [])),
    tag = "devices"
)]
async fn get_device(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<Device>, ApiError> {
    require_operator(&state, &headers)?;
    Ok(Json(state.devices.lookup(&uuid)?))
}

#[utoipa::path(
    post,
    path = "/api/devices/{uuid}/heartbeat",
    params(("uuid" = String, Path, description = "Device uuid")),
    request_body = HeartbeatRequest,
    responses(
        (status = 200, description = "Status recorded", body = Device),
        (status = 400, description = "Malformed version or status", body = ErrorResponse),
        (status = 403, description = "Device not authorized", body = ErrorResponse),
    ),
    tag = "devices"
)]
async fn heartbeat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
    Json(report): Json<HeartbeatRequest>,
) -> Result<Json<Device>, ApiError> {
    require_device(&state, &headers, &uuid)?;
    let device = state
        .devices
        .heartbeat(&uuid, &report)
        .map_err(|e| match e {
            RegistryError::InvalidVersion(_) | RegistryError::InvalidStatus(_) => e.into(),
            other => device_error(other),
        })?;
    tracing::debug!(
        uuid = %device.uuid,
        version = %device.current_version,
        status = %device.status,
        "heartbeat"
    );
    Ok(Json(device))
}

#[utoipa::path(
    get,
    path = "/api/devices/{uuid}/updates/latest",
    params(("uuid" = String, Path, description = "Device uuid")),
    responses(
        (status = 200, description = "Latest published update", body = UpdateRecord),
        (status = 403, description = "Device not authorized", body = ErrorResponse),
        (status = 404, description = "Nothing published yet", body = ErrorResponse),
    ),
    tag = "devices"
)]
async fn latest_update(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<UpdateRecord>, ApiError> {
    require_device(&state, &headers, &uuid)?;
    Ok(Json(state.updates.get_latest()?))
}

#[utoipa::path(
    post,
    path = "/api/devices/{uuid}/deactivate",
    params(("uuid" = String, Path, description = "Device uuid")),
    responses(
        (status = 200, description = "Device disabled", body = Device),
        (status = 404, description = "Unknown device", body = ErrorResponse),
    ),
    security(("operator_key" = [])),
    tag = "devices"
)]
async fn deactivate_device(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let operator = require_operator(&state, &headers)?;
    let device = state.devices.deactivate(&uuid)?;
    tracing::info!(uuid = %device.uuid, operator = %operator.name, "device deactivated");
    state.audit.record(
        AuditEntry::new(AuditAction::DeviceDeactivated, &device.uuid).with_actor(&operator.name),
    );
    Ok(Json(device))
}

#[utoipa::path(
    post,
    path = "/api/devices/{uuid}/reactivate",
    params(("uuid" = String, Path, description = "Device uuid")),
    responses(
        (status = 200, description = "Device re-enabled", body = Device),
        (status = 404, description = "Unknown device", body = ErrorResponse),
    ),
    security(("operator_key" = [])),
    tag = "devices"
)]
async fn reactivate_device(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let operator = require_operator(&state, &headers)?;
    let device = state.devices.reactivate(&uuid)?;
    tracing::info!(uuid = %device.uuid, operator = %operator.name, "device reactivated");
    state.audit.record(
        AuditEntry::new(AuditAction::DeviceReactivated, &device.uuid).with_actor(&operator.name),
    );
    Ok(Json(device))
}
