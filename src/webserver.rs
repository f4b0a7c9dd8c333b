//! Admin API and HTTPS listener.
//!
//! The admin router maps every route 1:1 onto a [`LifecycleController`] call
//! of the node named by the `X-Node-Id` header (default node otherwise).
//! After each mutation the node's TLS listener is reconciled with its
//! credential snapshot: started when HTTPS gets enabled, hot-reloaded when
//! the served material changes, shut down when HTTPS is disabled.

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::services::fs::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::configs::AppConfig;
use crate::controller::{LifecycleController, NodeRegistry};
use crate::credentials::{CsrSubject, ProvisioningMode};
use crate::error::{Artifact, CredentialError};
use crate::protocol::{
    ArtifactInfo, DeleteKeyQuery, ErrorResponse, HostnameRequest, ModeRequest, StatusResponse,
};

pub const NODE_HEADER: &str = "x-node-id";
const PEM_CONTENT_TYPE: &str = "application/x-pem-file";
const LISTENER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running TLS listener and the snapshot version it serves.
struct Listener {
    handle: Handle,
    config: RustlsConfig,
    version: u64,
}

/// Shared state of the admin API.
pub struct AppState {
    registry: NodeRegistry,
    listeners: Mutex<HashMap<String, Listener>>,
    https_host: String,
    web_root: PathBuf,
}

impl AppState {
    pub fn new(registry: NodeRegistry, https_host: impl Into<String>, web_root: PathBuf) -> Self {
        Self {
            registry,
            listeners: Mutex::new(HashMap::new()),
            https_host: https_host.into(),
            web_root,
        }
    }

    fn controller(&self, headers: &HeaderMap) -> Result<Arc<LifecycleController>, ApiError> {
        let node = headers.get(NODE_HEADER).and_then(|v| v.to_str().ok());
        Ok(self.registry.get(node)?)
    }

    /// Bring the node's listener in line with its current snapshot.
    pub async fn reconcile(&self, controller: &LifecycleController) -> Result<()> {
        let node = controller.node().to_string();
        let mut listeners = self.listeners.lock().await;

        match controller.serving_material() {
            Some(material) => {
                if let Some(listener) = listeners.get_mut(&node) {
                    if listener.version != material.version {
                        listener
                            .config
                            .reload_from_pem(material.certificate_chain.clone(), material.key_pem())
                            .await
                            .context("Failed to reload TLS credentials")?;
                        listener.version = material.version;
                        info!(node = %node, version = material.version, "TLS credentials reloaded");
                    }
                    return Ok(());
                }

                let config =
                    RustlsConfig::from_pem(material.certificate_chain.clone(), material.key_pem())
                        .await
                        .context("Failed to build TLS configuration")?;
                let addr: SocketAddr = format!("{}:{}", self.https_host, controller.port())
                    .parse()
                    .with_context(|| format!("Invalid HTTPS address {}", self.https_host))?;
                let handle = Handle::new();

                let server = axum_server::bind_rustls(addr, config.clone())
                    .handle(handle.clone())
                    .serve(https_router(self.web_root.clone()).into_make_service());
                let task_node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.await {
                        error!(node = %task_node, error = %e, "HTTPS listener failed");
                    }
                });

                // `None` means the bind failed and the server task has ended.
                let bound = handle
                    .listening()
                    .await
                    .with_context(|| format!("Failed to bind HTTPS listener on {}", addr))?;

                info!(node = %node, address = %bound, "HTTPS listener started");
                listeners.insert(
                    node,
                    Listener {
                        handle,
                        config,
                        version: material.version,
                    },
                );
            }
            None => {
                if let Some(listener) = listeners.remove(&node) {
                    listener
                        .handle
                        .graceful_shutdown(Some(LISTENER_SHUTDOWN_GRACE));
                    info!(node = %node, "HTTPS listener stopped");
                }
            }
        }
        Ok(())
    }

    /// Reconcile after a mutation; a listener failure is logged, the
    /// committed credential change stands.
    async fn settle(&self, controller: &LifecycleController) {
        if let Err(e) = self.reconcile(controller).await {
            warn!(node = %controller.node(), error = %format!("{:#}", e), "Listener reconcile failed");
        }
    }

    async fn shutdown_listeners(&self) {
        for (node, listener) in self.listeners.lock().await.drain() {
            listener
                .handle
                .graceful_shutdown(Some(LISTENER_SHUTDOWN_GRACE));
            info!(node = %node, "HTTPS listener stopped");
        }
    }
}

// ================= errors =================

/// Error response: status code plus the JSON envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        if let CredentialError::Internal(detail) = &err {
            error!(detail = %detail, "Internal error");
        }
        Self {
            status: status_code(&err),
            body: ErrorResponse::from(&err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn status_code(err: &CredentialError) -> StatusCode {
    match err {
        CredentialError::MalformedInput { .. }
        | CredentialError::InvalidField(_)
        | CredentialError::InvalidMode(_) => StatusCode::BAD_REQUEST,
        CredentialError::NotFound(_) | CredentialError::UnknownNode(_) => StatusCode::NOT_FOUND,
        CredentialError::Conflict { .. }
        | CredentialError::AlreadyExists(_)
        | CredentialError::NoKeyPresent
        | CredentialError::InUse(_) => StatusCode::CONFLICT,
        CredentialError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8], artifact: Artifact) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError {
        status: StatusCode::BAD_REQUEST,
        body: ErrorResponse::invalid_json(artifact, e.to_string()),
    })
}

fn pem_response(pem: String) -> Response {
    ([(header::CONTENT_TYPE, PEM_CONTENT_TYPE)], pem).into_response()
}

// ================= routers =================

/// Router of the admin API.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/https/status", get(status))
        .route("/admin/https/mode", put(set_mode))
        .route("/admin/https/hostname", put(set_hostname))
        .route("/admin/https/key/generate", post(generate_key))
        .route("/admin/https/key", put(upload_key).delete(delete_key))
        .route("/admin/https/csr/generate", post(generate_csr))
        .route("/admin/https/csr", get(download_csr).delete(delete_csr))
        .route(
            "/admin/https/cert",
            put(upload_cert).get(download_cert).delete(delete_cert),
        )
        .route(
            "/admin/https/chain",
            put(upload_chain).get(download_chain).delete(delete_chain),
        )
        .route("/admin/https/enable", post(enable_https))
        .route("/admin/https/disable", post(disable_https))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router of the node's own HTTPS listener: static files from `web_root`.
fn https_router(web_root: PathBuf) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(web_root))
        .layer(TraceLayer::new_for_http())
}

// ================= handlers =================

async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    let controller = state.controller(&headers)?;
    Ok(Json(controller.status()))
}

async fn set_mode(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let controller = state.controller(&headers)?;
    let request: ModeRequest = parse_json(&body, Artifact::Mode)?;
    let mode: ProvisioningMode = request.mode.parse()?;
    let status = controller.set_mode(mode)?;
    state.settle(&controller).await;
    Ok(Json(status))
}

async fn set_hostname(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let controller = state.controller(&headers)?;
    let request: HostnameRequest = parse_json(&body, Artifact::Hostname)?;
    Ok(Json(controller.set_hostname(&request.hostname)?))
}

async fn generate_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ArtifactInfo>, ApiError> {
    let controller = state.controller(&headers)?;
    let worker = Arc::clone(&controller);
    // RSA generation is CPU bound and slow; keep it off the async workers.
    let info = tokio::task::spawn_blocking(move || worker.generate_key())
        .await
        .map_err(|e| CredentialError::Internal(format!("key generation task failed: {}", e)))??;
    Ok(Json(info))
}

async fn generate_csr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ArtifactInfo>, ApiError> {
    let controller = state.controller(&headers)?;
    let subject: CsrSubject = parse_json(&body, Artifact::Csr)?;
    Ok(Json(controller.generate_csr(subject)?))
}

async fn upload_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ArtifactInfo>, ApiError> {
    let controller = state.controller(&headers)?;
    Ok(Json(controller.upload_key(&body)?))
}

async fn upload_cert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ArtifactInfo>, ApiError> {
    let controller = state.controller(&headers)?;
    let info = controller.upload_cert(&body)?;
    state.settle(&controller).await;
    Ok(Json(info))
}

async fn upload_chain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ArtifactInfo>, ApiError> {
    let controller = state.controller(&headers)?;
    let info = controller.upload_chain(&body)?;
    state.settle(&controller).await;
    Ok(Json(info))
}

async fn download_csr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let controller = state.controller(&headers)?;
    Ok(pem_response(controller.download_csr()?))
}

async fn download_cert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let controller = state.controller(&headers)?;
    Ok(pem_response(controller.download_cert()?))
}

async fn download_chain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let controller = state.controller(&headers)?;
    Ok(pem_response(controller.download_chain()?))
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DeleteKeyQuery>,
) -> Result<StatusCode, ApiError> {
    let controller = state.controller(&headers)?;
    controller.delete_key(query.force)?;
    state.settle(&controller).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_csr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let controller = state.controller(&headers)?;
    controller.delete_csr()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_cert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let controller = state.controller(&headers)?;
    controller.delete_cert()?;
    state.settle(&controller).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_chain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let controller = state.controller(&headers)?;
    controller.delete_chain()?;
    state.settle(&controller).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_https(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    let controller = state.controller(&headers)?;
    controller.enable_https()?;
    if let Err(e) = state.reconcile(&controller).await {
        // Nothing is listening, so the flag must not claim otherwise.
        controller.disable_https()?;
        return Err(CredentialError::Internal(format!("{:#}", e)).into());
    }
    Ok(Json(controller.status()))
}

async fn disable_https(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let controller = state.controller(&headers)?;
    controller.disable_https()?;
    state.settle(&controller).await;
    Ok(StatusCode::NO_CONTENT)
}

// ================= server =================

/// Serve the admin API until Ctrl-C, with a TLS listener per node that has
/// HTTPS enabled.
pub async fn start_webserver(config: AppConfig, registry: NodeRegistry) -> Result<()> {
    let state = Arc::new(AppState::new(
        registry,
        config.server.https_host.clone(),
        config.server.web_root.clone(),
    ));

    let controllers: Vec<_> = state.registry.controllers().cloned().collect();
    for controller in controllers {
        state.settle(&controller).await;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {}", addr))?;
    info!(address = %addr, "Admin API listening");

    axum::serve(listener, admin_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Admin API server failed")?;

    state.shutdown_listeners().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
