//! HTTP API in front of the handler chain
//!
//! Every route builds a [`RequestContext`] from the user header set by the
//! authenticating proxy and calls the pipeline. Errors are mapped to status
//! codes by their [`ErrorKind`].

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path as UrlPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::crd::{DatabaseCluster, DatabaseEngine};
use crate::handlers::{
    CreateBackupStorageRequest, CreateMonitoringInstanceRequest, DeleteDatabaseClusterParams,
    Error, ErrorKind, Handler, RequestContext, UpdateBackupStorageRequest,
    UpdateMonitoringInstanceRequest,
};
use crate::health::HealthState;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

/// Pipeline error as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn outcome_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Unauthorized => "unauthorized",
        ErrorKind::InvalidInput => "invalid_input",
        ErrorKind::NotFound => "not_found",
        ErrorKind::Failed => "failed",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub struct ApiState {
    pub handler: Arc<dyn Handler>,
    pub health: Arc<HealthState>,
    /// Lowercase name of the header carrying the user
    pub user_header: String,
    /// Cancelled on shutdown; every request context derives from it
    pub shutdown: CancellationToken,
}

impl ApiState {
    fn context(&self, headers: &HeaderMap) -> RequestContext {
        let ctx = match headers
            .get(self.user_header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            Some(user) => RequestContext::with_user(user),
            None => RequestContext::new(),
        };
        ctx.with_cancellation(self.shutdown.child_token())
    }

    /// Run a pipeline call and record its outcome.
    async fn observe<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = crate::handlers::Result<T>>,
    ) -> ApiResult<T> {
        let start = Instant::now();
        let result = fut.await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => outcome_label(e.kind()),
        };
        self.health
            .metrics
            .record_request(operation, outcome, start.elapsed().as_secs_f64());
        result.map_err(ApiError)
    }
}

type Shared = State<Arc<ApiState>>;

async fn list_database_clusters(
    State(state): Shared,
    UrlPath(namespace): UrlPath<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let items = state
        .observe(
            "list_database_clusters",
            state.handler.list_database_clusters(&ctx, &namespace),
        )
        .await?;
    Ok(Json(items))
}

async fn create_database_cluster(
    State(state): Shared,
    UrlPath(namespace): UrlPath<String>,
    headers: HeaderMap,
    Json(mut cluster): Json<DatabaseCluster>,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    cluster.metadata.namespace = Some(namespace);
    let created = state
        .observe(
            "create_database_cluster",
            state.handler.create_database_cluster(&ctx, &cluster),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_database_cluster(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let cluster = state
        .observe(
            "get_database_cluster",
            state.handler.get_database_cluster(&ctx, &namespace, &name),
        )
        .await?;
    Ok(Json(cluster))
}

async fn update_database_cluster(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
    Json(mut cluster): Json<DatabaseCluster>,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    cluster.metadata.namespace = Some(namespace);
    cluster.metadata.name = Some(name);
    let updated = state
        .observe(
            "update_database_cluster",
            state.handler.update_database_cluster(&ctx, &cluster),
        )
        .await?;
    Ok(Json(updated))
}

async fn delete_database_cluster(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    Query(params): Query<DeleteDatabaseClusterParams>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    state
        .observe(
            "delete_database_cluster",
            state
                .handler
                .delete_database_cluster(&ctx, &namespace, &name, &params),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_database_cluster_backups(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let items = state
        .observe(
            "list_database_cluster_backups",
            state
                .handler
                .list_database_cluster_backups(&ctx, &namespace, &name),
        )
        .await?;
    Ok(Json(items))
}

async fn list_database_engines(
    State(state): Shared,
    UrlPath(namespace): UrlPath<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let items = state
        .observe(
            "list_database_engines",
            state.handler.list_database_engines(&ctx, &namespace),
        )
        .await?;
    Ok(Json(items))
}

async fn get_database_engine(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let engine = state
        .observe(
            "get_database_engine",
            state.handler.get_database_engine(&ctx, &namespace, &name),
        )
        .await?;
    Ok(Json(engine))
}

async fn update_database_engine(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
    Json(mut engine): Json<DatabaseEngine>,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    engine.metadata.namespace = Some(namespace);
    engine.metadata.name = Some(name);
    let updated = state
        .observe(
            "update_database_engine",
            state.handler.update_database_engine(&ctx, &engine),
        )
        .await?;
    Ok(Json(updated))
}

async fn get_upgrade_plan(
    State(state): Shared,
    UrlPath(namespace): UrlPath<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let plan = state
        .observe(
            "get_upgrade_plan",
            state.handler.get_upgrade_plan(&ctx, &namespace),
        )
        .await?;
    Ok(Json(plan))
}

async fn approve_upgrade_plan(
    State(state): Shared,
    UrlPath(namespace): UrlPath<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    state
        .observe(
            "approve_upgrade_plan",
            state.handler.approve_upgrade_plan(&ctx, &namespace),
        )
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_backup_storages(
    State(state): Shared,
    UrlPath(namespace): UrlPath<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let items = state
        .observe(
            "list_backup_storages",
            state.handler.list_backup_storages(&ctx, &namespace),
        )
        .await?;
    Ok(Json(items))
}

async fn create_backup_storage(
    State(state): Shared,
    UrlPath(namespace): UrlPath<String>,
    headers: HeaderMap,
    Json(req): Json<CreateBackupStorageRequest>,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let created = state
        .observe(
            "create_backup_storage",
            state.handler.create_backup_storage(&ctx, &namespace, &req),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_backup_storage(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let storage = state
        .observe(
            "get_backup_storage",
            state.handler.get_backup_storage(&ctx, &namespace, &name),
        )
        .await?;
    Ok(Json(storage))
}

async fn update_backup_storage(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<UpdateBackupStorageRequest>,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let updated = state
        .observe(
            "update_backup_storage",
            state
                .handler
                .update_backup_storage(&ctx, &namespace, &name, &req),
        )
        .await?;
    Ok(Json(updated))
}

async fn delete_backup_storage(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    state
        .observe(
            "delete_backup_storage",
            state.handler.delete_backup_storage(&ctx, &namespace, &name),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_monitoring_instances(
    State(state): Shared,
    UrlPath(namespace): UrlPath<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let items = state
        .observe(
            "list_monitoring_instances",
            state.handler.list_monitoring_instances(&ctx, &namespace),
        )
        .await?;
    Ok(Json(items))
}

async fn create_monitoring_instance(
    State(state): Shared,
    UrlPath(namespace): UrlPath<String>,
    headers: HeaderMap,
    Json(req): Json<CreateMonitoringInstanceRequest>,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let created = state
        .observe(
            "create_monitoring_instance",
            state
                .handler
                .create_monitoring_instance(&ctx, &namespace, &req),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_monitoring_instance(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let config = state
        .observe(
            "get_monitoring_instance",
            state.handler.get_monitoring_instance(&ctx, &namespace, &name),
        )
        .await?;
    Ok(Json(config))
}

async fn update_monitoring_instance(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<UpdateMonitoringInstanceRequest>,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    let updated = state
        .observe(
            "update_monitoring_instance",
            state
                .handler
                .update_monitoring_instance(&ctx, &namespace, &name, &req),
        )
        .await?;
    Ok(Json(updated))
}

async fn delete_monitoring_instance(
    State(state): Shared,
    UrlPath((namespace, name)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let ctx = state.context(&headers);
    state
        .observe(
            "delete_monitoring_instance",
            state
                .handler
                .delete_monitoring_instance(&ctx, &namespace, &name),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create the API router
pub fn create_router(state: Arc<ApiState>) -> Router {
    let namespaced = Router::new()
        .route(
            "/database-clusters",
            get(list_database_clusters).post(create_database_cluster),
        )
        .route(
            "/database-clusters/{name}",
            get(get_database_cluster)
                .put(update_database_cluster)
                .delete(delete_database_cluster),
        )
        .route(
            "/database-clusters/{name}/backups",
            get(list_database_cluster_backups),
        )
        .route("/database-engines", get(list_database_engines))
        .route("/database-engines/upgrade-plan", get(get_upgrade_plan))
        .route(
            "/database-engines/upgrade-plan/approval",
            post(approve_upgrade_plan),
        )
        .route(
            "/database-engines/{name}",
            get(get_database_engine).put(update_database_engine),
        )
        .route(
            "/backup-storages",
            get(list_backup_storages).post(create_backup_storage),
        )
        .route(
            "/backup-storages/{name}",
            get(get_backup_storage)
                .patch(update_backup_storage)
                .delete(delete_backup_storage),
        )
        .route(
            "/monitoring-instances",
            get(list_monitoring_instances).post(create_monitoring_instance),
        )
        .route(
            "/monitoring-instances/{name}",
            get(get_monitoring_instance)
                .patch(update_monitoring_instance)
                .delete(delete_monitoring_instance),
        );

    Router::new()
        .nest("/v1/namespaces/{namespace}", namespaced)
        .with_state(state)
}

/// Serve the API on `0.0.0.0:<port>`, over TLS when both PEM files are
/// given. Returns once `shutdown` is cancelled.
pub async fn run_api_server(
    state: Arc<ApiState>,
    port: u16,
    tls: Option<(&Path, &Path)>,
) -> Result<(), ServerError> {
    let shutdown = state.shutdown.clone();
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    match tls {
        Some((cert_path, key_path)) => {
            use axum_server::tls_rustls::RustlsConfig;

            let config = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .map_err(|e| ServerError::TlsConfig(e.to_string()))?;
            let handle = axum_server::Handle::new();
            {
                let handle = handle.clone();
                tokio::spawn(async move {
                    shutdown.cancelled().await;
                    handle.graceful_shutdown(None);
                });
            }
            info!("API server listening on {} with TLS", addr);
            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = TcpListener::bind(addr).await?;
            info!("API server listening on {}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;
        }
    }
    Ok(())
}
