//! server.rs
//!
//! Thin HTTP proxy in front of the Indexing Service. Browsers never see the
//! service credentials: every handler goes through the shared `IndexingApi`,
//! which injects the bearer token, applies timeouts and retries idempotent calls.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/auth` | Exchange the service credentials, return the auth header |
//! | `GET`  | `/connections` | Connections of the configured provider |
//! | `GET`  | `/connections/{id}/resources/children` | One page of a folder or search |
//! | `POST` | `/knowledge-base/add-resources` | Add resources to the connection's KB and sync |
//! | `POST` | `/knowledge-base/remove-resource` | Remove one resource and sync |
//! | `GET`  | `/knowledge-base/status` | Paths currently in the live index |
//! | `GET`  | `/knowledge-base/indexed-resources` | Members plus their indexed children |
//! | `POST` | `/knowledge-base/unindex` | Delete one path from the index |
//! | `GET`/`POST` | `/knowledge-bases` | List / create knowledge bases |
//! | `GET`  | `/knowledge-bases/{id}` | One knowledge base |
//! | `GET`  | `/knowledge-bases/sync/trigger/{kb}/{org}` | Queue a sync |
//! | `GET`  | `/organizations/me/current` | Current organization |
//! | `GET`  | `/health` | Liveness |
//!
//! # Errors
//!
//! ```json
//! { "error": { "code": "upstream_rejected", "message": "..." } }
//! ```
//!
//! Upstream 4xx responses keep their status. Upstream 5xx and unreadable
//! bodies become 502, timeouts 504, and a rejected token exchange 401.
//! A membership change whose sync could not be queued answers 207 with
//! `"status": "partial"`.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::client::{ApiError, AuthClient, AuthError, ChildrenQuery, IndexingApi, IndexingClient};
use crate::config::Config;
use crate::kb::{
    KnowledgeBaseCache, KnowledgeBaseError, KnowledgeBaseService, MembershipUpdate, SyncOutcome,
};
use crate::model::{
    Connection, CreateKnowledgeBase, IndexingParams, KnowledgeBase, Organization, Resource,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    api: Arc<dyn IndexingApi>,
    kb: Arc<KnowledgeBaseService>,
    provider: String,
    page_size: usize,
    embedding_model: String,
}

impl AppState {
    pub fn new(api: Arc<dyn IndexingApi>, config: &Config) -> Self {
        let kb = Arc::new(KnowledgeBaseService::new(
            api.clone(),
            Arc::new(KnowledgeBaseCache::new()),
            config.embedding_model.clone(),
        ));
        Self {
            api,
            kb,
            provider: config.provider.clone(),
            page_size: config.page_size,
            embedding_model: config.embedding_model.clone(),
        }
    }
}

/// Builds the live clients and serves until Ctrl+C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let auth = Arc::new(AuthClient::new(&config.service)?);
    let api: Arc<dyn IndexingApi> = Arc::new(IndexingClient::new(&config.service, auth)?);
    let app = router(AppState::new(api, config));

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(bind = %config.bind, "proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C");
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/auth", post(handle_auth))
        .route("/connections", get(handle_connections))
        .route("/connections/{id}/resources/children", get(handle_children))
        .route("/knowledge-base/add-resources", post(handle_add_resources))
        .route("/knowledge-base/remove-resource", post(handle_remove_resource))
        .route("/knowledge-base/status", get(handle_status))
        .route("/knowledge-base/indexed-resources", get(handle_indexed_resources))
        .route("/knowledge-base/unindex", post(handle_unindex))
        .route(
            "/knowledge-bases",
            get(handle_list_knowledge_bases).post(handle_create_knowledge_base),
        )
        .route("/knowledge-bases/{id}", get(handle_get_knowledge_base))
        .route("/knowledge-bases/sync/trigger/{kb}/{org}", get(handle_trigger_sync))
        .route("/organizations/me/current", get(handle_current_organization))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct ProxyError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ProxyError {
    ProxyError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<ApiError> for ProxyError {
    fn from(err: ApiError) -> Self {
        let message = err.to_string();
        let (status, code) = match &err {
            ApiError::Status { status, .. } if status.is_client_error() => (*status, "upstream_rejected"),
            ApiError::Status { .. } => (StatusCode::BAD_GATEWAY, "upstream_error"),
            ApiError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            ApiError::Http(e) if e.is_timeout() => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            ApiError::Http(_) => (StatusCode::BAD_GATEWAY, "upstream_unreachable"),
            ApiError::Auth(AuthError::Rejected { .. } | AuthError::MissingToken) => {
                (StatusCode::UNAUTHORIZED, "auth_failed")
            }
            ApiError::Auth(AuthError::Http(_)) => (StatusCode::BAD_GATEWAY, "auth_unreachable"),
            ApiError::Serde(_) => (StatusCode::BAD_GATEWAY, "bad_upstream_response"),
        };
        Self {
            status,
            code,
            message,
        }
    }
}

impl From<KnowledgeBaseError> for ProxyError {
    fn from(err: KnowledgeBaseError) -> Self {
        match err {
            KnowledgeBaseError::Api(e) => e.into(),
            KnowledgeBaseError::NothingToChange => bad_request(err.to_string()),
        }
    }
}

/// Decodes a JSON body, turning both malformed JSON and shape errors into 400s.
fn parse_body<T: DeserializeOwned>(body: Result<Json<Value>, JsonRejection>) -> Result<T, ProxyError> {
    let Json(value) = body.map_err(|e| bad_request(e.body_text()))?;
    serde_json::from_value(value).map_err(|e| bad_request(e.to_string()))
}

fn required(value: Option<String>, name: &str) -> Result<String, ProxyError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| bad_request(format!("{name} is required")))
}

// ============ Auth / connections ============

async fn handle_auth(State(state): State<AppState>) -> Result<Json<Value>, ProxyError> {
    let token = state.api.authenticate().await?;
    Ok(Json(json!({ "Authorization": token.header_value() })))
}

#[derive(Deserialize)]
struct ConnectionsParams {
    provider: Option<String>,
}

async fn handle_connections(
    State(state): State<AppState>,
    Query(params): Query<ConnectionsParams>,
) -> Result<Json<Vec<Connection>>, ProxyError> {
    let provider = params.provider.unwrap_or(state.provider);
    Ok(Json(state.api.list_connections(Some(&provider)).await?))
}

#[derive(Deserialize)]
struct ChildrenParams {
    resource_id: Option<String>,
    cursor: Option<String>,
    page_size: Option<usize>,
    search_query: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChildrenResponse {
    data: Vec<Resource>,
    total: usize,
    has_more: bool,
    cursor: Option<String>,
}

async fn handle_children(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Query(params): Query<ChildrenParams>,
) -> Result<Json<ChildrenResponse>, ProxyError> {
    let page_size = params.page_size.unwrap_or(state.page_size);
    if page_size == 0 {
        return Err(bad_request("page_size must be positive"));
    }
    let query = ChildrenQuery {
        parent_id: params.resource_id.filter(|id| !id.is_empty()),
        cursor: params.cursor.filter(|c| !c.is_empty()),
        page_size,
        search_query: params.search_query,
    };
    let page = state.api.list_children(&connection_id, &query).await?;
    Ok(Json(ChildrenResponse {
        total: page.items.len(),
        data: page.items,
        has_more: page.has_more,
        cursor: page.next_cursor,
    }))
}

// ============ Knowledge-base membership ============

#[derive(Deserialize)]
struct AddResourcesBody {
    connection_id: String,
    resource_ids: Vec<String>,
}

#[derive(Deserialize)]
struct RemoveResourceBody {
    connection_id: String,
    resource_id: String,
}

#[derive(Serialize)]
struct MembershipResponse {
    message: String,
    status: &'static str,
    knowledge_base_id: String,
    connection_source_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sync_error: Option<String>,
}

fn membership_response(update: MembershipUpdate, done: &str) -> Response {
    let partial = update.is_partial();
    let (code, status, message) = if partial {
        (
            StatusCode::MULTI_STATUS,
            "partial",
            format!("{done}, but the sync could not be queued"),
        )
    } else {
        (StatusCode::OK, "accepted", format!("{done} and sync queued"))
    };
    let sync_error = match update.sync {
        SyncOutcome::Failed(reason) => Some(reason),
        SyncOutcome::Accepted => None,
    };
    let body = MembershipResponse {
        message,
        status,
        knowledge_base_id: update.knowledge_base.knowledge_base_id,
        connection_source_ids: update.knowledge_base.connection_source_ids,
        sync_error,
    };
    (code, Json(body)).into_response()
}

async fn handle_add_resources(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let req: AddResourcesBody = parse_body(body)?;
    let connection_id = required(Some(req.connection_id), "connection_id")?;
    if req.resource_ids.iter().any(|id| id.trim().is_empty()) {
        return Err(bad_request("resource_ids must not contain empty ids"));
    }
    let update = state.kb.add_resources(&connection_id, &req.resource_ids).await?;
    Ok(membership_response(update, "resources added"))
}

async fn handle_remove_resource(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let req: RemoveResourceBody = parse_body(body)?;
    let connection_id = required(Some(req.connection_id), "connection_id")?;
    let resource_id = required(Some(req.resource_id), "resource_id")?;
    let update = state.kb.remove_resource(&connection_id, &resource_id).await?;
    Ok(membership_response(update, "resource removed"))
}

#[derive(Deserialize)]
struct StatusParams {
    knowledge_base_id: Option<String>,
    resource_path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    indexed_file_paths: Vec<String>,
}

async fn handle_status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Result<Json<StatusResponse>, ProxyError> {
    let kb_id = required(params.knowledge_base_id, "knowledge_base_id")?;
    let path = params.resource_path.unwrap_or_else(|| "/".to_string());
    let indexed_file_paths = state.api.get_indexed_paths(&kb_id, &path).await?;
    Ok(Json(StatusResponse { indexed_file_paths }))
}

#[derive(Deserialize)]
struct IndexedResourcesParams {
    connection_id: Option<String>,
}

async fn handle_indexed_resources(
    State(state): State<AppState>,
    Query(params): Query<IndexedResourcesParams>,
) -> Result<Json<Vec<Resource>>, ProxyError> {
    let connection_id = required(params.connection_id, "connection_id")?;
    Ok(Json(state.kb.indexed_resources(&connection_id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnindexBody {
    knowledge_base_id: String,
    resource_path: String,
}

async fn handle_unindex(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ProxyError> {
    let req: UnindexBody = parse_body(body)?;
    let kb_id = required(Some(req.knowledge_base_id), "knowledgeBaseId")?;
    let path = required(Some(req.resource_path), "resourcePath")?;
    state.api.delete_resource(&kb_id, &path).await?;
    Ok(Json(json!({ "success": true })))
}

// ============ Knowledge bases ============

async fn handle_list_knowledge_bases(
    State(state): State<AppState>,
) -> Result<Json<Vec<KnowledgeBase>>, ProxyError> {
    Ok(Json(state.api.list_knowledge_bases().await?))
}

/// `{ connectionId, connectionSourceIds, name, description? }` shortcut body.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateShortcut {
    connection_id: String,
    connection_source_ids: Vec<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn handle_create_knowledge_base(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<KnowledgeBase>, ProxyError> {
    let Json(value) = body.map_err(|e| bad_request(e.body_text()))?;
    let request = if value.get("connectionId").is_some() {
        let short: CreateShortcut =
            serde_json::from_value(value).map_err(|e| bad_request(e.to_string()))?;
        CreateKnowledgeBase {
            connection_id: short.connection_id,
            connection_source_ids: short.connection_source_ids,
            name: short.name.unwrap_or_else(|| "Knowledge Base".to_string()),
            description: short
                .description
                .unwrap_or_else(|| "Knowledge base for selected resources".to_string()),
            indexing_params: IndexingParams::with_model(state.embedding_model.clone()),
            org_level_role: None,
            cron_job_id: None,
        }
    } else {
        serde_json::from_value(value).map_err(|e| bad_request(e.to_string()))?
    };
    let kb = state.api.create_knowledge_base(&request).await?;
    info!(kb_id = %kb.knowledge_base_id, "knowledge base created through proxy");
    Ok(Json(kb))
}

async fn handle_get_knowledge_base(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeBase>, ProxyError> {
    Ok(Json(state.api.get_knowledge_base(&id).await?))
}

async fn handle_trigger_sync(
    State(state): State<AppState>,
    Path((kb_id, org_id)): Path<(String, String)>,
) -> Result<Json<Value>, ProxyError> {
    let result = state.api.trigger_sync(&kb_id, &org_id).await?;
    Ok(Json(json!({
        "success": true,
        "result": result,
        "message": "knowledge base sync has been triggered",
    })))
}

async fn handle_current_organization(
    State(state): State<AppState>,
) -> Result<Json<Organization>, ProxyError> {
    Ok(Json(state.api.current_organization().await?))
}

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
