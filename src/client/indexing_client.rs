//! indexing_client.rs
//!
//! Typed client for the Indexing Service REST API plus the `IndexingApi` trait
//! everything above the transport talks to.
//!
//! Every call:
//! - attaches a cached bearer token, re-authenticating once on 401
//! - is bounded by a timeout (30s, 60s for the knowledge-base list/create)
//! - retries transient failures only when it is a GET
//!
//! Example:
//! ```ignore
//! let auth = Arc::new(AuthClient::new(&config.service)?);
//! let api = IndexingClient::new(&config.service, auth)?;
//! let page = api.list_children("conn", &ChildrenQuery::root(100)).await?;
//! println!("{} entries, more = {}", page.items.len(), page.has_more);
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::auth_client::{AuthClient, AuthError, BearerToken};
use crate::client::retry::RetryPolicy;
use crate::config::ServiceConfig;
use crate::model::{
    ChildrenPage, Connection, CreateKnowledgeBase, KnowledgeBase, Organization, RawConnection,
    Resource, ensure_absolute_path,
};

/// Default per-call timeout.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// The knowledge-base list and create endpoints are much slower.
const KB_LIST_TIMEOUT: Duration = Duration::from_secs(60);

const GET_RETRY: RetryPolicy = RetryPolicy::new(2, Duration::from_secs(1));
const KB_LIST_RETRY: RetryPolicy = RetryPolicy::new(2, Duration::from_secs(2));

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("authentication: {0}")]
    Auth(#[from] AuthError),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ApiError {
    fn from_transport(err: reqwest::Error, url: &str) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(url.to_string())
        } else {
            ApiError::Http(err)
        }
    }

    /// Failures worth replaying for idempotent calls.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Timeout(_) => true,
            ApiError::Http(e) => e.is_timeout() || e.is_connect(),
            ApiError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Auth(_) | ApiError::Serde(_) => false,
        }
    }

    /// Transport-level failure (no HTTP status reached us).
    pub fn is_network(&self) -> bool {
        match self {
            ApiError::Timeout(_) => true,
            ApiError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Auth(AuthError::Rejected { status, .. }) => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

/// Parameters of a children (or search) listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildrenQuery {
    /// Folder to list; `None` lists the connection root.
    pub parent_id: Option<String>,
    pub cursor: Option<String>,
    pub page_size: usize,
    /// When set the search endpoint is used instead of the children endpoint.
    pub search_query: Option<String>,
}

impl ChildrenQuery {
    pub fn root(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    pub fn folder<S: Into<String>>(parent_id: S, page_size: usize) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            page_size,
            ..Self::default()
        }
    }
}

/// Everything the picker needs from the Indexing Service.
#[async_trait]
pub trait IndexingApi: Send + Sync {
    async fn authenticate(&self) -> Result<BearerToken, ApiError>;

    async fn current_organization(&self) -> Result<Organization, ApiError>;

    /// Connections, optionally filtered to one provider (e.g. `gdrive`).
    async fn list_connections(&self, provider: Option<&str>) -> Result<Vec<Connection>, ApiError>;

    async fn list_children(
        &self,
        connection_id: &str,
        query: &ChildrenQuery,
    ) -> Result<ChildrenPage, ApiError>;

    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>, ApiError>;

    async fn create_knowledge_base(
        &self,
        body: &CreateKnowledgeBase,
    ) -> Result<KnowledgeBase, ApiError>;

    async fn get_knowledge_base(&self, knowledge_base_id: &str) -> Result<KnowledgeBase, ApiError>;

    /// Full-object replace; the remote API has no partial update.
    async fn put_knowledge_base(&self, kb: &KnowledgeBase) -> Result<KnowledgeBase, ApiError>;

    /// Queues a re-index job. Success means "accepted", not "done".
    async fn trigger_sync(&self, knowledge_base_id: &str, org_id: &str) -> Result<Value, ApiError>;

    /// Entries of the knowledge base under `path`; an unknown path lists as empty.
    async fn list_knowledge_base_children(
        &self,
        knowledge_base_id: &str,
        path: &str,
    ) -> Result<Vec<Resource>, ApiError>;

    /// Absolute paths currently present in the live index under `path_prefix`.
    async fn get_indexed_paths(
        &self,
        knowledge_base_id: &str,
        path_prefix: &str,
    ) -> Result<Vec<String>, ApiError> {
        let entries = self
            .list_knowledge_base_children(knowledge_base_id, path_prefix)
            .await?;
        Ok(entries
            .iter()
            .filter(|r| !r.inode_path.path.is_empty())
            .map(Resource::absolute_path)
            .collect())
    }

    /// Removes `path` from the index. Deleting something already gone succeeds.
    async fn delete_resource(&self, knowledge_base_id: &str, path: &str) -> Result<(), ApiError>;
}

/// Listing bodies come back either bare or wrapped in `{ data: [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Bare(Vec<T>),
    Wrapped {
        #[serde(default = "Vec::new")]
        data: Vec<T>,
        #[serde(default)]
        next_cursor: Option<String>,
    },
}

impl<T> Listing<T> {
    fn into_parts(self) -> (Vec<T>, Option<String>) {
        match self {
            Listing::Bare(items) => (items, None),
            Listing::Wrapped { data, next_cursor } => (data, next_cursor),
        }
    }
}

/// reqwest-backed implementation of [`IndexingApi`].
pub struct IndexingClient {
    http: reqwest::Client,
    base_url: String,
    auth: Arc<AuthClient>,
}

impl IndexingClient {
    pub fn new(service: &ServiceConfig, auth: Arc<AuthClient>) -> Result<Self, ApiError> {
        // per-call timeouts are set on each request
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: service.base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// One authenticated round trip. Non-success statuses become `ApiError::Status`.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<reqwest::Response, ApiError> {
        let mut reauthenticated = false;
        loop {
            let token = self.auth.token().await?;
            let mut req = self
                .http
                .request(method.clone(), url)
                .timeout(timeout)
                .header(AUTHORIZATION, token.header_value());
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| ApiError::from_transport(e, url))?;
            let status = resp.status();

            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                debug!(%url, "401 from indexing service, re-authenticating");
                self.auth.invalidate().await;
                reauthenticated = true;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ApiError::Status { status, body });
            }
            return Ok(resp);
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        label: &str,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let (this, url) = (self, url.as_str());
        retry
            .run(label, ApiError::is_transient, move || async move {
                let resp = this.execute(Method::GET, url, query, None, timeout).await?;
                resp.json::<T>()
                    .await
                    .map_err(|e| ApiError::from_transport(e, url))
            })
            .await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Option<T>, ApiError> {
        let url = self.url(path);
        let resp = self
            .execute(method, &url, &[], Some(body), timeout)
            .await?;
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::from_transport(e, &url))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }
}

#[async_trait]
impl IndexingApi for IndexingClient {
    async fn authenticate(&self) -> Result<BearerToken, ApiError> {
        Ok(self.auth.token().await?)
    }

    async fn current_organization(&self) -> Result<Organization, ApiError> {
        self.get_json(
            "current_organization",
            "/organizations/me/current",
            &[],
            CALL_TIMEOUT,
            GET_RETRY,
        )
        .await
    }

    async fn list_connections(&self, provider: Option<&str>) -> Result<Vec<Connection>, ApiError> {
        let listing: Listing<RawConnection> = self
            .get_json("list_connections", "/connections", &[], CALL_TIMEOUT, GET_RETRY)
            .await?;
        let (raw, _) = listing.into_parts();
        Ok(raw
            .into_iter()
            .filter(|c| provider.is_none_or(|p| c.connection_provider == p))
            .map(Connection::from)
            .collect())
    }

    async fn list_children(
        &self,
        connection_id: &str,
        query: &ChildrenQuery,
    ) -> Result<ChildrenPage, ApiError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        let path = match query.search_query.as_deref().filter(|q| !q.is_empty()) {
            Some(q) => {
                params.push(("search_query", q.to_string()));
                format!("/connections/{connection_id}/resources/search")
            }
            None => format!("/connections/{connection_id}/resources/children"),
        };
        if let Some(parent) = &query.parent_id {
            params.push(("resource_id", parent.clone()));
        }
        if let Some(cursor) = &query.cursor {
            params.push(("cursor", cursor.clone()));
        }
        params.push(("page_size", query.page_size.to_string()));

        let listing: Listing<Resource> = self
            .get_json("list_children", &path, &params, CALL_TIMEOUT, GET_RETRY)
            .await?;
        let (items, next_cursor) = listing.into_parts();
        Ok(ChildrenPage::from_items(items, query.page_size, next_cursor))
    }

    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>, ApiError> {
        let listing: Listing<KnowledgeBase> = self
            .get_json(
                "list_knowledge_bases",
                "/knowledge_bases",
                &[],
                KB_LIST_TIMEOUT,
                KB_LIST_RETRY,
            )
            .await?;
        Ok(listing.into_parts().0)
    }

    async fn create_knowledge_base(
        &self,
        body: &CreateKnowledgeBase,
    ) -> Result<KnowledgeBase, ApiError> {
        let body = serde_json::to_value(body)?;
        let created: Option<KnowledgeBase> = self
            .send_json(Method::POST, "/knowledge_bases", &body, KB_LIST_TIMEOUT)
            .await?;
        created.ok_or_else(|| ApiError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: "create knowledge base returned an empty body".to_string(),
        })
    }

    async fn get_knowledge_base(&self, knowledge_base_id: &str) -> Result<KnowledgeBase, ApiError> {
        self.get_json(
            "get_knowledge_base",
            &format!("/knowledge_bases/{knowledge_base_id}"),
            &[],
            CALL_TIMEOUT,
            GET_RETRY,
        )
        .await
    }

    async fn put_knowledge_base(&self, kb: &KnowledgeBase) -> Result<KnowledgeBase, ApiError> {
        let body = serde_json::to_value(kb)?;
        let path = format!("/knowledge_bases/{}", kb.knowledge_base_id);
        let updated: Option<KnowledgeBase> = self
            .send_json(Method::PUT, &path, &body, CALL_TIMEOUT)
            .await?;
        Ok(updated.unwrap_or_else(|| kb.clone()))
    }

    async fn trigger_sync(&self, knowledge_base_id: &str, org_id: &str) -> Result<Value, ApiError> {
        // a GET on the wire, but it queues work: no blind replay
        self.get_json(
            "trigger_sync",
            &format!("/knowledge_bases/sync/trigger/{knowledge_base_id}/{org_id}"),
            &[],
            CALL_TIMEOUT,
            RetryPolicy::none(),
        )
        .await
    }

    async fn list_knowledge_base_children(
        &self,
        knowledge_base_id: &str,
        path: &str,
    ) -> Result<Vec<Resource>, ApiError> {
        let params = [("resource_path", ensure_absolute_path(path))];
        let res: Result<Listing<Resource>, ApiError> = self
            .get_json(
                "list_knowledge_base_children",
                &format!("/knowledge_bases/{knowledge_base_id}/resources/children"),
                &params,
                CALL_TIMEOUT,
                GET_RETRY,
            )
            .await;
        match res {
            Ok(listing) => Ok(listing.into_parts().0),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn delete_resource(&self, knowledge_base_id: &str, path: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("/knowledge_bases/{knowledge_base_id}/resources"));
        let params = [("resource_path", ensure_absolute_path(path))];
        match self
            .execute(Method::DELETE, &url, &params, None, CALL_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(%path, "resource already absent from knowledge base");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
