//! Test doubles: an in-process HTTP upstream and an in-memory `IndexingApi`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{Json, Router, routing::post};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::client::auth_client::BearerToken;
use crate::client::{ApiError, ChildrenQuery, IndexingApi};
use crate::config::ServiceConfig;
use crate::model::{
    ChildrenPage, Connection, ConnectionStatus, CreateKnowledgeBase, InodeType, KnowledgeBase,
    Organization, Resource, ensure_absolute_path,
};

/// An axum router served on an ephemeral localhost port.
pub struct MockUpstream {
    pub url: String,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start(router: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self {
            url: format!("http://{addr}"),
            handle,
        }
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn service_config(url: &str) -> ServiceConfig {
    ServiceConfig {
        base_url: url.to_string(),
        auth_url: url.to_string(),
        anon_key: "anon".into(),
        email: "svc@example.com".into(),
        password: "secret".into(),
    }
}

/// Router with a token endpoint handing out `tok-0`, `tok-1`, ...
pub fn token_route() -> Router {
    let issued = Arc::new(AtomicU32::new(0));
    Router::new().route(
        "/auth/v1/token",
        post(move || {
            let issued = issued.clone();
            async move {
                let n = issued.fetch_add(1, Ordering::SeqCst);
                Json(json!({ "access_token": format!("tok-{n}"), "expires_in": 3600 }))
            }
        }),
    )
}

pub fn file(id: &str, path: &str) -> Resource {
    Resource::new(id, path, InodeType::File)
}

pub fn folder(id: &str, path: &str) -> Resource {
    Resource::new(id, path, InodeType::Directory)
}

/// Scripted answer for one `get_indexed_paths` call.
#[derive(Debug, Clone)]
pub enum PollReply {
    Paths(Vec<&'static str>),
    Status(StatusCode),
    Timeout,
}

#[derive(Default)]
pub struct FakeState {
    pub connections: Vec<Connection>,
    /// Children per parent id (`None` is the connection root).
    pub children: HashMap<Option<String>, Vec<Resource>>,
    pub knowledge_bases: HashMap<String, KnowledgeBase>,
    /// Knowledge-base listing per absolute path.
    pub kb_children: HashMap<String, Vec<Resource>>,
    pub poll_script: VecDeque<PollReply>,
    pub fail_put: Option<StatusCode>,
    pub fail_sync: Option<StatusCode>,
    pub fail_get_kb: Option<StatusCode>,
    pub calls: HashMap<&'static str, u32>,
    next_kb: u32,
}

/// In-memory stand-in for the Indexing Service.
#[derive(Default)]
pub struct FakeIndexingApi {
    pub state: Mutex<FakeState>,
}

impl FakeIndexingApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_kb(connection_id: &str, kb_id: &str, members: &[&str]) -> Arc<Self> {
        let api = Self::default();
        api.state.lock().unwrap().knowledge_bases.insert(
            kb_id.to_string(),
            serde_json::from_value(json!({
                "knowledge_base_id": kb_id,
                "connection_id": connection_id,
                "connection_source_ids": members,
                "name": "existing",
                "indexing_params": { "ocr": false }
            }))
            .unwrap(),
        );
        Arc::new(api)
    }

    pub fn calls(&self, name: &str) -> u32 {
        self.state.lock().unwrap().calls.get(name).copied().unwrap_or(0)
    }

    pub fn members(&self, kb_id: &str) -> Vec<String> {
        self.state.lock().unwrap().knowledge_bases[kb_id]
            .connection_source_ids
            .clone()
    }

    pub fn script(&self, replies: impl IntoIterator<Item = PollReply>) {
        self.state.lock().unwrap().poll_script.extend(replies);
    }

    fn record(&self, name: &'static str) -> std::sync::MutexGuard<'_, FakeState> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(name).or_default() += 1;
        state
    }
}

fn status_error(status: StatusCode) -> ApiError {
    ApiError::Status {
        status,
        body: json!({ "detail": "injected failure" }).to_string(),
    }
}

#[async_trait]
impl IndexingApi for FakeIndexingApi {
    async fn authenticate(&self) -> Result<BearerToken, ApiError> {
        self.record("authenticate");
        Ok(BearerToken::new("fake-token", None))
    }

    async fn current_organization(&self) -> Result<Organization, ApiError> {
        self.record("current_organization");
        Ok(Organization {
            org_id: "org-1".into(),
            extra: Default::default(),
        })
    }

    async fn list_connections(&self, provider: Option<&str>) -> Result<Vec<Connection>, ApiError> {
        let state = self.record("list_connections");
        let mut out = state.connections.clone();
        if out.is_empty() {
            out.push(Connection {
                id: "conn-1".into(),
                name: "Drive".into(),
                kind: "gdrive".into(),
                status: ConnectionStatus::Connected,
                metadata: None,
            });
        }
        Ok(out
            .into_iter()
            .filter(|c| provider.is_none_or(|p| c.kind == p))
            .collect())
    }

    async fn list_children(
        &self,
        _connection_id: &str,
        query: &ChildrenQuery,
    ) -> Result<ChildrenPage, ApiError> {
        let state = self.record("list_children");
        let all = state
            .children
            .get(&query.parent_id)
            .cloned()
            .unwrap_or_default();
        let start: usize = query
            .cursor
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let items: Vec<Resource> = all.into_iter().skip(start).take(query.page_size).collect();
        let next = (start + items.len()).to_string();
        Ok(ChildrenPage::from_items(items, query.page_size, Some(next)))
    }

    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>, ApiError> {
        let state = self.record("list_knowledge_bases");
        Ok(state.knowledge_bases.values().cloned().collect())
    }

    async fn create_knowledge_base(
        &self,
        body: &CreateKnowledgeBase,
    ) -> Result<KnowledgeBase, ApiError> {
        let mut state = self.record("create_knowledge_base");
        state.next_kb += 1;
        let id = format!("kb-new-{}", state.next_kb);
        let mut value = serde_json::to_value(body)?;
        value["knowledge_base_id"] = Value::String(id.clone());
        let kb: KnowledgeBase = serde_json::from_value(value)?;
        state.knowledge_bases.insert(id, kb.clone());
        Ok(kb)
    }

    async fn get_knowledge_base(&self, knowledge_base_id: &str) -> Result<KnowledgeBase, ApiError> {
        let state = self.record("get_knowledge_base");
        if let Some(status) = state.fail_get_kb {
            return Err(status_error(status));
        }
        state
            .knowledge_bases
            .get(knowledge_base_id)
            .cloned()
            .ok_or_else(|| status_error(StatusCode::NOT_FOUND))
    }

    async fn put_knowledge_base(&self, kb: &KnowledgeBase) -> Result<KnowledgeBase, ApiError> {
        let mut state = self.record("put_knowledge_base");
        if let Some(status) = state.fail_put {
            return Err(status_error(status));
        }
        state
            .knowledge_bases
            .insert(kb.knowledge_base_id.clone(), kb.clone());
        Ok(kb.clone())
    }

    async fn trigger_sync(&self, knowledge_base_id: &str, org_id: &str) -> Result<Value, ApiError> {
        let state = self.record("trigger_sync");
        if let Some(status) = state.fail_sync {
            return Err(status_error(status));
        }
        Ok(json!({ "knowledge_base_id": knowledge_base_id, "org_id": org_id }))
    }

    async fn list_knowledge_base_children(
        &self,
        _knowledge_base_id: &str,
        path: &str,
    ) -> Result<Vec<Resource>, ApiError> {
        let state = self.record("list_knowledge_base_children");
        Ok(state
            .kb_children
            .get(&ensure_absolute_path(path))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_indexed_paths(
        &self,
        _knowledge_base_id: &str,
        _path_prefix: &str,
    ) -> Result<Vec<String>, ApiError> {
        let mut state = self.record("get_indexed_paths");
        match state.poll_script.pop_front() {
            Some(PollReply::Paths(paths)) => Ok(paths.into_iter().map(String::from).collect()),
            Some(PollReply::Status(status)) => Err(status_error(status)),
            Some(PollReply::Timeout) => Err(ApiError::Timeout("fake".into())),
            None => Ok(Vec::new()),
        }
    }

    async fn delete_resource(&self, _knowledge_base_id: &str, _path: &str) -> Result<(), ApiError> {
        self.record("delete_resource");
        Ok(())
    }
}
