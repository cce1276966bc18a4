//! kb_service.rs
//!
//! Knowledge-base membership on top of `IndexingApi`.
//!
//! Responsibilities:
//! - find or create the one knowledge base a connection indexes into
//! - add/remove resource ids with a read-modify-write of the whole object
//! - queue a sync after every membership change (fire-and-forget)
//! - list what a connection currently has indexed
//!
//! The remote API has no partial update and no version check, so concurrent
//! writers race and the last PUT wins.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::client::{ApiError, IndexingApi};
use crate::kb::kb_cache::KnowledgeBaseCache;
use crate::model::{
    CreateKnowledgeBase, IndexingParams, InodePath, KnowledgeBase, Resource, union_ids,
};

#[derive(Error, Debug)]
pub enum KnowledgeBaseError {
    #[error("indexing service error: {0}")]
    Api(#[from] ApiError),

    #[error("no resource ids given")]
    NothingToChange,
}

/// What happened to the sync job queued after a membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Accepted,
    Failed(String),
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Accepted => f.write_str("accepted"),
            SyncOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Result of a membership change. A failed sync leaves the membership
/// change in place; callers report it as a partial success.
#[derive(Debug, Clone)]
pub struct MembershipUpdate {
    pub knowledge_base: KnowledgeBase,
    pub sync: SyncOutcome,
}

impl MembershipUpdate {
    pub fn is_partial(&self) -> bool {
        matches!(self.sync, SyncOutcome::Failed(_))
    }
}

pub struct KnowledgeBaseService {
    api: Arc<dyn IndexingApi>,
    cache: Arc<KnowledgeBaseCache>,
    org_id: OnceCell<String>,
    embedding_model: String,
}

impl KnowledgeBaseService {
    pub fn new(
        api: Arc<dyn IndexingApi>,
        cache: Arc<KnowledgeBaseCache>,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            api,
            cache,
            org_id: OnceCell::new(),
            embedding_model: embedding_model.into(),
        }
    }

    pub fn api(&self) -> &Arc<dyn IndexingApi> {
        &self.api
    }

    /// The knowledge base for `connection_id`: the cached one if it still
    /// exists, else the first listed one bound to the connection, else a new one.
    /// Every path returns the object as the server has it right now.
    pub async fn get_or_create(&self, connection_id: &str) -> Result<KnowledgeBase, KnowledgeBaseError> {
        if let Some(kb_id) = self.cache.get(connection_id) {
            match self.api.get_knowledge_base(&kb_id).await {
                Ok(kb) => return Ok(kb),
                Err(e) if e.is_not_found() => {
                    warn!(connection_id, kb_id, "cached knowledge base is gone");
                    self.cache.invalidate(connection_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let existing = self
            .api
            .list_knowledge_bases()
            .await?
            .into_iter()
            .find(|kb| kb.connection_id == connection_id);
        if let Some(kb) = existing {
            debug!(connection_id, kb_id = %kb.knowledge_base_id, "using existing knowledge base");
            self.cache.put(connection_id, &kb.knowledge_base_id);
            return Ok(kb);
        }

        let body = self.create_body(connection_id);
        let kb = self.api.create_knowledge_base(&body).await?;
        info!(connection_id, kb_id = %kb.knowledge_base_id, "created knowledge base");
        self.cache.put(connection_id, &kb.knowledge_base_id);
        Ok(kb)
    }

    fn create_body(&self, connection_id: &str) -> CreateKnowledgeBase {
        let short: String = connection_id.chars().take(8).collect();
        CreateKnowledgeBase {
            connection_id: connection_id.to_string(),
            connection_source_ids: Vec::new(),
            name: format!("File Picker Knowledge Base - {short}"),
            description: format!("Knowledge base for connection {connection_id}"),
            indexing_params: IndexingParams::with_model(self.embedding_model.clone()),
            org_level_role: None,
            cron_job_id: None,
        }
    }

    /// Unions `resource_ids` into the membership, writes it back and queues a sync.
    pub async fn add_resources(
        &self,
        connection_id: &str,
        resource_ids: &[String],
    ) -> Result<MembershipUpdate, KnowledgeBaseError> {
        if resource_ids.is_empty() {
            return Err(KnowledgeBaseError::NothingToChange);
        }
        let mut kb = self.get_or_create(connection_id).await?;
        kb.connection_source_ids = union_ids(&kb.connection_source_ids, resource_ids);
        let kb = self.api.put_knowledge_base(&kb).await?;
        info!(
            kb_id = %kb.knowledge_base_id,
            added = resource_ids.len(),
            members = kb.connection_source_ids.len(),
            "membership updated"
        );
        self.finish(kb).await
    }

    /// Drops `resource_id` from the membership, writes it back and queues a sync.
    pub async fn remove_resource(
        &self,
        connection_id: &str,
        resource_id: &str,
    ) -> Result<MembershipUpdate, KnowledgeBaseError> {
        let mut kb = self.get_or_create(connection_id).await?;
        kb.connection_source_ids.retain(|id| id != resource_id);
        let kb = self.api.put_knowledge_base(&kb).await?;
        info!(kb_id = %kb.knowledge_base_id, resource_id, "resource removed from membership");
        self.finish(kb).await
    }

    async fn finish(&self, knowledge_base: KnowledgeBase) -> Result<MembershipUpdate, KnowledgeBaseError> {
        let sync = match self.trigger_sync(&knowledge_base.knowledge_base_id).await {
            Ok(()) => SyncOutcome::Accepted,
            Err(e) => {
                warn!(kb_id = %knowledge_base.knowledge_base_id, error = %e, "sync trigger failed");
                SyncOutcome::Failed(e.to_string())
            }
        };
        Ok(MembershipUpdate {
            knowledge_base,
            sync,
        })
    }

    /// Organization id, fetched once per process.
    pub async fn org_id(&self) -> Result<String, KnowledgeBaseError> {
        let org = self
            .org_id
            .get_or_try_init(|| async {
                let org = self.api.current_organization().await?;
                Ok::<_, ApiError>(org.org_id)
            })
            .await?;
        Ok(org.clone())
    }

    /// Queues a sync job. Returns once the job is accepted.
    pub async fn trigger_sync(&self, knowledge_base_id: &str) -> Result<(), KnowledgeBaseError> {
        let org_id = self.org_id().await?;
        self.api.trigger_sync(knowledge_base_id, &org_id).await?;
        debug!(kb_id = knowledge_base_id, "sync queued");
        Ok(())
    }

    /// Members found at the root of the index, plus the indexed children of
    /// every member folder. Child paths are rebuilt under their folder.
    pub async fn indexed_resources(&self, connection_id: &str) -> Result<Vec<Resource>, KnowledgeBaseError> {
        let kb = self.get_or_create(connection_id).await?;
        if kb.connection_source_ids.is_empty() {
            return Ok(Vec::new());
        }
        let members: HashSet<&str> = kb.connection_source_ids.iter().map(String::as_str).collect();
        let root = self
            .api
            .list_knowledge_base_children(&kb.knowledge_base_id, "/")
            .await?;

        let mut out: Vec<Resource> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let top: Vec<Resource> = root
            .into_iter()
            .filter(|r| members.contains(r.resource_id.as_str()))
            .collect();

        for resource in &top {
            if seen.insert(resource.resource_id.clone()) {
                out.push(resource.clone());
            }
        }
        for dir in top.iter().filter(|r| r.is_directory()) {
            let children = match self
                .api
                .list_knowledge_base_children(&kb.knowledge_base_id, &dir.inode_path.path)
                .await
            {
                Ok(children) => children,
                Err(e) => {
                    warn!(path = %dir.inode_path.path, error = %e, "could not list indexed folder");
                    continue;
                }
            };
            let base = dir.inode_path.path.trim_end_matches('/');
            for mut child in children {
                child.inode_path = InodePath {
                    path: format!("{base}/{}", child.name()),
                };
                if seen.insert(child.resource_id.clone()) {
                    out.push(child);
                }
            }
        }
        Ok(out)
    }
}
