//! model.rs
//!
//! Wire types shared by the Indexing Service client, the proxy and the terminal UI.
//!
//! Remote objects are read-modify-written as a whole, so every struct that is
//! ever sent back keeps the fields it does not model in a flattened `extra` map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default page size for children listings.
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InodeType {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodePath {
    pub path: String,
}

/// A file or directory handle living in the remote storage provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: String,
    pub inode_path: InodePath,
    pub inode_type: InodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Backend-side status (`pending`, `indexed`, ...) when listed from a KB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Resource {
    #[cfg(test)]
    pub fn new<S: Into<String>, P: Into<String>>(id: S, path: P, inode_type: InodeType) -> Self {
        Self {
            resource_id: id.into(),
            inode_path: InodePath { path: path.into() },
            inode_type,
            created_at: None,
            modified_at: None,
            size: None,
            status: None,
            extra: Map::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.inode_type == InodeType::Directory
    }

    /// Last path segment, used for display.
    pub fn name(&self) -> &str {
        let path = self.inode_path.path.trim_end_matches('/');
        path.rsplit('/').next().unwrap_or(path)
    }

    pub fn absolute_path(&self) -> String {
        ensure_absolute_path(&self.inode_path.path)
    }

    /// Backend timestamps are RFC 3339 most of the time; anything else is ignored.
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified_at
            .as_deref()
            .or(self.created_at.as_deref())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Normalizes a remote path to the `/`-prefixed form used for comparisons.
pub fn ensure_absolute_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Absolute path of the directory containing `path` (`/` for top-level entries).
pub fn parent_path(path: &str) -> String {
    let abs = ensure_absolute_path(path);
    let trimmed = abs.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// A named handle to a remote storage account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Connection as the Indexing Service returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConnection {
    pub connection_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub connection_provider: String,
    #[serde(default)]
    pub connection_provider_data: Option<Value>,
}

impl From<RawConnection> for Connection {
    fn from(raw: RawConnection) -> Self {
        // anything the API hands back is a live connection
        Self {
            id: raw.connection_id,
            name: raw.name,
            kind: raw.connection_provider,
            status: ConnectionStatus::Connected,
            metadata: raw.connection_provider_data,
        }
    }
}

/// Remote search-index container. Only the membership-related fields are typed;
/// everything else is round-tripped untouched through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub knowledge_base_id: String,
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub connection_source_ids: Vec<String>,
    /// `name`, `indexing_params` and the rest, exactly as the server sent them.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingParams {
    pub embedding_model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkerParams {
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub chunker: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingParams {
    pub ocr: bool,
    pub unstructured: bool,
    pub embedding_params: EmbeddingParams,
    pub chunker_params: ChunkerParams,
}

impl IndexingParams {
    /// Fixed parameters every picker-created knowledge base uses.
    pub fn with_model<S: Into<String>>(embedding_model: S) -> Self {
        Self {
            ocr: false,
            unstructured: true,
            embedding_params: EmbeddingParams {
                embedding_model: embedding_model.into(),
                api_key: None,
            },
            chunker_params: ChunkerParams {
                chunk_size: 1500,
                chunk_overlap: 500,
                chunker: "sentence".to_string(),
            },
        }
    }
}

/// Body of `POST /knowledge_bases`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateKnowledgeBase {
    pub connection_id: String,
    pub connection_source_ids: Vec<String>,
    pub name: String,
    pub description: String,
    pub indexing_params: IndexingParams,
    pub org_level_role: Option<String>,
    pub cron_job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One page of a children/search listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildrenPage {
    pub items: Vec<Resource>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl ChildrenPage {
    /// The backend's own "more pages" flag is unreliable; a full page is the only signal.
    pub fn from_items(items: Vec<Resource>, page_size: usize, next_cursor: Option<String>) -> Self {
        let has_more = page_size > 0 && items.len() == page_size;
        Self {
            items,
            next_cursor: if has_more { next_cursor } else { None },
            has_more,
        }
    }
}

/// Set-union that keeps existing order and drops duplicates.
pub fn union_ids(existing: &[String], added: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(existing.len() + added.len());
    for id in existing.iter().chain(added) {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}
