pub mod kb_cache;
pub mod kb_service;
pub mod optimistic;

pub use kb_cache::KnowledgeBaseCache;
pub use kb_service::{KnowledgeBaseError, KnowledgeBaseService, MembershipUpdate, SyncOutcome};
pub use optimistic::Optimistic;
