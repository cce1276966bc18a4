pub mod auth_client;
pub mod indexing_client;
pub mod retry;

pub use auth_client::{AuthClient, AuthError};
pub use indexing_client::{ApiError, ChildrenQuery, IndexingApi, IndexingClient};
