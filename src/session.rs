//! session.rs
//!
//! One user's browsing session over a single connection: where they are in
//! the tree, what they have checked, and the indexing status of everything
//! they acted on.
//!
//! Responsibilities:
//! - folder navigation and paging (selection resets on every move)
//! - optimistic index/de-index with rollback when the remote call fails
//! - one status poller per resource being indexed, torn down on shutdown
//! - rebuilding statuses for a listing from membership plus the live index

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{ApiError, ChildrenQuery, IndexingApi};
use crate::config::PollConfig;
use crate::kb::{KnowledgeBaseError, KnowledgeBaseService, MembershipUpdate, Optimistic, SyncOutcome};
use crate::model::{ChildrenPage, Resource, parent_path, union_ids};
use crate::selection::SelectionTracker;
use crate::status::{
    IndexingStatus, ItemStatus, PollHandle, PollOutcome, StatusBoard, StatusPoller, TransitionError,
    reconcile,
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    KnowledgeBase(#[from] KnowledgeBaseError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("nothing to index: every resource is already indexed or in progress")]
    NothingToIndex,

    #[error("no files selected")]
    NoFilesSelected,
}

pub struct PickerSession {
    connection_id: String,
    page_size: usize,
    api: Arc<dyn IndexingApi>,
    kb: Arc<KnowledgeBaseService>,
    board: Arc<StatusBoard>,
    poller: StatusPoller,
    pollers: HashMap<String, PollHandle>,
    knowledge_base_id: Option<String>,
    members: Optimistic<Vec<String>>,
    selection: SelectionTracker,
    breadcrumb: Vec<Resource>,
}

impl PickerSession {
    pub fn new(
        kb: Arc<KnowledgeBaseService>,
        board: Arc<StatusBoard>,
        poll: PollConfig,
        connection_id: impl Into<String>,
        page_size: usize,
    ) -> Self {
        let api = kb.api().clone();
        let poller = StatusPoller::new(api.clone(), board.clone(), poll);
        Self {
            connection_id: connection_id.into(),
            page_size,
            api,
            kb,
            board,
            poller,
            pollers: HashMap::new(),
            knowledge_base_id: None,
            members: Optimistic::new(Vec::new()),
            selection: SelectionTracker::new(),
            breadcrumb: Vec::new(),
        }
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    pub fn status(&self, resource_id: &str) -> ItemStatus {
        self.board.get(resource_id)
    }

    pub fn members(&self) -> Vec<String> {
        self.members.get()
    }

    pub fn knowledge_base_id(&self) -> Option<&str> {
        self.knowledge_base_id.as_deref()
    }

    /// Binds the session to the connection's knowledge base and loads its membership.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        let kb = self.kb.get_or_create(&self.connection_id).await?;
        info!(
            connection_id = %self.connection_id,
            kb_id = %kb.knowledge_base_id,
            members = kb.connection_source_ids.len(),
            "session opened"
        );
        self.members.set(kb.connection_source_ids);
        self.knowledge_base_id = Some(kb.knowledge_base_id);
        Ok(())
    }

    async fn ensure_kb(&mut self) -> Result<String, SessionError> {
        if self.knowledge_base_id.is_none() {
            self.open().await?;
        }
        Ok(self.knowledge_base_id.clone().unwrap_or_default())
    }

    // navigation

    pub fn breadcrumb(&self) -> &[Resource] {
        &self.breadcrumb
    }

    pub fn current_folder(&self) -> Option<&Resource> {
        self.breadcrumb.last()
    }

    pub fn current_path(&self) -> String {
        self.current_folder()
            .map(Resource::absolute_path)
            .unwrap_or_else(|| "/".to_string())
    }

    /// Enters `folder`. Selection does not survive navigation.
    pub fn enter(&mut self, folder: &Resource) {
        self.breadcrumb.push(folder.clone());
        self.selection.clear();
    }

    /// Goes one level up. Returns false at the root.
    pub fn leave(&mut self) -> bool {
        self.selection.clear();
        self.breadcrumb.pop().is_some()
    }

    /// Jumps back to the breadcrumb entry at `depth` (0 is the root).
    pub fn go_to_depth(&mut self, depth: usize) {
        self.breadcrumb.truncate(depth);
        self.selection.clear();
    }

    /// One page of the current folder, or of a search inside the connection.
    pub async fn list(&self, cursor: Option<String>, search: Option<&str>) -> Result<ChildrenPage, SessionError> {
        let mut query = match self.current_folder() {
            Some(folder) => ChildrenQuery::folder(folder.resource_id.clone(), self.page_size),
            None => ChildrenQuery::root(self.page_size),
        };
        query.cursor = cursor;
        query.search_query = search.map(str::to_string);
        Ok(self.api.list_children(&self.connection_id, &query).await?)
    }

    // selection

    pub fn selection(&self) -> &SelectionTracker {
        &self.selection
    }

    pub fn selection_mut(&mut self) -> &mut SelectionTracker {
        &mut self.selection
    }

    // indexing

    /// Indexes the selected files and clears the selection on success.
    /// Selected folders are left out of a batch.
    pub async fn index_selected(&mut self) -> Result<MembershipUpdate, SessionError> {
        let resources: Vec<Resource> = self
            .selection
            .selected_files()
            .into_iter()
            .cloned()
            .collect();
        if resources.is_empty() {
            return Err(SessionError::NoFilesSelected);
        }
        let update = self.index_resources(&resources).await?;
        self.selection.clear();
        Ok(update)
    }

    /// Adds `resources` to the knowledge base and starts polling each of them.
    /// Resources that are already indexed or in flight are skipped.
    pub async fn index_resources(&mut self, resources: &[Resource]) -> Result<MembershipUpdate, SessionError> {
        let kb_id = self.ensure_kb().await?;

        let mut started: Vec<(Resource, ItemStatus)> = Vec::new();
        for resource in resources {
            let current = self.board.state(&resource.resource_id);
            if !matches!(current, IndexingStatus::Pristine | IndexingStatus::Failed) {
                debug!(resource_id = %resource.resource_id, status = %current, "skipping resource");
                continue;
            }
            let next = ItemStatus::new(IndexingStatus::indexing_for(resource.inode_type));
            match self.board.transition(&resource.resource_id, next) {
                Ok(previous) => started.push((resource.clone(), previous)),
                Err(e) => debug!(error = %e, "skipping resource"),
            }
        }
        if started.is_empty() {
            return Err(SessionError::NothingToIndex);
        }

        let ids: Vec<String> = started.iter().map(|(r, _)| r.resource_id.clone()).collect();
        let (kb, connection_id) = (&self.kb, self.connection_id.as_str());
        let result = self
            .members
            .mutate(
                |members| *members = union_ids(members, &ids),
                || kb.add_resources(connection_id, &ids),
            )
            .await;

        let update = match result {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "index request failed, rolling back");
                for (resource, previous) in started {
                    self.board.restore(&resource.resource_id, previous);
                }
                return Err(e.into());
            }
        };
        self.members.set(update.knowledge_base.connection_source_ids.clone());

        match &update.sync {
            SyncOutcome::Accepted => {
                for (resource, _) in &started {
                    self.start_polling(&kb_id, resource);
                }
            }
            SyncOutcome::Failed(reason) => {
                // membership stays; a retry only has to re-queue the sync
                for (resource, _) in &started {
                    let failed = ItemStatus::failed(format!("sync not started: {reason}"));
                    if let Err(e) = self.board.transition(&resource.resource_id, failed) {
                        debug!(error = %e, "status moved on before sync failure was recorded");
                    }
                }
            }
        }
        Ok(update)
    }

    /// Retries a failed resource.
    pub async fn retry(&mut self, resource: &Resource) -> Result<MembershipUpdate, SessionError> {
        let current = self.board.state(&resource.resource_id);
        if current != IndexingStatus::Failed {
            return Err(TransitionError {
                resource_id: resource.resource_id.clone(),
                from: current,
                to: IndexingStatus::indexing_for(resource.inode_type),
            }
            .into());
        }
        self.index_resources(std::slice::from_ref(resource)).await
    }

    /// Removes `resource` from the knowledge base. On failure both the local
    /// membership and the status are put back.
    pub async fn deindex_resource(&mut self, resource: &Resource) -> Result<MembershipUpdate, SessionError> {
        self.ensure_kb().await?;
        let id = resource.resource_id.as_str();
        let previous = self
            .board
            .transition(id, ItemStatus::new(IndexingStatus::Deindexing))?;
        self.stop_polling(id);

        let (kb, connection_id) = (&self.kb, self.connection_id.as_str());
        let result = self
            .members
            .mutate(
                |members| members.retain(|m| m != id),
                || kb.remove_resource(connection_id, id),
            )
            .await;

        match result {
            Ok(update) => {
                self.members.set(update.knowledge_base.connection_source_ids.clone());
                self.board.transition(id, ItemStatus::new(IndexingStatus::Pristine))?;
                Ok(update)
            }
            Err(e) => {
                warn!(resource_id = id, error = %e, "de-index failed, reverting");
                self.board.restore(id, previous);
                Err(e.into())
            }
        }
    }

    /// Derives statuses for a freshly listed page (a folder or a search) from
    /// membership and the live index. Each item is looked up in its own
    /// parent's listing. Indexed members and failures are kept, resources with
    /// a running poller are left alone, and anything found mid-sync or
    /// mid-removal gets a poller.
    pub async fn refresh_statuses(&mut self, items: &[Resource]) -> Result<(), SessionError> {
        let kb_id = self.ensure_kb().await?;
        self.prune_pollers();
        let members: HashSet<String> = self.members.get().into_iter().collect();
        let under_member = self
            .breadcrumb
            .iter()
            .any(|folder| members.contains(&folder.resource_id));

        let mut listings: HashMap<String, HashSet<String>> = HashMap::new();
        for resource in items {
            let parent = parent_path(&resource.absolute_path());
            if !listings.contains_key(&parent) {
                let paths = self.api.get_indexed_paths(&kb_id, &parent).await?;
                listings.insert(parent, paths.into_iter().collect());
            }
        }

        for resource in items {
            let id = resource.resource_id.as_str();
            let current = self.board.state(id);
            if current.is_in_progress() && self.pollers.contains_key(id) {
                continue;
            }
            let covered = under_member || members.contains(id);
            if current.is_indexed() && covered {
                continue;
            }
            let path = resource.absolute_path();
            let listed = listings
                .get(&parent_path(&path))
                .is_some_and(|paths| paths.contains(&path));
            let derived = reconcile(resource.inode_type, covered, listed);
            if let Err(e) = self.board.derive(id, ItemStatus::new(derived)) {
                debug!(error = %e, "keeping current status");
                continue;
            }
            if derived.is_polling() {
                self.start_polling(&kb_id, resource);
            } else if derived == IndexingStatus::Deindexing {
                let handle = self.poller.spawn_removal(&kb_id, resource);
                self.pollers.insert(resource.resource_id.clone(), handle);
            }
        }
        Ok(())
    }

    // pollers

    fn start_polling(&mut self, kb_id: &str, resource: &Resource) {
        self.prune_pollers();
        let handle = self.poller.spawn(kb_id, resource);
        // replacing a handle drops (and cancels) the old poller
        self.pollers.insert(resource.resource_id.clone(), handle);
    }

    /// Drops handles whose task already resolved.
    fn prune_pollers(&mut self) {
        self.pollers.retain(|_, handle| !handle.is_finished());
    }

    fn stop_polling(&mut self, resource_id: &str) {
        if let Some(handle) = self.pollers.remove(resource_id) {
            handle.cancel();
        }
    }

    pub fn active_pollers(&self) -> usize {
        self.pollers.values().filter(|h| !h.is_finished()).count()
    }

    /// Waits for every running poller to resolve.
    pub async fn wait_for_pollers(&mut self) -> Vec<(String, PollOutcome)> {
        let mut out = Vec::with_capacity(self.pollers.len());
        for (id, handle) in self.pollers.drain() {
            out.push((id, handle.join().await));
        }
        out
    }

    /// Cancels every poller and waits for them to exit.
    pub async fn shutdown(&mut self) {
        for handle in self.pollers.values() {
            handle.cancel();
        }
        let stopped = self.wait_for_pollers().await;
        debug!(pollers = stopped.len(), "session shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::KnowledgeBaseCache;
    use crate::status::IndexingStatus::*;
    use crate::test_support::{FakeIndexingApi, PollReply, file, folder};
    use reqwest::StatusCode;
    use std::time::Duration;

    fn session(api: &Arc<FakeIndexingApi>) -> PickerSession {
        let kb = Arc::new(KnowledgeBaseService::new(
            api.clone(),
            Arc::new(KnowledgeBaseCache::new()),
            "text-embedding-ada-002",
        ));
        PickerSession::new(
            kb,
            Arc::new(StatusBoard::new()),
            PollConfig {
                interval: Duration::from_secs(2),
                max_attempts: 5,
            },
            "conn-1",
            100,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn index_then_deindex_scenario() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &[]);
        let mut s = session(&api);
        let (a, b) = (file("A", "a.txt"), file("B", "b.txt"));
        api.script([
            PollReply::Paths(vec!["/a.txt", "/b.txt"]),
            PollReply::Paths(vec!["/a.txt", "/b.txt"]),
        ]);

        s.selection_mut().select_multiple([&a, &b]);
        let update = s.index_selected().await.unwrap();
        assert!(!update.is_partial());
        assert!(s.selection().is_empty());
        assert_eq!(s.status("A").state, Indexing);

        s.wait_for_pollers().await;
        assert_eq!(s.status("A").state, Indexed);
        assert_eq!(s.status("B").state, Indexed);

        s.deindex_resource(&a).await.unwrap();
        assert_eq!(api.members("kb-1"), vec!["B"]);
        assert_eq!(s.members(), vec!["B"]);
        assert_eq!(s.status("A").state, Pristine);
        assert_eq!(s.status("B").state, Indexed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_remove_rolls_back_membership_and_status() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &[]);
        let mut s = session(&api);
        let a = file("A", "a.txt");
        api.script([PollReply::Paths(vec!["/a.txt"])]);
        s.index_resources(std::slice::from_ref(&a)).await.unwrap();
        s.wait_for_pollers().await;
        assert_eq!(s.status("A").state, Indexed);

        api.state.lock().unwrap().fail_put = Some(StatusCode::INTERNAL_SERVER_ERROR);
        let mut events = s.board().subscribe();
        let err = s.deindex_resource(&a).await.unwrap_err();
        assert!(matches!(err, SessionError::KnowledgeBase(_)));

        assert_eq!(s.members(), vec!["A"]);
        assert_eq!(api.members("kb-1"), vec!["A"]);
        assert_eq!(s.status("A").state, Indexed);
        let seen: Vec<IndexingStatus> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.status.state)
            .collect();
        assert_eq!(seen, vec![Deindexing, Indexed]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_add_restores_previous_status() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &[]);
        api.state.lock().unwrap().fail_put = Some(StatusCode::BAD_REQUEST);
        let mut s = session(&api);
        let a = file("A", "a.txt");
        s.selection_mut().toggle(&a);

        assert!(s.index_selected().await.is_err());
        assert_eq!(s.status("A").state, Pristine);
        assert!(s.members().is_empty());
        // selection survives a failed request
        assert!(s.selection().is_selected("A"));
        assert_eq!(s.active_pollers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sync_marks_failed_and_retry_recovers() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &[]);
        api.state.lock().unwrap().fail_sync = Some(StatusCode::BAD_GATEWAY);
        let mut s = session(&api);
        let d = folder("D", "docs");

        let update = s.index_resources(std::slice::from_ref(&d)).await.unwrap();
        assert!(update.is_partial());
        assert_eq!(s.status("D").state, Failed);
        assert_eq!(api.members("kb-1"), vec!["D"]);
        assert_eq!(s.active_pollers(), 0);

        api.state.lock().unwrap().fail_sync = None;
        api.script([
            PollReply::Paths(vec!["/docs/a", "/docs/b"]),
            PollReply::Paths(vec!["/docs/a", "/docs/b"]),
        ]);
        s.retry(&d).await.unwrap();
        assert_eq!(s.status("D").state, IndexingFolder);
        s.wait_for_pollers().await;
        assert_eq!(s.status("D").state, IndexedFull);
        assert_eq!(api.members("kb-1"), vec!["D"]);
    }

    #[tokio::test]
    async fn retry_requires_failed_state() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &[]);
        let mut s = session(&api);
        let err = s.retry(&file("A", "a.txt")).await.unwrap_err();
        assert!(matches!(err, SessionError::Transition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_resources_are_not_indexed_twice() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &[]);
        let mut s = session(&api);
        let a = file("A", "a.txt");
        s.index_resources(std::slice::from_ref(&a)).await.unwrap();
        let err = s.index_resources(std::slice::from_ref(&a)).await.unwrap_err();
        assert!(matches!(err, SessionError::NothingToIndex));
        assert_eq!(api.calls("put_knowledge_base"), 1);
        s.shutdown().await;
        assert_eq!(s.active_pollers(), 0);
    }

    #[tokio::test]
    async fn navigation_clears_selection() {
        let api = FakeIndexingApi::new();
        let mut s = session(&api);
        let docs = folder("D", "docs");
        s.selection_mut().toggle(&file("A", "a.txt"));
        s.enter(&docs);
        assert!(s.selection().is_empty());
        assert_eq!(s.current_path(), "/docs");

        s.selection_mut().toggle(&file("B", "docs/b.txt"));
        assert!(s.leave());
        assert!(s.selection().is_empty());
        assert!(!s.leave());

        // a checked folder does not stay checked once opened
        s.selection_mut().toggle(&docs);
        s.enter(&docs);
        assert!(s.selection().is_empty());
        assert!(!s.selection().is_selected("D"));
    }

    #[tokio::test]
    async fn lists_the_current_folder() {
        let api = FakeIndexingApi::new();
        api.state.lock().unwrap().children.insert(
            Some("D".into()),
            vec![file("A", "docs/a.txt"), file("B", "docs/b.txt")],
        );
        let mut s = session(&api);
        s.enter(&folder("D", "docs"));
        let page = s.list(None, None).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(!page.has_more);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_reconciles_membership_with_listing() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &["A", "C"]);
        let mut s = session(&api);
        s.open().await.unwrap();
        let items = [file("A", "a.txt"), file("B", "b.txt"), file("C", "c.txt"), file("E", "e.txt")];
        api.script([PollReply::Paths(vec!["/a.txt", "/b.txt"])]);

        s.refresh_statuses(&items).await.unwrap();
        assert_eq!(s.status("A").state, Indexed);
        assert_eq!(s.status("B").state, Deindexing);
        assert_eq!(s.status("C").state, Indexing);
        assert_eq!(s.status("E").state, Pristine);
        // C waits to appear, B waits to disappear
        assert_eq!(s.active_pollers(), 2);
        s.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_looks_up_search_results_in_their_own_folder() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &["A"]);
        let mut s = session(&api);
        let items = [file("A", "docs/a.txt"), file("N", "notes/n.txt")];
        api.script([
            PollReply::Paths(vec!["/docs/a.txt"]),
            PollReply::Paths(vec![]),
        ]);

        s.refresh_statuses(&items).await.unwrap();
        assert_eq!(s.status("A").state, Indexed);
        assert_eq!(s.status("N").state, Pristine);
        assert_eq!(s.active_pollers(), 0);

        // a lagging listing does not pull a settled member back into indexing
        api.script([PollReply::Paths(vec![]), PollReply::Paths(vec![])]);
        s.refresh_statuses(&items).await.unwrap();
        assert_eq!(s.status("A").state, Indexed);
        assert_eq!(s.active_pollers(), 0);
        assert_eq!(api.calls("get_indexed_paths"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn lingering_removal_is_polled_until_it_leaves_the_index() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &[]);
        let mut s = session(&api);
        let b = file("B", "b.txt");
        api.script([
            PollReply::Paths(vec!["/b.txt"]),
            PollReply::Paths(vec!["/b.txt"]),
            PollReply::Paths(vec![]),
        ]);

        s.refresh_statuses(std::slice::from_ref(&b)).await.unwrap();
        assert_eq!(s.status("B").state, Deindexing);
        assert_eq!(s.active_pollers(), 1);

        let outcomes = s.wait_for_pollers().await;
        assert_eq!(outcomes, vec![("B".to_string(), PollOutcome::Resolved(Pristine))]);
        assert_eq!(s.status("B").state, Pristine);
        assert_eq!(api.calls("get_indexed_paths"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_index_takes_only_files() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &[]);
        let mut s = session(&api);
        let (d, f) = (folder("D", "docs"), file("F", "f.txt"));

        s.selection_mut().toggle(&d);
        let err = s.index_selected().await.unwrap_err();
        assert!(matches!(err, SessionError::NoFilesSelected));
        assert!(s.selection().is_selected("D"));
        assert_eq!(api.calls("put_knowledge_base"), 0);

        s.selection_mut().toggle(&f);
        s.index_selected().await.unwrap();
        assert_eq!(api.members("kb-1"), vec!["F"]);
        assert_eq!(s.status("D").state, Pristine);
        assert_eq!(s.status("F").state, Indexing);
        assert!(s.selection().is_empty());
        s.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_pollers_are_pruned() {
        let api = FakeIndexingApi::with_kb("conn-1", "kb-1", &[]);
        let mut s = session(&api);
        api.script([PollReply::Paths(vec!["/a.txt"])]);
        s.index_resources(&[file("A", "a.txt")]).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(s.status("A").state, Indexed);
        assert_eq!(s.active_pollers(), 0);
        assert_eq!(s.pollers.len(), 1);

        s.index_resources(&[file("B", "b.txt")]).await.unwrap();
        assert_eq!(s.pollers.len(), 1);
        assert!(s.pollers.contains_key("B"));
        s.shutdown().await;
    }
}
