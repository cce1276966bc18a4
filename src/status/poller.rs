//! poller.rs
//!
//! One background task per resource that is being indexed. Each task polls the
//! live index listing on a fixed interval and writes the result onto the shared
//! `StatusBoard` until the resource resolves, the attempt budget runs out, or
//! its handle is cancelled.
//!
//! Matching rules:
//! - a file is done once its absolute path shows up in its parent's listing
//! - a folder is done once its child count is non-zero and unchanged across
//!   two consecutive polls (the backend never says how many files to expect,
//!   so this is an inference, not a guarantee)
//!
//! Failure rules:
//! - an HTTP error status from the listing fails the resource immediately
//! - network errors and timeouts are retried and count against the budget
//! - an exhausted budget fails a file, and marks a folder `indexed-partial`
//!   when anything was observed under it
//!
//! Removal polling watches a `deindexing` resource the other way round: it
//! resolves to `pristine` once nothing of it is left in the listing. When the
//! budget runs out or the listing errors, the status stays `deindexing` and
//! the next refresh starts a new watch.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::IndexingApi;
use crate::config::PollConfig;
use crate::model::{Resource, parent_path};
use crate::status::board::StatusBoard;
use crate::status::state::{IndexingStatus, ItemStatus};

/// How a poll task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The poller wrote this terminal status.
    Resolved(IndexingStatus),
    /// Someone else moved the resource out of a polling state first.
    Superseded,
    Cancelled,
    /// Gave up with the resource still in flight; its status is left as is.
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollMode {
    /// Waits for the resource to show up in the index.
    Indexing,
    /// Waits for a removed resource to leave the index.
    Removal,
}

impl PollMode {
    fn owns(self, state: IndexingStatus) -> bool {
        match self {
            PollMode::Indexing => state.is_polling(),
            PollMode::Removal => state == IndexingStatus::Deindexing,
        }
    }
}

/// Owner of one running poll task. Dropping the handle cancels the task.
pub struct PollHandle {
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<PollOutcome>>,
}

impl PollHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    pub async fn join(mut self) -> PollOutcome {
        match self.task.take() {
            Some(task) => task.await.unwrap_or(PollOutcome::Cancelled),
            None => PollOutcome::Cancelled,
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Clone)]
pub struct StatusPoller {
    api: Arc<dyn IndexingApi>,
    board: Arc<StatusBoard>,
    config: PollConfig,
}

impl StatusPoller {
    pub fn new(api: Arc<dyn IndexingApi>, board: Arc<StatusBoard>, config: PollConfig) -> Self {
        Self { api, board, config }
    }

    /// Starts polling `resource` inside `knowledge_base_id`. The caller is
    /// expected to have already moved it into `indexing`/`indexing-folder`.
    pub fn spawn(&self, knowledge_base_id: &str, resource: &Resource) -> PollHandle {
        self.start(knowledge_base_id, resource, PollMode::Indexing)
    }

    /// Watches a `deindexing` resource until it leaves the live index.
    pub fn spawn_removal(&self, knowledge_base_id: &str, resource: &Resource) -> PollHandle {
        self.start(knowledge_base_id, resource, PollMode::Removal)
    }

    fn start(&self, knowledge_base_id: &str, resource: &Resource, mode: PollMode) -> PollHandle {
        let (cancel, cancelled) = watch::channel(false);
        let poller = self.clone();
        let kb_id = knowledge_base_id.to_string();
        let target = resource.clone();
        let task = tokio::spawn(async move { poller.run(kb_id, target, mode, cancelled).await });
        PollHandle {
            cancel,
            task: Some(task),
        }
    }

    async fn run(
        self,
        kb_id: String,
        resource: Resource,
        mode: PollMode,
        mut cancelled: watch::Receiver<bool>,
    ) -> PollOutcome {
        let id = resource.resource_id.as_str();
        let target = resource.absolute_path();
        let folder = resource.is_directory();
        let listing_path = if folder {
            target.clone()
        } else {
            parent_path(&target)
        };

        let mut last_count: Option<usize> = None;
        let mut observed = 0usize;

        for attempt in 1..=self.config.max_attempts {
            tokio::select! {
                _ = cancelled.changed() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            if !mode.owns(self.board.state(id)) {
                debug!(resource_id = id, "status left polling state, stopping");
                return PollOutcome::Superseded;
            }

            let listing = tokio::select! {
                _ = cancelled.changed() => return PollOutcome::Cancelled,
                res = self.api.get_indexed_paths(&kb_id, &listing_path) => res,
            };

            let paths = match listing {
                Ok(paths) => paths,
                Err(e) if e.is_network() => {
                    warn!(resource_id = id, attempt, error = %e, "status poll failed, will retry");
                    continue;
                }
                Err(e) if mode == PollMode::Removal => {
                    warn!(resource_id = id, attempt, error = %e, "removal poll rejected");
                    return PollOutcome::Unresolved;
                }
                Err(e) => {
                    warn!(resource_id = id, attempt, error = %e, "status poll rejected");
                    return self.finish(id, ItemStatus::failed(e.to_string()));
                }
            };

            if mode == PollMode::Removal {
                let lingering = if folder {
                    paths.iter().any(|p| is_under(p, &target))
                } else {
                    paths.iter().any(|p| *p == target)
                };
                if !lingering {
                    return self.finish(id, ItemStatus::default());
                }
                debug!(resource_id = id, attempt, "still in the index");
                continue;
            }

            if !folder {
                if paths.iter().any(|p| *p == target) {
                    return self.finish(id, ItemStatus::new(IndexingStatus::Indexed));
                }
                debug!(resource_id = id, attempt, "not indexed yet");
                continue;
            }

            let count = paths.iter().filter(|p| is_under(p, &target)).count();
            observed = count;
            if count > 0 && last_count == Some(count) {
                return self.finish(
                    id,
                    ItemStatus::folder_progress(IndexingStatus::IndexedFull, count, Some(count)),
                );
            }
            last_count = Some(count);
            let progress = ItemStatus::folder_progress(IndexingStatus::IndexingFolder, count, None);
            if self.board.transition(id, progress).is_err() {
                return PollOutcome::Superseded;
            }
        }

        let attempts = self.config.max_attempts;
        if mode == PollMode::Removal {
            debug!(resource_id = id, attempts, "still in the index, giving up for now");
            return PollOutcome::Unresolved;
        }
        let status = if folder && observed > 0 {
            ItemStatus::folder_progress(IndexingStatus::IndexedPartial, observed, None)
        } else {
            ItemStatus::failed(format!("not indexed after {attempts} polls"))
        };
        self.finish(id, status)
    }

    fn finish(&self, id: &str, status: ItemStatus) -> PollOutcome {
        let state = status.state;
        match self.board.transition(id, status) {
            Ok(_) => {
                info!(resource_id = id, status = %state, "status resolved");
                PollOutcome::Resolved(state)
            }
            Err(e) => {
                debug!(error = %e, "poll result discarded");
                PollOutcome::Superseded
            }
        }
    }
}

/// True when `path` lies strictly below the folder `dir`.
fn is_under(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    path.len() > dir.len() + 1 && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}
