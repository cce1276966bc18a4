//! state.rs
//!
//! Per-resource indexing status and the transitions allowed between states.
//!
//! ```text
//! pristine        -> indexing | indexing-folder          (user indexes)
//! indexing        -> indexed | failed
//! indexing-folder -> indexed-full | indexed-partial | failed
//! indexed*        -> deindexing                          (user de-indexes)
//! deindexing      -> pristine | indexed*                 (remove ok / revert)
//! failed          -> indexing | indexing-folder          (user retries)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::InodeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexingStatus {
    #[default]
    Pristine,
    Indexing,
    IndexingFolder,
    Indexed,
    IndexedFull,
    IndexedPartial,
    Failed,
    Deindexing,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid status transition for {resource_id}: {from} -> {to}")]
pub struct TransitionError {
    pub resource_id: String,
    pub from: IndexingStatus,
    pub to: IndexingStatus,
}

impl IndexingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingStatus::Pristine => "pristine",
            IndexingStatus::Indexing => "indexing",
            IndexingStatus::IndexingFolder => "indexing-folder",
            IndexingStatus::Indexed => "indexed",
            IndexingStatus::IndexedFull => "indexed-full",
            IndexingStatus::IndexedPartial => "indexed-partial",
            IndexingStatus::Failed => "failed",
            IndexingStatus::Deindexing => "deindexing",
        }
    }

    /// The state a user "index" action moves a resource into.
    pub fn indexing_for(kind: InodeType) -> Self {
        match kind {
            InodeType::File => IndexingStatus::Indexing,
            InodeType::Directory => IndexingStatus::IndexingFolder,
        }
    }

    /// States a background poller is responsible for.
    pub fn is_polling(&self) -> bool {
        matches!(self, IndexingStatus::Indexing | IndexingStatus::IndexingFolder)
    }

    /// Non-terminal states: something is still in flight.
    pub fn is_in_progress(&self) -> bool {
        self.is_polling() || *self == IndexingStatus::Deindexing
    }

    pub fn is_indexed(&self) -> bool {
        matches!(
            self,
            IndexingStatus::Indexed | IndexingStatus::IndexedFull | IndexingStatus::IndexedPartial
        )
    }

    pub fn can_transition_to(&self, next: IndexingStatus) -> bool {
        use IndexingStatus::*;
        match (*self, next) {
            (Pristine | Failed, Indexing | IndexingFolder) => true,
            // progress updates while still polling
            (Indexing, Indexing) | (IndexingFolder, IndexingFolder) => true,
            (Indexing, Indexed | Failed) => true,
            (IndexingFolder, IndexedFull | IndexedPartial | Failed) => true,
            (Indexed | IndexedFull | IndexedPartial, Deindexing) => true,
            (Deindexing, Pristine | Indexed | IndexedFull | IndexedPartial) => true,
            _ => false,
        }
    }
}

impl fmt::Display for IndexingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus the progress annotations the UI shows next to it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemStatus {
    pub state: IndexingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_processed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_files: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemStatus {
    pub fn new(state: IndexingStatus) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn folder_progress(state: IndexingStatus, processed: usize, total: Option<usize>) -> Self {
        Self {
            state,
            files_processed: Some(processed),
            total_files: total,
            error: None,
        }
    }

    pub fn failed<S: Into<String>>(error: S) -> Self {
        Self {
            state: IndexingStatus::Failed,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Short human label, e.g. `indexed-partial (3/5 files)`.
    pub fn label(&self) -> String {
        match (self.state, self.files_processed, self.total_files, &self.error) {
            (_, _, _, Some(err)) => format!("{} ({err})", self.state),
            (_, Some(done), Some(total), _) => format!("{} ({done}/{total} files)", self.state),
            (_, Some(done), None, _) => format!("{} ({done} files processed)", self.state),
            _ => self.state.to_string(),
        }
    }
}

/// Derives the displayed status from the two signals the backend exposes.
///
/// `covered`: the resource, or a folder above it, is in `connection_source_ids`.
/// `listed`: its path (or, for a folder, any path under it) is in the live index.
///
/// Membership without a listing is an in-flight sync; a listing without
/// membership is a removal the index has not caught up with yet.
pub fn reconcile(kind: InodeType, covered: bool, listed: bool) -> IndexingStatus {
    match (kind, covered, listed) {
        (InodeType::File, true, true) => IndexingStatus::Indexed,
        (InodeType::Directory, true, true) => IndexingStatus::IndexedFull,
        (kind, true, false) => IndexingStatus::indexing_for(kind),
        (_, false, true) => IndexingStatus::Deindexing,
        (_, false, false) => IndexingStatus::Pristine,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::IndexingStatus::*;
    use rstest::rstest;

    #[rstest]
    #[case(Pristine, Indexing, true)]
    #[case(Pristine, IndexingFolder, true)]
    #[case(Pristine, Indexed, false)]
    #[case(Indexing, Indexed, true)]
    #[case(Indexing, IndexedFull, false)]
    #[case(Indexing, Failed, true)]
    #[case(IndexingFolder, IndexedPartial, true)]
    #[case(IndexingFolder, Indexed, false)]
    #[case(Indexed, Deindexing, true)]
    #[case(IndexedPartial, Deindexing, true)]
    #[case(Indexed, Indexing, false)]
    #[case(Deindexing, Pristine, true)]
    #[case(Deindexing, Indexed, true)]
    #[case(Deindexing, Failed, false)]
    #[case(Failed, Indexing, true)]
    #[case(Failed, Indexed, false)]
    fn transitions(#[case] from: IndexingStatus, #[case] to: IndexingStatus, #[case] ok: bool) {
        assert_eq!(from.can_transition_to(to), ok);
    }

    #[rstest]
    #[case(InodeType::File, true, true, Indexed)]
    #[case(InodeType::File, true, false, Indexing)]
    #[case(InodeType::Directory, true, false, IndexingFolder)]
    #[case(InodeType::Directory, true, true, IndexedFull)]
    #[case(InodeType::File, false, true, Deindexing)]
    #[case(InodeType::File, false, false, Pristine)]
    fn reconciles(
        #[case] kind: InodeType,
        #[case] covered: bool,
        #[case] listed: bool,
        #[case] expected: IndexingStatus,
    ) {
        assert_eq!(reconcile(kind, covered, listed), expected);
    }

    #[test]
    fn member_without_listing_is_never_pristine() {
        for kind in [InodeType::File, InodeType::Directory] {
            let status = reconcile(kind, true, false);
            assert_ne!(status, Pristine);
            assert!(status.is_in_progress());
        }
    }

    #[test]
    fn serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&IndexingFolder).unwrap(),
            "\"indexing-folder\""
        );
    }

    #[test]
    fn labels() {
        assert_eq!(
            ItemStatus::folder_progress(IndexedPartial, 3, Some(5)).label(),
            "indexed-partial (3/5 files)"
        );
        assert_eq!(ItemStatus::failed("boom").label(), "failed (boom)");
        assert_eq!(ItemStatus::new(Indexed).label(), "indexed");
    }
}
