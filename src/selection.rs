//! selection.rs
//!
//! Checked resources in the browser, keyed by resource id. Insertion order is
//! kept so batch requests list resources in the order the user picked them.

use crate::model::Resource;

#[derive(Debug, Default, Clone)]
pub struct SelectionTracker {
    selected: Vec<Resource>,
}

impl SelectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects `resource` if it is not selected, deselects it otherwise.
    /// Returns whether it is selected afterwards.
    pub fn toggle(&mut self, resource: &Resource) -> bool {
        if let Some(pos) = self.position(&resource.resource_id) {
            self.selected.remove(pos);
            false
        } else {
            self.selected.push(resource.clone());
            true
        }
    }

    /// Replaces the whole selection.
    pub fn select_multiple<'a, I>(&mut self, resources: I)
    where
        I: IntoIterator<Item = &'a Resource>,
    {
        self.selected.clear();
        for resource in resources {
            if self.position(&resource.resource_id).is_none() {
                self.selected.push(resource.clone());
            }
        }
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    pub fn is_selected(&self, resource_id: &str) -> bool {
        self.position(resource_id).is_some()
    }

    pub fn selected(&self) -> &[Resource] {
        &self.selected
    }

    /// Selected entries that are files; directories are dropped.
    pub fn selected_files(&self) -> Vec<&Resource> {
        self.selected.iter().filter(|r| !r.is_directory()).collect()
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    fn position(&self, resource_id: &str) -> Option<usize> {
        self.selected.iter().position(|r| r.resource_id == resource_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{file, folder};

    #[test]
    fn toggle_flips_membership() {
        let mut sel = SelectionTracker::new();
        let a = file("a", "a.txt");
        assert!(sel.toggle(&a));
        assert!(sel.is_selected("a"));
        assert!(!sel.toggle(&a));
        assert!(sel.is_empty());
    }

    #[test]
    fn select_multiple_replaces_and_dedupes() {
        let mut sel = SelectionTracker::new();
        sel.toggle(&file("old", "old.txt"));
        let (a, b) = (file("a", "a.txt"), folder("b", "b"));
        sel.select_multiple([&a, &b, &a]);
        let ids: Vec<&str> = sel.selected().iter().map(|r| r.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!sel.is_selected("old"));
    }

    #[test]
    fn clear_empties_everything() {
        let mut sel = SelectionTracker::new();
        sel.select_multiple(&[file("a", "a.txt"), file("b", "b.txt")]);
        sel.clear();
        assert!(!sel.is_selected("a"));
        assert!(!sel.is_selected("b"));
        assert!(sel.selected_files().is_empty());
        assert_eq!(sel.len(), 0);
    }

    #[test]
    fn folder_then_children_then_clear_leaves_nothing() {
        let mut sel = SelectionTracker::new();
        let docs = folder("d", "docs");
        let children = [file("a", "docs/a.txt"), file("b", "docs/b.txt")];
        assert!(sel.toggle(&docs));
        for child in &children {
            assert!(sel.toggle(child));
        }
        assert_eq!(sel.len(), 3);

        sel.clear();
        assert!(sel.is_empty());
        for id in ["d", "a", "b"] {
            assert!(!sel.is_selected(id));
        }
    }

    #[test]
    fn selected_files_skips_directories() {
        let mut sel = SelectionTracker::new();
        sel.select_multiple(&[folder("d", "docs"), file("f", "docs/a.txt")]);
        let files: Vec<&str> = sel.selected_files().iter().map(|r| r.resource_id.as_str()).collect();
        assert_eq!(files, vec!["f"]);
        assert_eq!(sel.len(), 2);
    }
}
