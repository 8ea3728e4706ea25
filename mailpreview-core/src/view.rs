use std::collections::HashMap;

use crate::{FileId, FileRecord, Timestamp};

/// Which file is selected and when each file was last looked at.
#[derive(Debug, Default)]
pub struct ViewState {
    selected: Option<FileId>,
    viewed: HashMap<FileId, Timestamp>,
}

impl ViewState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected(&self) -> Option<&FileId> {
        self.selected.as_ref()
    }

    pub fn is_selected(&self, id: &FileId) -> bool {
        self.selected.as_ref() == Some(id)
    }

    /// Replaces the selection, returning the previous one. `viewed_at` stamps
    /// the newly selected file when the user actually looked at it.
    pub fn set_selected(&mut self, id: FileId, viewed_at: Option<Timestamp>) -> Option<FileId> {
        if let Some(now) = viewed_at {
            self.viewed.insert(id.clone(), now);
        }
        self.selected.replace(id)
    }

    pub fn clear_selection(&mut self) -> Option<FileId> {
        self.selected.take()
    }

    pub fn viewed(&self, id: &FileId) -> Option<Timestamp> {
        self.viewed.get(id).copied()
    }

    pub fn forget(&mut self, id: &FileId) {
        self.viewed.remove(id);
        if self.is_selected(id) {
            self.selected = None;
        }
    }

    /// A file needs attention until it has been viewed at or after its
    /// freshness timestamp.
    pub fn is_updated(&self, record: &FileRecord) -> bool {
        match self.viewed(&record.id) {
            Some(viewed) => viewed < record.last_mod(),
            None => true,
        }
    }
}
