use std::collections::HashMap;

use tracing::debug;

use crate::{CoreError, FileId, FileRecord, FileUpdate, compare_names};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub inserted: bool,
    pub revision: u64,
}

#[derive(Debug)]
struct Entry {
    record: FileRecord,
    revision: u64,
}

/// Every file the client knows about, keyed by id, plus the display order.
///
/// The order is name-sorted once, when the bulk listing arrives. Files that
/// show up later through push events are appended at the end.
#[derive(Debug, Default)]
pub struct FileRegistry {
    entries: HashMap<FileId, Entry>,
    order: Vec<FileId>,
}

impl FileRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &FileId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &FileId) -> Option<&FileRecord> {
        self.entries.get(id).map(|entry| &entry.record)
    }

    pub fn revision(&self, id: &FileId) -> Option<u64> {
        self.entries.get(id).map(|entry| entry.revision)
    }

    pub fn ordered(&self) -> impl Iterator<Item = &FileRecord> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|entry| &entry.record))
    }

    pub fn first(&self) -> Option<&FileId> {
        self.order.first()
    }

    /// Installs the bulk listing. Returns the listed ids in name order.
    ///
    /// Listed files replace whatever was stored under the same id; only a
    /// record that actually differs gets a new revision. Files the registry
    /// already knew but the listing omits keep their place after the listed
    /// ones.
    pub fn load_listing(&mut self, files: Vec<FileUpdate>) -> Result<Vec<FileId>, CoreError> {
        let mut records = files
            .into_iter()
            .map(FileRecord::from_update)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| compare_names(&a.name, &b.name));

        let listed = records
            .iter()
            .map(|record| record.id.clone())
            .collect::<Vec<_>>();
        let leftovers = self
            .order
            .iter()
            .filter(|id| !listed.contains(id))
            .cloned()
            .collect::<Vec<_>>();

        for record in records {
            let revision = match self.entries.get(&record.id) {
                Some(entry) if entry.record == record => continue,
                Some(entry) => entry.revision + 1,
                None => 0,
            };
            self.entries
                .insert(record.id.clone(), Entry { record, revision });
        }

        self.order = listed.iter().cloned().chain(leftovers).collect();
        debug!(files = listed.len(), "listing loaded");
        Ok(listed)
    }

    /// Applies one change notification.
    ///
    /// Unknown ids become new records; known ids are shallow-merged in place.
    /// Either way the freshness timestamp is recomputed and the revision moves.
    pub fn apply(&mut self, update: FileUpdate) -> Result<ApplyOutcome, CoreError> {
        if let Some(entry) = self.entries.get_mut(&update.id) {
            entry.record.merge(update);
            entry.revision += 1;
            debug!(
                id = %entry.record.id,
                revision = entry.revision,
                last_mod = %entry.record.last_mod(),
                "file updated"
            );
            return Ok(ApplyOutcome {
                inserted: false,
                revision: entry.revision,
            });
        }

        let record = FileRecord::from_update(update)?;
        let id = record.id.clone();
        debug!(id = %id, last_mod = %record.last_mod(), "file added");
        self.entries.insert(id.clone(), Entry { record, revision: 0 });
        self.order.push(id);
        Ok(ApplyOutcome {
            inserted: true,
            revision: 0,
        })
    }

    pub fn remove(&mut self, id: &FileId) -> Option<FileRecord> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|known| known != id);
        debug!(id = %id, "file removed");
        Some(entry.record)
    }
}
