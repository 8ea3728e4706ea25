use tokio::sync::mpsc;
use tracing::info;

use crate::{
    ApplyOutcome, CoreError, EventBus, FileId, FileRecord, FileRegistry, FileUpdate, Timestamp,
    ViewState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The bulk listing was installed; ids are in display order.
    Listed { ids: Vec<FileId> },
    /// Always published before the `Selected` that replaces it.
    Deselected { id: FileId },
    Selected { id: FileId, revision: u64 },
    /// The selected file changed in place; anything rendering it must reload.
    Refreshed { id: FileId, revision: u64 },
    TemplateChanged {
        id: FileId,
        revision: u64,
        inserted: bool,
    },
    Removed { id: FileId },
}

/// Owns the registry and view state and is their only writer.
///
/// Consumers read through the accessors and learn about changes by
/// subscribing; nothing else mutates either structure.
#[derive(Debug, Default)]
pub struct Session {
    registry: FileRegistry,
    view: ViewState,
    events: EventBus<SessionEvent>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn selected(&self) -> Option<&FileId> {
        self.view.selected()
    }

    pub fn selected_record(&self) -> Option<&FileRecord> {
        self.view.selected().and_then(|id| self.registry.get(id))
    }

    /// Installs a bulk listing. When nothing is selected yet the first file
    /// in name order is selected; when the selected file came back changed
    /// it is refreshed.
    pub fn load_listing(&mut self, files: Vec<FileUpdate>, now: Timestamp) -> Result<(), CoreError> {
        let selected_before = self
            .view
            .selected()
            .and_then(|id| self.registry.revision(id).map(|revision| (id.clone(), revision)));

        let ids = self.registry.load_listing(files)?;
        info!(files = ids.len(), "template listing installed");
        self.events.publish(SessionEvent::Listed { ids });

        match selected_before {
            Some((id, before)) => {
                if let Some(revision) = self.registry.revision(&id)
                    && revision != before
                {
                    self.events.publish(SessionEvent::Refreshed { id, revision });
                }
            }
            None => {
                if self.view.selected().is_none()
                    && let Some(first) = self.registry.first().cloned()
                {
                    self.select(&first, now)?;
                }
            }
        }
        Ok(())
    }

    /// Reconciles one push notification into the registry.
    pub fn apply_change(
        &mut self,
        update: FileUpdate,
        now: Timestamp,
    ) -> Result<ApplyOutcome, CoreError> {
        let id = update.id.clone();
        let outcome = self.registry.apply(update)?;

        if outcome.inserted {
            if self.view.selected().is_none() {
                self.change_selection(id.clone(), None, outcome.revision);
            }
        } else if self.view.is_selected(&id) {
            self.events.publish(SessionEvent::Refreshed {
                id: id.clone(),
                revision: outcome.revision,
            });
        }

        info!(id = %id, inserted = outcome.inserted, revision = outcome.revision, at = %now, "template changed");
        self.events.publish(SessionEvent::TemplateChanged {
            id,
            revision: outcome.revision,
            inserted: outcome.inserted,
        });
        Ok(outcome)
    }

    /// User selection: the file becomes selected and is stamped as viewed.
    pub fn select(&mut self, id: &FileId, now: Timestamp) -> Result<(), CoreError> {
        let revision = self
            .registry
            .revision(id)
            .ok_or_else(|| CoreError::UnknownFile(id.clone()))?;
        self.change_selection(id.clone(), Some(now), revision);
        Ok(())
    }

    pub fn is_updated(&self, id: &FileId) -> Result<bool, CoreError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| CoreError::UnknownFile(id.clone()))?;
        Ok(self.view.is_updated(record))
    }

    pub fn has_errors(&self, id: &FileId) -> Result<bool, CoreError> {
        self.registry
            .get(id)
            .map(FileRecord::has_errors)
            .ok_or_else(|| CoreError::UnknownFile(id.clone()))
    }

    /// The backend never sends deletions today; this exists so that a
    /// backend that does has somewhere to land.
    pub fn remove(&mut self, id: &FileId) -> Option<FileRecord> {
        let record = self.registry.remove(id)?;
        if self.view.is_selected(id) {
            self.events
                .publish(SessionEvent::Deselected { id: id.clone() });
        }
        self.view.forget(id);
        self.events.publish(SessionEvent::Removed { id: id.clone() });
        Some(record)
    }

    fn change_selection(&mut self, id: FileId, viewed_at: Option<Timestamp>, revision: u64) {
        if let Some(previous) = self.view.clear_selection() {
            self.events.publish(SessionEvent::Deselected { id: previous });
        }
        self.view.set_selected(id.clone(), viewed_at);
        self.events.publish(SessionEvent::Selected { id, revision });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dependency;

    fn ts(millis: i64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn file(id: &str, name: &str, modified: i64) -> FileUpdate {
        FileUpdate {
            name: Some(name.to_owned()),
            modified: Some(ts(modified)),
            dependencies: Some(Vec::new()),
            ..FileUpdate::new(id)
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn first_selection_follows_name_order() {
        let mut session = Session::new();
        session
            .load_listing(vec![file("2", "B", 1), file("1", "A", 1)], ts(10))
            .unwrap();

        assert_eq!(session.selected(), Some(&FileId::new("1")));
        assert_eq!(session.view().viewed(&FileId::new("1")), Some(ts(10)));
    }

    #[test]
    fn empty_listing_leaves_nothing_selected() {
        let mut session = Session::new();
        session.load_listing(Vec::new(), ts(10)).unwrap();
        assert!(session.selected().is_none());

        session.apply_change(file("late", "late", 5), ts(20)).unwrap();
        assert_eq!(session.selected(), Some(&FileId::new("late")));
    }

    #[test]
    fn new_file_is_auto_selected_only_when_nothing_is() {
        let mut session = Session::new();
        session.apply_change(file("a", "a", 1), ts(2)).unwrap();
        session.apply_change(file("b", "b", 1), ts(3)).unwrap();
        assert_eq!(session.selected(), Some(&FileId::new("a")));
    }

    #[test]
    fn push_into_empty_registry_then_view_then_update() {
        let mut session = Session::new();
        let f1 = FileId::new("f1");

        session.apply_change(file("f1", "x", 100), ts(150)).unwrap();
        let record = session.registry().get(&f1).unwrap();
        assert_eq!(record.last_mod(), ts(100));
        assert_eq!(session.selected(), Some(&f1));
        assert!(session.is_updated(&f1).unwrap());

        session.select(&f1, ts(200)).unwrap();
        assert!(!session.is_updated(&f1).unwrap());

        let mut change = FileUpdate::new("f1");
        change.modified = Some(ts(300));
        session.apply_change(change, ts(300)).unwrap();

        assert_eq!(session.registry().get(&f1).unwrap().last_mod(), ts(300));
        assert!(session.is_updated(&f1).unwrap());
    }

    #[test]
    fn dependency_change_marks_viewed_file_updated() {
        let mut session = Session::new();
        let id = FileId::new("f");
        session.apply_change(file("f", "f", 100), ts(100)).unwrap();
        session.select(&id, ts(200)).unwrap();

        let mut change = FileUpdate::new("f");
        change.dependencies = Some(vec![Dependency::at(ts(250))]);
        session.apply_change(change, ts(250)).unwrap();

        assert!(session.is_updated(&id).unwrap());
    }

    #[test]
    fn select_publishes_deselect_before_select() {
        let mut session = Session::new();
        let mut rx = session.subscribe();
        session
            .load_listing(vec![file("1", "A", 1), file("2", "B", 1)], ts(5))
            .unwrap();
        drain(&mut rx);

        session.select(&FileId::new("2"), ts(6)).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::Deselected {
                    id: FileId::new("1")
                },
                SessionEvent::Selected {
                    id: FileId::new("2"),
                    revision: 0
                },
            ]
        );
    }

    #[test]
    fn update_to_selected_file_refreshes_then_broadcasts() {
        let mut session = Session::new();
        session.apply_change(file("a", "a", 1), ts(1)).unwrap();
        let mut rx = session.subscribe();

        let mut change = FileUpdate::new("a");
        change.modified = Some(ts(2));
        session.apply_change(change, ts(2)).unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::Refreshed {
                    id: FileId::new("a"),
                    revision: 1
                },
                SessionEvent::TemplateChanged {
                    id: FileId::new("a"),
                    revision: 1,
                    inserted: false
                },
            ]
        );
    }

    #[test]
    fn update_to_other_file_does_not_touch_selection() {
        let mut session = Session::new();
        session
            .load_listing(vec![file("1", "A", 1), file("2", "B", 1)], ts(5))
            .unwrap();
        let mut rx = session.subscribe();

        let mut change = FileUpdate::new("2");
        change.modified = Some(ts(9));
        session.apply_change(change, ts(9)).unwrap();

        assert_eq!(session.selected(), Some(&FileId::new("1")));
        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::TemplateChanged {
                id: FileId::new("2"),
                revision: 1,
                inserted: false
            }]
        );
    }

    #[test]
    fn relisting_refreshes_selected_file_that_changed() {
        let mut session = Session::new();
        session.load_listing(vec![file("a", "a", 100)], ts(200)).unwrap();
        let mut rx = session.subscribe();

        session.load_listing(vec![file("a", "a", 300)], ts(400)).unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::Listed {
                    ids: vec![FileId::new("a")]
                },
                SessionEvent::Refreshed {
                    id: FileId::new("a"),
                    revision: 1
                },
            ]
        );
        assert!(session.is_updated(&FileId::new("a")).unwrap());
    }

    #[test]
    fn relisting_unchanged_selection_publishes_only_listing() {
        let mut session = Session::new();
        session
            .load_listing(vec![file("a", "a", 100), file("b", "b", 100)], ts(200))
            .unwrap();
        let mut rx = session.subscribe();

        session
            .load_listing(vec![file("a", "a", 100), file("b", "b", 500)], ts(600))
            .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::Listed {
                ids: vec![FileId::new("a"), FileId::new("b")]
            }]
        );
        assert_eq!(session.selected(), Some(&FileId::new("a")));
    }

    #[test]
    fn selecting_unknown_file_fails() {
        let mut session = Session::new();
        let err = session.select(&FileId::new("nope"), ts(1)).unwrap_err();
        assert_eq!(err, CoreError::UnknownFile(FileId::new("nope")));
    }

    #[test]
    fn errors_are_reported_per_file() {
        let mut session = Session::new();
        let mut broken = file("b", "broken", 1);
        broken.errors = Some([("less".to_owned(), "unexpected token".to_owned())].into());
        session
            .load_listing(vec![broken, file("ok", "ok", 1)], ts(1))
            .unwrap();

        assert!(session.has_errors(&FileId::new("b")).unwrap());
        assert!(!session.has_errors(&FileId::new("ok")).unwrap());
    }

    #[test]
    fn removing_selected_file_clears_selection() {
        let mut session = Session::new();
        session.apply_change(file("a", "a", 1), ts(1)).unwrap();
        let mut rx = session.subscribe();

        assert!(session.remove(&FileId::new("a")).is_some());
        assert!(session.selected().is_none());
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::Deselected {
                    id: FileId::new("a")
                },
                SessionEvent::Removed {
                    id: FileId::new("a")
                },
            ]
        );
    }
}
