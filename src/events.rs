use std::sync::mpsc::Sender;

/// Change notifications for whoever owns the unit collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    UnitInstalled { id: String },
    UnitUpdated { id: String },
    UnitRenamed { old_id: String, new_id: String },
    UnitDeleted { id: String },
    NotesChanged,
    CategoriesChanged,
    ProfileSaved { context: String, name: String },
    ProfileDeleted { context: String, name: String },
}

#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<CoreEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<CoreEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit(&self, event: CoreEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
