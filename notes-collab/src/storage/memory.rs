//! In-memory store. Used by tests and by single-process deployments that do
//! not need durability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    check_next_version, unix_now, Collaborator, DocumentState, DocumentStore, Note, NoteCatalog,
    NoteChanges, OperationRecord, Permission, StoreError,
};
use crate::protocol::{NoteId, ParticipantId};

#[derive(Default)]
struct Inner {
    notes: HashMap<NoteId, Note>,
    operations: HashMap<NoteId, Vec<OperationRecord>>,
    collaborators: HashMap<NoteId, Vec<Collaborator>>,
}

/// Thread-safe in-memory document store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document at an arbitrary version (owner 0, public).
    pub async fn with_document(
        self,
        note_id: impl Into<NoteId>,
        content: &str,
        version: u64,
    ) -> Self {
        {
            let mut inner = self.inner.write().await;
            let mut note = Note::new(note_id.into(), 0, "", content, true);
            note.version = version;
            inner.notes.insert(note.id.clone(), note);
        }
        self
    }

    pub async fn note_count(&self) -> usize {
        self.inner.read().await.notes.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, note_id: &NoteId) -> Result<DocumentState, StoreError> {
        let inner = self.inner.read().await;
        inner
            .notes
            .get(note_id)
            .map(Note::state)
            .ok_or_else(|| StoreError::NotFound(note_id.clone()))
    }

    async fn save(&self, note_id: &NoteId, content: &str, version: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let note = inner
            .notes
            .get_mut(note_id)
            .ok_or_else(|| StoreError::NotFound(note_id.clone()))?;
        check_next_version(note_id, note.version, version)?;
        note.content = content.to_string();
        note.version = version;
        note.updated_at = unix_now();
        Ok(())
    }

    async fn append_operation(&self, record: OperationRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.notes.contains_key(&record.note_id) {
            return Err(StoreError::NotFound(record.note_id));
        }
        inner
            .operations
            .entry(record.note_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn operations(&self, note_id: &NoteId) -> Result<Vec<OperationRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.operations.get(note_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl NoteCatalog for MemoryStore {
    async fn insert(&self, note: Note) -> Result<Note, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.notes.contains_key(&note.id) {
            return Err(StoreError::AlreadyExists(note.id));
        }
        inner.notes.insert(note.id.clone(), note.clone());
        Ok(note)
    }

    async fn get(&self, note_id: &NoteId) -> Result<Note, StoreError> {
        let inner = self.inner.read().await;
        inner
            .notes
            .get(note_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(note_id.clone()))
    }

    async fn list_for(&self, participant: ParticipantId) -> Result<Vec<Note>, StoreError> {
        let inner = self.inner.read().await;
        let mut notes: Vec<Note> = inner
            .notes
            .values()
            .filter(|note| {
                note.owner_id == participant
                    || note.is_public
                    || inner
                        .collaborators
                        .get(&note.id)
                        .is_some_and(|cs| cs.iter().any(|c| c.participant == participant))
            })
            .cloned()
            .collect();
        notes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(notes)
    }

    async fn update(&self, note_id: &NoteId, changes: NoteChanges) -> Result<Note, StoreError> {
        let mut inner = self.inner.write().await;
        let note = inner
            .notes
            .get_mut(note_id)
            .ok_or_else(|| StoreError::NotFound(note_id.clone()))?;
        note.apply_changes(&changes);
        Ok(note.clone())
    }

    async fn delete(&self, note_id: &NoteId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.notes.remove(note_id).is_none() {
            return Err(StoreError::NotFound(note_id.clone()));
        }
        inner.operations.remove(note_id);
        inner.collaborators.remove(note_id);
        Ok(())
    }

    async fn share(
        &self,
        note_id: &NoteId,
        participant: ParticipantId,
        permission: Permission,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.notes.contains_key(note_id) {
            return Err(StoreError::NotFound(note_id.clone()));
        }
        let collaborators = inner.collaborators.entry(note_id.clone()).or_default();
        match collaborators.iter_mut().find(|c| c.participant == participant) {
            Some(existing) => existing.permission = permission,
            None => collaborators.push(Collaborator {
                participant,
                permission,
                created_at: unix_now(),
            }),
        }
        Ok(())
    }

    async fn collaborators(&self, note_id: &NoteId) -> Result<Vec<Collaborator>, StoreError> {
        let inner = self.inner.read().await;
        if !inner.notes.contains_key(note_id) {
            return Err(StoreError::NotFound(note_id.clone()));
        }
        Ok(inner.collaborators.get(note_id).cloned().unwrap_or_default())
    }
}
