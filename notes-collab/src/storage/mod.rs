//! Document persistence.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  load / save / log   ┌──────────────────────────────┐
//! │ Hub (snapshots)  │ ───────────────────► │ dyn DocumentStore            │
//! │ OperationApplier │                      │   MemoryStore  (tests, dev)  │
//! └──────────────────┘                      │   RocksStore   (on disk)     │
//!                                           └──────────────┬───────────────┘
//! ┌──────────────────┐  create / share / …                │ same Note schema
//! │ Session bootstrap│ ───────────────────► dyn NoteCatalog ┘
//! └──────────────────┘
//! ```
//!
//! Both traits are implemented by every backend so the realtime path and the
//! CRUD path always agree on a note's content and version.

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{Edit, EditKind, NoteId, ParticipantId};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Current content and version of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    pub content: String,
    pub version: u64,
}

/// Immutable audit record of one applied edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub note_id: NoteId,
    pub participant: ParticipantId,
    pub kind: EditKind,
    pub position: usize,
    pub content: String,
    pub length: usize,
    /// Document version after the edit was applied.
    pub version: u64,
    /// Seconds since the unix epoch.
    pub created_at: u64,
}

impl OperationRecord {
    pub fn new(note_id: NoteId, participant: ParticipantId, edit: &Edit, version: u64) -> Self {
        let (content, length) = match edit {
            Edit::Insert { content, .. } => (content.clone(), 0),
            Edit::Delete { length, .. } => (String::new(), *length),
            Edit::Retain { .. } => (String::new(), 0),
        };
        Self {
            note_id,
            participant,
            kind: edit.kind(),
            position: edit.position(),
            content,
            length,
            version,
            created_at: unix_now(),
        }
    }
}

/// A document as seen by the CRUD surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    pub content: String,
    pub owner_id: ParticipantId,
    pub is_public: bool,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Note {
    /// New note at version 1.
    pub fn new(
        id: NoteId,
        owner_id: ParticipantId,
        title: impl Into<String>,
        content: impl Into<String>,
        is_public: bool,
    ) -> Self {
        let now = unix_now();
        Self {
            id,
            title: title.into(),
            content: content.into(),
            owner_id,
            is_public,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> DocumentState {
        DocumentState {
            content: self.content.clone(),
            version: self.version,
        }
    }

    /// Apply a partial update. A content change bumps the version.
    pub fn apply_changes(&mut self, changes: &NoteChanges) {
        if let Some(title) = &changes.title {
            self.title = title.clone();
        }
        if let Some(content) = &changes.content {
            self.content = content.clone();
            self.version += 1;
        }
        if let Some(is_public) = changes.is_public {
            self.is_public = is_public;
        }
        self.updated_at = unix_now();
    }
}

/// Partial update of a note; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteChanges {
    pub title: Option<String>,
    pub content: Option<String>,
    pub is_public: Option<bool>,
}

/// Permission granted when sharing a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub participant: ParticipantId,
    pub permission: Permission,
    pub created_at: u64,
}

/// Effective access of a participant to a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Owner,
    Write,
    Read,
    None,
}

impl Access {
    pub fn can_read(self) -> bool {
        !matches!(self, Access::None)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Access::Owner | Access::Write)
    }
}

/// Realtime persistence contract consumed by the hub and the operation applier.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, note_id: &NoteId) -> Result<DocumentState, StoreError>;

    /// Compare-and-save: `version` must be exactly one past the stored version.
    async fn save(&self, note_id: &NoteId, content: &str, version: u64) -> Result<(), StoreError>;

    async fn append_operation(&self, record: OperationRecord) -> Result<(), StoreError>;

    /// Operation log of a note in application order.
    async fn operations(&self, note_id: &NoteId) -> Result<Vec<OperationRecord>, StoreError>;
}

/// CRUD and sharing contract over the same notes.
#[async_trait]
pub trait NoteCatalog: Send + Sync {
    /// Insert a note under an explicit id.
    async fn insert(&self, note: Note) -> Result<Note, StoreError>;

    async fn get(&self, note_id: &NoteId) -> Result<Note, StoreError>;

    /// Notes owned by, shared with, or visible to `participant`.
    async fn list_for(&self, participant: ParticipantId) -> Result<Vec<Note>, StoreError>;

    async fn update(&self, note_id: &NoteId, changes: NoteChanges) -> Result<Note, StoreError>;

    /// Remove a note with its operation log and collaborators.
    async fn delete(&self, note_id: &NoteId) -> Result<(), StoreError>;

    /// Grant or change a collaborator's permission.
    async fn share(
        &self,
        note_id: &NoteId,
        participant: ParticipantId,
        permission: Permission,
    ) -> Result<(), StoreError>;

    async fn collaborators(&self, note_id: &NoteId) -> Result<Vec<Collaborator>, StoreError>;

    /// Create a note with a fresh id.
    async fn create(
        &self,
        owner: ParticipantId,
        title: &str,
        content: &str,
        is_public: bool,
    ) -> Result<Note, StoreError> {
        let id = NoteId::new(uuid::Uuid::new_v4().to_string());
        self.insert(Note::new(id, owner, title, content, is_public)).await
    }

    async fn access(&self, note_id: &NoteId, participant: ParticipantId) -> Result<Access, StoreError> {
        let note = self.get(note_id).await?;
        if note.owner_id == participant {
            return Ok(Access::Owner);
        }
        let shared = self
            .collaborators(note_id)
            .await?
            .into_iter()
            .find(|c| c.participant == participant);
        Ok(match shared {
            Some(c) if c.permission == Permission::Write => Access::Write,
            Some(_) => Access::Read,
            None if note.is_public => Access::Read,
            None => Access::None,
        })
    }
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Note not found: {0}")]
    NotFound(NoteId),
    #[error("Note already exists: {0}")]
    AlreadyExists(NoteId),
    #[error("Note id of {len} bytes exceeds the {max} byte limit")]
    NoteIdTooLong { len: usize, max: usize },
    #[error("Version conflict on note {note_id}: stored {current}, attempted {attempted}")]
    VersionConflict {
        note_id: NoteId,
        current: u64,
        attempted: u64,
    },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Shared compare-and-save rule.
pub(crate) fn check_next_version(
    note_id: &NoteId,
    current: u64,
    attempted: u64,
) -> Result<(), StoreError> {
    if attempted == current + 1 {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            note_id: note_id.clone(),
            current,
            attempted,
        })
    }
}
