//! Applying edits to documents.
//!
//! [`apply`] is the pure content transition. [`OperationApplier`] runs the
//! full load → apply → save → log → broadcast cycle for one edit while
//! holding that document's write lock, so edits to the same document are
//! applied one at a time and edits to different documents never contend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::hub::Hub;
use crate::protocol::{Edit, Envelope, NoteId, ParticipantId, ProtocolError};
use crate::storage::{DocumentStore, OperationRecord, StoreError};

/// Apply an edit to `content`.
///
/// Positions and lengths count characters. Out-of-range edits are clamped:
/// an insert past the end appends, a delete starting at or past the end does
/// nothing, and a delete running past the end stops there.
pub fn apply(content: &str, edit: &Edit) -> String {
    match edit {
        Edit::Insert { position, content: text } => {
            let at = byte_offset(content, *position);
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..at]);
            out.push_str(text);
            out.push_str(&content[at..]);
            out
        }
        Edit::Delete { position, length } => {
            let start = byte_offset(content, *position);
            if start >= content.len() {
                return content.to_string();
            }
            let end = byte_offset(content, position.saturating_add(*length));
            let mut out = String::with_capacity(content.len() - (end - start));
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            out
        }
        Edit::Retain { .. } => content.to_string(),
    }
}

/// Byte index of the `chars`-th character, or the end of the string.
fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

type LockTable = Arc<Mutex<HashMap<NoteId, Arc<tokio::sync::Mutex<()>>>>>;

/// One async mutex per document id, created on demand and discarded once
/// nobody holds or waits for it.
#[derive(Clone, Default)]
pub struct NoteLocks {
    table: LockTable,
}

impl NoteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a document.
    pub async fn lock(&self, note_id: &NoteId) -> NoteGuard {
        let slot = {
            let mut table = self.table.lock();
            Arc::clone(table.entry(note_id.clone()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        NoteGuard {
            guard: Some(guard),
            slot,
            note_id: note_id.clone(),
            table: Arc::clone(&self.table),
        }
    }

    /// Number of documents with a live lock entry.
    pub fn active(&self) -> usize {
        self.table.lock().len()
    }
}

/// Exclusive access to one document; released on drop.
pub struct NoteGuard {
    guard: Option<OwnedMutexGuard<()>>,
    slot: Arc<tokio::sync::Mutex<()>>,
    note_id: NoteId,
    table: LockTable,
}

impl Drop for NoteGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.table.lock();
        // Only the table and this guard still reference the slot: no waiters.
        if Arc::strong_count(&self.slot) == 2 {
            table.remove(&self.note_id);
        }
    }
}

/// Why an edit was not applied.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Failed to load note {note_id}: {source}")]
    Load {
        note_id: NoteId,
        #[source]
        source: StoreError,
    },
    #[error("Failed to save note {note_id}: {source}")]
    Save {
        note_id: NoteId,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Applies edits against the store and fans the result out through the hub.
#[derive(Clone)]
pub struct OperationApplier {
    store: Arc<dyn DocumentStore>,
    hub: Hub,
    locks: NoteLocks,
}

impl OperationApplier {
    pub fn new(store: Arc<dyn DocumentStore>, hub: Hub) -> Self {
        Self {
            store,
            hub,
            locks: NoteLocks::new(),
        }
    }

    pub fn locks(&self) -> &NoteLocks {
        &self.locks
    }

    /// Apply one edit and return the document's new version.
    ///
    /// The resulting `operation` envelope is broadcast to the whole room,
    /// the originator included, before the document lock is released.
    pub async fn apply(
        &self,
        note_id: &NoteId,
        participant: ParticipantId,
        edit: Edit,
    ) -> Result<u64, ApplyError> {
        let _guard = self.locks.lock(note_id).await;

        let state = self
            .store
            .load(note_id)
            .await
            .map_err(|source| ApplyError::Load {
                note_id: note_id.clone(),
                source,
            })?;

        let content = apply(&state.content, &edit);
        let version = state.version + 1;

        self.store
            .save(note_id, &content, version)
            .await
            .map_err(|source| ApplyError::Save {
                note_id: note_id.clone(),
                source,
            })?;

        let record = OperationRecord::new(note_id.clone(), participant, &edit, version);
        if let Err(e) = self.store.append_operation(record).await {
            // Content is already saved; the room still has to see it.
            log::error!("Failed to log operation v{version} on note {note_id}: {e}");
        }

        log::debug!(
            "Participant {participant} applied {} to note {note_id} (v{version})",
            edit.kind().as_str()
        );

        let frame = Envelope::operation(note_id.clone(), participant, edit, version).encode()?;
        self.hub.broadcast(frame, None).await;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::hub::{Frame, Peer};
    use crate::storage::{DocumentState, MemoryStore};

    fn insert(position: usize, content: &str) -> Edit {
        Edit::Insert {
            position,
            content: content.into(),
        }
    }

    fn delete(position: usize, length: usize) -> Edit {
        Edit::Delete { position, length }
    }

    #[test]
    fn test_insert() {
        assert_eq!(apply("abc", &insert(0, "X")), "Xabc");
        assert_eq!(apply("abc", &insert(1, "XY")), "aXYbc");
        assert_eq!(apply("abc", &insert(3, "X")), "abcX");
        assert_eq!(apply("", &insert(0, "hello")), "hello");
    }

    #[test]
    fn test_insert_past_end_appends() {
        assert_eq!(apply("abc", &insert(10, "X")), "abcX");
    }

    #[test]
    fn test_delete() {
        assert_eq!(apply("abcdef", &delete(1, 2)), "adef");
        assert_eq!(apply("abc", &delete(0, 3)), "");
        assert_eq!(apply("abc", &delete(1, 0)), "abc");
    }

    #[test]
    fn test_delete_clamped_to_end() {
        assert_eq!(apply("abc", &delete(1, 10)), "a");
        assert_eq!(apply("abc", &delete(0, usize::MAX)), "");
    }

    #[test]
    fn test_delete_past_end_is_noop() {
        assert_eq!(apply("abc", &delete(5, 2)), "abc");
        assert_eq!(apply("abc", &delete(3, 1)), "abc");
        assert_eq!(apply("", &delete(0, 1)), "");
    }

    #[test]
    fn test_retain_unchanged() {
        assert_eq!(apply("abc", &Edit::Retain { position: 1 }), "abc");
    }

    #[test]
    fn test_multibyte_offsets_are_characters() {
        assert_eq!(apply("héllo", &insert(2, "X")), "héXllo");
        assert_eq!(apply("日本語", &delete(1, 1)), "日語");
        assert_eq!(apply("🎉a", &insert(1, "b")), "🎉ba");
        assert_eq!(apply("ñ", &delete(0, 5)), "");
    }

    #[tokio::test]
    async fn test_note_locks_released() {
        let locks = NoteLocks::new();
        let a = NoteId::from("a");
        {
            let _g = locks.lock(&a).await;
            assert_eq!(locks.active(), 1);
            let _other = locks.lock(&NoteId::from("b")).await;
            assert_eq!(locks.active(), 2);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_note_locks_exclusive() {
        let locks = NoteLocks::new();
        let id = NoteId::from("a");
        let guard = locks.lock(&id).await;

        let contender = {
            let locks = locks.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.active(), 0);
    }

    async fn setup(content: &str, version: u64) -> (Arc<MemoryStore>, Hub, OperationApplier) {
        let store = Arc::new(MemoryStore::new().with_document("doc", content, version).await);
        let hub = Hub::spawn(store.clone(), 64);
        let applier = OperationApplier::new(store.clone(), hub.clone());
        (store, hub, applier)
    }

    async fn next(rx: &mut tokio::sync::mpsc::Receiver<Frame>) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        Envelope::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_apply_persists_and_broadcasts() {
        let (store, hub, applier) = setup("hello", 3).await;
        let id = NoteId::from("doc");
        let (peer, mut rx) = Peer::new(id.clone(), 1, 16);
        hub.register(peer).await;
        assert_eq!(next(&mut rx).await.kind(), "sync");

        let version = applier.apply(&id, 1, insert(5, " world")).await.unwrap();
        assert_eq!(version, 4);
        assert_eq!(
            store.load(&id).await.unwrap(),
            DocumentState {
                content: "hello world".into(),
                version: 4
            }
        );

        let log = store.operations(&id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].participant, 1);
        assert_eq!(log[0].content, " world");
        assert_eq!(log[0].version, 4);

        // Originator receives its own echo
        match next(&mut rx).await {
            Envelope::Operation {
                user_id, version, ..
            } => {
                assert_eq!(user_id, 1);
                assert_eq!(version, 4);
            }
            other => panic!("Expected operation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retain_bumps_version() {
        let (store, _hub, applier) = setup("abc", 1).await;
        let id = NoteId::from("doc");
        let v = applier
            .apply(&id, 2, Edit::Retain { position: 0 })
            .await
            .unwrap();
        assert_eq!(v, 2);
        assert_eq!(store.load(&id).await.unwrap().content, "abc");
    }

    #[tokio::test]
    async fn test_apply_missing_note() {
        let (_store, _hub, applier) = setup("", 1).await;
        let err = applier
            .apply(&NoteId::from("ghost"), 1, insert(0, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Load { .. }));
        assert_eq!(applier.locks().active(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_edits_serialized() {
        let (store, _hub, applier) = setup("", 10).await;
        let id = NoteId::from("doc");
        let k = 25;

        let tasks: Vec<_> = (0..k)
            .map(|i| {
                let applier = applier.clone();
                let id = id.clone();
                tokio::spawn(async move { applier.apply(&id, i, insert(0, "x")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let state = store.load(&id).await.unwrap();
        assert_eq!(state.version, 10 + k);
        assert_eq!(state.content.len(), k as usize);

        let versions: Vec<u64> = store
            .operations(&id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, (11..=10 + k).collect::<Vec<_>>());
    }

    /// Saves succeed, the audit log is unavailable.
    struct LoglessStore(MemoryStore);

    #[async_trait]
    impl DocumentStore for LoglessStore {
        async fn load(&self, note_id: &NoteId) -> Result<DocumentState, StoreError> {
            self.0.load(note_id).await
        }

        async fn save(&self, note_id: &NoteId, content: &str, version: u64) -> Result<(), StoreError> {
            self.0.save(note_id, content, version).await
        }

        async fn append_operation(&self, _record: OperationRecord) -> Result<(), StoreError> {
            Err(StoreError::Database("log offline".into()))
        }

        async fn operations(&self, note_id: &NoteId) -> Result<Vec<OperationRecord>, StoreError> {
            self.0.operations(note_id).await
        }
    }

    #[tokio::test]
    async fn test_log_failure_still_broadcasts() {
        let inner = MemoryStore::new().with_document("doc", "a", 1).await;
        let store: Arc<dyn DocumentStore> = Arc::new(LoglessStore(inner));
        let hub = Hub::spawn(store.clone(), 16);
        let applier = OperationApplier::new(store.clone(), hub.clone());
        let id = NoteId::from("doc");
        let (peer, mut rx) = Peer::new(id.clone(), 1, 16);
        hub.register(peer).await;
        assert_eq!(next(&mut rx).await.kind(), "sync");

        assert_eq!(applier.apply(&id, 1, insert(1, "b")).await.unwrap(), 2);
        assert_eq!(next(&mut rx).await.kind(), "operation");
        assert_eq!(store.load(&id).await.unwrap().content, "ab");
    }
}
