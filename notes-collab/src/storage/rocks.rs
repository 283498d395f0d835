//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`:     note content (LZ4 compressed), keyed by note id
//! - `metadata`:      title, owner, visibility, version, sizes (bincode)
//! - `operations`:    operation log, keyed by `note id ‖ version (u64 BE)`
//! - `collaborators`: sharing grants, keyed by `note id ‖ participant (u64 BE)`
//!
//! Note ids are variable length, so every key starts with a two byte
//! big-endian length prefix followed by the id bytes. Ids longer than
//! `u16::MAX` bytes are rejected. Range scans over one note's operations or
//! collaborators iterate forward from that prefix.
//!
//! Metadata and content of a note live in different column families. Reads
//! that need both go through one RocksDB snapshot so they never straddle a
//! concurrent write.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, Direction, IteratorMode,
    Options, Snapshot, WriteBatch, WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    check_next_version, unix_now, Collaborator, DocumentState, DocumentStore, Note, NoteCatalog,
    NoteChanges, OperationRecord, Permission, StoreError,
};
use crate::protocol::{NoteId, ParticipantId};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_OPERATIONS: &str = "operations";
const CF_COLLABORATORS: &str = "collaborators";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_OPERATIONS, CF_COLLABORATORS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("notes_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Everything about a note except its content.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NoteMeta {
    title: String,
    owner_id: ParticipantId,
    is_public: bool,
    version: u64,
    created_at: u64,
    updated_at: u64,
    content_size: u64,
    compressed_size: u64,
}

impl NoteMeta {
    fn from_note(note: &Note, compressed_size: usize) -> Self {
        Self {
            title: note.title.clone(),
            owner_id: note.owner_id,
            is_public: note.is_public,
            version: note.version,
            created_at: note.created_at,
            updated_at: note.updated_at,
            content_size: note.content.len() as u64,
            compressed_size: compressed_size as u64,
        }
    }

    fn into_note(self, id: NoteId, content: String) -> Note {
        Note {
            id,
            title: self.title,
            content,
            owner_id: self.owner_id,
            is_public: self.is_public,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// RocksDB-backed store implementing both [`DocumentStore`] and [`NoteCatalog`].
pub struct RocksStore {
    db: DB,
    config: StoreConfig,
    /// Serializes read-modify-write cycles on metadata.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Content is already LZ4 compressed by us.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA | CF_COLLABORATORS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Append-heavy, scanned per note
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Reads ────────────────────────────────────────────────────────

    fn read_meta(&self, note_id: &NoteId) -> Result<NoteMeta, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, note_key(note_id)?)? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(note_id.clone())),
        }
    }

    fn read_content_at(&self, snapshot: &Snapshot<'_>, note_id: &NoteId) -> Result<String, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = snapshot
            .get_cf(cf, note_key(note_id)?)?
            .ok_or_else(|| StoreError::NotFound(note_id.clone()))?;
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(raw).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// Metadata and content from the same point in time.
    fn read_state(&self, note_id: &NoteId) -> Result<(NoteMeta, String), StoreError> {
        let snapshot = self.db.snapshot();
        let cf = self.cf(CF_METADATA)?;
        let meta: NoteMeta = match snapshot.get_cf(cf, note_key(note_id)?)? {
            Some(bytes) => decode(&bytes)?,
            None => return Err(StoreError::NotFound(note_id.clone())),
        };
        let content = self.read_content_at(&snapshot, note_id)?;
        Ok((meta, content))
    }

    fn read_note(&self, note_id: &NoteId) -> Result<Note, StoreError> {
        let (meta, content) = self.read_state(note_id)?;
        Ok(meta.into_note(note_id.clone(), content))
    }

    /// Values of every key under `prefix` in a column family, in key order.
    fn scan_prefix<T: DeserializeOwned>(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    fn has_collaborator(
        &self,
        snapshot: &Snapshot<'_>,
        note_id: &NoteId,
        participant: ParticipantId,
    ) -> Result<bool, StoreError> {
        let cf = self.cf(CF_COLLABORATORS)?;
        Ok(snapshot
            .get_cf(cf, suffixed_key(note_id, participant)?)?
            .is_some())
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Content and metadata of one note, written atomically.
    fn write_note(&self, note: &Note) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(note.content.as_bytes());
        let meta = NoteMeta::from_note(note, compressed.len());

        let key = note_key(&note.id)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, &key, &compressed);
        batch.put_cf(cf_meta, &key, encode(&meta)?);
        self.write(batch)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn delete_prefix(&self, batch: &mut WriteBatch, cf_name: &str, prefix: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            batch.delete_cf(cf, &key);
        }
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn load(&self, note_id: &NoteId) -> Result<DocumentState, StoreError> {
        let (meta, content) = self.read_state(note_id)?;
        Ok(DocumentState {
            content,
            version: meta.version,
        })
    }

    async fn save(&self, note_id: &NoteId, content: &str, version: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut note = self.read_note(note_id)?;
        check_next_version(note_id, note.version, version)?;
        note.content = content.to_string();
        note.version = version;
        note.updated_at = unix_now();
        self.write_note(&note)
    }

    async fn append_operation(&self, record: OperationRecord) -> Result<(), StoreError> {
        // The log only exists for known notes.
        self.read_meta(&record.note_id)?;
        let cf = self.cf(CF_OPERATIONS)?;
        let key = suffixed_key(&record.note_id, record.version)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, key, encode(&record)?);
        self.write(batch)
    }

    async fn operations(&self, note_id: &NoteId) -> Result<Vec<OperationRecord>, StoreError> {
        self.scan_prefix(CF_OPERATIONS, &note_key(note_id)?)
    }
}

#[async_trait]
impl NoteCatalog for RocksStore {
    async fn insert(&self, note: Note) -> Result<Note, StoreError> {
        note_key(&note.id)?;
        let _guard = self.write_lock.lock();
        match self.read_meta(&note.id) {
            Ok(_) => return Err(StoreError::AlreadyExists(note.id)),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.write_note(&note)?;
        Ok(note)
    }

    async fn get(&self, note_id: &NoteId) -> Result<Note, StoreError> {
        self.read_note(note_id)
    }

    async fn list_for(&self, participant: ParticipantId) -> Result<Vec<Note>, StoreError> {
        let snapshot = self.db.snapshot();
        let cf = self.cf(CF_METADATA)?;
        let mut notes = Vec::new();
        for item in snapshot.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let id = note_id_from_key(&key)?;
            let meta: NoteMeta = decode(&value)?;
            let visible = meta.owner_id == participant
                || meta.is_public
                || self.has_collaborator(&snapshot, &id, participant)?;
            if visible {
                let content = self.read_content_at(&snapshot, &id)?;
                notes.push(meta.into_note(id, content));
            }
        }
        Ok(notes)
    }

    async fn update(&self, note_id: &NoteId, changes: NoteChanges) -> Result<Note, StoreError> {
        let _guard = self.write_lock.lock();
        let mut note = self.read_note(note_id)?;
        note.apply_changes(&changes);
        self.write_note(&note)?;
        Ok(note)
    }

    async fn delete(&self, note_id: &NoteId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.read_meta(note_id)?;

        let key = note_key(note_id)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, &key);
        batch.delete_cf(self.cf(CF_METADATA)?, &key);
        self.delete_prefix(&mut batch, CF_OPERATIONS, &key)?;
        self.delete_prefix(&mut batch, CF_COLLABORATORS, &key)?;
        self.write(batch)
    }

    async fn share(
        &self,
        note_id: &NoteId,
        participant: ParticipantId,
        permission: Permission,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.read_meta(note_id)?;

        let cf = self.cf(CF_COLLABORATORS)?;
        let key = suffixed_key(note_id, participant)?;
        let created_at = match self.db.get_cf(cf, &key)? {
            Some(bytes) => decode::<Collaborator>(&bytes)?.created_at,
            None => unix_now(),
        };
        let grant = Collaborator {
            participant,
            permission,
            created_at,
        };
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, key, encode(&grant)?);
        self.write(batch)
    }

    async fn collaborators(&self, note_id: &NoteId) -> Result<Vec<Collaborator>, StoreError> {
        self.read_meta(note_id)?;
        self.scan_prefix(CF_COLLABORATORS, &note_key(note_id)?)
    }
}

// ─── Keys & codecs ────────────────────────────────────────────────────

/// `len (u16 BE) ‖ id bytes`
fn note_key(note_id: &NoteId) -> Result<Vec<u8>, StoreError> {
    let bytes = note_id.as_str().as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| StoreError::NoteIdTooLong {
        len: bytes.len(),
        max: u16::MAX as usize,
    })?;
    let mut key = Vec::with_capacity(2 + bytes.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(bytes);
    Ok(key)
}

/// `note_key ‖ suffix (u64 BE)`; sorts numerically within a note.
fn suffixed_key(note_id: &NoteId, suffix: u64) -> Result<Vec<u8>, StoreError> {
    let mut key = note_key(note_id)?;
    key.extend_from_slice(&suffix.to_be_bytes());
    Ok(key)
}

fn note_id_from_key(key: &[u8]) -> Result<NoteId, StoreError> {
    let invalid = || StoreError::Deserialization("Invalid note key".into());
    let len_bytes: [u8; 2] = key.get(..2).ok_or_else(invalid)?.try_into().map_err(|_| invalid())?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    let id = key.get(2..2 + len).ok_or_else(invalid)?;
    let id = std::str::from_utf8(id).map_err(|_| invalid())?;
    Ok(NoteId::from(id))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
