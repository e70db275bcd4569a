//! Disk-backed secondary tier
//!
//! Layout under the configured directory:
//!
//! ```text
//! <dir>/index.json            key -> IndexRecord, loaded once at open
//! <dir>/payloads/<hash>.<gen>.bin
//! ```
//!
//! Payload files are named by the SHA-256 of the key plus a per-write
//! generation, so an overwrite never touches the file the index currently
//! references. A payload becomes reachable only after it has been renamed
//! into place and the index naming it has been persisted. Anything in
//! `payloads/` the index does not reference is garbage.
//!
//! The in-memory index is authoritative and lives behind its own lock,
//! separate from the memory tier. The index file is rewritten while that
//! lock is held so rewrites are totally ordered. When a rewrite fails the
//! mutation still takes effect in memory and never falls back to an older
//! record: a failed commit drops the key and deletes the payloads it named,
//! so a stale file can only point at payloads that no longer exist. Async
//! callers run index rewrites on the blocking pool.

use std::{
    collections::{HashMap, HashSet},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::entry::{elapsed_millis, CacheEntry, DataClass};
use crate::error::{CacheError, Result};

const INDEX_FILE: &str = "index.json";
const PAYLOAD_DIR: &str = "payloads";
const PAYLOAD_EXTENSION: &str = "bin";
const TMP_EXTENSION: &str = "tmp";
const INDEX_VERSION: u32 = 1;

const CODEC_RAW: u8 = 0;
const CODEC_GZIP: u8 = 1;

/// Index metadata for one persisted entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub ttl_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub data_class: DataClass,
    /// Payload file name, relative to the payload directory
    pub location: String,
}

impl IndexRecord {
    fn for_entry(entry: &CacheEntry, location: &str) -> Self {
        Self {
            ttl_seconds: entry.ttl_seconds,
            created_at: entry.created_at,
            data_class: entry.data_class,
            location: location.to_string(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        elapsed_millis(self.created_at, now) > self.ttl_seconds.saturating_mul(1000)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: HashMap<String, IndexRecord>,
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    key: &'a str,
    value: &'a Value,
}

#[derive(Deserialize)]
struct Payload {
    key: String,
    value: Value,
}

/// Key -> record map and the file it is mirrored to
struct Index {
    path: PathBuf,
    records: Mutex<HashMap<String, IndexRecord>>,
}

/// Outcome of pointing the index at a new payload
struct Commit {
    /// Record that was replaced, or dropped if persisting failed
    previous: Option<IndexRecord>,
    persisted: Result<()>,
}

/// Records dropped from the index. They are gone from memory even when
/// `persisted` is an error.
struct Removal {
    records: Vec<(String, IndexRecord)>,
    persisted: Result<()>,
}

impl Index {
    fn get(&self, key: &str) -> Option<IndexRecord> {
        self.records.lock().get(key).cloned()
    }

    fn commit(&self, key: String, record: IndexRecord) -> Commit {
        let mut records = self.records.lock();
        let previous = records.insert(key.clone(), record);
        let persisted = write_index(&self.path, &records);
        if persisted.is_err() {
            records.remove(&key);
        }
        Commit {
            previous,
            persisted,
        }
    }

    /// Drop `record` if it is still the one indexed under `key`
    fn purge(&self, key: &str, record: &IndexRecord) -> bool {
        let mut records = self.records.lock();
        if records.get(key) != Some(record) {
            return false;
        }
        records.remove(key);
        if let Err(e) = write_index(&self.path, &records) {
            warn!("Failed to persist cache index after purging {}: {}", key, e);
        }
        true
    }

    fn remove_many(&self, keys: &[String]) -> Removal {
        let mut records = self.records.lock();
        let removed: Vec<(String, IndexRecord)> = keys
            .iter()
            .filter_map(|key| records.remove(key).map(|record| (key.clone(), record)))
            .collect();
        self.removal(&records, removed)
    }

    fn drain(&self) -> Removal {
        let mut records = self.records.lock();
        let removed: Vec<(String, IndexRecord)> = records.drain().collect();
        let persisted = write_index(&self.path, &records);
        Removal {
            records: removed,
            persisted,
        }
    }

    fn drain_expired(&self, now: DateTime<Utc>) -> Removal {
        let mut records = self.records.lock();
        let expired: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        let removed: Vec<(String, IndexRecord)> = expired
            .into_iter()
            .filter_map(|key| records.remove(&key).map(|record| (key, record)))
            .collect();
        self.removal(&records, removed)
    }

    fn removal(
        &self,
        records: &HashMap<String, IndexRecord>,
        removed: Vec<(String, IndexRecord)>,
    ) -> Removal {
        let persisted = if removed.is_empty() {
            Ok(())
        } else {
            write_index(&self.path, records)
        };
        Removal {
            records: removed,
            persisted,
        }
    }
}

/// Durable store for entries whose data class is persistent
pub struct PersistentStore {
    root: PathBuf,
    payload_dir: PathBuf,
    compress: bool,
    generation: AtomicU64,
    index: Arc<Index>,
}

impl PersistentStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Failing to create the directory is fatal. An unreadable index is
    /// treated as empty and unreferenced payload files are reclaimed.
    pub fn open(root: impl AsRef<Path>, compress: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let payload_dir = root.join(PAYLOAD_DIR);
        std::fs::create_dir_all(&payload_dir)?;

        let index_path = root.join(INDEX_FILE);
        let records = read_index(&index_path);
        let reclaimed = reclaim_orphans(&payload_dir, &records);

        info!(
            "Opened persistent cache at {} ({} entries, {} orphans reclaimed)",
            root.display(),
            records.len(),
            reclaimed
        );

        Ok(Self {
            root,
            payload_dir,
            compress,
            generation: AtomicU64::new(Utc::now().timestamp_micros().max(0) as u64),
            index: Arc::new(Index {
                path: index_path,
                records: Mutex::new(records),
            }),
        })
    }

    /// Directory this store was opened at
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of indexed entries, expired ones included
    pub fn len(&self) -> usize {
        self.index.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.records.lock().is_empty()
    }

    /// Indexed keys
    pub fn keys(&self) -> Vec<String> {
        self.index.records.lock().keys().cloned().collect()
    }

    /// Index record for `key`, if any
    pub fn record(&self, key: &str) -> Option<IndexRecord> {
        self.index.get(key)
    }

    /// Whether the index holds an unexpired record for `key`.
    ///
    /// Answered from the index alone; no payload is read.
    pub fn contains_live(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.index
            .records
            .lock()
            .get(key)
            .is_some_and(|record| !record.is_expired_at(now))
    }

    /// Path of a payload file
    pub fn payload_path(&self, location: &str) -> PathBuf {
        self.payload_dir.join(location)
    }

    /// Write an entry through to disk.
    ///
    /// On any failure the key is left unindexed, so an older value can
    /// never be read back in place of this one.
    pub fn write(&self, entry: &CacheEntry) -> Result<()> {
        let location = match self.stage(entry) {
            Ok(location) => location,
            Err(e) => {
                self.discard(&entry.key);
                return Err(e);
            }
        };

        let commit = self
            .index
            .commit(entry.key.clone(), IndexRecord::for_entry(entry, &location));
        self.finish_commit(&entry.key, &location, commit)
    }

    /// Async twin of [`PersistentStore::write`]
    pub async fn write_async(&self, entry: &CacheEntry) -> Result<()> {
        let location = match self.stage_async(entry).await {
            Ok(location) => location,
            Err(e) => {
                self.discard_async(&entry.key).await;
                return Err(e);
            }
        };

        let key = entry.key.clone();
        let record = IndexRecord::for_entry(entry, &location);
        let commit = self.offload(move |index| index.commit(key, record)).await?;
        self.finish_commit_async(&entry.key, &location, commit).await
    }

    /// Read an entry back.
    ///
    /// Expired records are purged and reported as absent. A missing or
    /// undecodable payload purges the record and returns
    /// [`CacheError::CorruptEntry`].
    pub fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(record) = self.index.get(key) else {
            return Ok(None);
        };
        if record.is_expired_at(Utc::now()) {
            debug!("Persistent entry expired: {}", key);
            self.purge_record(key, &record);
            return Ok(None);
        }

        let loaded = match std::fs::read(self.payload_path(&record.location)) {
            Ok(bytes) => decode_entry(key, &record, &bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::corrupt(key, "payload file is missing"))
            }
            Err(e) => return Err(e.into()),
        };
        if loaded.is_err() {
            self.purge_record(key, &record);
        }
        loaded.map(Some)
    }

    /// Async twin of [`PersistentStore::load`]
    pub async fn load_async(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(record) = self.index.get(key) else {
            return Ok(None);
        };
        if record.is_expired_at(Utc::now()) {
            debug!("Persistent entry expired: {}", key);
            self.purge_record_async(key, record).await;
            return Ok(None);
        }

        let loaded = match tokio::fs::read(self.payload_path(&record.location)).await {
            Ok(bytes) => decode_entry(key, &record, &bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::corrupt(key, "payload file is missing"))
            }
            Err(e) => return Err(e.into()),
        };
        if loaded.is_err() {
            self.purge_record_async(key, record).await;
        }
        loaded.map(Some)
    }

    /// Remove an entry. Returns whether it was indexed.
    ///
    /// An error means the record was dropped but the index file could not
    /// be rewritten.
    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(!self.remove_many(&[key.to_string()])?.is_empty())
    }

    /// Async twin of [`PersistentStore::remove`]
    pub async fn remove_async(&self, key: &str) -> Result<bool> {
        Ok(!self.remove_many_async(&[key.to_string()]).await?.is_empty())
    }

    /// Remove every listed key with a single index rewrite, returning the
    /// keys that were indexed
    pub fn remove_many(&self, keys: &[String]) -> Result<Vec<String>> {
        self.finish_removal(self.index.remove_many(keys))
    }

    /// Async twin of [`PersistentStore::remove_many`]
    pub async fn remove_many_async(&self, keys: &[String]) -> Result<Vec<String>> {
        let keys = keys.to_vec();
        let removal = self.offload(move |index| index.remove_many(&keys)).await?;
        self.finish_removal_async(removal).await
    }

    /// Remove every entry, returning how many were indexed
    pub fn clear(&self) -> Result<usize> {
        self.finish_removal(self.index.drain()).map(|keys| keys.len())
    }

    /// Async twin of [`PersistentStore::clear`]
    pub async fn clear_async(&self) -> Result<usize> {
        let removal = self.offload(|index| index.drain()).await?;
        self.finish_removal_async(removal).await.map(|keys| keys.len())
    }

    /// Remove every record expired at `now`, returning their keys
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.finish_removal(self.index.drain_expired(now))
    }

    /// Async twin of [`PersistentStore::purge_expired`]
    pub async fn purge_expired_async(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let removal = self.offload(move |index| index.drain_expired(now)).await?;
        self.finish_removal_async(removal).await
    }

    /// Encode and rename a payload into place, returning its location
    fn stage(&self, entry: &CacheEntry) -> Result<String> {
        let (location, bytes) = self.prepare(entry)?;
        let path = self.payload_path(&location);
        let tmp = path.with_extension(TMP_EXTENSION);

        if let Err(e) = std::fs::write(&tmp, &bytes).and_then(|_| std::fs::rename(&tmp, &path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(location)
    }

    async fn stage_async(&self, entry: &CacheEntry) -> Result<String> {
        let (location, bytes) = self.prepare(entry)?;
        let path = self.payload_path(&location);
        let tmp = path.with_extension(TMP_EXTENSION);

        let written = match tokio::fs::write(&tmp, &bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(location)
    }

    fn prepare(&self, entry: &CacheEntry) -> Result<(String, Vec<u8>)> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let location = format!(
            "{}.{:x}.{}",
            hash_key(&entry.key),
            generation,
            PAYLOAD_EXTENSION
        );
        let bytes = encode_payload(&entry.key, &entry.value, self.compress)?;
        Ok((location, bytes))
    }

    /// Run an index mutation on the blocking pool
    async fn offload<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Index) -> T + Send + 'static,
        T: Send + 'static,
    {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || op(&index))
            .await
            .map_err(|e| CacheError::Background {
                message: format!("cache index task failed: {}", e),
            })
    }

    fn finish_commit(&self, key: &str, location: &str, commit: Commit) -> Result<()> {
        if let Some(previous) = &commit.previous {
            remove_payload(&self.payload_path(&previous.location));
        }
        if let Err(e) = commit.persisted {
            remove_payload(&self.payload_path(location));
            return Err(e);
        }
        debug!("Persisted cache entry: {}", key);
        Ok(())
    }

    async fn finish_commit_async(&self, key: &str, location: &str, commit: Commit) -> Result<()> {
        if let Some(previous) = &commit.previous {
            remove_payload_async(&self.payload_path(&previous.location)).await;
        }
        if let Err(e) = commit.persisted {
            remove_payload_async(&self.payload_path(location)).await;
            return Err(e);
        }
        debug!("Persisted cache entry: {}", key);
        Ok(())
    }

    fn finish_removal(&self, removal: Removal) -> Result<Vec<String>> {
        for (_, record) in &removal.records {
            remove_payload(&self.payload_path(&record.location));
        }
        removal.persisted?;
        Ok(removal.records.into_iter().map(|(key, _)| key).collect())
    }

    async fn finish_removal_async(&self, removal: Removal) -> Result<Vec<String>> {
        for (_, record) in &removal.records {
            remove_payload_async(&self.payload_path(&record.location)).await;
        }
        removal.persisted?;
        Ok(removal.records.into_iter().map(|(key, _)| key).collect())
    }

    /// Unindex `key` after a payload could not be staged
    fn discard(&self, key: &str) {
        if let Err(e) = self.remove_many(&[key.to_string()]) {
            warn!("Failed to persist cache index after discarding {}: {}", key, e);
        }
    }

    async fn discard_async(&self, key: &str) {
        if let Err(e) = self.remove_many_async(&[key.to_string()]).await {
            warn!("Failed to persist cache index after discarding {}: {}", key, e);
        }
    }

    fn purge_record(&self, key: &str, record: &IndexRecord) {
        if self.index.purge(key, record) {
            debug!("Purged persistent entry: {}", key);
            remove_payload(&self.payload_path(&record.location));
        }
    }

    async fn purge_record_async(&self, key: &str, record: IndexRecord) {
        let location = record.location.clone();
        let owned_key = key.to_string();
        match self
            .offload(move |index| index.purge(&owned_key, &record))
            .await
        {
            Ok(true) => {
                debug!("Purged persistent entry: {}", key);
                remove_payload_async(&self.payload_path(&location)).await;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to purge persistent entry {}: {}", key, e),
        }
    }
}

/// Hex SHA-256 of a cache key
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn decode_entry(key: &str, record: &IndexRecord, bytes: &[u8]) -> Result<CacheEntry> {
    let payload = decode_payload(bytes).map_err(|e| CacheError::corrupt(key, e.to_string()))?;
    if payload.key != key {
        return Err(CacheError::corrupt(
            key,
            format!("payload belongs to key '{}'", payload.key),
        ));
    }

    let mut entry = CacheEntry::new(key, payload.value, record.data_class, record.ttl_seconds);
    entry.created_at = record.created_at;
    entry.persistent = true;
    Ok(entry)
}

fn encode_payload(key: &str, value: &Value, compress: bool) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&PayloadRef { key, value })?;
    if !compress {
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(CODEC_RAW);
        bytes.extend_from_slice(&body);
        return Ok(bytes);
    }

    let mut encoder = GzEncoder::new(vec![CODEC_GZIP], Compression::default());
    encoder
        .write_all(&body)
        .map_err(|e| CacheError::Compression {
            message: format!("Failed to compress payload: {}", e),
        })?;
    encoder.finish().map_err(|e| CacheError::Compression {
        message: format!("Failed to finish compression: {}", e),
    })
}

fn decode_payload(bytes: &[u8]) -> Result<Payload> {
    let Some((&codec, body)) = bytes.split_first() else {
        return Err(CacheError::Serialization {
            message: "empty payload file".to_string(),
        });
    };

    match codec {
        CODEC_RAW => Ok(serde_json::from_slice(body)?),
        CODEC_GZIP => {
            let mut decoded = Vec::new();
            GzDecoder::new(body)
                .read_to_end(&mut decoded)
                .map_err(|e| CacheError::Compression {
                    message: format!("Failed to decompress payload: {}", e),
                })?;
            Ok(serde_json::from_slice(&decoded)?)
        }
        other => Err(CacheError::Serialization {
            message: format!("unknown payload codec {}", other),
        }),
    }
}

fn read_index(path: &Path) -> HashMap<String, IndexRecord> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!("Cannot read cache index {}, starting empty: {}", path.display(), e);
            return HashMap::new();
        }
    };

    match serde_json::from_slice::<IndexFile>(&content) {
        Ok(file) if file.version == INDEX_VERSION => file.entries,
        Ok(file) => {
            warn!(
                "Unsupported cache index version {} in {}, starting empty",
                file.version,
                path.display()
            );
            HashMap::new()
        }
        Err(e) => {
            warn!("Corrupt cache index {}, starting empty: {}", path.display(), e);
            HashMap::new()
        }
    }
}

fn write_index(path: &Path, entries: &HashMap<String, IndexRecord>) -> Result<()> {
    #[derive(Serialize)]
    struct IndexFileRef<'a> {
        version: u32,
        entries: &'a HashMap<String, IndexRecord>,
    }

    let content = serde_json::to_vec(&IndexFileRef {
        version: INDEX_VERSION,
        entries,
    })?;
    let tmp = path.with_extension(TMP_EXTENSION);
    std::fs::write(&tmp, &content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Delete payload and temp files the index does not reference
fn reclaim_orphans(payload_dir: &Path, index: &HashMap<String, IndexRecord>) -> usize {
    let referenced: HashSet<&str> = index.values().map(|r| r.location.as_str()).collect();

    let entries = match std::fs::read_dir(payload_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot scan {} for orphans: {}", payload_dir.display(), e);
            return 0;
        }
    };

    let mut reclaimed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let keep = name.to_str().is_some_and(|name| referenced.contains(name));
        if keep || !path.is_file() {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => reclaimed += 1,
            Err(e) => warn!("Failed to reclaim {}: {}", path.display(), e),
        }
    }
    reclaimed
}

fn remove_payload(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove payload {}: {}", path.display(), e);
        }
    }
}

async fn remove_payload_async(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove payload {}: {}", path.display(), e);
        }
    }
}
