use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::codec::Codec;
use crate::error::{CodecError, StoreError};
use crate::event::EventRecord;
use crate::prometheus::report_evicted_entries;

pub mod backend;
pub mod memory;
pub mod sqlite;

pub use backend::KvBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Every committed record lives under a key with this prefix.
pub const DATA_PREFIX: &str = "data_";
/// Reserved keys, never listed, evicted or swept.
pub const CONFIG_KEY: &str = "pipeline:config";
pub const STATUS_KEY: &str = "pipeline:status";

/// Builds the key of the `index`-th record of a batch committed at `stamp`
/// (unix nanoseconds). Both parts are zero-padded so that lexicographic key order
/// is insertion order.
pub fn entry_key(stamp: i128, index: usize) -> String {
    format!("{DATA_PREFIX}{stamp:020}_{index:010}")
}

/// Inverse of [`entry_key`]: the commit stamp and index encoded in a key.
pub fn parse_entry_key(key: &str) -> Option<(i128, u64)> {
    let (stamp, index) = key.strip_prefix(DATA_PREFIX)?.split_once('_')?;
    if stamp.len() != 20 || index.len() != 10 {
        return None;
    }
    Some((stamp.parse().ok()?, index.parse().ok()?))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredEntry {
    pub key: String,
    pub encoded: String,
    #[serde(with = "time::serde::rfc3339")]
    pub inserted_at: OffsetDateTime,
}

impl StoredEntry {
    fn from_raw(key: String, encoded: String) -> Result<Self, StoreError> {
        let inserted_at = parse_entry_key(&key)
            .and_then(|(stamp, _)| OffsetDateTime::from_unix_timestamp_nanos(stamp).ok())
            .ok_or_else(|| StoreError::MalformedKey(key.clone()))?;
        Ok(StoredEntry {
            key,
            encoded,
            inserted_at,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub keys: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
}

/// Owns the committed entries. All writes, including eviction and sweeping, go
/// through here and are serialized on one writer lock.
pub struct Store {
    backend: Arc<dyn KvBackend>,
    codec: Arc<dyn Codec>,
    // Stamp of the last successful commit, loaded from the keys on first write
    writer: Mutex<Option<i128>>,
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>, codec: Arc<dyn Codec>) -> Self {
        Self {
            backend,
            codec,
            writer: Mutex::new(None),
        }
    }

    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    pub fn decode(&self, entry: &StoredEntry) -> Result<EventRecord, CodecError> {
        self.codec.decode(&entry.encoded)
    }

    /// Persists the whole batch under fresh keys, or nothing at all.
    #[instrument(skip_all, fields(batch_size = batch.len()))]
    pub async fn commit(
        &self,
        batch: &[EventRecord],
        now: OffsetDateTime,
    ) -> Result<CommitReceipt, StoreError> {
        let mut writer = self.writer.lock().await;
        let last = match *writer {
            Some(last) => last,
            None => self.latest_stamp().await?,
        };

        // Strictly after the previous commit, even if the clock stalled or stepped back
        let stamp = now.unix_timestamp_nanos().max(last + 1);
        let committed_at = OffsetDateTime::from_unix_timestamp_nanos(stamp).unwrap_or(now);

        let mut items = Vec::with_capacity(batch.len());
        for (index, record) in batch.iter().enumerate() {
            let encoded = self
                .codec
                .encode(record)
                .map_err(|source| StoreError::Encode {
                    id: record.id.clone(),
                    source,
                })?;
            items.push((entry_key(stamp, index), encoded));
        }
        let keys: Vec<String> = items.iter().map(|(key, _)| key.clone()).collect();

        if !items.is_empty() {
            self.backend.set_many(items).await?;
            *writer = Some(stamp);
        }

        debug!(keys = keys.len(), "committed batch");
        Ok(CommitReceipt { keys, committed_at })
    }

    /// Evicts the oldest entries, by insertion order, until at most `capacity` remain.
    /// Returns the evicted keys.
    #[instrument(skip(self))]
    pub async fn enforce_capacity(&self, capacity: usize) -> Result<Vec<String>, StoreError> {
        let _writer = self.writer.lock().await;
        // Malformed keys never list, so they don't take up capacity; the sweep removes them
        let keys = self.entry_keys().await?;
        if keys.len() <= capacity {
            return Ok(vec![]);
        }

        let excess = keys.len() - capacity;
        let evicted: Vec<String> = keys.into_iter().take(excess).collect();
        self.backend.remove(&evicted).await?;

        report_evicted_entries(evicted.len());
        debug!(evicted = evicted.len(), capacity, "evicted oldest entries");
        Ok(evicted)
    }

    /// Every committed entry in insertion order. Entries whose key can't be parsed
    /// are logged and left out.
    pub async fn read_all(&self) -> Result<Vec<StoredEntry>, StoreError> {
        let raw = self.backend.scan_prefix(DATA_PREFIX).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(key, encoded)| match StoredEntry::from_raw(key, encoded) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("skipping stored entry: {}", err);
                    None
                }
            })
            .collect())
    }

    /// Entries inserted within `[from, to)`. A missing bound is open.
    pub async fn read_range(
        &self,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let mut entries = self.read_all().await?;
        entries.retain(|entry| {
            from.map_or(true, |from| entry.inserted_at >= from)
                && to.map_or(true, |to| entry.inserted_at < to)
        });
        Ok(entries)
    }

    /// Raw key/value pairs under the data prefix, malformed keys included.
    pub(crate) async fn read_raw(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.backend.scan_prefix(DATA_PREFIX).await
    }

    /// Deletes entries by key. Missing keys and reserved keys are ignored.
    #[instrument(skip_all, fields(keys = keys.len()))]
    pub async fn remove(&self, keys: &[String]) -> Result<u64, StoreError> {
        let keys: Vec<String> = keys
            .iter()
            .filter(|key| key.starts_with(DATA_PREFIX))
            .cloned()
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let _writer = self.writer.lock().await;
        self.backend.remove(&keys).await
    }

    /// Removes every entry, leaving the reserved keys in place.
    pub async fn clear(&self) -> Result<u64, StoreError> {
        let _writer = self.writer.lock().await;
        let keys = self.backend.keys_with_prefix(DATA_PREFIX).await?;
        self.backend.remove(&keys).await
    }

    /// Number of well-formed data entries, the ones [`Store::read_all`] returns.
    pub async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.entry_keys().await?.len())
    }

    async fn entry_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = self.backend.keys_with_prefix(DATA_PREFIX).await?;
        keys.retain(|key| parse_entry_key(key).is_some());
        Ok(keys)
    }

    pub async fn read_reserved(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.backend.get(key).await
    }

    pub async fn write_reserved(&self, key: &str, value: String) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        self.backend.set(key, value).await
    }

    async fn latest_stamp(&self) -> Result<i128, StoreError> {
        let started = Instant::now();
        let keys = self.backend.keys_with_prefix(DATA_PREFIX).await?;
        let latest = keys
            .iter()
            .rev()
            .find_map(|key| parse_entry_key(key))
            .map(|(stamp, _)| stamp)
            .unwrap_or(0);
        debug!(latest, took = ?started.elapsed(), "loaded latest commit stamp");
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::event::EventSource;
    use serde_json::json;
    use time::macros::datetime;

    fn record(id: &str) -> EventRecord {
        EventRecord::new(
            id,
            "message",
            datetime!(2024-01-01 00:00 UTC),
            EventSource::Network,
            json!({"id": id}),
        )
    }

    fn store() -> (Store, MemoryBackend) {
        let backend = MemoryBackend::new();
        let store = Store::new(Arc::new(backend.clone()), Arc::new(JsonCodec));
        (store, backend)
    }

    #[test]
    fn keys_sort_in_insertion_order() {
        let a = entry_key(999, 10);
        let b = entry_key(1000, 0);
        let c = entry_key(1000, 2);
        assert!(a < b && b < c);
        assert_eq!(parse_entry_key(&c), Some((1000, 2)));
        assert_eq!(parse_entry_key("data_12_3"), None);
        assert_eq!(parse_entry_key("pipeline:config"), None);
    }

    #[tokio::test]
    async fn batches_sharing_a_timestamp_get_distinct_keys() {
        let (store, _) = store();
        let now = datetime!(2024-01-01 12:00 UTC);

        let first = store.commit(&[record("a"), record("b")], now).await.unwrap();
        let second = store.commit(&[record("c")], now).await.unwrap();

        assert!(second.committed_at > first.committed_at);
        let keys: Vec<String> = store
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[..2], first.keys[..]);
        assert_eq!(keys[2..], second.keys[..]);
    }

    #[tokio::test]
    async fn entries_decode_back_to_records() {
        let (store, _) = store();
        let now = datetime!(2024-01-01 12:00 UTC);
        store.commit(&[record("a")], now).await.unwrap();

        let entries = store.read_all().await.unwrap();
        assert_eq!(entries[0].inserted_at, now);
        assert_eq!(store.decode(&entries[0]).unwrap(), record("a"));
    }

    #[tokio::test]
    async fn capacity_keeps_newest() {
        let (store, _) = store();
        let now = datetime!(2024-01-01 12:00 UTC);
        for i in 0..5 {
            store
                .commit(&[record(&format!("r{i}"))], now + time::Duration::seconds(i))
                .await
                .unwrap();
        }

        let evicted = store.enforce_capacity(3).await.unwrap();
        assert_eq!(evicted.len(), 2);

        let ids: Vec<String> = store
            .read_all()
            .await
            .unwrap()
            .iter()
            .map(|e| store.decode(e).unwrap().id)
            .collect();
        assert_eq!(ids, vec!["r2", "r3", "r4"]);
        assert!(store.enforce_capacity(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_commit_is_invisible() {
        let (store, backend) = store();
        backend.fail_writes(1);

        let batch: Vec<EventRecord> = (0..6).map(|i| record(&i.to_string())).collect();
        assert!(store
            .commit(&batch, datetime!(2024-01-01 12:00 UTC))
            .await
            .is_err());
        assert!(store.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reserved_keys_are_not_data() {
        let (store, backend) = store();
        store
            .write_reserved(CONFIG_KEY, "{}".to_string())
            .await
            .unwrap();
        store
            .commit(&[record("a")], datetime!(2024-01-01 12:00 UTC))
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.remove(&[CONFIG_KEY.to_string()]).await.unwrap(), 0);
        assert_eq!(store.clear().await.unwrap(), 1);
        assert_eq!(backend.raw(CONFIG_KEY).as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn range_is_half_open() {
        let (store, _) = store();
        let t0 = datetime!(2024-01-01 12:00 UTC);
        for i in 0..4 {
            store
                .commit(&[record(&i.to_string())], t0 + time::Duration::minutes(i))
                .await
                .unwrap();
        }

        let entries = store
            .read_range(
                Some(t0 + time::Duration::minutes(1)),
                Some(t0 + time::Duration::minutes(3)),
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(store.read_range(None, None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn stamps_continue_after_reopen() {
        let backend = MemoryBackend::new();
        let now = datetime!(2024-01-01 12:00 UTC);
        let first = Store::new(Arc::new(backend.clone()), Arc::new(JsonCodec));
        first.commit(&[record("a")], now).await.unwrap();

        // Same clock reading in a fresh process must not overwrite the entry
        let second = Store::new(Arc::new(backend.clone()), Arc::new(JsonCodec));
        second.commit(&[record("b")], now).await.unwrap();
        assert_eq!(second.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn malformed_keys_are_skipped_when_listing() {
        let (store, backend) = store();
        backend.insert_raw("data_garbage", "x");
        store
            .commit(&[record("a")], datetime!(2024-01-01 12:00 UTC))
            .await
            .unwrap();

        assert_eq!(store.read_all().await.unwrap().len(), 1);
        assert_eq!(store.read_raw().await.unwrap().len(), 2);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_keys_take_no_capacity() {
        let (store, backend) = store();
        backend.insert_raw("data_garbage", "x");
        backend.insert_raw("data_12_3", "y");
        let now = datetime!(2024-01-01 12:00 UTC);
        for i in 0..3 {
            store
                .commit(&[record(&format!("r{i}"))], now + time::Duration::seconds(i))
                .await
                .unwrap();
        }

        assert!(store.enforce_capacity(3).await.unwrap().is_empty());
        assert_eq!(store.read_all().await.unwrap().len(), 3);

        let evicted = store.enforce_capacity(2).await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(store.read_all().await.unwrap().len(), 2);
        assert_eq!(backend.raw("data_garbage").as_deref(), Some("x"));
    }
}
