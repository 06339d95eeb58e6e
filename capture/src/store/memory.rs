use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::backend::KvBackend;

/// In-process backend, used for tests and `MEMORY_STORE=true` runs.
///
/// Faults can be injected to exercise the failure paths: `fail_writes(n)` makes the
/// next `n` multi-key writes fail after half of their items have been applied, and
/// the partial write is then rolled back like a database transaction would be.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    items: BTreeMap<String, String>,
    failing_writes: u32,
    failing_reads: u32,
    write_calls: u64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    pub fn fail_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    /// Number of `set_many` calls seen, failed ones included.
    pub fn write_calls(&self) -> u64 {
        self.lock().write_calls
    }

    /// Writes a raw value, bypassing codec and key generation.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().items.insert(key.into(), value.into());
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.lock().items.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn take_read_fault(&mut self, operation: &'static str) -> Result<(), StoreError> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(StoreError::backend(operation, "injected read failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        inner.take_read_fault("get")?;
        Ok(inner.items.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(StoreError::backend("set", "injected write failure"));
        }
        inner.items.insert(key.to_owned(), value);
        Ok(())
    }

    async fn set_many(&self, items: Vec<(String, String)>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.write_calls += 1;
        let fail_at = match inner.failing_writes {
            0 => None,
            _ => {
                inner.failing_writes -= 1;
                Some(items.len() / 2)
            }
        };

        // Undo log: previous value of every key touched so far
        let mut undo: Vec<(String, Option<String>)> = Vec::with_capacity(items.len());
        for (index, (key, value)) in items.into_iter().enumerate() {
            if fail_at == Some(index) {
                for (key, previous) in undo.into_iter().rev() {
                    match previous {
                        Some(value) => inner.items.insert(key, value),
                        None => inner.items.remove(&key),
                    };
                }
                return Err(StoreError::backend("set_many", "injected write failure"));
            }
            let previous = inner.items.insert(key.clone(), value);
            undo.push((key, previous));
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut inner = self.lock();
        inner.take_read_fault("scan_prefix")?;
        Ok(inner
            .items
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        inner.take_read_fault("keys_with_prefix")?;
        Ok(inner
            .items
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn remove(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let removed = keys
            .iter()
            .filter(|key| inner.items.remove(key.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }
}
