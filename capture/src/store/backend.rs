use async_trait::async_trait;

use crate::error::StoreError;

/// A flat string key/value map, the only thing the store needs from persistence.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Writes every item or none of them.
    async fn set_many(&self, items: Vec<(String, String)>) -> Result<(), StoreError>;

    /// Items whose key starts with `prefix`, in ascending key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Keys starting with `prefix`, in ascending order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Deletes the given keys, ignoring the ones that don't exist. Returns how
    /// many were actually removed.
    async fn remove(&self, keys: &[String]) -> Result<u64, StoreError>;
}
