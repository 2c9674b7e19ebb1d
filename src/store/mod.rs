//! Persistent store abstraction.
//!
//! The source system treats persistence as an external transactional
//! document/row store with unique-key lookup and range-query support
//! (Postgres via an ORM). This crate backs that role with an embedded
//! ordered key-value store (`sled`), and layers row-lock semantics on top
//! via [`with_lock`] since `sled` has no native `SELECT FOR UPDATE`.

mod sled_store;

pub use sled_store::{with_lock, SledStore};
pub use sled_store::open;

use crate::error::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// A typed collection within the store: entities serialize to/from JSON and
/// are keyed by a big-endian-encoded composite key so range scans come back
/// in key order.
#[async_trait]
pub trait Collection<T>: Send + Sync
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn name(&self) -> &'static str;

    async fn get(&self, key: &[u8]) -> Result<Option<T>>;
    async fn put(&self, key: &[u8], value: &T) -> Result<()>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
    /// Inclusive-inclusive range scan, ascending key order.
    async fn range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, T)>>;
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, T)>>;
    async fn last(&self) -> Result<Option<(Vec<u8>, T)>>;
    async fn last_before(&self, key: &[u8]) -> Result<Option<(Vec<u8>, T)>>;
    /// Best-effort bulk insert; conflicting keys (an entry already present)
    /// are silently skipped, mirroring `bulk_create(..., ignore_conflicts=True)`.
    async fn bulk_put_ignore_conflicts(&self, items: &[(Vec<u8>, T)]) -> Result<usize>;
}

/// Big-endian encode a composite `(id, time)` key so lexicographic byte
/// order matches numeric order — the same trick `HistoryStorage` uses for
/// its single-field timestamp keys, extended to two fields.
pub fn composite_key(id: u64, time: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&id.to_be_bytes());
    // time is stored as its bit pattern XORed with the sign bit so negative
    // values still sort before non-negative ones in unsigned byte order.
    key.extend_from_slice(&((time as u64) ^ (1u64 << 63)).to_be_bytes());
    key
}

pub fn time_from_composite_key(key: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[8..16]);
    (u64::from_be_bytes(bytes) ^ (1u64 << 63)) as i64
}
