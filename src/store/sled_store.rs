//! `sled`-backed implementation of [`super::Collection`], plus the
//! per-key-mutex `with_lock` transaction helper that stands in for
//! `SELECT FOR UPDATE` in this single-process deployment.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::store::Collection;

static DB: OnceLock<Arc<sled::Db>> = OnceLock::new();

/// Open (or reuse) the global store at `path`. Must be called once at
/// startup before any `SledStore` is constructed.
pub fn open(path: impl AsRef<std::path::Path>) -> Result<()> {
    if DB.get().is_none() {
        let db = sled::open(path)?;
        let _ = DB.set(Arc::new(db));
    }
    Ok(())
}

fn db() -> Arc<sled::Db> {
    DB.get()
        .cloned()
        .expect("store::open() must be called before use")
}

/// A named tree within the shared sled database.
pub struct SledStore<T> {
    tree: sled::Tree,
    name: &'static str,
    _marker: PhantomData<T>,
}

impl<T> SledStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn open(name: &'static str) -> Result<Self> {
        let tree = db().open_tree(name)?;
        Ok(Self {
            tree,
            name,
            _marker: PhantomData,
        })
    }
}

#[async_trait]
impl<T> Collection<T> for SledStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn get(&self, key: &[u8]) -> Result<Option<T>> {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    async fn range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, T)>> {
        let mut out = Vec::new();
        for item in self.tree.range(start.to_vec()..=end.to_vec()) {
            let (k, v) = item?;
            out.push((k.to_vec(), serde_json::from_slice(&v)?));
        }
        Ok(out)
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, T)>> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (k, v) = item?;
            out.push((k.to_vec(), serde_json::from_slice(&v)?));
        }
        Ok(out)
    }

    async fn last(&self) -> Result<Option<(Vec<u8>, T)>> {
        match self.tree.last()? {
            Some((k, v)) => Ok(Some((k.to_vec(), serde_json::from_slice(&v)?))),
            None => Ok(None),
        }
    }

    async fn last_before(&self, key: &[u8]) -> Result<Option<(Vec<u8>, T)>> {
        for item in self.tree.range(..key.to_vec()).rev().take(1) {
            let (k, v) = item?;
            return Ok(Some((k.to_vec(), serde_json::from_slice(&v)?)));
        }
        Ok(None)
    }

    async fn bulk_put_ignore_conflicts(&self, items: &[(Vec<u8>, T)]) -> Result<usize> {
        let mut inserted = 0;
        for (key, value) in items {
            if self.tree.get(key)?.is_some() {
                continue;
            }
            let bytes = serde_json::to_vec(value)?;
            self.tree.insert(key.as_slice(), bytes)?;
            inserted += 1;
        }
        Ok(inserted)
    }
}

/// Process-wide registry of per-key async mutexes, used to serialize
/// concurrent access to the same logical row set within one process —
/// the closest this embedded store gets to `SELECT FOR UPDATE`.
static LOCKS: OnceLock<Mutex<BTreeMap<String, Arc<Mutex<()>>>>> = OnceLock::new();

fn locks() -> &'static Mutex<BTreeMap<String, Arc<Mutex<()>>>> {
    LOCKS.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Acquire one mutex per key in `keys` (sorted, to make lock order
/// deterministic across concurrent callers and avoid deadlocks), run `f`,
/// then release. Models row-locking a set of entities for the duration of a
/// transactional step (C4's device+datastreams lock, C5's df+ds lock, C8's
/// device/asset sweep locks).
pub async fn with_lock<F, Fut, R>(keys: &[String], f: F) -> R
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let mut sorted: Vec<&String> = keys.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut held = Vec::with_capacity(sorted.len());
    {
        let mut registry = locks().lock().await;
        for key in &sorted {
            let entry = registry
                .entry((*key).clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            held.push(entry);
        }
    }

    // acquire in sorted order, held for the lifetime of the closure
    let mut guards = Vec::with_capacity(held.len());
    for lock in &held {
        guards.push(lock.lock().await);
    }

    let result = f().await;
    drop(guards);
    result
}
