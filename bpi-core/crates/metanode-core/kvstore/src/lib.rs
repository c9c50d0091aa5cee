//! Typed, prefixed facade over an ordered byte-keyed store.
//!
//! Wraps `sled` (already the workspace's embedded-storage dependency) behind
//! the narrow interface the rest of the node actually needs: `get`/`put`/
//! `del`, an ordered `scan_prefix`, and an atomic `batch`. Every persistent
//! key used elsewhere in this workspace is routed through here so that
//! prefix ordering and durability semantics stay in one place.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Errors returned by the KV-store facade.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("record at key {0:?} failed to deserialize and was skipped")]
    Corrupt(Vec<u8>),
}

pub type KvResult<T> = Result<T, KvError>;

/// A single write queued inside a `Batch`.
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
}

/// An atomic set of writes. Nothing is visible to readers until `commit`.
#[derive(Default)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        self.ops.push(Op::Put(key.as_ref().to_vec(), value.as_ref().to_vec()));
        self
    }

    pub fn put_json<T: Serialize>(&mut self, key: impl AsRef<[u8]>, value: &T) -> KvResult<&mut Self> {
        let bytes = serde_json::to_vec(value)?;
        self.ops.push(Op::Put(key.as_ref().to_vec(), bytes));
        Ok(self)
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.ops.push(Op::Del(key.as_ref().to_vec()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered byte-keyed store with atomic batch commits and prefix scans.
///
/// Durability: every `commit`/`put` goes through `sled::Tree::apply_batch`
/// followed by an explicit `flush`, giving fsync-equivalent semantics for
/// invariant-critical writes (bond registration, audit entries, anchors) as
/// required by spec.md §4.1.
#[derive(Clone)]
pub struct KvStore {
    tree: sled::Tree,
}

impl KvStore {
    /// Open (or create) a store at `path`, using `tree_name` as the sled
    /// tree/namespace. Separate trees give separate subsystems independent
    /// key spaces while sharing one on-disk database file.
    pub fn open(path: impl AsRef<Path>, tree_name: &str) -> KvResult<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(tree_name)?;
        Ok(Self { tree })
    }

    /// In-memory store for tests; never persisted.
    pub fn temporary(tree_name: &str) -> KvResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree(tree_name)?;
        Ok(Self { tree })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> KvResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: impl AsRef<[u8]>) -> KvResult<Option<T>> {
        match self.tree.get(key.as_ref())? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(v) => Ok(Some(v)),
                Err(_) => {
                    tracing::warn!(key = ?key.as_ref(), "kvstore: corrupt record, skipping");
                    Err(KvError::Corrupt(key.as_ref().to_vec()))
                }
            },
            None => Ok(None),
        }
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> KvResult<()> {
        self.tree.insert(key.as_ref(), value.as_ref())?;
        self.tree.flush()?;
        Ok(())
    }

    pub fn put_json<T: Serialize>(&self, key: impl AsRef<[u8]>, value: &T) -> KvResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, bytes)
    }

    pub fn del(&self, key: impl AsRef<[u8]>) -> KvResult<()> {
        self.tree.remove(key.as_ref())?;
        self.tree.flush()?;
        Ok(())
    }

    /// Ordered iteration over every key carrying `prefix`. Deserialization
    /// failures are logged and skipped rather than aborting the scan
    /// (spec.md §4.2 "corruption of an individual serialized record").
    pub fn scan_prefix_json<T: DeserializeOwned>(
        &self,
        prefix: impl AsRef<[u8]>,
    ) -> impl Iterator<Item = (Vec<u8>, T)> + '_ {
        self.tree.scan_prefix(prefix).filter_map(|entry| match entry {
            Ok((k, v)) => match serde_json::from_slice::<T>(&v) {
                Ok(val) => Some((k.to_vec(), val)),
                Err(e) => {
                    tracing::warn!(key = ?k, error = %e, "kvstore: skipping corrupt record during scan");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "kvstore: scan_prefix iteration error");
                None
            }
        })
    }

    pub fn scan_prefix_raw(&self, prefix: impl AsRef<[u8]>) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + '_ {
        self.tree.scan_prefix(prefix).filter_map(|entry| entry.ok().map(|(k, v)| (k.to_vec(), v.to_vec())))
    }

    /// Commit a batch atomically: either all writes land or none do.
    pub fn commit(&self, batch: Batch) -> KvResult<()> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                Op::Put(k, v) => sled_batch.insert(k, v),
                Op::Del(k) => sled_batch.remove(k),
            }
        }
        self.tree.apply_batch(sled_batch)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Monotonic id generator backed by a sled counter, used for append-only
    /// logs whose id ordering must match storage-key ordering (spec.md §8).
    pub fn next_id(&self, counter_key: impl AsRef<[u8]>) -> KvResult<u64> {
        let new = self.tree.update_and_fetch(counter_key, |old| {
            let n = old.map(|b| u64::from_be_bytes(b.try_into().unwrap_or([0; 8]))).unwrap_or(0);
            Some((n + 1).to_be_bytes().to_vec())
        })?;
        Ok(new.map(|b| u64::from_be_bytes(b.as_ref().try_into().unwrap())).unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn put_get_roundtrip() {
        let kv = KvStore::temporary("t1").unwrap();
        let s = Sample { a: 7, b: "x".into() };
        kv.put_json(b"k1", &s).unwrap();
        let got: Sample = kv.get_json(b"k1").unwrap().unwrap();
        assert_eq!(got, s);
    }

    #[test]
    fn scan_prefix_is_ordered_and_skips_corruption() {
        let kv = KvStore::temporary("t2").unwrap();
        kv.put_json(b"p_a", &Sample { a: 1, b: "a".into() }).unwrap();
        kv.put_json(b"p_b", &Sample { a: 2, b: "b".into() }).unwrap();
        kv.put(b"p_c", b"not json").unwrap();
        let out: Vec<_> = kv.scan_prefix_json::<Sample>(b"p_").collect();
        assert_eq!(out.len(), 2);
        assert!(out[0].0 < out[1].0);
    }

    #[test]
    fn batch_is_atomic() {
        let kv = KvStore::temporary("t3").unwrap();
        let mut batch = Batch::new();
        batch.put_json(b"x", &Sample { a: 1, b: "1".into() }).unwrap();
        batch.put_json(b"y", &Sample { a: 2, b: "2".into() }).unwrap();
        kv.commit(batch).unwrap();
        assert!(kv.get(b"x").unwrap().is_some());
        assert!(kv.get(b"y").unwrap().is_some());
    }

    #[test]
    fn next_id_is_monotonic() {
        let kv = KvStore::temporary("t4").unwrap();
        let a = kv.next_id(b"__ctr").unwrap();
        let b = kv.next_id(b"__ctr").unwrap();
        assert!(b > a);
    }
}
