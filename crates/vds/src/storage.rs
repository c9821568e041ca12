//! Storage traits and the in-memory implementation
//!
//! All state lives in namespaces of `(bucket, key) -> bytes`. Reads and writes
//! happen inside a callback handed a scoped reader or writer; an update either
//! commits all of its writes or none of them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::{Result, VdsError};

pub trait KeyReader {
    /// `Ok(None)` when the key is absent
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>>;
}

pub trait KeyWriter: KeyReader {
    /// Store `value` under `key`, or delete it when `value` is `None`
    fn set(&mut self, bucket: &[u8], key: &[u8], value: Option<Vec<u8>>) -> Result<()>;
}

pub trait StorageReader: Send + Sync {
    fn execute_read_only<T, F>(&self, namespace: &[u8], f: F) -> Result<T>
    where
        F: FnOnce(&dyn KeyReader) -> Result<T>;
}

pub trait StorageWriter: StorageReader {
    /// Run `f` in a transaction. Writes are discarded if `f` fails.
    fn execute_update<T, F>(&self, namespace: &[u8], f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn KeyWriter) -> Result<T>;
}

type BucketKey = (Vec<u8>, Vec<u8>);

/// Write overlay on top of a reader.
///
/// Reads see staged writes (including staged deletes) before falling through
/// to the underlying reader.
pub struct StagedWriter<'a, R: KeyReader + ?Sized> {
    base: &'a R,
    writes: BTreeMap<BucketKey, Option<Vec<u8>>>,
}

impl<'a, R: KeyReader + ?Sized> StagedWriter<'a, R> {
    pub fn new(base: &'a R) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// The final value of every key written, in key order
    pub fn into_writes(self) -> Vec<(Vec<u8>, Vec<u8>, Option<Vec<u8>>)> {
        self.writes
            .into_iter()
            .map(|((bucket, key), value)| (bucket, key, value))
            .collect()
    }
}

impl<R: KeyReader + ?Sized> KeyReader for StagedWriter<'_, R> {
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.writes.get(&(bucket.to_vec(), key.to_vec())) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.get(bucket, key),
        }
    }
}

impl<R: KeyReader + ?Sized> KeyWriter for StagedWriter<'_, R> {
    fn set(&mut self, bucket: &[u8], key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        self.writes.insert((bucket.to_vec(), key.to_vec()), value);
        Ok(())
    }
}

type NamespaceData = HashMap<BucketKey, Vec<u8>>;

struct NamespaceView<'a> {
    data: Option<&'a NamespaceData>,
}

impl KeyReader for NamespaceView<'_> {
    fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .data
            .and_then(|d| d.get(&(bucket.to_vec(), key.to_vec())))
            .cloned())
    }
}

/// In-memory storage (for testing, demos and the default server)
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    namespaces: Arc<RwLock<HashMap<Vec<u8>, NamespaceData>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E>(_: E) -> VdsError {
    VdsError::Storage("storage lock poisoned".to_string())
}

impl StorageReader for InMemoryStorage {
    fn execute_read_only<T, F>(&self, namespace: &[u8], f: F) -> Result<T>
    where
        F: FnOnce(&dyn KeyReader) -> Result<T>,
    {
        let namespaces = self.namespaces.read().map_err(poisoned)?;
        let view = NamespaceView {
            data: namespaces.get(namespace),
        };
        f(&view)
    }
}

impl StorageWriter for InMemoryStorage {
    fn execute_update<T, F>(&self, namespace: &[u8], f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn KeyWriter) -> Result<T>,
    {
        let mut namespaces = self.namespaces.write().map_err(poisoned)?;
        let (rv, writes) = {
            let view = NamespaceView {
                data: namespaces.get(namespace),
            };
            let mut staged = StagedWriter::new(&view);
            let rv = f(&mut staged)?;
            (rv, staged.into_writes())
        };

        let data = namespaces.entry(namespace.to_vec()).or_default();
        for (bucket, key, value) in writes {
            match value {
                Some(v) => {
                    data.insert((bucket, key), v);
                }
                None => {
                    data.remove(&(bucket, key));
                }
            }
        }
        Ok(rv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_are_isolated() {
        let storage = InMemoryStorage::new();
        storage
            .execute_update(b"a", |kw| kw.set(b"b", b"k", Some(b"v".to_vec())))
            .unwrap();

        let in_a = storage.execute_read_only(b"a", |kr| kr.get(b"b", b"k")).unwrap();
        let in_b = storage.execute_read_only(b"b", |kr| kr.get(b"b", b"k")).unwrap();
        assert_eq!(in_a, Some(b"v".to_vec()));
        assert_eq!(in_b, None);
    }

    #[test]
    fn failed_update_leaves_no_writes() {
        let storage = InMemoryStorage::new();
        let res: Result<()> = storage.execute_update(b"ns", |kw| {
            kw.set(b"b", b"k", Some(b"v".to_vec()))?;
            Err(VdsError::InvalidRequest("boom".into()))
        });
        assert!(res.is_err());
        assert_eq!(storage.execute_read_only(b"ns", |kr| kr.get(b"b", b"k")).unwrap(), None);
    }

    #[test]
    fn staged_reads_see_own_writes_and_deletes() {
        let storage = InMemoryStorage::new();
        storage
            .execute_update(b"ns", |kw| {
                kw.set(b"b", b"x", Some(b"1".to_vec()))?;
                kw.set(b"b", b"y", Some(b"2".to_vec()))
            })
            .unwrap();

        let writes = storage
            .execute_read_only(b"ns", |kr| {
                let mut staged = StagedWriter::new(kr);
                staged.set(b"b", b"x", None)?;
                staged.set(b"b", b"z", Some(b"3".to_vec()))?;
                assert_eq!(staged.get(b"b", b"x")?, None);
                assert_eq!(staged.get(b"b", b"y")?, Some(b"2".to_vec()));
                assert_eq!(staged.get(b"b", b"z")?, Some(b"3".to_vec()));
                Ok(staged.into_writes())
            })
            .unwrap();
        assert_eq!(writes.len(), 2);

        storage
            .execute_update(b"ns", |kw| {
                for (bucket, key, value) in writes {
                    kw.set(&bucket, &key, value)?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(storage.execute_read_only(b"ns", |kr| kr.get(b"b", b"x")).unwrap(), None);
        assert_eq!(
            storage.execute_read_only(b"ns", |kr| kr.get(b"b", b"z")).unwrap(),
            Some(b"3".to_vec())
        );
    }
}
