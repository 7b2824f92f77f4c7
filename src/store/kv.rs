//! Key-value store surface.
//!
//! Keys are `/`-separated UTF-8 segments; identifier validation guarantees a
//! segment never contains the separator, so prefix scans cannot bleed across
//! namespaces. The single write primitive beyond blind `set` is a single-key
//! compare-and-set, which is all the coordination the catalog needs.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// transactional key-value store with ordered iteration
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// single-key compare-and-set. `expected` is the serialized prior value;
    /// `None` means the key must not exist (create-only). A mismatch fails
    /// with [`Error::CasFailed`].
    fn set_if(&self, key: &[u8], value: &[u8], expected: Option<&[u8]>) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// remove every key starting with `prefix`
    fn delete_prefix(&self, prefix: &[u8]) -> Result<()>;

    /// ascending scan of keys with `prefix`, starting at the least key >=
    /// `from` (an absolute key). Returns a point-in-time snapshot.
    fn scan(&self, prefix: &[u8], from: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// in-memory store over a sorted map
#[derive(Debug, Default)]
pub struct MemKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn set_if(&self, key: &[u8], value: &[u8], expected: Option<&[u8]>) -> Result<()> {
        let mut data = self.data.write();
        let current = data.get(key).map(|v| v.as_slice());
        if current != expected {
            return Err(Error::CasFailed {
                key: String::from_utf8_lossy(key).into_owned(),
            });
        }
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let doomed: Vec<Vec<u8>> = data
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            data.remove(&key);
        }
        Ok(())
    }

    fn scan(&self, prefix: &[u8], from: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let start = if from > prefix { from } else { prefix };
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
