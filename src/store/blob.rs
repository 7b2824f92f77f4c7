//! Content-addressed blob surface.
//!
//! Tree pages are persisted here. `put` derives the identifier from the
//! bytes themselves, so equal contents always share one blob and identifiers
//! can be trusted as content hashes.

use std::collections::HashMap;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::{RangeId, StorageNamespace};

/// content-addressable blob service, multiplexed across storage namespaces
pub trait BlobStore: Send + Sync {
    /// store `data`, returning its content hash; idempotent
    fn put(&self, ns: &StorageNamespace, data: &[u8]) -> Result<RangeId>;

    fn get(&self, ns: &StorageNamespace, id: &RangeId) -> Result<Vec<u8>>;
}

/// hash bytes the way the blob store addresses them
pub fn content_address(data: &[u8]) -> RangeId {
    let digest = Sha256::digest(data);
    RangeId::from_bytes(digest.into())
}

/// in-memory blob store keyed by (namespace, hash)
#[derive(Debug, Default)]
pub struct MemBlobStore {
    blobs: RwLock<HashMap<(String, RangeId), Vec<u8>>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemBlobStore {
    fn put(&self, ns: &StorageNamespace, data: &[u8]) -> Result<RangeId> {
        let id = content_address(data);
        self.blobs
            .write()
            .insert((ns.as_str().to_string(), id), data.to_vec());
        Ok(id)
    }

    fn get(&self, ns: &StorageNamespace, id: &RangeId) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(&(ns.as_str().to_string(), *id))
            .cloned()
            .ok_or_else(|| Error::not_found("blob", id.to_hex()))
    }
}
