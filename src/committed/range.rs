//! Leaf page construction with content-defined boundaries.

use sha2::{Digest, Sha256};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::proto::{self, RangeRef};
use crate::store::BlobStore;
use crate::types::{EntryRecord, ObjectPath, RangeId, StorageNamespace, TreeId};

/// hard cap on entries per leaf page
pub(crate) const MAX_RANGE_ENTRIES: u64 = 4096;

/// A range ends after `path` when the low nibble of its digest saturates,
/// i.e. on average every 16 entries. The decision depends only on the key,
/// so rewriting any contiguous region re-synchronizes on the same
/// boundaries as writing the whole tree from scratch.
pub(crate) fn is_break(path: &ObjectPath) -> bool {
    let digest = Sha256::digest(path.as_str().as_bytes());
    digest[0] & 0x0F == 0x0F
}

/// a range may be carried over by reference only if a from-scratch write
/// would have ended a page exactly at its max path
pub(crate) fn ends_aligned(range: &RangeRef) -> bool {
    is_break(&range.max_path) || range.count >= MAX_RANGE_ENTRIES
}

pub(crate) fn load_index(
    ctx: &Context,
    blobs: &dyn BlobStore,
    ns: &StorageNamespace,
    tree: &TreeId,
) -> Result<Vec<RangeRef>> {
    ctx.check()?;
    let raw = blobs.get(ns, &RangeId::from_bytes(*tree.as_bytes()))?;
    proto::decode_index(&raw)
}

pub(crate) fn load_range(
    ctx: &Context,
    blobs: &dyn BlobStore,
    ns: &StorageNamespace,
    id: &RangeId,
) -> Result<Vec<EntryRecord>> {
    ctx.check()?;
    let raw = blobs.get(ns, id)?;
    proto::decode_range(&raw)
}

/// Accumulates sorted entries into leaf pages and finally an index page.
///
/// Entries stream in ascending path order, either one at a time (`push`) or
/// as whole untouched pages carried over by reference (`push_range`).
pub(crate) struct RangeWriter<'a> {
    ctx: &'a Context,
    blobs: &'a dyn BlobStore,
    ns: &'a StorageNamespace,
    pending: Vec<EntryRecord>,
    ranges: Vec<RangeRef>,
    last_path: Option<ObjectPath>,
}

impl<'a> RangeWriter<'a> {
    pub fn new(ctx: &'a Context, blobs: &'a dyn BlobStore, ns: &'a StorageNamespace) -> Self {
        Self {
            ctx,
            blobs,
            ns,
            pending: Vec::new(),
            ranges: Vec::new(),
            last_path: None,
        }
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn check_order(&mut self, path: &ObjectPath) -> Result<()> {
        if let Some(last) = &self.last_path {
            if path <= last {
                return Err(Error::invalid_input(format!(
                    "tree entries out of order: {path} after {last}"
                )));
            }
        }
        self.last_path = Some(path.clone());
        Ok(())
    }

    /// append one live entry; tombstones never reach committed pages
    pub fn push(&mut self, record: EntryRecord) -> Result<()> {
        self.ctx.check()?;
        self.check_order(&record.path)?;
        let boundary = is_break(&record.path);
        self.pending.push(record);
        if boundary || self.pending.len() as u64 >= MAX_RANGE_ENTRIES {
            self.flush()?;
        }
        Ok(())
    }

    /// carry an existing page by reference. The caller must ensure no
    /// pending entries are buffered and that the page precedes any entry it
    /// will push later.
    pub fn push_range(&mut self, range: RangeRef) -> Result<()> {
        self.ctx.check()?;
        debug_assert!(self.pending.is_empty());
        self.check_order(&range.min_path)?;
        self.last_path = Some(range.max_path.clone());
        self.ranges.push(range);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let bytes = proto::encode_range(&self.pending)?;
        let id = self.blobs.put(self.ns, &bytes)?;
        self.ranges.push(RangeRef {
            min_path: self.pending.first().unwrap().path.clone(),
            max_path: self.pending.last().unwrap().path.clone(),
            id,
            count: self.pending.len() as u64,
        });
        self.pending.clear();
        Ok(())
    }

    /// flush the tail page and write the index; its hash is the TreeId
    pub fn finish(mut self) -> Result<TreeId> {
        self.flush()?;
        let bytes = proto::encode_index(&self.ranges);
        let id = self.blobs.put(self.ns, &bytes)?;
        Ok(TreeId::from_bytes(*id.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemBlobStore;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn entry(path: &str) -> EntryRecord {
        EntryRecord::new(
            ObjectPath::new(path).unwrap(),
            crate::types::Entry {
                last_modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                address: format!("blk://{path}"),
                etag: "e".to_string(),
                metadata: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn test_writer_round_trip() {
        let ctx = Context::background();
        let blobs = MemBlobStore::new();
        let ns = StorageNamespace::new("mem://t").unwrap();

        let mut writer = RangeWriter::new(&ctx, &blobs, &ns);
        for p in ["a", "b", "c"] {
            writer.push(entry(p)).unwrap();
        }
        let tree = writer.finish().unwrap();

        let index = load_index(&ctx, &blobs, &ns, &tree).unwrap();
        let mut paths = Vec::new();
        for range in &index {
            for record in load_range(&ctx, &blobs, &ns, &range.id).unwrap() {
                paths.push(record.path.as_str().to_string());
            }
        }
        assert_eq!(paths, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_writer_rejects_disorder() {
        let ctx = Context::background();
        let blobs = MemBlobStore::new();
        let ns = StorageNamespace::new("mem://t").unwrap();

        let mut writer = RangeWriter::new(&ctx, &blobs, &ns);
        writer.push(entry("b")).unwrap();
        assert!(writer.push(entry("a")).is_err());
        let mut writer = RangeWriter::new(&ctx, &blobs, &ns);
        writer.push(entry("a")).unwrap();
        assert!(writer.push(entry("a")).is_err());
    }

    #[test]
    fn test_same_entries_same_tree() {
        let ctx = Context::background();
        let blobs = MemBlobStore::new();
        let ns = StorageNamespace::new("mem://t").unwrap();

        let write = || {
            let mut writer = RangeWriter::new(&ctx, &blobs, &ns);
            for i in 0..100 {
                writer.push(entry(&format!("path-{i:04}"))).unwrap();
            }
            writer.finish().unwrap()
        };
        assert_eq!(write(), write());
    }

    #[test]
    fn test_empty_tree_is_writable() {
        let ctx = Context::background();
        let blobs = MemBlobStore::new();
        let ns = StorageNamespace::new("mem://t").unwrap();

        let tree = RangeWriter::new(&ctx, &blobs, &ns).finish().unwrap();
        assert!(load_index(&ctx, &blobs, &ns, &tree).unwrap().is_empty());
    }
}
