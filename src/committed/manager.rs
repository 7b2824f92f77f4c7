//! The committed-tree manager: point reads, scans, apply, diff and merge.

use std::sync::Arc;

use crate::committed::apply;
use crate::committed::diff::DiffIterator;
use crate::committed::iterator::TreeIterator;
use crate::committed::merge;
use crate::committed::range::{load_index, load_range, RangeWriter};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::iter::ValueIterator;
use crate::store::BlobStore;
use crate::types::{Entry, EntryRecord, ObjectPath, StorageNamespace, TreeId};

/// Owns the mapping TreeId -> ordered entry set.
///
/// Stateless besides the blob store handle; one instance serves any number
/// of repositories, selected per call by storage namespace.
#[derive(Clone)]
pub struct CommittedManager {
    blobs: Arc<dyn BlobStore>,
}

impl CommittedManager {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// the tree with no entries; stored so it is addressable like any other
    pub fn empty_tree(&self, ctx: &Context, ns: &StorageNamespace) -> Result<TreeId> {
        RangeWriter::new(ctx, self.blobs.as_ref(), ns).finish()
    }

    /// point read of `path` within `tree`
    pub fn get_entry(
        &self,
        ctx: &Context,
        ns: &StorageNamespace,
        tree: &TreeId,
        path: &ObjectPath,
    ) -> Result<Entry> {
        let index = load_index(ctx, self.blobs.as_ref(), ns, tree)?;
        let range_idx = index.partition_point(|range| range.max_path < *path);
        if range_idx >= index.len() || index[range_idx].min_path > *path {
            return Err(Error::not_found("entry", path.as_str()));
        }
        let page = load_range(ctx, self.blobs.as_ref(), ns, &index[range_idx].id)?;
        page.binary_search_by(|record| record.path.cmp(path))
            .ok()
            .and_then(|i| page[i].entry.clone())
            .ok_or_else(|| Error::not_found("entry", path.as_str()))
    }

    /// ordered scan of `tree` starting at the least path >= `from`
    pub fn list_entries(
        &self,
        ctx: &Context,
        ns: &StorageNamespace,
        tree: &TreeId,
        from: &str,
    ) -> Result<TreeIterator> {
        TreeIterator::new(ctx.clone(), self.blobs.clone(), ns.clone(), tree, from)
    }

    /// Merge a sorted stream of entry/tombstone overlays onto `tree`.
    ///
    /// The stream must be strictly ascending by path; violations fail with
    /// InvalidInput. The result is content-addressed: equal effective
    /// contents produce equal TreeIds.
    pub fn apply(
        &self,
        ctx: &Context,
        ns: &StorageNamespace,
        tree: &TreeId,
        changes: &mut dyn ValueIterator<Item = EntryRecord>,
    ) -> Result<TreeId> {
        apply::apply(ctx, self.blobs.as_ref(), ns, tree, changes)
    }

    /// stream the differences from `left` toward `right`, with `base` used
    /// to classify two-sided changes as conflicts
    #[allow(clippy::too_many_arguments)]
    pub fn diff(
        &self,
        ctx: &Context,
        ns: &StorageNamespace,
        left: &TreeId,
        right: &TreeId,
        base: &TreeId,
        from: &str,
    ) -> Result<DiffIterator> {
        DiffIterator::new(
            ctx.clone(),
            self.blobs.clone(),
            ns.clone(),
            left,
            right,
            base,
            from,
        )
    }

    /// three-way merge of `right` into `left` over ancestor `base`
    pub fn merge(
        &self,
        ctx: &Context,
        ns: &StorageNamespace,
        left: &TreeId,
        right: &TreeId,
        base: &TreeId,
    ) -> Result<TreeId> {
        merge::merge(ctx, &self.blobs, ns, left, right, base)
    }
}
