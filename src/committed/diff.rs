//! Three-way diff between committed trees.

use std::sync::Arc;

use crate::committed::iterator::TreeIterator;
use crate::committed::range::{load_index, load_range};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::iter::ValueIterator;
use crate::proto::RangeRef;
use crate::store::BlobStore;
use crate::types::{DiffEntry, DiffType, Entry, EntryRecord, StorageNamespace, TreeId};

fn same_value(a: Option<&Entry>, b: Option<&Entry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_value(b),
        _ => false,
    }
}

/// classify one differing path; `base` is the common-ancestor value
pub(crate) fn classify(
    left: Option<&Entry>,
    right: Option<&Entry>,
    base: Option<&Entry>,
) -> DiffType {
    let left_changed = !same_value(left, base);
    let right_changed = !same_value(right, base);
    if left_changed && right_changed {
        DiffType::Conflict
    } else if left.is_none() {
        DiffType::Added
    } else if right.is_none() {
        DiffType::Removed
    } else {
        DiffType::Changed
    }
}

/// point lookups into the base tree, cached page by page; diff paths arrive
/// in ascending order so the cache almost always hits
struct BaseReader {
    ctx: Context,
    blobs: Arc<dyn BlobStore>,
    ns: StorageNamespace,
    index: Vec<RangeRef>,
    cached: Option<(usize, Vec<EntryRecord>)>,
}

impl BaseReader {
    fn new(
        ctx: Context,
        blobs: Arc<dyn BlobStore>,
        ns: StorageNamespace,
        tree: &TreeId,
    ) -> Result<Self> {
        let index = load_index(&ctx, blobs.as_ref(), &ns, tree)?;
        Ok(Self {
            ctx,
            blobs,
            ns,
            index,
            cached: None,
        })
    }

    fn get(&mut self, path: &str) -> Result<Option<Entry>> {
        let range_idx = self
            .index
            .partition_point(|range| range.max_path.as_str() < path);
        if range_idx >= self.index.len() || self.index[range_idx].min_path.as_str() > path {
            return Ok(None);
        }
        let cached_idx = self.cached.as_ref().map(|(i, _)| *i);
        if cached_idx != Some(range_idx) {
            let page = load_range(
                &self.ctx,
                self.blobs.as_ref(),
                &self.ns,
                &self.index[range_idx].id,
            )?;
            self.cached = Some((range_idx, page));
        }
        let page = &self.cached.as_ref().unwrap().1;
        Ok(page
            .binary_search_by(|record| record.path.as_str().cmp(path))
            .ok()
            .and_then(|i| page[i].entry.clone()))
    }
}

/// Streams the differences between `left` and `right`, from left's
/// perspective toward right, consulting `base` only to upgrade a two-sided
/// change to a Conflict.
pub struct DiffIterator {
    ctx: Context,
    left: TreeIterator,
    right: TreeIterator,
    base: BaseReader,
    left_cur: Option<EntryRecord>,
    right_cur: Option<EntryRecord>,
    current: Option<DiffEntry>,
    err: Option<Error>,
}

impl DiffIterator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Context,
        blobs: Arc<dyn BlobStore>,
        ns: StorageNamespace,
        left: &TreeId,
        right: &TreeId,
        base: &TreeId,
        from: &str,
    ) -> Result<Self> {
        let left_it = TreeIterator::new(ctx.clone(), blobs.clone(), ns.clone(), left, from)?;
        let right_it = TreeIterator::new(ctx.clone(), blobs.clone(), ns.clone(), right, from)?;
        let base_reader = BaseReader::new(ctx.clone(), blobs, ns, base)?;
        Ok(Self {
            ctx,
            left: left_it,
            right: right_it,
            base: base_reader,
            left_cur: None,
            right_cur: None,
            current: None,
            err: None,
        })
    }

    fn fill(&mut self) -> Result<()> {
        if self.left_cur.is_none() && self.left.next() {
            self.left_cur = self.left.value().cloned();
        }
        if let Some(e) = self.left.take_err() {
            return Err(e);
        }
        if self.right_cur.is_none() && self.right.next() {
            self.right_cur = self.right.value().cloned();
        }
        if let Some(e) = self.right.take_err() {
            return Err(e);
        }
        Ok(())
    }

    fn step(&mut self) -> Result<Option<DiffEntry>> {
        loop {
            self.ctx.check()?;
            self.fill()?;
            let (left, right) = match (&self.left_cur, &self.right_cur) {
                (None, None) => return Ok(None),
                (Some(l), None) => (Some(l.clone()), None),
                (None, Some(r)) => (None, Some(r.clone())),
                (Some(l), Some(r)) => {
                    if l.path < r.path {
                        (Some(l.clone()), None)
                    } else if r.path < l.path {
                        (None, Some(r.clone()))
                    } else {
                        (Some(l.clone()), Some(r.clone()))
                    }
                }
            };
            if left.is_some() {
                self.left_cur = None;
            }
            if right.is_some() {
                self.right_cur = None;
            }
            let path = left
                .as_ref()
                .or(right.as_ref())
                .map(|record| record.path.clone())
                .unwrap();
            let left_entry = left.as_ref().and_then(|record| record.entry.as_ref());
            let right_entry = right.as_ref().and_then(|record| record.entry.as_ref());
            if same_value(left_entry, right_entry) {
                continue;
            }
            let base_entry = self.base.get(path.as_str())?;
            let kind = classify(left_entry, right_entry, base_entry.as_ref());
            return Ok(Some(DiffEntry { path, kind }));
        }
    }
}

impl ValueIterator for DiffIterator {
    type Item = DiffEntry;

    fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        match self.step() {
            Ok(Some(entry)) => {
                self.current = Some(entry);
                true
            }
            Ok(None) => {
                self.current = None;
                false
            }
            Err(e) => {
                self.err = Some(e);
                self.current = None;
                false
            }
        }
    }

    fn seek_ge(&mut self, key: &str) {
        if self.err.is_some() {
            return;
        }
        self.left.seek_ge(key);
        self.right.seek_ge(key);
        self.left_cur = None;
        self.right_cur = None;
        self.current = None;
    }

    fn value(&self) -> Option<&DiffEntry> {
        self.current.as_ref()
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn take_err(&mut self) -> Option<Error> {
        self.err.take()
    }
}
