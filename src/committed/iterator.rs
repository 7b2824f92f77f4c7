//! Ordered scan over a committed tree.

use std::sync::Arc;

use crate::committed::range::{load_index, load_range};
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::iter::ValueIterator;
use crate::proto::RangeRef;
use crate::store::BlobStore;
use crate::types::{EntryRecord, StorageNamespace, TreeId};

/// Single-pass iterator over all entries of a tree, ascending by path.
///
/// Pages load lazily; `seek_ge` jumps straight to the page covering the key.
pub struct TreeIterator {
    ctx: Context,
    blobs: Arc<dyn BlobStore>,
    ns: StorageNamespace,
    index: Vec<RangeRef>,
    /// next page to load
    range_idx: usize,
    page: Vec<EntryRecord>,
    page_pos: usize,
    /// position within the next loaded page, set by seek_ge
    pending_seek: Option<String>,
    current: Option<EntryRecord>,
    err: Option<Error>,
}

impl TreeIterator {
    pub(crate) fn new(
        ctx: Context,
        blobs: Arc<dyn BlobStore>,
        ns: StorageNamespace,
        tree: &TreeId,
        from: &str,
    ) -> Result<Self> {
        let index = load_index(&ctx, blobs.as_ref(), &ns, tree)?;
        let mut it = Self {
            ctx,
            blobs,
            ns,
            index,
            range_idx: 0,
            page: Vec::new(),
            page_pos: 0,
            pending_seek: None,
            current: None,
            err: None,
        };
        if !from.is_empty() {
            it.seek_ge(from);
        }
        Ok(it)
    }
}

impl ValueIterator for TreeIterator {
    type Item = EntryRecord;

    fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if let Err(e) = self.ctx.check() {
            self.err = Some(e);
            self.current = None;
            return false;
        }
        loop {
            if self.page_pos < self.page.len() {
                self.current = Some(self.page[self.page_pos].clone());
                self.page_pos += 1;
                return true;
            }
            if self.range_idx >= self.index.len() {
                self.current = None;
                return false;
            }
            let range = &self.index[self.range_idx];
            self.range_idx += 1;
            match load_range(&self.ctx, self.blobs.as_ref(), &self.ns, &range.id) {
                Ok(page) => {
                    self.page = page;
                    self.page_pos = match self.pending_seek.take() {
                        Some(key) => self
                            .page
                            .partition_point(|record| record.path.as_str() < key.as_str()),
                        None => 0,
                    };
                }
                Err(e) => {
                    self.err = Some(e);
                    self.current = None;
                    return false;
                }
            }
        }
    }

    fn seek_ge(&mut self, key: &str) {
        if self.err.is_some() {
            return;
        }
        self.range_idx = self
            .index
            .partition_point(|range| range.max_path.as_str() < key);
        self.page = Vec::new();
        self.page_pos = 0;
        self.pending_seek = Some(key.to_string());
        self.current = None;
    }

    fn value(&self) -> Option<&EntryRecord> {
        self.current.as_ref()
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn take_err(&mut self) -> Option<Error> {
        self.err.take()
    }
}
