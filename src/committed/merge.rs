//! Three-way merge of committed trees.

use std::sync::Arc;

use tracing::debug;

use crate::committed::apply::apply;
use crate::committed::iterator::TreeIterator;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::iter::{SliceIterator, ValueIterator};
use crate::store::BlobStore;
use crate::types::{Entry, EntryRecord, ObjectPath, StorageNamespace, TreeId};

fn same_value(a: Option<&Entry>, b: Option<&Entry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_value(b),
        _ => false,
    }
}

fn advance(it: &mut TreeIterator, slot: &mut Option<EntryRecord>) -> Result<()> {
    if slot.is_none() {
        if it.next() {
            *slot = it.value().cloned();
        } else if let Some(e) = it.take_err() {
            return Err(e);
        }
    }
    Ok(())
}

/// take the record out of a slot if it sits at `path`
fn take_at(slot: &mut Option<EntryRecord>, path: &ObjectPath) -> Option<EntryRecord> {
    if slot.as_ref().map(|record| &record.path) == Some(path) {
        slot.take()
    } else {
        None
    }
}

/// Merge `right` into `left` relative to their common ancestor `base`.
///
/// Walks the three trees in lockstep collecting right-vs-base changes that
/// do not collide with left-vs-base changes; colliding paths are gathered
/// and reported together in one Conflict error. When nothing conflicts the
/// change set streams into [`apply`] on top of `left`. Nothing is persisted
/// on failure.
pub(crate) fn merge(
    ctx: &Context,
    blobs: &Arc<dyn BlobStore>,
    ns: &StorageNamespace,
    left: &TreeId,
    right: &TreeId,
    base: &TreeId,
) -> Result<TreeId> {
    if left == right {
        return Ok(*left);
    }

    let mut left_it = TreeIterator::new(ctx.clone(), blobs.clone(), ns.clone(), left, "")?;
    let mut right_it = TreeIterator::new(ctx.clone(), blobs.clone(), ns.clone(), right, "")?;
    let mut base_it = TreeIterator::new(ctx.clone(), blobs.clone(), ns.clone(), base, "")?;

    let mut left_cur: Option<EntryRecord> = None;
    let mut right_cur: Option<EntryRecord> = None;
    let mut base_cur: Option<EntryRecord> = None;

    let mut changes: Vec<EntryRecord> = Vec::new();
    let mut conflicts: Vec<ObjectPath> = Vec::new();

    loop {
        ctx.check()?;
        advance(&mut left_it, &mut left_cur)?;
        advance(&mut right_it, &mut right_cur)?;
        advance(&mut base_it, &mut base_cur)?;

        let path = match [&left_cur, &right_cur, &base_cur]
            .into_iter()
            .flatten()
            .map(|record| &record.path)
            .min()
        {
            Some(path) => path.clone(),
            None => break,
        };

        let l = take_at(&mut left_cur, &path);
        let r = take_at(&mut right_cur, &path);
        let b = take_at(&mut base_cur, &path);
        let l_entry = l.as_ref().and_then(|record| record.entry.as_ref());
        let r_entry = r.as_ref().and_then(|record| record.entry.as_ref());
        let b_entry = b.as_ref().and_then(|record| record.entry.as_ref());

        if same_value(l_entry, r_entry) {
            continue;
        }
        let left_changed = !same_value(l_entry, b_entry);
        let right_changed = !same_value(r_entry, b_entry);
        if left_changed && right_changed {
            conflicts.push(path);
        } else if right_changed {
            // right's change applies onto left; absence is a tombstone
            changes.push(EntryRecord {
                path,
                entry: r_entry.cloned(),
            });
        }
    }

    if !conflicts.is_empty() {
        return Err(Error::Conflict { paths: conflicts });
    }
    if changes.is_empty() {
        return Ok(*left);
    }
    debug!(
        changes = changes.len(),
        left = %left.short(),
        right = %right.short(),
        "merging trees"
    );
    let mut stream = SliceIterator::new(changes);
    apply(ctx, blobs.as_ref(), ns, left, &mut stream)
}
