//! Apply a sorted change stream onto a tree, producing a new TreeId.

use crate::committed::range::{ends_aligned, load_index, load_range, RangeWriter};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::iter::ValueIterator;
use crate::store::BlobStore;
use crate::types::{EntryRecord, StorageNamespace, TreeId};

/// pull the next change, enforcing strict ascending order with no duplicates
fn next_change(
    changes: &mut dyn ValueIterator<Item = EntryRecord>,
    last: &mut Option<String>,
) -> Result<Option<EntryRecord>> {
    if !changes.next() {
        return match changes.take_err() {
            Some(e) => Err(e),
            None => Ok(None),
        };
    }
    let record = changes.value().unwrap().clone();
    if let Some(prev) = last {
        if record.path.as_str() <= prev.as_str() {
            return Err(Error::invalid_input(format!(
                "change stream out of order: {} after {prev}",
                record.path
            )));
        }
    }
    *last = Some(record.path.as_str().to_string());
    Ok(Some(record))
}

/// push a change to the writer; a tombstone with no base entry is dropped
fn push_change(writer: &mut RangeWriter<'_>, change: EntryRecord) -> Result<()> {
    if change.entry.is_some() {
        writer.push(change)?;
    }
    Ok(())
}

/// Merge `changes` over the entries of `tree`.
///
/// Pages whose span the change stream never touches are carried over by
/// reference; everything else is re-chunked on the same content-defined
/// boundaries a from-scratch write would produce, which keeps the resulting
/// TreeId a pure function of the effective contents.
pub(crate) fn apply(
    ctx: &Context,
    blobs: &dyn BlobStore,
    ns: &StorageNamespace,
    tree: &TreeId,
    changes: &mut dyn ValueIterator<Item = EntryRecord>,
) -> Result<TreeId> {
    let index = load_index(ctx, blobs, ns, tree)?;
    let range_count = index.len();
    let mut writer = RangeWriter::new(ctx, blobs, ns);
    let mut last = None;
    let mut change = next_change(changes, &mut last)?;

    for (i, range) in index.into_iter().enumerate() {
        // changes that fall strictly before this page
        while let Some(c) = &change {
            if c.path >= range.min_path {
                break;
            }
            push_change(&mut writer, change.take().unwrap())?;
            change = next_change(changes, &mut last)?;
        }

        let untouched = change
            .as_ref()
            .map_or(true, |c| c.path > range.max_path);
        let is_last = i + 1 == range_count;
        if untouched
            && writer.pending_is_empty()
            && (ends_aligned(&range) || (is_last && change.is_none()))
        {
            writer.push_range(range)?;
            continue;
        }

        // rewrite: merge the page's entries with the changes in its span
        let page = load_range(ctx, blobs, ns, &range.id)?;
        let mut page_pos = 0;
        loop {
            ctx.check()?;
            let in_span = change
                .as_ref()
                .map_or(false, |c| c.path <= range.max_path);
            let take_change = match (in_span, page.get(page_pos)) {
                (true, Some(base)) => {
                    let c = change.as_ref().unwrap();
                    if c.path == base.path {
                        // overlay wins; consume the base entry
                        page_pos += 1;
                        true
                    } else {
                        c.path < base.path
                    }
                }
                (true, None) => true,
                (false, Some(_)) => false,
                (false, None) => break,
            };
            if take_change {
                push_change(&mut writer, change.take().unwrap())?;
                change = next_change(changes, &mut last)?;
            } else {
                writer.push(page[page_pos].clone())?;
                page_pos += 1;
            }
        }
    }

    // changes past the last page
    while let Some(c) = change.take() {
        push_change(&mut writer, c)?;
        change = next_change(changes, &mut last)?;
    }

    writer.finish()
}
