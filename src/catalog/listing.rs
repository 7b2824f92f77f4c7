//! Listing machinery: staging overlaid on committed, delimiter grouping,
//! pagination.

use crate::error::{Error, Result};
use crate::iter::ValueIterator;
use crate::types::{EntryRecord, Listing, ObjectPath};

/// Merge of two sorted entry streams, staging over committed.
///
/// On a shared path the staged record wins; staged tombstones suppress the
/// committed entry and are not yielded themselves.
pub(crate) struct StagedOverIterator<A, B> {
    staging: A,
    committed: B,
    staging_cur: Option<EntryRecord>,
    committed_cur: Option<EntryRecord>,
    current: Option<EntryRecord>,
    err: Option<Error>,
}

impl<A, B> StagedOverIterator<A, B>
where
    A: ValueIterator<Item = EntryRecord>,
    B: ValueIterator<Item = EntryRecord>,
{
    pub fn new(staging: A, committed: B) -> Self {
        Self {
            staging,
            committed,
            staging_cur: None,
            committed_cur: None,
            current: None,
            err: None,
        }
    }

    fn fill(&mut self) -> Result<()> {
        if self.staging_cur.is_none() && self.staging.next() {
            self.staging_cur = self.staging.value().cloned();
        }
        if let Some(e) = self.staging.take_err() {
            return Err(e);
        }
        if self.committed_cur.is_none() && self.committed.next() {
            self.committed_cur = self.committed.value().cloned();
        }
        if let Some(e) = self.committed.take_err() {
            return Err(e);
        }
        Ok(())
    }
}

impl<A, B> ValueIterator for StagedOverIterator<A, B>
where
    A: ValueIterator<Item = EntryRecord>,
    B: ValueIterator<Item = EntryRecord>,
{
    type Item = EntryRecord;

    fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        loop {
            if let Err(e) = self.fill() {
                self.err = Some(e);
                self.current = None;
                return false;
            }
            #[derive(Clone, Copy)]
            enum Pick {
                Staged,
                Committed,
                /// equal paths: the staged record shadows the committed one
                Shadow,
            }
            let pick = match (&self.staging_cur, &self.committed_cur) {
                (None, None) => {
                    self.current = None;
                    return false;
                }
                (Some(_), None) => Pick::Staged,
                (None, Some(_)) => Pick::Committed,
                (Some(s), Some(c)) => {
                    if s.path < c.path {
                        Pick::Staged
                    } else if c.path < s.path {
                        Pick::Committed
                    } else {
                        Pick::Shadow
                    }
                }
            };
            let record = match pick {
                Pick::Committed => self.committed_cur.take().unwrap(),
                Pick::Staged => self.staging_cur.take().unwrap(),
                Pick::Shadow => {
                    self.committed_cur = None;
                    self.staging_cur.take().unwrap()
                }
            };
            if !matches!(pick, Pick::Committed) && record.is_tombstone() {
                continue;
            }
            self.current = Some(record);
            return true;
        }
    }

    fn seek_ge(&mut self, key: &str) {
        if self.err.is_some() {
            return;
        }
        self.staging.seek_ge(key);
        self.committed.seek_ge(key);
        self.staging_cur = None;
        self.committed_cur = None;
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

/// the least key sorting after every path that starts with `prefix`, when
/// one can be formed without leaving ASCII
fn skip_key(prefix: &str) -> Option<String> {
    let bytes = prefix.as_bytes();
    let &last = bytes.last()?;
    if last >= 0x7f {
        return None;
    }
    let mut next = bytes.to_vec();
    *next.last_mut().unwrap() = last + 1;
    String::from_utf8(next).ok()
}

/// Group and paginate an entry stream into listings.
///
/// Paths under `prefix` whose remainder contains `delimiter` fold into a
/// single CommonPrefix per group; everything else lists as an entry.
/// Resumes strictly after `after`, returns up to `amount` listings and
/// whether more follow.
pub(crate) fn paginate_listings(
    it: &mut dyn ValueIterator<Item = EntryRecord>,
    prefix: &str,
    after: &str,
    delimiter: &str,
    amount: usize,
) -> Result<(Vec<Listing>, bool)> {
    if amount == 0 {
        return Err(Error::invalid_input("listing amount must be positive"));
    }
    let resume = format!("{after}\0");
    let start = if resume.as_str() > prefix {
        resume.as_str()
    } else {
        prefix
    };
    it.seek_ge(start);

    let mut results: Vec<Listing> = Vec::new();
    let mut has_more = false;
    while it.next() {
        let record = it.value().unwrap().clone();
        let path = record.path.as_str();
        if !path.starts_with(prefix) {
            break;
        }
        let remainder = &path[prefix.len()..];
        let common = match delimiter {
            "" => None,
            d => remainder
                .find(d)
                .map(|i| path[..prefix.len() + i + d.len()].to_string()),
        };
        match common {
            Some(common) => {
                // collapse repeats of the group we just emitted or resumed on
                let resumed = !after.is_empty() && common.as_str() <= after;
                let repeated = results
                    .last()
                    .map_or(false, |prev| prev.path().as_str() == common);
                if resumed || repeated {
                    if let Some(key) = skip_key(&common) {
                        it.seek_ge(&key);
                    }
                    continue;
                }
                if results.len() == amount {
                    has_more = true;
                    break;
                }
                if let Some(key) = skip_key(&common) {
                    it.seek_ge(&key);
                }
                results.push(Listing::CommonPrefix(ObjectPath::new(common)?));
            }
            None => {
                if results.len() == amount {
                    has_more = true;
                    break;
                }
                results.push(Listing::Object(record));
            }
        }
    }
    if let Some(e) = it.take_err() {
        return Err(e);
    }
    Ok((results, has_more))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::SliceIterator;
    use crate::types::Entry;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn entry(tag: &str) -> Entry {
        Entry {
            last_modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            address: format!("blk://{tag}"),
            etag: tag.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    fn record(path: &str, tag: &str) -> EntryRecord {
        EntryRecord::new(ObjectPath::new(path).unwrap(), entry(tag))
    }

    fn tombstone(path: &str) -> EntryRecord {
        EntryRecord::tombstone(ObjectPath::new(path).unwrap())
    }

    fn merged(
        staging: Vec<EntryRecord>,
        committed: Vec<EntryRecord>,
    ) -> StagedOverIterator<SliceIterator<EntryRecord>, SliceIterator<EntryRecord>> {
        StagedOverIterator::new(SliceIterator::new(staging), SliceIterator::new(committed))
    }

    fn drain(it: &mut dyn ValueIterator<Item = EntryRecord>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while it.next() {
            let record = it.value().unwrap();
            out.push((
                record.path.as_str().to_string(),
                record.entry.as_ref().unwrap().etag.clone(),
            ));
        }
        out
    }

    #[test]
    fn test_staged_over_committed_precedence() {
        let mut it = merged(
            vec![record("a", "staged"), record("c", "staged")],
            vec![record("a", "committed"), record("b", "committed")],
        );
        assert_eq!(
            drain(&mut it),
            vec![
                ("a".to_string(), "staged".to_string()),
                ("b".to_string(), "committed".to_string()),
                ("c".to_string(), "staged".to_string()),
            ]
        );
    }

    #[test]
    fn test_tombstone_suppresses_committed() {
        let mut it = merged(
            vec![tombstone("a")],
            vec![record("a", "committed"), record("b", "committed")],
        );
        assert_eq!(drain(&mut it), vec![("b".to_string(), "committed".to_string())]);
    }

    #[test]
    fn test_delimiter_grouping() {
        // the S7 shape: a/x, a/y collapse under a/, b stays an entry
        let mut it = merged(
            vec![],
            vec![record("a/x", "1"), record("a/y", "2"), record("b", "3")],
        );
        let (listings, has_more) = paginate_listings(&mut it, "", "", "/", 10).unwrap();
        assert!(!has_more);
        assert_eq!(listings.len(), 2);
        assert!(matches!(&listings[0], Listing::CommonPrefix(p) if p.as_str() == "a/"));
        assert!(matches!(&listings[1], Listing::Object(r) if r.path.as_str() == "b"));
    }

    #[test]
    fn test_prefix_strip_and_nested_delimiter() {
        let mut it = merged(
            vec![],
            vec![
                record("logs/2024/jan", "1"),
                record("logs/2024/feb", "2"),
                record("logs/2025/jan", "3"),
                record("logs/readme", "4"),
            ],
        );
        let (listings, _) = paginate_listings(&mut it, "logs/", "", "/", 10).unwrap();
        let shown: Vec<_> = listings.iter().map(|l| l.path().as_str().to_string()).collect();
        assert_eq!(shown, vec!["logs/2024/", "logs/2025/", "logs/readme"]);
    }

    #[test]
    fn test_pagination_and_resume() {
        let committed = vec![
            record("a/x", "1"),
            record("a/y", "2"),
            record("b", "3"),
            record("c/z", "4"),
            record("d", "5"),
        ];
        let mut it = merged(vec![], committed.clone());
        let (page1, has_more) = paginate_listings(&mut it, "", "", "/", 2).unwrap();
        assert!(has_more);
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[1].path().as_str(), "b");

        // resume after the last listing of page 1
        let mut it = merged(vec![], committed);
        let (page2, has_more) = paginate_listings(&mut it, "", "b", "/", 10).unwrap();
        assert!(!has_more);
        let shown: Vec<_> = page2.iter().map(|l| l.path().as_str().to_string()).collect();
        assert_eq!(shown, vec!["c/", "d"]);
    }

    #[test]
    fn test_resume_after_common_prefix_skips_group() {
        let committed = vec![record("a/x", "1"), record("a/y", "2"), record("b", "3")];
        let mut it = merged(vec![], committed);
        let (page, _) = paginate_listings(&mut it, "", "a/", "/", 10).unwrap();
        let shown: Vec<_> = page.iter().map(|l| l.path().as_str().to_string()).collect();
        assert_eq!(shown, vec!["b"]);
    }

    #[test]
    fn test_no_delimiter_lists_raw_entries() {
        let mut it = merged(vec![], vec![record("a/x", "1"), record("b", "2")]);
        let (listings, _) = paginate_listings(&mut it, "", "", "", 10).unwrap();
        assert_eq!(listings.len(), 2);
        assert!(matches!(&listings[0], Listing::Object(_)));
    }

    #[test]
    fn test_zero_amount_is_invalid() {
        let mut it = merged(vec![], vec![]);
        let err = paginate_listings(&mut it, "", "", "/", 0).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
