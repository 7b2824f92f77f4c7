//! Commit graph traversal: history log and merge-base.
//!
//! Both walks are best-first over parent edges, keyed by descending creation
//! date with commit id bytes as the deterministic tie-break.

use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::refs::RefManager;
use crate::types::{Commit, CommitId, CommitRecord, RepositoryId};

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    date: DateTime<Utc>,
    id: CommitId,
}

/// Iterator over history in reverse-chronological topological order.
///
/// Follows all parents; every reachable commit is yielded exactly once. The
/// iterator ends after the root (parentless) commit.
pub struct CommitLogIterator {
    ctx: Context,
    refs: RefManager,
    repo: RepositoryId,
    heap: BinaryHeap<HeapKey>,
    loaded: HashMap<CommitId, Commit>,
    visited: HashSet<CommitId>,
    current: Option<CommitRecord>,
    err: Option<Error>,
}

impl CommitLogIterator {
    pub(crate) fn new(
        ctx: Context,
        refs: RefManager,
        repo: RepositoryId,
        from: CommitId,
    ) -> Result<Self> {
        let commit = refs.get_commit(&ctx, &repo, &from)?;
        let mut heap = BinaryHeap::new();
        heap.push(HeapKey {
            date: commit.creation_date,
            id: from,
        });
        let mut loaded = HashMap::new();
        loaded.insert(from, commit);
        let mut visited = HashSet::new();
        visited.insert(from);
        Ok(Self {
            ctx,
            refs,
            repo,
            heap,
            loaded,
            visited,
            current: None,
            err: None,
        })
    }

    pub fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if let Err(e) = self.ctx.check() {
            self.err = Some(e);
            self.current = None;
            return false;
        }
        let key = match self.heap.pop() {
            Some(key) => key,
            None => {
                self.current = None;
                return false;
            }
        };
        let commit = self
            .loaded
            .remove(&key.id)
            .expect("heap entries are always loaded");
        for parent in &commit.parents {
            if !self.visited.insert(*parent) {
                continue;
            }
            match self.refs.get_commit(&self.ctx, &self.repo, parent) {
                Ok(parent_commit) => {
                    self.heap.push(HeapKey {
                        date: parent_commit.creation_date,
                        id: *parent,
                    });
                    self.loaded.insert(*parent, parent_commit);
                }
                Err(e) => {
                    self.err = Some(e);
                    self.current = None;
                    return false;
                }
            }
        }
        self.current = Some(CommitRecord { id: key.id, commit });
        true
    }

    pub fn value(&self) -> Option<&CommitRecord> {
        self.current.as_ref()
    }

    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn take_err(&mut self) -> Option<Error> {
        self.err.take()
    }
}

const SIDE_A: u8 = 1;
const SIDE_B: u8 = 2;
const BOTH: u8 = SIDE_A | SIDE_B;

/// Lowest common ancestor of `a` and `b`.
///
/// One combined best-first walk: every node carries a mask of which sides
/// reached it; masks merge where the walks meet. Because nodes are processed
/// newest-first, the first node popped with both marks has no descendant
/// that is also a common ancestor. Symmetric in `a` and `b`.
pub(crate) fn find_merge_base(
    ctx: &Context,
    refs: &RefManager,
    repo: &RepositoryId,
    a: CommitId,
    b: CommitId,
) -> Result<CommitRecord> {
    let mut mask: HashMap<CommitId, u8> = HashMap::new();
    let mut loaded: HashMap<CommitId, Commit> = HashMap::new();
    let mut expanded: HashSet<CommitId> = HashSet::new();
    let mut heap = BinaryHeap::new();

    for (id, side) in [(a, SIDE_A), (b, SIDE_B)] {
        *mask.entry(id).or_insert(0) |= side;
        if !loaded.contains_key(&id) {
            let commit = refs.get_commit(ctx, repo, &id)?;
            heap.push(HeapKey {
                date: commit.creation_date,
                id,
            });
            loaded.insert(id, commit);
        }
    }

    while let Some(key) = heap.pop() {
        ctx.check()?;
        let m = mask[&key.id];
        if m == BOTH {
            let commit = loaded[&key.id].clone();
            return Ok(CommitRecord { id: key.id, commit });
        }
        if !expanded.insert(key.id) {
            continue;
        }
        let parents = loaded[&key.id].parents.clone();
        for parent in parents {
            let prior = mask.get(&parent).copied().unwrap_or(0);
            let merged = prior | m;
            if merged == prior {
                continue;
            }
            mask.insert(parent, merged);
            if !loaded.contains_key(&parent) {
                loaded.insert(parent, refs.get_commit(ctx, repo, &parent)?);
            }
            heap.push(HeapKey {
                date: loaded[&parent].creation_date,
                id: parent,
            });
        }
    }
    Err(Error::not_found("merge base", format!("{} {}", a.short(), b.short())))
}
