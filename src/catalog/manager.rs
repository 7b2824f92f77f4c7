//! The Catalog: user-facing CRUD, branching, commits, diffs and merges.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::catalog::listing::{paginate_listings, StagedOverIterator};
use crate::committed::CommittedManager;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::iter::{SliceIterator, ValueIterator};
use crate::refs::RefManager;
use crate::staging::StagingManager;
use crate::store::{BlobStore, KvStore, MemBlobStore, MemKvStore};
use crate::types::{
    Branch, BranchId, BranchRecord, Commit, CommitId, CommitRecord, DiffEntry, DiffType, Entry,
    EntryRecord, Listing, ObjectPath, Ref, Repository, RepositoryId, RepositoryRecord,
    StagingToken, StorageNamespace, Tag, TagId, TagRecord,
};

/// attempts at the branch compare-and-set before surfacing the conflict
const COMMIT_RETRIES: usize = 3;

/// committer recorded on repository-created commits
const SYSTEM_COMMITTER: &str = "catalog";

/// A versioned object catalog over a KV store and a blob store.
pub struct Catalog {
    refs: RefManager,
    committed: CommittedManager,
    staging: StagingManager,
}

impl Catalog {
    pub fn new(kv: Arc<dyn KvStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            refs: RefManager::new(kv.clone()),
            committed: CommittedManager::new(blobs),
            staging: StagingManager::new(kv),
        }
    }

    /// a catalog over in-memory stores; state dies with the process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemKvStore::new()), Arc::new(MemBlobStore::new()))
    }

    fn namespace(&self, ctx: &Context, repo: &RepositoryId) -> Result<StorageNamespace> {
        Ok(self.refs.get_repository(ctx, repo)?.storage_namespace)
    }

    // ---- repositories ----

    /// Create a repository with an initial empty commit on `default_branch`.
    pub fn create_repository(
        &self,
        ctx: &Context,
        id: &RepositoryId,
        storage_namespace: StorageNamespace,
        default_branch: BranchId,
    ) -> Result<RepositoryRecord> {
        let now = Utc::now();
        let repository = Repository {
            storage_namespace: storage_namespace.clone(),
            creation_date: now,
            default_branch: default_branch.clone(),
        };
        let tree_id = self.committed.empty_tree(ctx, &storage_namespace)?;
        let initial = Commit {
            committer: SYSTEM_COMMITTER.to_string(),
            message: "Repository created".to_string(),
            tree_id,
            creation_date: now,
            parents: Vec::new(),
            metadata: BTreeMap::new(),
        };
        let commit_id = self.refs.add_commit(ctx, id, &initial)?;
        let token = StagingToken::generate();
        let branch = Branch {
            commit_id,
            staging_token: token.clone(),
        };
        self.refs.create_repository(ctx, id, &repository, &branch)?;
        self.staging.set_current_token(ctx, id, &default_branch, &token)?;
        Ok(RepositoryRecord {
            id: id.clone(),
            repository,
        })
    }

    pub fn get_repository(&self, ctx: &Context, id: &RepositoryId) -> Result<Repository> {
        self.refs.get_repository(ctx, id)
    }

    pub fn list_repositories(
        &self,
        ctx: &Context,
        from: &str,
    ) -> Result<SliceIterator<RepositoryRecord>> {
        self.refs.list_repositories(ctx, from)
    }

    /// Delete the repository, its refs and all staged state.
    pub fn delete_repository(&self, ctx: &Context, id: &RepositoryId) -> Result<()> {
        self.refs.delete_repository(ctx, id)?;
        self.staging.drop_repository(ctx, id)
    }

    // ---- branches, tags, refs ----

    /// Create a branch pointing wherever `source` resolves, with a fresh
    /// staging token.
    pub fn create_branch(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        source: &Ref,
    ) -> Result<BranchRecord> {
        self.refs.get_repository(ctx, repo)?;
        let (commit_id, _) = self.refs.resolve(ctx, repo, source)?;
        let token = StagingToken::generate();
        let record = Branch {
            commit_id,
            staging_token: token.clone(),
        };
        self.refs
            .set_branch_if(ctx, repo, branch, &record, None)
            .map_err(|e| match e {
                Error::CasFailed { .. } => Error::already_exists("branch", branch.as_str()),
                other => other,
            })?;
        self.staging.set_current_token(ctx, repo, branch, &token)?;
        debug!(repo = %repo, branch = %branch, source = %source, "branch created");
        Ok(BranchRecord {
            id: branch.clone(),
            branch: record,
        })
    }

    pub fn get_branch(&self, ctx: &Context, repo: &RepositoryId, branch: &BranchId) -> Result<Branch> {
        self.refs.get_branch(ctx, repo, branch)
    }

    /// Delete a branch and its staged state. The default branch stays.
    pub fn delete_branch(&self, ctx: &Context, repo: &RepositoryId, branch: &BranchId) -> Result<()> {
        let repository = self.refs.get_repository(ctx, repo)?;
        if *branch == repository.default_branch {
            return Err(Error::invalid_input("cannot delete the default branch"));
        }
        self.refs.delete_branch(ctx, repo, branch)?;
        self.staging.drop_branch(ctx, repo, branch)
    }

    pub fn list_branches(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        from: &str,
    ) -> Result<SliceIterator<BranchRecord>> {
        self.refs.list_branches(ctx, repo, from)
    }

    pub fn create_tag(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        tag: &TagId,
        target: &Ref,
    ) -> Result<TagRecord> {
        self.refs.get_repository(ctx, repo)?;
        let (commit_id, _) = self.refs.resolve(ctx, repo, target)?;
        let record = Tag { commit_id };
        self.refs.create_tag(ctx, repo, tag, &record)?;
        Ok(TagRecord {
            id: tag.clone(),
            tag: record,
        })
    }

    pub fn get_tag(&self, ctx: &Context, repo: &RepositoryId, tag: &TagId) -> Result<Tag> {
        self.refs.get_tag(ctx, repo, tag)
    }

    pub fn delete_tag(&self, ctx: &Context, repo: &RepositoryId, tag: &TagId) -> Result<()> {
        self.refs.delete_tag(ctx, repo, tag)
    }

    pub fn list_tags(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        from: &str,
    ) -> Result<SliceIterator<TagRecord>> {
        self.refs.list_tags(ctx, repo, from)
    }

    /// Resolve a ref (commit digest, digest prefix, branch, tag) to a commit.
    pub fn dereference(&self, ctx: &Context, repo: &RepositoryId, r: &Ref) -> Result<CommitId> {
        self.refs.dereference(ctx, repo, r)
    }

    pub fn get_commit(&self, ctx: &Context, repo: &RepositoryId, id: &CommitId) -> Result<Commit> {
        self.refs.get_commit(ctx, repo, id)
    }

    /// History of `from`, newest first, up to `amount` commits.
    pub fn log(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        from: CommitId,
        amount: usize,
    ) -> Result<(Vec<CommitRecord>, bool)> {
        if amount == 0 {
            return Err(Error::invalid_input("log amount must be positive"));
        }
        let mut it = self.refs.log(ctx, repo, from)?;
        let mut out = Vec::new();
        let mut has_more = false;
        while it.next() {
            if out.len() == amount {
                has_more = true;
                break;
            }
            out.push(it.value().unwrap().clone());
        }
        if let Some(e) = it.take_err() {
            return Err(e);
        }
        Ok((out, has_more))
    }

    // ---- entries ----

    /// Read `path` as seen from `r`: staging first when `r` is a branch,
    /// the committed tree otherwise.
    pub fn get_entry(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        r: &Ref,
        path: &ObjectPath,
    ) -> Result<Entry> {
        let repository = self.refs.get_repository(ctx, repo)?;
        let (commit_id, branch) = self.refs.resolve(ctx, repo, r)?;
        if let Some(branch) = branch {
            let token = self.staging.current_token(ctx, repo, &branch.id)?;
            match self.staging.get_entry(ctx, repo, &branch.id, &token, path) {
                Ok(Some(entry)) => return Ok(entry),
                // a staged tombstone hides the committed entry
                Ok(None) => return Err(Error::not_found("entry", path.as_str())),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        let commit = self.refs.get_commit(ctx, repo, &commit_id)?;
        self.committed
            .get_entry(ctx, &repository.storage_namespace, &commit.tree_id, path)
    }

    /// Stage an entry on a branch. Never touches committed state.
    pub fn set_entry(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        path: &ObjectPath,
        entry: Entry,
    ) -> Result<()> {
        self.refs.get_branch(ctx, repo, branch)?;
        self.staging.set_entry(ctx, repo, branch, path, Some(&entry))
    }

    /// Stage a delete (tombstone) on a branch.
    pub fn delete_entry(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        path: &ObjectPath,
    ) -> Result<()> {
        self.refs.get_branch(ctx, repo, branch)?;
        self.staging.delete_entry(ctx, repo, branch, path)
    }

    /// List entries under `prefix` as seen from `r`, grouped by `delimiter`,
    /// resuming strictly after `after`. Returns up to `amount` listings and
    /// whether more follow.
    #[allow(clippy::too_many_arguments)]
    pub fn list_entries(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        r: &Ref,
        prefix: &str,
        after: &str,
        delimiter: &str,
        amount: usize,
    ) -> Result<(Vec<Listing>, bool)> {
        let repository = self.refs.get_repository(ctx, repo)?;
        let (commit_id, branch) = self.refs.resolve(ctx, repo, r)?;
        let commit = self.refs.get_commit(ctx, repo, &commit_id)?;
        let committed_it = self.committed.list_entries(
            ctx,
            &repository.storage_namespace,
            &commit.tree_id,
            "",
        )?;
        let staging_it = match &branch {
            Some(branch) => {
                let token = self.staging.current_token(ctx, repo, &branch.id)?;
                self.staging.list_entries(ctx, repo, &branch.id, &token, "")?
            }
            None => SliceIterator::new(Vec::new()),
        };
        let mut merged = StagedOverIterator::new(staging_it, committed_it);
        paginate_listings(&mut merged, prefix, after, delimiter, amount)
    }

    // ---- commits ----

    /// Commit a branch's staged changes.
    ///
    /// Freezes the staging overlay, applies it over the branch head's tree,
    /// records the commit and advances the branch with a compare-and-set;
    /// a lost race re-applies the same frozen overlay onto the new head, so
    /// writes that arrive mid-commit stay staged for the next one.
    pub fn commit(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        committer: &str,
        message: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<CommitRecord> {
        if committer.is_empty() {
            return Err(Error::invalid_input("commit requires a committer"));
        }
        let ns = self.namespace(ctx, repo)?;
        self.refs.get_branch(ctx, repo, branch)?;
        if !self.staging.has_changes(ctx, repo, branch)? {
            return Err(Error::NothingToCommit);
        }
        let (frozen, live) = self.staging.snapshot(ctx, repo, branch)?;
        let changes =
            drain_entries(self.staging.list_snapshot(ctx, repo, branch, &frozen, "")?)?;
        if changes.is_empty() {
            let _ = self.staging.drop_token(ctx, repo, branch, &frozen);
            return Err(Error::NothingToCommit);
        }

        let mut attempt = 0;
        loop {
            let prior = self.refs.get_branch(ctx, repo, branch)?;
            let head = self.refs.get_commit(ctx, repo, &prior.commit_id)?;
            let mut stream = SliceIterator::new(changes.clone());
            let tree_id = self.committed.apply(ctx, &ns, &head.tree_id, &mut stream)?;
            let commit = Commit {
                committer: committer.to_string(),
                message: message.to_string(),
                tree_id,
                creation_date: Utc::now(),
                parents: vec![prior.commit_id],
                metadata: metadata.clone(),
            };
            let id = self.refs.add_commit(ctx, repo, &commit)?;
            let next = Branch {
                commit_id: id,
                staging_token: live.clone(),
            };
            match self.refs.set_branch_if(ctx, repo, branch, &next, Some(&prior)) {
                Ok(()) => {
                    if let Err(e) = self.staging.drop_token(ctx, repo, branch, &frozen) {
                        warn!(repo = %repo, branch = %branch, error = %e, "failed to drop frozen staging token");
                    }
                    debug!(repo = %repo, branch = %branch, commit = %id.short(), "committed");
                    return Ok(CommitRecord { id, commit });
                }
                Err(e) if e.is_retriable() && attempt + 1 < COMMIT_RETRIES => {
                    attempt += 1;
                    warn!(repo = %repo, branch = %branch, attempt, "branch moved during commit, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Discard all staged changes on a branch.
    pub fn reset(&self, ctx: &Context, repo: &RepositoryId, branch: &BranchId) -> Result<()> {
        let mut attempt = 0;
        loop {
            let prior = self.refs.get_branch(ctx, repo, branch)?;
            let (frozen, live) = self.staging.snapshot(ctx, repo, branch)?;
            let _ = self.staging.drop_token(ctx, repo, branch, &frozen);
            let next = Branch {
                commit_id: prior.commit_id,
                staging_token: live,
            };
            match self.refs.set_branch_if(ctx, repo, branch, &next, Some(&prior)) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retriable() && attempt + 1 < COMMIT_RETRIES => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Hard-reset a branch head to `r`, discarding staged changes.
    pub fn reset_branch(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        r: &Ref,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            let prior = self.refs.get_branch(ctx, repo, branch)?;
            let (commit_id, _) = self.refs.resolve(ctx, repo, r)?;
            let (frozen, live) = self.staging.snapshot(ctx, repo, branch)?;
            let _ = self.staging.drop_token(ctx, repo, branch, &frozen);
            let next = Branch {
                commit_id,
                staging_token: live,
            };
            match self.refs.set_branch_if(ctx, repo, branch, &next, Some(&prior)) {
                Ok(()) => {
                    debug!(repo = %repo, branch = %branch, to = %commit_id.short(), "branch reset");
                    return Ok(());
                }
                Err(e) if e.is_retriable() && attempt + 1 < COMMIT_RETRIES => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Commit the inverse of what `r` changed relative to its first parent.
    ///
    /// Paths the user already staged with a different value abort the revert
    /// with a Conflict before anything is staged.
    pub fn revert(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        r: &Ref,
        committer: &str,
    ) -> Result<CommitRecord> {
        let ns = self.namespace(ctx, repo)?;
        self.refs.get_branch(ctx, repo, branch)?;
        let (reverted_id, _) = self.refs.resolve(ctx, repo, r)?;
        let reverted = self.refs.get_commit(ctx, repo, &reverted_id)?;
        let parent_tree = match reverted.first_parent() {
            Some(parent) => self.refs.get_commit(ctx, repo, &parent)?.tree_id,
            None => self.committed.empty_tree(ctx, &ns)?,
        };

        // the commit's own changes, seen from its parent
        let mut diff = self
            .committed
            .diff(ctx, &ns, &parent_tree, &reverted.tree_id, &parent_tree, "")?;
        let mut plan: Vec<EntryRecord> = Vec::new();
        while diff.next() {
            let d = diff.value().unwrap().clone();
            match d.kind {
                DiffType::Added => plan.push(EntryRecord::tombstone(d.path)),
                DiffType::Removed | DiffType::Changed => {
                    let restored = self.committed.get_entry(ctx, &ns, &parent_tree, &d.path)?;
                    plan.push(EntryRecord::new(d.path, restored));
                }
                // base is the parent itself, so nothing can classify as both-changed
                DiffType::Conflict => {
                    return Err(Error::Conflict {
                        paths: vec![d.path],
                    })
                }
            }
        }
        if let Some(e) = diff.take_err() {
            return Err(e);
        }
        if plan.is_empty() {
            return Err(Error::NothingToCommit);
        }

        let token = self.staging.current_token(ctx, repo, branch)?;
        let mut conflicts = Vec::new();
        for planned in &plan {
            match self.staging.get_entry(ctx, repo, branch, &token, &planned.path) {
                Ok(existing) => {
                    let agrees = match (&existing, &planned.entry) {
                        (None, None) => true,
                        (Some(a), Some(b)) => a.same_value(b),
                        _ => false,
                    };
                    if !agrees {
                        conflicts.push(planned.path.clone());
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if !conflicts.is_empty() {
            return Err(Error::Conflict { paths: conflicts });
        }
        for planned in plan {
            self.staging
                .set_entry(ctx, repo, branch, &planned.path, planned.entry.as_ref())?;
        }
        self.commit(
            ctx,
            repo,
            branch,
            committer,
            &format!("Revert {}", r),
            BTreeMap::new(),
        )
    }

    // ---- diffs and merges ----

    /// Merge `from` into branch `to`.
    ///
    /// Fast-forwards when `to` is the merge base; does nothing when `from`
    /// is already merged. Otherwise records a merge commit whose parents are
    /// `[to_tip, from_tip]`. Conflicts abort with the conflicting paths and
    /// no branch moves.
    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        from: &Ref,
        to: &BranchId,
        committer: &str,
        message: Option<&str>,
        metadata: BTreeMap<String, String>,
    ) -> Result<CommitId> {
        if committer.is_empty() {
            return Err(Error::invalid_input("merge requires a committer"));
        }
        let ns = self.namespace(ctx, repo)?;
        let mut attempt = 0;
        loop {
            let prior = self.refs.get_branch(ctx, repo, to)?;
            let (from_id, _) = self.refs.resolve(ctx, repo, from)?;
            let to_id = prior.commit_id;
            if from_id == to_id {
                return Ok(to_id);
            }
            let base = self.refs.find_merge_base(ctx, repo, from_id, to_id)?;
            if base.id == from_id {
                // everything in `from` is already reachable
                return Ok(to_id);
            }
            if base.id == to_id {
                let next = Branch {
                    commit_id: from_id,
                    staging_token: prior.staging_token.clone(),
                };
                match self.refs.set_branch_if(ctx, repo, to, &next, Some(&prior)) {
                    Ok(()) => {
                        debug!(repo = %repo, branch = %to, to = %from_id.short(), "fast-forward merge");
                        return Ok(from_id);
                    }
                    Err(e) if e.is_retriable() && attempt + 1 < COMMIT_RETRIES => {
                        attempt += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let from_commit = self.refs.get_commit(ctx, repo, &from_id)?;
            let to_commit = self.refs.get_commit(ctx, repo, &to_id)?;
            let tree_id = self.committed.merge(
                ctx,
                &ns,
                &to_commit.tree_id,
                &from_commit.tree_id,
                &base.commit.tree_id,
            )?;
            let message = message
                .map(str::to_string)
                .unwrap_or_else(|| format!("Merge {} into {}", from, to));
            let commit = Commit {
                committer: committer.to_string(),
                message,
                tree_id,
                creation_date: Utc::now(),
                parents: vec![to_id, from_id],
                metadata: metadata.clone(),
            };
            let id = self.refs.add_commit(ctx, repo, &commit)?;
            let next = Branch {
                commit_id: id,
                staging_token: prior.staging_token.clone(),
            };
            match self.refs.set_branch_if(ctx, repo, to, &next, Some(&prior)) {
                Ok(()) => {
                    debug!(repo = %repo, branch = %to, commit = %id.short(), "merge committed");
                    return Ok(id);
                }
                Err(e) if e.is_retriable() && attempt + 1 < COMMIT_RETRIES => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Differences from `left` toward `right`, classified against their
    /// merge base; starts at the least path >= `from`.
    #[allow(clippy::too_many_arguments)]
    pub fn diff(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        left: &Ref,
        right: &Ref,
        from: &str,
        amount: usize,
    ) -> Result<(Vec<DiffEntry>, bool)> {
        if amount == 0 {
            return Err(Error::invalid_input("diff amount must be positive"));
        }
        let ns = self.namespace(ctx, repo)?;
        let (left_id, _) = self.refs.resolve(ctx, repo, left)?;
        let (right_id, _) = self.refs.resolve(ctx, repo, right)?;
        if left_id == right_id {
            return Ok((Vec::new(), false));
        }
        let base = self.refs.find_merge_base(ctx, repo, left_id, right_id)?;
        let left_tree = self.refs.get_commit(ctx, repo, &left_id)?.tree_id;
        let right_tree = self.refs.get_commit(ctx, repo, &right_id)?.tree_id;
        let mut it = self.committed.diff(
            ctx,
            &ns,
            &left_tree,
            &right_tree,
            &base.commit.tree_id,
            from,
        )?;
        let mut out = Vec::new();
        let mut has_more = false;
        while it.next() {
            if out.len() == amount {
                has_more = true;
                break;
            }
            out.push(it.value().unwrap().clone());
        }
        if let Some(e) = it.take_err() {
            return Err(e);
        }
        Ok((out, has_more))
    }

    /// Differences between a branch's head tree and its staging overlay.
    pub fn diff_uncommitted(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        from: &str,
        amount: usize,
    ) -> Result<(Vec<DiffEntry>, bool)> {
        if amount == 0 {
            return Err(Error::invalid_input("diff amount must be positive"));
        }
        let ns = self.namespace(ctx, repo)?;
        let head = self.refs.get_branch(ctx, repo, branch)?;
        let tree_id = self.refs.get_commit(ctx, repo, &head.commit_id)?.tree_id;
        let token = self.staging.current_token(ctx, repo, branch)?;
        let mut it = self.staging.list_entries(ctx, repo, branch, &token, from)?;
        let mut out = Vec::new();
        let mut has_more = false;
        while it.next() {
            let record = it.value().unwrap().clone();
            let committed = match self.committed.get_entry(ctx, &ns, &tree_id, &record.path) {
                Ok(entry) => Some(entry),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            let kind = match (&record.entry, &committed) {
                (Some(_), None) => DiffType::Added,
                (Some(staged), Some(committed)) => {
                    if staged.same_value(committed) {
                        continue;
                    }
                    DiffType::Changed
                }
                (None, Some(_)) => DiffType::Removed,
                // tombstone over nothing
                (None, None) => continue,
            };
            if out.len() == amount {
                has_more = true;
                break;
            }
            out.push(DiffEntry {
                path: record.path,
                kind,
            });
        }
        if let Some(e) = it.take_err() {
            return Err(e);
        }
        Ok((out, has_more))
    }
}

fn drain_entries(mut it: SliceIterator<EntryRecord>) -> Result<Vec<EntryRecord>> {
    let mut out = Vec::new();
    while it.next() {
        out.push(it.value().unwrap().clone());
    }
    if let Some(e) = it.take_err() {
        return Err(e);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        ctx: Context,
        catalog: Catalog,
        repo: RepositoryId,
        main: BranchId,
    }

    fn setup() -> Fixture {
        let ctx = Context::background();
        let catalog = Catalog::in_memory();
        let repo = RepositoryId::new("repo1").unwrap();
        let main = BranchId::new("main").unwrap();
        catalog
            .create_repository(
                &ctx,
                &repo,
                StorageNamespace::new("mem://repo1").unwrap(),
                main.clone(),
            )
            .unwrap();
        Fixture {
            ctx,
            catalog,
            repo,
            main,
        }
    }

    fn entry(tag: &str) -> Entry {
        Entry {
            last_modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            address: format!("blk://{tag}"),
            etag: tag.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    fn path(p: &str) -> ObjectPath {
        ObjectPath::new(p).unwrap()
    }

    fn r(s: &str) -> Ref {
        Ref::new(s).unwrap()
    }

    impl Fixture {
        fn set(&self, branch: &str, p: &str, tag: &str) {
            self.catalog
                .set_entry(
                    &self.ctx,
                    &self.repo,
                    &BranchId::new(branch).unwrap(),
                    &path(p),
                    entry(tag),
                )
                .unwrap();
        }

        fn commit(&self, branch: &str, message: &str) -> CommitRecord {
            self.catalog
                .commit(
                    &self.ctx,
                    &self.repo,
                    &BranchId::new(branch).unwrap(),
                    "tester",
                    message,
                    BTreeMap::new(),
                )
                .unwrap()
        }

        fn listing_paths(&self, reference: &str) -> Vec<String> {
            let (listings, has_more) = self
                .catalog
                .list_entries(&self.ctx, &self.repo, &r(reference), "", "", "", 100)
                .unwrap();
            assert!(!has_more);
            listings
                .iter()
                .map(|l| l.path().as_str().to_string())
                .collect()
        }
    }

    #[test]
    fn test_basic_commit_and_list() {
        // S1
        let f = setup();
        f.set("main", "a", "1");
        f.set("main", "b", "2");
        f.commit("main", "first");

        let (listings, has_more) = f
            .catalog
            .list_entries(&f.ctx, &f.repo, &r("main"), "", "", "", 10)
            .unwrap();
        assert!(!has_more);
        assert_eq!(listings.len(), 2);
        match &listings[0] {
            Listing::Object(record) => {
                assert_eq!(record.path.as_str(), "a");
                assert_eq!(record.entry.as_ref().unwrap().etag, "1");
            }
            other => panic!("expected entry, got {other:?}"),
        }
        assert_eq!(listings[1].path().as_str(), "b");
    }

    #[test]
    fn test_staging_overrides_committed() {
        // S2
        let f = setup();
        f.set("main", "a", "1");
        f.set("main", "b", "2");
        let first = f.commit("main", "first");

        f.set("main", "a", "1-staged");
        let got = f
            .catalog
            .get_entry(&f.ctx, &f.repo, &r("main"), &path("a"))
            .unwrap();
        assert_eq!(got.etag, "1-staged");

        // the frozen commit still serves the committed value
        let got = f
            .catalog
            .get_entry(&f.ctx, &f.repo, &r(&first.id.to_hex()), &path("a"))
            .unwrap();
        assert_eq!(got.etag, "1");
    }

    #[test]
    fn test_delete_via_tombstone() {
        // S3
        let f = setup();
        f.set("main", "a", "1");
        f.set("main", "b", "2");
        f.commit("main", "first");

        f.catalog
            .delete_entry(&f.ctx, &f.repo, &f.main, &path("a"))
            .unwrap();
        let err = f
            .catalog
            .get_entry(&f.ctx, &f.repo, &r("main"), &path("a"))
            .unwrap_err();
        assert!(err.is_not_found());

        f.commit("main", "delete a");
        assert_eq!(f.listing_paths("main"), vec!["b"]);
    }

    #[test]
    fn test_branch_and_diff() {
        // S4
        let f = setup();
        f.set("main", "a", "1");
        f.set("main", "b", "2");
        f.commit("main", "first");

        f.catalog
            .create_branch(&f.ctx, &f.repo, &BranchId::new("dev").unwrap(), &r("main"))
            .unwrap();
        f.set("dev", "c", "3");
        f.commit("dev", "add c");

        let (diffs, has_more) = f
            .catalog
            .diff(&f.ctx, &f.repo, &r("main"), &r("dev"), "", 10)
            .unwrap();
        assert!(!has_more);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path.as_str(), "c");
        assert_eq!(diffs[0].kind, DiffType::Added);
    }

    #[test]
    fn test_merge_records_parents_in_order() {
        // S5, with main advanced so a real merge commit is required
        let f = setup();
        f.set("main", "a", "1");
        f.set("main", "b", "2");
        f.commit("main", "first");

        f.catalog
            .create_branch(&f.ctx, &f.repo, &BranchId::new("dev").unwrap(), &r("main"))
            .unwrap();
        f.set("dev", "c", "3");
        let dev_tip = f.commit("dev", "add c");

        f.set("main", "d", "4");
        let main_tip = f.commit("main", "add d");

        let merge_id = f
            .catalog
            .merge(
                &f.ctx,
                &f.repo,
                &r("dev"),
                &f.main,
                "tester",
                None,
                BTreeMap::new(),
            )
            .unwrap();

        let merge_commit = f.catalog.get_commit(&f.ctx, &f.repo, &merge_id).unwrap();
        assert_eq!(merge_commit.parents, vec![main_tip.id, dev_tip.id]);
        assert_eq!(f.listing_paths("main"), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_fast_forward_merge_creates_no_commit() {
        // property 6
        let f = setup();
        f.set("main", "a", "1");
        f.commit("main", "first");

        f.catalog
            .create_branch(&f.ctx, &f.repo, &BranchId::new("dev").unwrap(), &r("main"))
            .unwrap();
        f.set("dev", "b", "2");
        let dev_tip = f.commit("dev", "add b");

        let merged = f
            .catalog
            .merge(
                &f.ctx,
                &f.repo,
                &r("dev"),
                &f.main,
                "tester",
                None,
                BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(merged, dev_tip.id);
        let main = f.catalog.get_branch(&f.ctx, &f.repo, &f.main).unwrap();
        assert_eq!(main.commit_id, dev_tip.id);
        assert_eq!(f.listing_paths("main"), vec!["a", "b"]);

        // merging again is a no-op
        let again = f
            .catalog
            .merge(
                &f.ctx,
                &f.repo,
                &r("dev"),
                &f.main,
                "tester",
                None,
                BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(again, dev_tip.id);
    }

    #[test]
    fn test_merge_conflict_leaves_branches_alone() {
        // S6
        let f = setup();
        f.set("main", "a", "base");
        f.commit("main", "first");

        f.catalog
            .create_branch(&f.ctx, &f.repo, &BranchId::new("dev").unwrap(), &r("main"))
            .unwrap();
        f.set("dev", "a", "from-dev");
        f.commit("dev", "dev change");
        f.set("main", "a", "from-main");
        let main_tip = f.commit("main", "main change");

        let err = f
            .catalog
            .merge(
                &f.ctx,
                &f.repo,
                &r("dev"),
                &f.main,
                "tester",
                None,
                BTreeMap::new(),
            )
            .unwrap_err();
        match err {
            Error::Conflict { paths } => {
                assert_eq!(paths.len(), 1);
                assert_eq!(paths[0].as_str(), "a");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let main = f.catalog.get_branch(&f.ctx, &f.repo, &f.main).unwrap();
        assert_eq!(main.commit_id, main_tip.id);
    }

    #[test]
    fn test_delimiter_listing() {
        // S7
        let f = setup();
        f.set("main", "a/x", "1");
        f.set("main", "a/y", "2");
        f.set("main", "b", "3");
        f.commit("main", "first");

        let (listings, has_more) = f
            .catalog
            .list_entries(&f.ctx, &f.repo, &r("main"), "", "", "/", 10)
            .unwrap();
        assert!(!has_more);
        assert_eq!(listings.len(), 2);
        assert!(matches!(&listings[0], Listing::CommonPrefix(p) if p.as_str() == "a/"));
        assert!(matches!(&listings[1], Listing::Object(rec) if rec.path.as_str() == "b"));
    }

    #[test]
    fn test_nothing_to_commit() {
        // property 3
        let f = setup();
        let err = f
            .catalog
            .commit(&f.ctx, &f.repo, &f.main, "tester", "empty", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::NothingToCommit));

        f.set("main", "a", "1");
        f.commit("main", "first");
        let err = f
            .catalog
            .commit(&f.ctx, &f.repo, &f.main, "tester", "again", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::NothingToCommit));
    }

    #[test]
    fn test_commit_round_trip_properties() {
        // property 2
        let f = setup();
        f.set("main", "a", "1");
        f.commit("main", "add");
        let got = f
            .catalog
            .get_entry(&f.ctx, &f.repo, &r("main"), &path("a"))
            .unwrap();
        assert_eq!(got.etag, "1");

        f.catalog
            .delete_entry(&f.ctx, &f.repo, &f.main, &path("a"))
            .unwrap();
        f.commit("main", "remove");
        assert!(f
            .catalog
            .get_entry(&f.ctx, &f.repo, &r("main"), &path("a"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_writes_between_commits_stay_staged() {
        // property 7, single-writer shape
        let f = setup();
        f.set("main", "a", "1");
        f.commit("main", "first");

        f.set("main", "b", "2");
        // staged but not committed: visible on the branch, absent at the tip
        let tip = f.catalog.get_branch(&f.ctx, &f.repo, &f.main).unwrap();
        assert!(f
            .catalog
            .get_entry(&f.ctx, &f.repo, &r(&tip.commit_id.to_hex()), &path("b"))
            .unwrap_err()
            .is_not_found());
        f.catalog
            .get_entry(&f.ctx, &f.repo, &r("main"), &path("b"))
            .unwrap();

        f.commit("main", "second");
        f.catalog
            .get_entry(&f.ctx, &f.repo, &r("main"), &path("b"))
            .unwrap();
    }

    #[test]
    fn test_reset_discards_staging() {
        let f = setup();
        f.set("main", "a", "1");
        f.commit("main", "first");

        f.set("main", "b", "2");
        f.catalog.reset(&f.ctx, &f.repo, &f.main).unwrap();
        assert!(f
            .catalog
            .get_entry(&f.ctx, &f.repo, &r("main"), &path("b"))
            .unwrap_err()
            .is_not_found());
        let (diffs, _) = f
            .catalog
            .diff_uncommitted(&f.ctx, &f.repo, &f.main, "", 10)
            .unwrap();
        assert!(diffs.is_empty());
    }

    #[test]
    fn test_reset_branch_to_ref() {
        let f = setup();
        f.set("main", "a", "1");
        let first = f.commit("main", "first");
        f.set("main", "b", "2");
        f.commit("main", "second");

        f.set("main", "c", "3");
        f.catalog
            .reset_branch(&f.ctx, &f.repo, &f.main, &r(&first.id.to_hex()))
            .unwrap();
        assert_eq!(f.listing_paths("main"), vec!["a"]);
    }

    #[test]
    fn test_revert_undoes_a_commit() {
        let f = setup();
        f.set("main", "a", "1");
        f.set("main", "b", "2");
        f.commit("main", "first");
        f.set("main", "b", "2-changed");
        f.set("main", "c", "3");
        let second = f.commit("main", "second");

        let reverted = f
            .catalog
            .revert(&f.ctx, &f.repo, &f.main, &r(&second.id.to_hex()), "tester")
            .unwrap();
        assert!(reverted.commit.message.starts_with("Revert"));

        assert_eq!(f.listing_paths("main"), vec!["a", "b"]);
        let got = f
            .catalog
            .get_entry(&f.ctx, &f.repo, &r("main"), &path("b"))
            .unwrap();
        assert_eq!(got.etag, "2");
    }

    #[test]
    fn test_revert_aborts_on_staged_collision() {
        let f = setup();
        f.set("main", "a", "1");
        f.commit("main", "first");
        f.set("main", "a", "2");
        let second = f.commit("main", "second");

        // user stages their own value for the path the revert must restore
        f.set("main", "a", "user-staged");
        let err = f
            .catalog
            .revert(&f.ctx, &f.repo, &f.main, &r(&second.id.to_hex()), "tester")
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_diff_uncommitted() {
        let f = setup();
        f.set("main", "a", "1");
        f.set("main", "b", "2");
        f.commit("main", "first");

        f.set("main", "a", "1-changed");
        f.set("main", "c", "3");
        f.catalog
            .delete_entry(&f.ctx, &f.repo, &f.main, &path("b"))
            .unwrap();

        let (diffs, has_more) = f
            .catalog
            .diff_uncommitted(&f.ctx, &f.repo, &f.main, "", 10)
            .unwrap();
        assert!(!has_more);
        let shaped: Vec<_> = diffs
            .iter()
            .map(|d| (d.path.as_str().to_string(), d.kind))
            .collect();
        assert_eq!(
            shaped,
            vec![
                ("a".to_string(), DiffType::Changed),
                ("b".to_string(), DiffType::Removed),
                ("c".to_string(), DiffType::Added),
            ]
        );
    }

    #[test]
    fn test_tags_resolve_and_are_immutable() {
        let f = setup();
        f.set("main", "a", "1");
        let first = f.commit("main", "first");
        f.set("main", "a", "2");
        f.commit("main", "second");

        f.catalog
            .create_tag(
                &f.ctx,
                &f.repo,
                &TagId::new("v1").unwrap(),
                &r(&first.id.to_hex()),
            )
            .unwrap();
        let got = f
            .catalog
            .get_entry(&f.ctx, &f.repo, &r("v1"), &path("a"))
            .unwrap();
        assert_eq!(got.etag, "1");

        let err = f
            .catalog
            .create_tag(&f.ctx, &f.repo, &TagId::new("v1").unwrap(), &r("main"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn test_log_pagination() {
        let f = setup();
        f.set("main", "a", "1");
        f.commit("main", "first");
        f.set("main", "b", "2");
        f.commit("main", "second");

        let tip = f.catalog.get_branch(&f.ctx, &f.repo, &f.main).unwrap();
        let (page, has_more) = f.catalog.log(&f.ctx, &f.repo, tip.commit_id, 2).unwrap();
        assert!(has_more);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].commit.message, "second");
        assert_eq!(page[1].commit.message, "first");

        let (all, has_more) = f.catalog.log(&f.ctx, &f.repo, tip.commit_id, 10).unwrap();
        assert!(!has_more);
        // repository-created commit is the root
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].commit.message, "Repository created");
    }

    #[test]
    fn test_delete_repository_drops_staging() {
        let f = setup();
        f.set("main", "a", "1");
        f.catalog.delete_repository(&f.ctx, &f.repo).unwrap();
        assert!(f
            .catalog
            .get_repository(&f.ctx, &f.repo)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_default_branch_cannot_be_deleted() {
        let f = setup();
        let err = f
            .catalog
            .delete_branch(&f.ctx, &f.repo, &f.main)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_branch_lifecycle() {
        let f = setup();
        f.set("main", "a", "1");
        f.commit("main", "first");

        let dev = BranchId::new("dev").unwrap();
        f.catalog
            .create_branch(&f.ctx, &f.repo, &dev, &r("main"))
            .unwrap();
        let err = f
            .catalog
            .create_branch(&f.ctx, &f.repo, &dev, &r("main"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        f.catalog.delete_branch(&f.ctx, &f.repo, &dev).unwrap();
        assert!(f
            .catalog
            .get_branch(&f.ctx, &f.repo, &dev)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_commit_requires_committer() {
        let f = setup();
        f.set("main", "a", "1");
        let err = f
            .catalog
            .commit(&f.ctx, &f.repo, &f.main, "", "msg", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_canceled_context_fails_fast() {
        let f = setup();
        f.ctx.cancel();
        let err = f
            .catalog
            .get_entry(&f.ctx, &f.repo, &r("main"), &path("a"))
            .unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }
}
