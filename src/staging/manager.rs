//! Staged entries over the KV store.

use std::sync::Arc;

use tracing::debug;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::iter::SliceIterator;
use crate::store::KvStore;
use crate::types::{BranchId, Entry, EntryRecord, ObjectPath, RepositoryId, StagingToken};

const SNAPSHOT_RETRIES: usize = 3;

/// Maintains, per (repository, branch, token), a path -> entry-or-tombstone
/// overlay with ordered iteration.
#[derive(Clone)]
pub struct StagingManager {
    kv: Arc<dyn KvStore>,
}

fn token_key(repo: &RepositoryId, branch: &BranchId) -> Vec<u8> {
    format!("staging/{repo}/{branch}/token").into_bytes()
}

fn entry_prefix(repo: &RepositoryId, branch: &BranchId, token: &StagingToken) -> Vec<u8> {
    format!("staging/{repo}/{branch}/e/{token}/").into_bytes()
}

fn entry_key(
    repo: &RepositoryId,
    branch: &BranchId,
    token: &StagingToken,
    path: &ObjectPath,
) -> Vec<u8> {
    let mut key = entry_prefix(repo, branch, token);
    key.extend_from_slice(path.as_str().as_bytes());
    key
}

impl StagingManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The branch's live token, allocating one on first use.
    pub fn current_token(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
    ) -> Result<StagingToken> {
        ctx.check()?;
        loop {
            if let Some(raw) = self.kv.get(&token_key(repo, branch))? {
                return Ok(StagingToken::from_string(
                    String::from_utf8_lossy(&raw).into_owned(),
                ));
            }
            let fresh = StagingToken::generate();
            match self
                .kv
                .set_if(&token_key(repo, branch), fresh.as_str().as_bytes(), None)
            {
                Ok(()) => return Ok(fresh),
                // lost the allocation race; reread the winner's token
                Err(Error::CasFailed { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Point the branch at `token`; used when a branch is created with a
    /// token already recorded on its ref.
    pub fn set_current_token(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        token: &StagingToken,
    ) -> Result<()> {
        ctx.check()?;
        self.kv
            .set(&token_key(repo, branch), token.as_str().as_bytes())
    }

    /// Read a staged path. `Ok(None)` is a stored tombstone; an unstaged
    /// path is NotFound.
    pub fn get_entry(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        token: &StagingToken,
        path: &ObjectPath,
    ) -> Result<Option<Entry>> {
        ctx.check()?;
        let raw = self
            .kv
            .get(&entry_key(repo, branch, token, path))?
            .ok_or_else(|| Error::not_found("staged entry", path.as_str()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Stage an entry (or a tombstone when `entry` is None) under the
    /// branch's current token.
    pub fn set_entry(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        path: &ObjectPath,
        entry: Option<&Entry>,
    ) -> Result<()> {
        ctx.check()?;
        let token = self.current_token(ctx, repo, branch)?;
        let value = serde_json::to_vec(&entry)?;
        self.kv.set(&entry_key(repo, branch, &token, path), &value)
    }

    /// Stage a tombstone; deleting a path that was never staged is fine.
    pub fn delete_entry(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        path: &ObjectPath,
    ) -> Result<()> {
        self.set_entry(ctx, repo, branch, path, None)
    }

    /// Ordered scan of a token's overlay, tombstones included, starting at
    /// the least path >= `from`.
    pub fn list_entries(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        token: &StagingToken,
        from: &str,
    ) -> Result<SliceIterator<EntryRecord>> {
        ctx.check()?;
        let prefix = entry_prefix(repo, branch, token);
        let start = [&prefix[..], from.as_bytes()].concat();
        let mut records = Vec::new();
        for (key, value) in self.kv.scan(&prefix, &start)? {
            ctx.check()?;
            let path = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            records.push(EntryRecord {
                path: ObjectPath::new(path)?,
                entry: serde_json::from_slice(&value)?,
            });
        }
        Ok(SliceIterator::new(records))
    }

    /// Scan a frozen token; same shape as `list_entries`.
    pub fn list_snapshot(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        token: &StagingToken,
        from: &str,
    ) -> Result<SliceIterator<EntryRecord>> {
        self.list_entries(ctx, repo, branch, token, from)
    }

    /// whether the branch's current token holds any staged change
    pub fn has_changes(&self, ctx: &Context, repo: &RepositoryId, branch: &BranchId) -> Result<bool> {
        let token = self.current_token(ctx, repo, branch)?;
        let prefix = entry_prefix(repo, branch, &token);
        Ok(!self.kv.scan(&prefix, &prefix)?.is_empty())
    }

    /// Freeze the current token and redirect future writes to a fresh one.
    ///
    /// Returns `(frozen, live)`. The frozen token stays readable; only a
    /// successful commit drops it.
    pub fn snapshot(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
    ) -> Result<(StagingToken, StagingToken)> {
        ctx.check()?;
        for _ in 0..SNAPSHOT_RETRIES {
            let old = self.current_token(ctx, repo, branch)?;
            let new = StagingToken::generate();
            match self.kv.set_if(
                &token_key(repo, branch),
                new.as_str().as_bytes(),
                Some(old.as_str().as_bytes()),
            ) {
                Ok(()) => {
                    debug!(repo = %repo, branch = %branch, "staging snapshot taken");
                    return Ok((old, new));
                }
                Err(Error::CasFailed { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::CasFailed {
            key: String::from_utf8_lossy(&token_key(repo, branch)).into_owned(),
        })
    }

    /// Remove a frozen token's entries. Best-effort cleanup after commit.
    pub fn drop_token(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        branch: &BranchId,
        token: &StagingToken,
    ) -> Result<()> {
        ctx.check()?;
        self.kv.delete_prefix(&entry_prefix(repo, branch, token))
    }

    /// Remove everything staged for a branch, current token included.
    pub fn drop_branch(&self, ctx: &Context, repo: &RepositoryId, branch: &BranchId) -> Result<()> {
        ctx.check()?;
        self.kv
            .delete_prefix(format!("staging/{repo}/{branch}/").as_bytes())
    }

    /// Remove everything staged for a repository.
    pub fn drop_repository(&self, ctx: &Context, repo: &RepositoryId) -> Result<()> {
        ctx.check()?;
        self.kv.delete_prefix(format!("staging/{repo}/").as_bytes())
    }
}
