//! Repository, branch, tag and commit records over the KV store.

use std::sync::Arc;

use tracing::debug;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::iter::SliceIterator;
use crate::proto;
use crate::refs::log::{self, CommitLogIterator};
use crate::store::KvStore;
use crate::types::{
    Branch, BranchId, BranchRecord, Commit, CommitId, CommitRecord, Ref, RefForm, Repository,
    RepositoryId, RepositoryRecord, Tag, TagId, TagRecord,
};

/// Manages refs: repositories, branches, commits, and tags.
#[derive(Clone)]
pub struct RefManager {
    kv: Arc<dyn KvStore>,
}

fn repo_key(repo: &RepositoryId) -> Vec<u8> {
    format!("repo/{repo}").into_bytes()
}

fn branch_key(repo: &RepositoryId, branch: &BranchId) -> Vec<u8> {
    format!("branch/{repo}/{branch}").into_bytes()
}

fn branch_prefix(repo: &RepositoryId) -> Vec<u8> {
    format!("branch/{repo}/").into_bytes()
}

fn tag_key(repo: &RepositoryId, tag: &TagId) -> Vec<u8> {
    format!("tag/{repo}/{tag}").into_bytes()
}

fn tag_prefix(repo: &RepositoryId) -> Vec<u8> {
    format!("tag/{repo}/").into_bytes()
}

fn commit_key(repo: &RepositoryId, id: &CommitId) -> Vec<u8> {
    format!("commit/{repo}/{}", id.to_hex()).into_bytes()
}

fn commit_prefix(repo: &RepositoryId) -> Vec<u8> {
    format!("commit/{repo}/").into_bytes()
}

impl RefManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Atomically create the repository record and its default branch.
    ///
    /// The default branch must point at an already-added commit.
    pub fn create_repository(
        &self,
        ctx: &Context,
        id: &RepositoryId,
        repository: &Repository,
        default_branch: &Branch,
    ) -> Result<()> {
        ctx.check()?;
        let record = serde_json::to_vec(repository)?;
        self.kv
            .set_if(&repo_key(id), &record, None)
            .map_err(|e| match e {
                Error::CasFailed { .. } => Error::already_exists("repository", id.as_str()),
                other => other,
            })?;
        let branch = serde_json::to_vec(default_branch)?;
        self.kv
            .set(&branch_key(id, &repository.default_branch), &branch)?;
        debug!(repo = %id, branch = %repository.default_branch, "repository created");
        Ok(())
    }

    pub fn get_repository(&self, ctx: &Context, id: &RepositoryId) -> Result<Repository> {
        ctx.check()?;
        let raw = self
            .kv
            .get(&repo_key(id))?
            .ok_or_else(|| Error::not_found("repository", id.as_str()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Delete the repository and all of its ref records. Commit records are
    /// left behind; they are content-addressed and unreachable without refs.
    pub fn delete_repository(&self, ctx: &Context, id: &RepositoryId) -> Result<()> {
        ctx.check()?;
        if self.kv.get(&repo_key(id))?.is_none() {
            return Err(Error::not_found("repository", id.as_str()));
        }
        self.kv.delete(&repo_key(id))?;
        self.kv.delete_prefix(&branch_prefix(id))?;
        self.kv.delete_prefix(&tag_prefix(id))?;
        debug!(repo = %id, "repository deleted");
        Ok(())
    }

    /// List repositories with ids >= `from`, ascending.
    pub fn list_repositories(
        &self,
        ctx: &Context,
        from: &str,
    ) -> Result<SliceIterator<RepositoryRecord>> {
        ctx.check()?;
        let prefix = b"repo/".to_vec();
        let start = format!("repo/{from}").into_bytes();
        let mut records = Vec::new();
        for (key, value) in self.kv.scan(&prefix, &start)? {
            ctx.check()?;
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            records.push(RepositoryRecord {
                id: RepositoryId::new(id)?,
                repository: serde_json::from_slice(&value)?,
            });
        }
        Ok(SliceIterator::new(records))
    }

    pub fn get_branch(&self, ctx: &Context, repo: &RepositoryId, id: &BranchId) -> Result<Branch> {
        ctx.check()?;
        let raw = self
            .kv
            .get(&branch_key(repo, id))?
            .ok_or_else(|| Error::not_found("branch", id.as_str()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Blind branch overwrite; concurrency control is the caller's problem.
    pub fn set_branch(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        id: &BranchId,
        branch: &Branch,
    ) -> Result<()> {
        ctx.check()?;
        self.kv
            .set(&branch_key(repo, id), &serde_json::to_vec(branch)?)
    }

    /// Compare-and-set branch update against the expected prior value.
    /// `expected: None` means create-only.
    pub fn set_branch_if(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        id: &BranchId,
        branch: &Branch,
        expected: Option<&Branch>,
    ) -> Result<()> {
        ctx.check()?;
        let value = serde_json::to_vec(branch)?;
        let prior = expected.map(serde_json::to_vec).transpose()?;
        self.kv
            .set_if(&branch_key(repo, id), &value, prior.as_deref())
    }

    pub fn delete_branch(&self, ctx: &Context, repo: &RepositoryId, id: &BranchId) -> Result<()> {
        ctx.check()?;
        if self.kv.get(&branch_key(repo, id))?.is_none() {
            return Err(Error::not_found("branch", id.as_str()));
        }
        self.kv.delete(&branch_key(repo, id))
    }

    /// List branches with ids >= `from`, ascending.
    pub fn list_branches(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        from: &str,
    ) -> Result<SliceIterator<BranchRecord>> {
        ctx.check()?;
        let prefix = branch_prefix(repo);
        let start = [&prefix[..], from.as_bytes()].concat();
        let mut records = Vec::new();
        for (key, value) in self.kv.scan(&prefix, &start)? {
            ctx.check()?;
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            records.push(BranchRecord {
                id: BranchId::new(id)?,
                branch: serde_json::from_slice(&value)?,
            });
        }
        Ok(SliceIterator::new(records))
    }

    pub fn create_tag(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        id: &TagId,
        tag: &Tag,
    ) -> Result<()> {
        ctx.check()?;
        self.kv
            .set_if(&tag_key(repo, id), &serde_json::to_vec(tag)?, None)
            .map_err(|e| match e {
                Error::CasFailed { .. } => Error::already_exists("tag", id.as_str()),
                other => other,
            })
    }

    pub fn get_tag(&self, ctx: &Context, repo: &RepositoryId, id: &TagId) -> Result<Tag> {
        ctx.check()?;
        let raw = self
            .kv
            .get(&tag_key(repo, id))?
            .ok_or_else(|| Error::not_found("tag", id.as_str()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn delete_tag(&self, ctx: &Context, repo: &RepositoryId, id: &TagId) -> Result<()> {
        ctx.check()?;
        if self.kv.get(&tag_key(repo, id))?.is_none() {
            return Err(Error::not_found("tag", id.as_str()));
        }
        self.kv.delete(&tag_key(repo, id))
    }

    /// List tags with ids >= `from`, ascending.
    pub fn list_tags(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        from: &str,
    ) -> Result<SliceIterator<TagRecord>> {
        ctx.check()?;
        let prefix = tag_prefix(repo);
        let start = [&prefix[..], from.as_bytes()].concat();
        let mut records = Vec::new();
        for (key, value) in self.kv.scan(&prefix, &start)? {
            ctx.check()?;
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            records.push(TagRecord {
                id: TagId::new(id)?,
                tag: serde_json::from_slice(&value)?,
            });
        }
        Ok(SliceIterator::new(records))
    }

    /// Store a commit under the hash of its canonical encoding.
    ///
    /// Re-adding identical content is a no-op by construction.
    pub fn add_commit(&self, ctx: &Context, repo: &RepositoryId, commit: &Commit) -> Result<CommitId> {
        ctx.check()?;
        if commit.committer.is_empty() {
            return Err(Error::invalid_input("commit requires a committer"));
        }
        if commit.parents.len() > 2 {
            return Err(Error::invalid_input(format!(
                "commit cannot have {} parents",
                commit.parents.len()
            )));
        }
        let id = proto::hash_commit(commit);
        self.kv
            .set(&commit_key(repo, &id), &proto::encode_commit(commit))?;
        debug!(repo = %repo, commit = %id.short(), "commit added");
        Ok(id)
    }

    pub fn get_commit(&self, ctx: &Context, repo: &RepositoryId, id: &CommitId) -> Result<Commit> {
        ctx.check()?;
        let raw = self
            .kv
            .get(&commit_key(repo, id))?
            .ok_or_else(|| Error::not_found("commit", id.to_hex()))?;
        proto::decode_commit(&raw)
    }

    /// Resolve a ref to its commit, also surfacing the branch record when the
    /// ref named a branch (the catalog needs it for staging lookups).
    ///
    /// Precedence: full commit digest, then branch id, then tag id, then a
    /// unique commit digest prefix.
    pub fn resolve(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        r: &Ref,
    ) -> Result<(CommitId, Option<BranchRecord>)> {
        ctx.check()?;
        match r.form() {
            RefForm::FullHash(id) => {
                self.get_commit(ctx, repo, &id)?;
                Ok((id, None))
            }
            RefForm::Name { id, hex_prefix } => {
                if let Ok(branch_id) = BranchId::new(id) {
                    match self.get_branch(ctx, repo, &branch_id) {
                        Ok(branch) => {
                            let commit_id = branch.commit_id;
                            return Ok((
                                commit_id,
                                Some(BranchRecord {
                                    id: branch_id,
                                    branch,
                                }),
                            ));
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                if let Ok(tag_id) = TagId::new(id) {
                    match self.get_tag(ctx, repo, &tag_id) {
                        Ok(tag) => return Ok((tag.commit_id, None)),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                if hex_prefix {
                    return self
                        .commit_by_prefix(ctx, repo, id)
                        .map(|commit_id| (commit_id, None));
                }
                Err(Error::not_found("ref", r.as_str()))
            }
        }
    }

    /// Translate a ref to the commit it points at.
    pub fn dereference(&self, ctx: &Context, repo: &RepositoryId, r: &Ref) -> Result<CommitId> {
        self.resolve(ctx, repo, r).map(|(id, _)| id)
    }

    fn commit_by_prefix(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        prefix: &str,
    ) -> Result<CommitId> {
        ctx.check()?;
        let scan_prefix = [&commit_prefix(repo)[..], prefix.as_bytes()].concat();
        let matches = self.kv.scan(&scan_prefix, &scan_prefix)?;
        match matches.len() {
            0 => Err(Error::not_found("ref", prefix)),
            1 => {
                let key = &matches[0].0;
                let hex = String::from_utf8_lossy(&key[commit_prefix(repo).len()..]);
                CommitId::from_hex(&hex)
            }
            _ => Err(Error::AmbiguousRef(prefix.to_string())),
        }
    }

    /// Walk history from `from` in reverse-chronological topological order.
    pub fn log(&self, ctx: &Context, repo: &RepositoryId, from: CommitId) -> Result<CommitLogIterator> {
        CommitLogIterator::new(ctx.clone(), self.clone(), repo.clone(), from)
    }

    /// Find the lowest common ancestor of `a` and `b` in the commit DAG.
    pub fn find_merge_base(
        &self,
        ctx: &Context,
        repo: &RepositoryId,
        a: CommitId,
        b: CommitId,
    ) -> Result<CommitRecord> {
        log::find_merge_base(ctx, self, repo, a, b)
    }
}
