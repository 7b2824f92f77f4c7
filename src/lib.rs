//! strata - a versioned object catalog.
//!
//! Layers Git-like branching, commits and merges over a flat object store:
//! entries are addressed by path within named branches of named
//! repositories, mutations stage per branch, and commits snapshot the
//! branch into an immutable content-addressed tree without copying data.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use strata::{BranchId, Catalog, Context, Entry, ObjectPath, RepositoryId, StorageNamespace};
//!
//! let ctx = Context::background();
//! let catalog = Catalog::in_memory();
//! let repo = RepositoryId::new("example").unwrap();
//! catalog
//!     .create_repository(
//!         &ctx,
//!         &repo,
//!         StorageNamespace::new("mem://example").unwrap(),
//!         BranchId::new("main").unwrap(),
//!     )
//!     .unwrap();
//!
//! let main = BranchId::new("main").unwrap();
//! let entry = Entry {
//!     last_modified: chrono::Utc::now(),
//!     address: "block://1".to_string(),
//!     etag: "etag-1".to_string(),
//!     metadata: BTreeMap::new(),
//! };
//! catalog
//!     .set_entry(&ctx, &repo, &main, &ObjectPath::new("hello").unwrap(), entry)
//!     .unwrap();
//! catalog
//!     .commit(&ctx, &repo, &main, "me", "first commit", BTreeMap::new())
//!     .unwrap();
//! ```

pub mod catalog;
pub mod committed;
pub mod context;
pub mod error;
pub mod iter;
pub mod proto;
pub mod refs;
pub mod staging;
pub mod store;
pub mod types;

pub use catalog::Catalog;
pub use committed::CommittedManager;
pub use context::Context;
pub use error::{Error, Result};
pub use iter::ValueIterator;
pub use refs::RefManager;
pub use staging::StagingManager;
pub use store::{BlobStore, KvStore, MemBlobStore, MemKvStore};
pub use types::{
    Branch, BranchId, BranchRecord, Commit, CommitId, CommitRecord, DiffEntry, DiffType, Entry,
    EntryRecord, Listing, ObjectPath, RangeId, Ref, RefForm, Repository, RepositoryId,
    RepositoryRecord, StagingToken, StorageNamespace, Tag, TagId, TagRecord, TreeId,
};
