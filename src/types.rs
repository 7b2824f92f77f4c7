//! core type-safe wrappers and records for the catalog.
//!
//! Identifiers are validated newtypes so we don't accidentally pass a branch
//! name where a repository id is expected, and so KV key segments can never
//! contain the `/` separator.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// length of a full hex-encoded content hash
pub const HASH_HEX_LEN: usize = 64;

fn validate_id(kind: &'static str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::invalid_input(format!("{kind} cannot be empty")));
    }
    if id.len() > 64 {
        return Err(Error::invalid_input(format!(
            "{kind} too long: {} characters",
            id.len()
        )));
    }
    let first = id.chars().next().unwrap();
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(Error::invalid_input(format!(
            "{kind} cannot start with '{first}'"
        )));
    }
    for (i, c) in id.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
            return Err(Error::invalid_input(format!(
                "invalid character '{c}' at position {i} in {kind}"
            )));
        }
    }
    Ok(())
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// identifier of a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryId(String);

impl RepositoryId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_id("repository id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// identifier of a branch within a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(String);

impl BranchId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_id("branch id", &id)?;
        // a branch named like a full commit digest could never be addressed
        if id.len() == HASH_HEX_LEN && is_hex(&id) {
            return Err(Error::invalid_input(
                "branch id cannot be a full commit digest",
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// identifier of a tag within a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagId(String);

impl TagId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_id("tag id", &id)?;
        if id.len() == HASH_HEX_LEN && is_hex(&id) {
            return Err(Error::invalid_input("tag id cannot be a full commit digest"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// URI of the storage location backing a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageNamespace(String);

impl StorageNamespace {
    pub fn new(uri: impl Into<String>) -> Result<Self> {
        let uri = uri.into();
        if uri.is_empty() {
            return Err(Error::invalid_input("storage namespace cannot be empty"));
        }
        Ok(Self(uri))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// logical path of an entry within a tree; ordered bytewise
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(Error::invalid_input("path cannot be empty"));
        }
        if path.contains('\0') {
            return Err(Error::invalid_input("path cannot contain NUL"));
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// opaque token namespacing a branch's uncommitted writes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagingToken(String);

impl StagingToken {
    /// allocate a fresh token
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StagingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! hash_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name([u8; 32]);

        impl $name {
            pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// parse from a full-length hex string
            pub fn from_hex(hex_str: &str) -> Result<Self> {
                let raw = hex::decode(hex_str)
                    .map_err(|_| Error::invalid_input(format!("bad hex id: {hex_str}")))?;
                let bytes: [u8; 32] = raw
                    .try_into()
                    .map_err(|_| Error::invalid_input(format!("bad id length: {hex_str}")))?;
                Ok(Self(bytes))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// short form for messages and logs
            pub fn short(&self) -> String {
                self.to_hex()[..8].to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.short())
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::from_hex(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_hex()
            }
        }
    };
}

hash_id! {
    /// content-addressed identifier of a commit
    CommitId
}

hash_id! {
    /// content-addressed identifier of a tree (root index page)
    TreeId
}

hash_id! {
    /// content-addressed identifier of a single tree range page
    RangeId
}

/// a ref string: commit digest, digest prefix, branch id or tag id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ref(String);

/// the syntactic form of a ref, decided once instead of string-sniffing at
/// every resolution site
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefForm<'a> {
    /// full-length commit digest
    FullHash(CommitId),
    /// a name; `hex_prefix` marks it as a candidate digest prefix
    Name { id: &'a str, hex_prefix: bool },
}

impl Ref {
    /// minimum hex length considered a digest prefix
    pub const MIN_PREFIX_LEN: usize = 2;

    pub fn new(r: impl Into<String>) -> Result<Self> {
        let r = r.into();
        if r.is_empty() {
            return Err(Error::invalid_input("ref cannot be empty"));
        }
        Ok(Self(r))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn form(&self) -> RefForm<'_> {
        if self.0.len() == HASH_HEX_LEN && is_hex(&self.0) {
            if let Ok(id) = CommitId::from_hex(&self.0) {
                return RefForm::FullHash(id);
            }
        }
        RefForm::Name {
            id: &self.0,
            hex_prefix: self.0.len() >= Self::MIN_PREFIX_LEN
                && self.0.len() < HASH_HEX_LEN
                && is_hex(&self.0),
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<BranchId> for Ref {
    fn from(branch: BranchId) -> Self {
        Ref(branch.0)
    }
}

impl From<CommitId> for Ref {
    fn from(id: CommitId) -> Self {
        Ref(id.to_hex())
    }
}

/// metadata record describing one stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub last_modified: DateTime<Utc>,
    /// physical address in the underlying block store
    pub address: String,
    pub etag: String,
    pub metadata: BTreeMap<String, String>,
}

impl Entry {
    /// value equality used by diff and merge; `last_modified` is excluded
    pub fn same_value(&self, other: &Entry) -> bool {
        self.address == other.address
            && self.etag == other.etag
            && self.metadata == other.metadata
    }
}

/// a path together with its entry; `entry: None` is a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub path: ObjectPath,
    pub entry: Option<Entry>,
}

impl EntryRecord {
    pub fn new(path: ObjectPath, entry: Entry) -> Self {
        Self {
            path,
            entry: Some(entry),
        }
    }

    pub fn tombstone(path: ObjectPath) -> Self {
        Self { path, entry: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.entry.is_none()
    }
}

/// commit metadata; immutable once added
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub committer: String,
    pub message: String,
    pub tree_id: TreeId,
    pub creation_date: DateTime<Utc>,
    /// first parent is the branch's prior tip
    pub parents: Vec<CommitId>,
    pub metadata: BTreeMap<String, String>,
}

impl Commit {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn first_parent(&self) -> Option<CommitId> {
        self.parents.first().copied()
    }
}

/// CommitId with the associated commit data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub id: CommitId,
    pub commit: Commit,
}

/// repository metadata; attributes are immutable after create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub storage_namespace: StorageNamespace,
    pub creation_date: DateTime<Utc>,
    pub default_branch: BranchId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub id: RepositoryId,
    pub repository: Repository,
}

/// a mutable pointer to a commit plus the branch's staging token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub commit_id: CommitId,
    pub staging_token: StagingToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRecord {
    pub id: BranchId,
    pub branch: Branch,
}

/// an immutable named pointer to a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub commit_id: CommitId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub id: TagId,
    pub tag: Tag,
}

/// a changed state for a given path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    Added,
    Removed,
    Changed,
    Conflict,
}

/// one element of a diff stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: ObjectPath,
    pub kind: DiffType,
}

/// one element of a delimiter-grouped listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    /// a prefix covering one or more entries, up to and including the first
    /// delimiter after the listing prefix
    CommonPrefix(ObjectPath),
    Object(EntryRecord),
}

impl Listing {
    pub fn path(&self) -> &ObjectPath {
        match self {
            Listing::CommonPrefix(p) => p,
            Listing::Object(record) => &record.path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_id_valid() {
        assert!(RepositoryId::new("repo1").is_ok());
        assert!(RepositoryId::new("my-repo").is_ok());
        assert!(RepositoryId::new("_internal").is_ok());
    }

    #[test]
    fn test_repository_id_invalid() {
        assert!(RepositoryId::new("").is_err());
        assert!(RepositoryId::new("1repo").is_err());
        assert!(RepositoryId::new("a/b").is_err());
        assert!(RepositoryId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn test_branch_id_rejects_full_digest() {
        let digest = "a".repeat(64);
        assert!(BranchId::new(digest).is_err());
        // one short of a digest is a fine branch name
        assert!(BranchId::new("a".repeat(63)).is_ok());
    }

    #[test]
    fn test_path_ordering_is_bytewise() {
        let a = ObjectPath::new("a/x").unwrap();
        let b = ObjectPath::new("a0x").unwrap();
        // '/' (0x2f) sorts before '0' (0x30)
        assert!(a < b);
    }

    #[test]
    fn test_hash_id_hex_round_trip() {
        let id = CommitId::from_bytes([0xab; 32]);
        let parsed = CommitId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short(), "abababab");
    }

    #[test]
    fn test_ref_form() {
        let digest = "0f".repeat(32);
        let r = Ref::new(digest).unwrap();
        assert!(matches!(r.form(), RefForm::FullHash(_)));

        let r = Ref::new("main").unwrap();
        assert!(matches!(
            r.form(),
            RefForm::Name {
                hex_prefix: false,
                ..
            }
        ));

        let r = Ref::new("0fe2").unwrap();
        assert!(matches!(
            r.form(),
            RefForm::Name {
                hex_prefix: true,
                ..
            }
        ));
    }

    #[test]
    fn test_entry_same_value_ignores_last_modified() {
        let mut a = Entry {
            last_modified: Utc::now(),
            address: "s3://bucket/obj".to_string(),
            etag: "e1".to_string(),
            metadata: BTreeMap::new(),
        };
        let mut b = a.clone();
        b.last_modified = b.last_modified + chrono::Duration::seconds(10);
        assert!(a.same_value(&b));

        b.etag = "e2".to_string();
        assert!(!a.same_value(&b));

        a.etag = "e2".to_string();
        a.metadata.insert("k".to_string(), "v".to_string());
        assert!(!a.same_value(&b));
    }
}
