//! Canonical wire payloads.
//!
//! Commits and tree pages are content-addressed, so their byte encoding must
//! be stable across every producer: fields encode in tag order, maps are
//! `BTreeMap`s (sorted keys), defaults are skipped. SHA-256 over the encoded
//! payload is the identity. The same encoding doubles as the persisted form,
//! so a decoded record always re-hashes to the id it was stored under.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::{Commit, CommitId, Entry, EntryRecord, ObjectPath, RangeId, TreeId};

#[derive(Clone, PartialEq, Message)]
pub struct CommitPayload {
    #[prost(string, tag = "1")]
    pub committer: String,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, optional, tag = "3")]
    pub creation_date: Option<prost_types::Timestamp>,
    #[prost(bytes = "vec", tag = "4")]
    pub tree_id: Vec<u8>,
    #[prost(btree_map = "string, string", tag = "5")]
    pub metadata: BTreeMap<String, String>,
    #[prost(string, repeated, tag = "6")]
    pub parents: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntryPayload {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(string, tag = "2")]
    pub etag: String,
    #[prost(message, optional, tag = "3")]
    pub last_modified: Option<prost_types::Timestamp>,
    #[prost(btree_map = "string, string", tag = "4")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PageEntry {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(message, optional, tag = "2")]
    pub entry: Option<EntryPayload>,
}

/// a leaf page: sorted entries for one contiguous path range
#[derive(Clone, PartialEq, Message)]
pub struct RangePayload {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<PageEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RangeRefPayload {
    #[prost(string, tag = "1")]
    pub min_path: String,
    #[prost(string, tag = "2")]
    pub max_path: String,
    #[prost(bytes = "vec", tag = "3")]
    pub range_id: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub count: u64,
}

/// the root index page; its hash is the TreeId
#[derive(Clone, PartialEq, Message)]
pub struct TreeIndexPayload {
    #[prost(message, repeated, tag = "1")]
    pub ranges: Vec<RangeRefPayload>,
}

fn to_timestamp(dt: &DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

fn from_timestamp(ts: &prost_types::Timestamp) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, ts.nanos as u32)
        .single()
        .ok_or_else(|| Error::invalid_input("timestamp out of range"))
}

fn id_bytes(raw: &[u8]) -> Result<[u8; 32]> {
    raw.try_into()
        .map_err(|_| Error::invalid_input("bad id length in payload"))
}

pub fn commit_to_payload(commit: &Commit) -> CommitPayload {
    CommitPayload {
        committer: commit.committer.clone(),
        message: commit.message.clone(),
        creation_date: Some(to_timestamp(&commit.creation_date)),
        tree_id: commit.tree_id.as_bytes().to_vec(),
        metadata: commit.metadata.clone(),
        parents: commit.parents.iter().map(|p| p.to_hex()).collect(),
    }
}

pub fn commit_from_payload(payload: &CommitPayload) -> Result<Commit> {
    let creation_date = match &payload.creation_date {
        Some(ts) => from_timestamp(ts)?,
        None => return Err(Error::invalid_input("commit payload missing creation date")),
    };
    let parents = payload
        .parents
        .iter()
        .map(|p| CommitId::from_hex(p))
        .collect::<Result<Vec<_>>>()?;
    Ok(Commit {
        committer: payload.committer.clone(),
        message: payload.message.clone(),
        tree_id: TreeId::from_bytes(id_bytes(&payload.tree_id)?),
        creation_date,
        parents,
        metadata: payload.metadata.clone(),
    })
}

/// canonical commit bytes; also the persisted record form
pub fn encode_commit(commit: &Commit) -> Vec<u8> {
    commit_to_payload(commit).encode_to_vec()
}

pub fn decode_commit(data: &[u8]) -> Result<Commit> {
    let payload = CommitPayload::decode(data)?;
    commit_from_payload(&payload)
}

/// CommitId = SHA-256 of the canonical commit bytes
pub fn hash_commit(commit: &Commit) -> CommitId {
    let digest = Sha256::digest(encode_commit(commit));
    CommitId::from_bytes(digest.into())
}

pub fn entry_to_payload(entry: &Entry) -> EntryPayload {
    EntryPayload {
        address: entry.address.clone(),
        etag: entry.etag.clone(),
        last_modified: Some(to_timestamp(&entry.last_modified)),
        metadata: entry.metadata.clone(),
    }
}

pub fn entry_from_payload(payload: &EntryPayload) -> Result<Entry> {
    let last_modified = match &payload.last_modified {
        Some(ts) => from_timestamp(ts)?,
        None => return Err(Error::invalid_input("entry payload missing last modified")),
    };
    Ok(Entry {
        last_modified,
        address: payload.address.clone(),
        etag: payload.etag.clone(),
        metadata: payload.metadata.clone(),
    })
}

/// encode a leaf page; entries must be sorted and tombstone-free
pub fn encode_range(entries: &[EntryRecord]) -> Result<Vec<u8>> {
    let mut payload = RangePayload::default();
    for record in entries {
        let entry = record
            .entry
            .as_ref()
            .ok_or_else(|| Error::invalid_input("tombstone in committed range"))?;
        payload.entries.push(PageEntry {
            path: record.path.as_str().to_string(),
            entry: Some(entry_to_payload(entry)),
        });
    }
    Ok(payload.encode_to_vec())
}

pub fn decode_range(data: &[u8]) -> Result<Vec<EntryRecord>> {
    let payload = RangePayload::decode(data)?;
    payload
        .entries
        .iter()
        .map(|page_entry| {
            let entry = page_entry
                .entry
                .as_ref()
                .ok_or_else(|| Error::invalid_input("range page entry missing value"))?;
            Ok(EntryRecord::new(
                ObjectPath::new(page_entry.path.clone())?,
                entry_from_payload(entry)?,
            ))
        })
        .collect()
}

/// one leaf page descriptor inside a tree index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRef {
    pub min_path: ObjectPath,
    pub max_path: ObjectPath,
    pub id: RangeId,
    pub count: u64,
}

pub fn encode_index(ranges: &[RangeRef]) -> Vec<u8> {
    let payload = TreeIndexPayload {
        ranges: ranges
            .iter()
            .map(|r| RangeRefPayload {
                min_path: r.min_path.as_str().to_string(),
                max_path: r.max_path.as_str().to_string(),
                range_id: r.id.as_bytes().to_vec(),
                count: r.count,
            })
            .collect(),
    };
    payload.encode_to_vec()
}

pub fn decode_index(data: &[u8]) -> Result<Vec<RangeRef>> {
    let payload = TreeIndexPayload::decode(data)?;
    payload
        .ranges
        .iter()
        .map(|r| {
            Ok(RangeRef {
                min_path: ObjectPath::new(r.min_path.clone())?,
                max_path: ObjectPath::new(r.max_path.clone())?,
                id: RangeId::from_bytes(id_bytes(&r.range_id)?),
                count: r.count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_commit() -> Commit {
        Commit {
            committer: "tester".to_string(),
            message: "add things".to_string(),
            tree_id: TreeId::from_bytes([7; 32]),
            creation_date: Utc.timestamp_opt(1_700_000_000, 42).unwrap(),
            parents: vec![CommitId::from_bytes([1; 32])],
            metadata: BTreeMap::from([("key".to_string(), "value".to_string())]),
        }
    }

    #[test]
    fn test_commit_round_trip() {
        let commit = sample_commit();
        let decoded = decode_commit(&encode_commit(&commit)).unwrap();
        assert_eq!(commit, decoded);
    }

    #[test]
    fn test_equal_commits_equal_ids() {
        let a = sample_commit();
        let b = sample_commit();
        assert_eq!(hash_commit(&a), hash_commit(&b));

        let mut c = sample_commit();
        c.message = "add other things".to_string();
        assert_ne!(hash_commit(&a), hash_commit(&c));
    }

    #[test]
    fn test_metadata_order_does_not_matter() {
        let mut a = sample_commit();
        a.metadata.insert("a".to_string(), "1".to_string());
        a.metadata.insert("z".to_string(), "2".to_string());

        let mut b = sample_commit();
        b.metadata.insert("z".to_string(), "2".to_string());
        b.metadata.insert("a".to_string(), "1".to_string());

        assert_eq!(hash_commit(&a), hash_commit(&b));
    }

    #[test]
    fn test_parent_order_matters() {
        let mut a = sample_commit();
        a.parents = vec![CommitId::from_bytes([1; 32]), CommitId::from_bytes([2; 32])];
        let mut b = sample_commit();
        b.parents = vec![CommitId::from_bytes([2; 32]), CommitId::from_bytes([1; 32])];
        assert_ne!(hash_commit(&a), hash_commit(&b));
    }

    #[test]
    fn test_range_round_trip() {
        let entry = Entry {
            last_modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            address: "s3://bucket/a".to_string(),
            etag: "e1".to_string(),
            metadata: BTreeMap::new(),
        };
        let records = vec![EntryRecord::new(ObjectPath::new("a").unwrap(), entry)];
        let decoded = decode_range(&encode_range(&records).unwrap()).unwrap();
        assert_eq!(records, decoded);
    }

    #[test]
    fn test_range_rejects_tombstones() {
        let records = vec![EntryRecord::tombstone(ObjectPath::new("a").unwrap())];
        assert!(encode_range(&records).is_err());
    }
}
