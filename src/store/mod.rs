//! External storage surfaces consumed by the catalog core.
//!
//! The core only requires two collaborators: a transactional key-value store
//! with ordered prefix scans ([`KvStore`]) and a content-addressable blob
//! service ([`BlobStore`]). In-memory implementations back the tests and any
//! embedded use; production deployments plug their own.

mod blob;
mod kv;

pub use blob::{BlobStore, MemBlobStore};
pub use kv::{KvStore, MemKvStore};
