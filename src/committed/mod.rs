//! Committed trees: immutable, content-addressed, range-partitioned.
//!
//! A tree is a root index page mapping path ranges to leaf pages, all stored
//! in the blob store; the root hash is the TreeId. Range boundaries are
//! content-defined, so applying a change set rewrites only the pages it
//! touches and equal effective contents always hash to the same TreeId.

mod apply;
mod diff;
mod iterator;
mod manager;
mod merge;
mod range;

pub use diff::DiffIterator;
pub use iterator::TreeIterator;
pub use manager::CommittedManager;
