//! The catalog façade.
//!
//! Composes the ref, committed and staging managers into one coherent view
//! of a versioned object store: reads overlay staging on committed state,
//! writes go to staging, commits and merges advance branches atomically.

mod listing;
mod manager;

pub use manager::Catalog;
