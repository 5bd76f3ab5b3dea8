//! Persistent block-header and filter-header store.

pub mod store;

pub use store::{BlockStamp, ChainStateError, HeaderStore};
