//! Error types for the index and eviction policy.
//!
//! These replace the C library's integer return codes with `thiserror`
//! enums. Allocation failure is not modeled here: on stable Rust, `Box`
//! and `Vec` abort the process on OOM, which is the idiomatic analogue
//! of the C library's `ENOMEM` path and is treated as a non-recoverable
//! condition rather than faked with a fallible-alloc shim.

use thiserror::Error;

/// Failure modes for [`crate::index::Index::insert`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InsertError {
    /// The exact key is already present in the trie.
    #[error("key already present in index")]
    AlreadyPresent,
}

/// Failure modes for [`crate::policy::LruPolicy::attach`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    /// The caller's back-pointer slot is already attached to a node.
    #[error("back-pointer slot is already attached")]
    AlreadyAttached,
}
